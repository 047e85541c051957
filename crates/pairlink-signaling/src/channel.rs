//! WebSocket signaling **client** (display role).
//!
//! # Lifecycle
//!
//! ```text
//! connect(peer)
//!   ├─ attempt 1..=N:
//!   │     GET http://peer/status      ── fail ─► PreCheckFailed, sleep N×2s
//!   │     ws://peer/signaling         ── fail ─► Disconnected, sleep N×2s
//!   │       └─ ok ─► Connected
//!   └─ N exhausted ─► Error(PeerUnreachable)
//!
//! open:  ping every 5s, read deadline 15s, write deadline 5s
//!        inbound text ─► Message(..)   unknown/malformed ─► logged, dropped
//!        any close    ─► Disconnected
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use pairlink_core::config::SignalingConfig;
use pairlink_core::PeerEndpoint;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::protocol::{parse_frame, Inbound, SignalingMessage};
use crate::{SignalingError, SignalingEvent, SignalingEventSender};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

// MARK: - Signaling trait

/// Message channel to the paired device.
///
/// All methods return immediately; progress is reported as
/// [`SignalingEvent`]s on the sender passed to `connect`.
pub trait Signaling: Send {
    /// Pre-check and open a channel to `peer`, replacing any previous one.
    fn connect(&mut self, peer: &PeerEndpoint, events: SignalingEventSender);

    /// Best-effort send. Dropped with a log line when no channel is open.
    fn send(&self, message: SignalingMessage);

    /// Close the channel. Idempotent.
    fn disconnect(&mut self);

    fn is_open(&self) -> bool;
}

// MARK: - WebSocketChannel

pub struct WebSocketChannel {
    config:   SignalingConfig,
    open:     Arc<AtomicBool>,
    outbound: Option<mpsc::UnboundedSender<SignalingMessage>>,
    cancel:   Option<CancellationToken>,
}

impl WebSocketChannel {
    pub fn new(config: SignalingConfig) -> Self {
        Self {
            config,
            open: Arc::new(AtomicBool::new(false)),
            outbound: None,
            cancel: None,
        }
    }

    pub fn status_url(&self, peer: &PeerEndpoint) -> String {
        format!("http://{}{}", peer.socket_addr(), self.config.status_path)
    }

    pub fn signaling_url(&self, peer: &PeerEndpoint) -> String {
        format!("ws://{}{}", peer.socket_addr(), self.config.signaling_path)
    }
}

impl Signaling for WebSocketChannel {
    fn connect(&mut self, peer: &PeerEndpoint, events: SignalingEventSender) {
        self.disconnect();

        let cancel = CancellationToken::new();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        // Fresh flag per connection so a closing predecessor cannot flip it.
        let open = Arc::new(AtomicBool::new(false));

        let task = ChannelTask {
            config: self.config.clone(),
            status_url: self.status_url(peer),
            signaling_url: self.signaling_url(peer),
            sink: EventSink { tx: events, cancel: cancel.clone() },
            open: Arc::clone(&open),
            cancel: cancel.clone(),
        };
        info!("[Signaling] Connecting to {}", peer);
        tokio::spawn(task.run(outbound_rx));

        self.open = open;
        self.outbound = Some(outbound_tx);
        self.cancel = Some(cancel);
    }

    fn send(&self, message: SignalingMessage) {
        if !self.is_open() {
            debug!("[Signaling] Channel not open; dropping {}", message.kind());
            return;
        }
        if let Some(tx) = &self.outbound {
            if tx.send(message).is_err() {
                debug!("[Signaling] Channel task gone; message dropped");
            }
        }
    }

    fn disconnect(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
            debug!("[Signaling] Disconnect requested");
        }
        self.outbound = None;
        self.open.store(false, Ordering::Release);
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

impl Drop for WebSocketChannel {
    fn drop(&mut self) {
        self.disconnect();
    }
}

// MARK: - EventSink

/// Drops events once the owning connection has been cancelled, except the
/// final `Disconnected`, which always goes out.
struct EventSink {
    tx:     SignalingEventSender,
    cancel: CancellationToken,
}

impl EventSink {
    fn emit(&self, event: SignalingEvent) {
        if self.cancel.is_cancelled() {
            trace!("[Signaling] Suppressing {:?} after disconnect", event);
            return;
        }
        let _ = self.tx.send(event);
    }

    fn closed(&self, reason: String) {
        let _ = self.tx.send(SignalingEvent::Disconnected { reason });
    }
}

// MARK: - Channel task

struct ChannelTask {
    config:        SignalingConfig,
    status_url:    String,
    signaling_url: String,
    sink:          EventSink,
    open:          Arc<AtomicBool>,
    cancel:        CancellationToken,
}

impl ChannelTask {
    async fn run(self, outbound: mpsc::UnboundedReceiver<SignalingMessage>) {
        let Some(ws) = self.establish().await else { return };

        self.open.store(true, Ordering::Release);
        info!("[Signaling] Channel open: {}", self.signaling_url);
        self.sink.emit(SignalingEvent::Connected);

        let reason = self.pump(ws, outbound).await;

        self.open.store(false, Ordering::Release);
        info!("[Signaling] Channel closed: {}", reason);
        self.sink.closed(reason);
    }

    /// Pre-check + open, retried with linear backoff up to the attempt cap.
    async fn establish(&self) -> Option<WsStream> {
        let max = self.config.max_transport_attempts;
        let client = match reqwest::Client::builder()
            .timeout(self.config.precheck_timeout())
            .no_proxy()
            .build()
        {
            Ok(c) => c,
            Err(e) => {
                self.sink.emit(SignalingError::Transport(e.to_string()).into());
                return None;
            }
        };

        let mut attempt = 0;
        loop {
            attempt += 1;

            let failure = tokio::select! {
                _ = self.cancel.cancelled() => return None,
                outcome = self.attempt(&client, attempt, max) => match outcome {
                    Ok(ws) => return Some(ws),
                    Err(reason) => reason,
                },
            };

            if attempt >= max {
                warn!("[Signaling] Giving up after {} attempts: {}", attempt, failure);
                self.sink.emit(
                    SignalingError::PeerUnreachable { attempts: attempt, reason: failure }.into(),
                );
                return None;
            }

            let delay = self.config.transport_backoff(attempt);
            debug!("[Signaling] Retrying in {:?} (attempt {}/{})", delay, attempt + 1, max);
            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn attempt(&self, client: &reqwest::Client, attempt: u32, max: u32) -> Result<WsStream, String> {
        if let Err(e) = precheck(client, &self.status_url).await {
            warn!("[Signaling] Pre-check {}/{} failed: {}", attempt, max, e);
            self.sink.emit(SignalingEvent::PreCheckFailed { attempt, max_attempts: max, reason: e.clone() });
            return Err(e);
        }
        self.sink.emit(SignalingEvent::PreCheckPassed { attempt });

        match tokio::time::timeout(self.config.connect_timeout(), connect_async(self.signaling_url.as_str())).await {
            Ok(Ok((ws, _response))) => Ok(ws),
            Ok(Err(e)) => {
                let reason = format!("open failed: {e}");
                warn!("[Signaling] {} ({}/{})", reason, attempt, max);
                self.sink.emit(SignalingEvent::Disconnected { reason: reason.clone() });
                Err(reason)
            }
            Err(_) => {
                let reason = SignalingError::Timeout {
                    operation: "connect",
                    ms: self.config.connect_timeout_ms,
                }
                .to_string();
                warn!("[Signaling] {} ({}/{})", reason, attempt, max);
                self.sink.emit(SignalingEvent::Disconnected { reason: reason.clone() });
                Err(reason)
            }
        }
    }

    /// Drive an open channel until it closes. Returns the close reason.
    async fn pump(&self, ws: WsStream, mut outbound: mpsc::UnboundedReceiver<SignalingMessage>) -> String {
        let (mut write, mut read) = ws.split();
        let write_timeout = self.config.write_timeout();
        let read_timeout = self.config.read_timeout();

        let mut ping = tokio::time::interval_at(
            Instant::now() + self.config.ping_interval(),
            self.config.ping_interval(),
        );
        let read_deadline = tokio::time::sleep(read_timeout);
        tokio::pin!(read_deadline);

        loop {
            let to_send = tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = tokio::time::timeout(write_timeout, write.send(Message::Close(None))).await;
                    return "closed locally".into();
                }

                _ = &mut read_deadline => {
                    let err = SignalingError::Timeout { operation: "read", ms: self.config.read_timeout_ms };
                    warn!("[Signaling] {}", err);
                    let reason = err.to_string();
                    self.sink.emit(err.into());
                    return reason;
                }

                _ = ping.tick() => Message::Ping(Vec::new()),

                msg = outbound.recv() => match msg {
                    Some(msg) => {
                        debug!("[Signaling] Sending {}", msg.kind());
                        Message::Text(msg.to_json())
                    }
                    None => return "closed locally".into(),
                },

                frame = read.next() => {
                    read_deadline.as_mut().reset(Instant::now() + read_timeout);
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            self.handle_text(&text);
                            continue;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            return match frame {
                                Some(f) => format!("closed by peer ({}: {})", f.code, f.reason),
                                None => "closed by peer".into(),
                            };
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            let err = SignalingError::Transport(e.to_string());
                            warn!("[Signaling] {}", err);
                            let reason = err.to_string();
                            self.sink.emit(err.into());
                            return reason;
                        }
                        None => return "stream ended".into(),
                    }
                }
            };

            match tokio::time::timeout(write_timeout, write.send(to_send)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    let err = SignalingError::Transport(e.to_string());
                    warn!("[Signaling] Write failed: {}", err);
                    let reason = err.to_string();
                    self.sink.emit(err.into());
                    return reason;
                }
                Err(_) => {
                    let err = SignalingError::Timeout { operation: "write", ms: self.config.write_timeout_ms };
                    warn!("[Signaling] {}", err);
                    let reason = err.to_string();
                    self.sink.emit(err.into());
                    return reason;
                }
            }
        }
    }

    fn handle_text(&self, text: &str) {
        match parse_frame(text) {
            Ok(Inbound::Message(msg)) => {
                trace!("[Signaling] Received {}", msg.kind());
                self.sink.emit(SignalingEvent::Message(msg));
            }
            Ok(Inbound::Unknown(tag)) => {
                info!("[Signaling] Ignoring message with unknown type '{}'", tag);
            }
            Err(e) => {
                debug!("[Signaling] Dropping frame: {}", e);
            }
        }
    }
}

/// Any HTTP response counts as reachable; only transport failures fail.
async fn precheck(client: &reqwest::Client, url: &str) -> Result<(), String> {
    match client.get(url).send().await {
        Ok(resp) => {
            debug!("[Signaling] Pre-check {} → {}", url, resp.status());
            Ok(())
        }
        Err(e) if e.is_timeout() => Err(format!("pre-check timed out: {e}")),
        Err(e) => Err(format!("pre-check failed: {e}")),
    }
}
