//! Peer discovery over UDP broadcast.
//!
//! The companion device periodically broadcasts an [`Announcement`] on the
//! discovery port. [`BroadcastListener`] binds that port on a dedicated OS
//! thread, drops anything that is not a valid announcement, and reports each
//! distinct address once per discovery session.
//!
//! ```text
//! phone ──UDP broadcast :8888──► BroadcastListener thread
//!                                    │ (dedupe by address)
//!                                    ▼
//!                          DiscoveryEvent::PeerFound ──► session mailbox
//! ```

mod announcement;

pub use announcement::{parse_announcement, Announcement};

use std::collections::HashSet;
use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use pairlink_core::config::DiscoveryConfig;
use pairlink_core::{PairLinkError, PeerEndpoint};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

// MARK: - Events

#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    /// First announcement from a new address in this discovery session.
    PeerFound(PeerEndpoint),
    /// The listening socket failed while discovery was still active.
    Error(String),
}

pub type DiscoveryEventSender = mpsc::UnboundedSender<DiscoveryEvent>;

// MARK: - Discovery trait

/// Fonte de peers para o controlador de sessão.
pub trait Discovery: Send {
    /// Inicia a escuta. Reiniciar uma descoberta ativa limpa o conjunto de vistos.
    fn start(&mut self, events: DiscoveryEventSender) -> Result<(), DiscoveryError>;

    /// Stop listening and forget every discovered peer. Idempotent, and safe
    /// to call when never started.
    fn stop(&mut self);
}

// MARK: - BroadcastListener

/// Blocking UDP listener running on its own thread.
///
/// The receive call is bounded by `receive_timeout`, so a `stop()` is picked
/// up within one timeout period. The thread is never joined or killed; it
/// observes the liveness flag and exits by itself.
pub struct BroadcastListener {
    config:  DiscoveryConfig,
    running: Option<Arc<AtomicBool>>,
    thread:  Option<JoinHandle<()>>,
}

impl BroadcastListener {
    pub fn new(config: DiscoveryConfig) -> Self {
        Self { config, running: None, thread: None }
    }

    fn bind(&self) -> std::io::Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        // A listener from the previous session may still be inside its
        // receive timeout when discovery restarts.
        socket.set_reuse_address(true)?;
        socket.set_broadcast(true)?;
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.config.port);
        socket.bind(&addr.into())?;
        socket.set_read_timeout(Some(self.config.receive_timeout()))?;
        Ok(socket.into())
    }
}

impl Discovery for BroadcastListener {
    fn start(&mut self, events: DiscoveryEventSender) -> Result<(), DiscoveryError> {
        self.stop();

        let port = self.config.port;
        let socket = self.bind().map_err(|e| match e.kind() {
            // Privileged port; retrying will not help.
            ErrorKind::PermissionDenied => DiscoveryError::PermissionDenied { port },
            _ => DiscoveryError::BindFailed { port, reason: e.to_string() },
        })?;

        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let tag = self.config.announce_tag.clone();

        let thread = std::thread::Builder::new()
            .name("pairlink-discovery".into())
            .spawn(move || listen(socket, flag, tag, events))
            .map_err(|e| DiscoveryError::BindFailed { port, reason: e.to_string() })?;

        info!("[Discovery] Listening for announcements on UDP:{}", self.config.port);
        self.running = Some(running);
        self.thread = Some(thread);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(running) = self.running.take() {
            running.store(false, Ordering::Release);
            info!("[Discovery] Stopped");
        }
        // Detach: the thread exits on its next timeout.
        self.thread.take();
    }
}

impl Drop for BroadcastListener {
    fn drop(&mut self) {
        self.stop();
    }
}

fn listen(socket: UdpSocket, running: Arc<AtomicBool>, tag: String, events: DiscoveryEventSender) {
    let mut seen: HashSet<IpAddr> = HashSet::new();
    let mut buf = [0u8; 2048];

    while running.load(Ordering::Acquire) {
        match socket.recv_from(&mut buf) {
            Ok((len, from)) => {
                if !running.load(Ordering::Acquire) {
                    break;
                }
                let Some(peer) = parse_announcement(&buf[..len], &tag) else {
                    trace!("[Discovery] Ignoring {} byte datagram from {}", len, from);
                    continue;
                };
                if !seen.insert(peer.address) {
                    trace!("[Discovery] Repeat announcement from {}", peer.address);
                    continue;
                }
                info!("[Discovery] Found peer {}", peer);
                if events.send(DiscoveryEvent::PeerFound(peer)).is_err() {
                    debug!("[Discovery] Event receiver dropped; listener exiting");
                    break;
                }
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => continue,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                if running.load(Ordering::Acquire) {
                    warn!("[Discovery] Receive failed: {}", e);
                    let _ = events.send(DiscoveryEvent::Error(e.to_string()));
                }
                break;
            }
        }
    }
    debug!("[Discovery] Listener thread exiting ({} peers seen)", seen.len());
}

// MARK: - DiscoveryError

#[derive(Debug, Clone, thiserror::Error)]
pub enum DiscoveryError {
    #[error("Cannot listen on UDP port {port}: {reason}")]
    BindFailed { port: u16, reason: String },

    #[error("Not permitted to listen on UDP port {port}")]
    PermissionDenied { port: u16 },
}

impl From<DiscoveryError> for PairLinkError {
    fn from(err: DiscoveryError) -> Self {
        match err {
            DiscoveryError::BindFailed { .. } => PairLinkError::TransientNetwork { reason: err.to_string() },
            DiscoveryError::PermissionDenied { .. } => {
                PairLinkError::ConfigurationInvalid { reason: err.to_string() }
            }
        }
    }
}
