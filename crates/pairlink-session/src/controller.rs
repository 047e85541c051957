use std::sync::Arc;

use pairlink_core::{
    IceCandidate, MediaStats, PairLinkError, PeerEndpoint, SessionConfig, SessionState, SessionStatus,
};
use pairlink_discovery::{Discovery, DiscoveryEvent};
use pairlink_display::DisplaySurface;
use pairlink_negotiation::{
    EngineEvent, MediaConnectionState, MediaEngine, NegotiationAdapter, NegotiationError,
};
use pairlink_signaling::{Signaling, SignalingEvent, SignalingMessage};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::quality::QualityController;
use crate::SessionError;

// MARK: - Commands

#[derive(Debug)]
enum Command {
    Start,
    Restart,
    Shutdown(oneshot::Sender<()>),
}

/// Result of an offer handled off the controller task.
struct NegotiationOutcome {
    offer: Uuid,
    result: Result<String, NegotiationError>,
}

// MARK: - SessionHandle

/// Cloneable handle to a running [`SessionController`].
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<SessionState>,
}

impl SessionHandle {
    /// Idle → Discovering. Ignored in any other state.
    pub async fn start(&self) -> Result<(), SessionError> {
        self.send(Command::Start).await
    }

    /// Leave Failed (or Idle) with fresh counters and search again.
    pub async fn restart(&self) -> Result<(), SessionError> {
        self.send(Command::Restart).await
    }

    /// Tear everything down and stop the controller. Resolves once teardown
    /// has finished. Calling it on a stopped controller is not an error.
    pub async fn shutdown(&self) -> Result<(), SessionError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown(ack_tx)).await.is_err() {
            return Ok(());
        }
        let _ = ack_rx.await;
        Ok(())
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    async fn send(&self, command: Command) -> Result<(), SessionError> {
        self.commands.send(command).await.map_err(|_| SessionError::ControllerGone)
    }
}

// MARK: - SessionController

/// Owner of [`SessionState`] and the only task that acts on it.
///
/// Discovery, signaling, engine, negotiation results, timers and handle
/// commands all arrive here and are handled one at a time:
///
/// ```text
/// Idle ─start─► Discovering ─PeerFound─► PreChecking ─passed─► ChannelConnecting
///                   ▲                                                  │ Connected
///                   │ restart timer                                    ▼
///               Recovering ◄─ channel lost / engine lost ─ ChannelReady ─offer─► MediaNegotiating
///                   │                                                  ▲                │ engine Connected
///                   └─ restart cap exceeded ─► Failed                  └──── offer ──── Streaming
/// ```
///
/// Discovery and signaling get a fresh event channel on every start/connect;
/// the old receiver is dropped, so a stale component can never reach the
/// new pass.
pub struct SessionController {
    config: SessionConfig,
    state: SessionState,
    state_tx: watch::Sender<SessionState>,

    discovery: Box<dyn Discovery>,
    signaling: Box<dyn Signaling>,
    adapter: Arc<NegotiationAdapter>,
    display: Box<dyn DisplaySurface>,

    quality: QualityController,
    quality_tick: Option<Interval>,
    last_stats: Option<MediaStats>,

    /// Post-connect restarts since the last ChannelReady.
    restart_attempts: u32,
    /// Rejected offers since the last Streaming. Survives ChannelReady.
    negotiation_failures: u32,
    restart_at: Option<Instant>,
    peer: Option<PeerEndpoint>,
    pass: Uuid,
    /// The offer currently being applied, and the id its outcome carries.
    negotiation: Option<JoinHandle<()>>,
    offer: Uuid,

    commands: mpsc::Receiver<Command>,
    discovery_rx: Option<mpsc::UnboundedReceiver<DiscoveryEvent>>,
    signaling_rx: Option<mpsc::UnboundedReceiver<SignalingEvent>>,
    engine_rx: mpsc::UnboundedReceiver<EngineEvent>,
    negotiation_tx: mpsc::UnboundedSender<NegotiationOutcome>,
    negotiation_rx: mpsc::UnboundedReceiver<NegotiationOutcome>,
}

impl SessionController {
    /// Spawn the controller on the current runtime. It stays Idle until
    /// [`SessionHandle::start`].
    pub fn spawn(
        config: SessionConfig,
        discovery: Box<dyn Discovery>,
        signaling: Box<dyn Signaling>,
        engine: Arc<dyn MediaEngine>,
        display: Box<dyn DisplaySurface>,
    ) -> (SessionHandle, JoinHandle<()>) {
        let (command_tx, commands) = mpsc::channel(16);
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        let (engine_tx, engine_rx) = mpsc::unbounded_channel();
        let (negotiation_tx, negotiation_rx) = mpsc::unbounded_channel();

        engine.subscribe(engine_tx);
        let adapter = Arc::new(NegotiationAdapter::new(engine, config.negotiation.filtered_codecs.clone()));

        let controller = Self {
            quality: QualityController::new(config.quality.clone()),
            config,
            state: SessionState::Idle,
            state_tx,
            discovery,
            signaling,
            adapter,
            display,
            quality_tick: None,
            last_stats: None,
            restart_attempts: 0,
            negotiation_failures: 0,
            restart_at: None,
            peer: None,
            pass: Uuid::new_v4(),
            negotiation: None,
            offer: Uuid::nil(),
            commands,
            discovery_rx: None,
            signaling_rx: None,
            engine_rx,
            negotiation_tx,
            negotiation_rx,
        };

        let task = tokio::spawn(controller.run());
        (SessionHandle { commands: command_tx, state: state_rx }, task)
    }

    async fn run(mut self) {
        info!("[Session] Controller ready");
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Start) => self.on_start(false).await,
                    Some(Command::Restart) => self.on_start(true).await,
                    Some(Command::Shutdown(ack)) => {
                        self.teardown().await;
                        let _ = ack.send(());
                        break;
                    }
                    None => {
                        debug!("[Session] All handles dropped");
                        self.teardown().await;
                        break;
                    }
                },

                event = recv_from(&mut self.discovery_rx) => match event {
                    Some(event) => self.on_discovery(event).await,
                    None => self.discovery_rx = None,
                },

                event = recv_from(&mut self.signaling_rx) => match event {
                    Some(event) => self.on_signaling(event).await,
                    None => self.signaling_rx = None,
                },

                Some(event) = self.engine_rx.recv() => self.on_engine(event).await,

                Some(outcome) = self.negotiation_rx.recv() => self.on_negotiation(outcome).await,

                _ = sleep_until(self.restart_at) => {
                    self.restart_at = None;
                    self.begin_pass().await;
                }

                _ = tick(&mut self.quality_tick) => self.on_quality_tick().await,
            }
        }
        info!("[Session] Controller stopped");
    }

    // ── Commands ──────────────────────────────────────────────────────────

    async fn on_start(&mut self, restart: bool) {
        let allowed = match self.state {
            SessionState::Idle => true,
            SessionState::Failed => restart,
            _ => false,
        };
        if !allowed {
            debug!("[Session] {} ignored in {}", if restart { "Restart" } else { "Start" }, self.state);
            return;
        }
        self.restart_attempts = 0;
        self.negotiation_failures = 0;
        self.restart_at = None;
        self.begin_pass().await;
    }

    /// Explicit shutdown: discovery, then channel, then engine. Safe from any
    /// state, including with a restart pending or an offer in flight.
    async fn teardown(&mut self) {
        info!("[Session] pass={} Shutting down from {}", self.pass, self.state);
        self.restart_at = None;

        self.discovery.stop();
        self.discovery_rx = None;

        self.signaling.disconnect();
        self.signaling_rx = None;

        self.release_media().await;
        self.peer = None;
        self.set_state(SessionState::Idle, "").await;
    }

    // ── Lifecycle passes ──────────────────────────────────────────────────

    /// Start a fresh discovery pass. Any previous channel is closed and the
    /// discovered-peer set is cleared.
    async fn begin_pass(&mut self) {
        self.pass = Uuid::new_v4();
        self.peer = None;
        self.stop_quality();

        self.signaling.disconnect();
        self.signaling_rx = None;

        self.discovery.stop();
        self.discovery_rx = None;

        let (tx, rx) = mpsc::unbounded_channel();
        match self.discovery.start(tx) {
            Ok(()) => {
                info!("[Session] pass={} Discovering (port {})", self.pass, self.config.discovery.port);
                self.discovery_rx = Some(rx);
                self.set_state(SessionState::Discovering, "").await;
            }
            Err(e) => {
                warn!("[Session] pass={} Discovery failed to start: {}", self.pass, e);
                self.on_error(PairLinkError::from(e)).await;
            }
        }
    }

    /// Count a failure against the restart cap and either schedule the next
    /// pass or give up.
    async fn on_error(&mut self, error: PairLinkError) {
        self.release_media().await;
        self.signaling.disconnect();
        self.signaling_rx = None;
        self.discovery.stop();
        self.discovery_rx = None;

        if !error.is_retryable() {
            self.give_up(error).await;
            return;
        }

        self.restart_attempts += 1;
        let max = self.config.recovery.max_restart_attempts;

        if self.restart_attempts > max {
            self.give_up(PairLinkError::Exhausted { attempts: max, cause: error.to_string() }).await;
            return;
        }

        let delay = self.config.recovery.backoff(self.restart_attempts);
        info!(
            "[Session] pass={} {}, restarting in {:?} (attempt {}/{})",
            self.pass, error, delay, self.restart_attempts, max
        );
        self.restart_at = Some(Instant::now() + delay);
        self.set_status(
            SessionState::Recovering,
            SessionStatus::for_state(SessionState::Recovering, error.to_string())
                .with_attempt(self.restart_attempts, max),
        )
        .await;
    }

    /// Terminal: stays Failed until [`SessionHandle::restart`]. The caller has
    /// already released everything.
    async fn give_up(&mut self, error: PairLinkError) {
        warn!("[Session] pass={} {}", self.pass, error);
        self.restart_at = None;
        self.set_status(SessionState::Failed, SessionStatus::new(error.label(), error.to_string())).await;
    }

    /// Lost the channel or the media session: clear the stream, close the
    /// channel and search again after a short pause. Does not count against
    /// the restart cap.
    async fn recover(&mut self, reason: String) {
        self.recover_with(SessionStatus::for_state(SessionState::Recovering, reason)).await;
    }

    async fn recover_with(&mut self, status: SessionStatus) {
        if self.state == SessionState::Recovering || self.restart_at.is_some() {
            trace!("[Session] Recovery already scheduled");
            return;
        }
        info!("[Session] pass={} Recovering: {}", self.pass, status.detail);
        self.release_media().await;
        self.signaling.disconnect();
        self.signaling_rx = None;

        self.restart_at = Some(Instant::now() + self.config.recovery.restart_delay());
        self.set_status(SessionState::Recovering, status).await;
    }

    /// Cancel any offer in flight, stop quality, hide the stream and release
    /// the engine session.
    async fn release_media(&mut self) {
        if let Some(task) = self.negotiation.take() {
            task.abort();
            // Wait for the abort to land so nothing touches the engine after close.
            let _ = task.await;
            debug!("[Session] Cancelled in-flight negotiation");
        }
        self.stop_quality();
        self.display.hide_stream().await;
        self.adapter.reset();
        self.adapter.engine().close().await;
        self.last_stats = None;
    }

    // ── Discovery ─────────────────────────────────────────────────────────

    async fn on_discovery(&mut self, event: DiscoveryEvent) {
        match event {
            DiscoveryEvent::PeerFound(peer) => {
                if self.state != SessionState::Discovering {
                    debug!("[Session] Ignoring {} in {}", peer, self.state);
                    return;
                }
                info!("[Session] pass={} Found {}", self.pass, peer);

                // First responder wins.
                self.discovery.stop();
                self.discovery_rx = None;

                let (tx, rx) = mpsc::unbounded_channel();
                self.signaling.connect(&peer, tx);
                self.signaling_rx = Some(rx);
                self.set_state(SessionState::PreChecking, peer.to_string()).await;
                self.peer = Some(peer);
            }
            DiscoveryEvent::Error(reason) => {
                if self.state == SessionState::Discovering {
                    self.on_error(PairLinkError::TransientNetwork { reason }).await;
                }
            }
        }
    }

    // ── Signaling ─────────────────────────────────────────────────────────

    async fn on_signaling(&mut self, event: SignalingEvent) {
        match event {
            SignalingEvent::PreCheckFailed { attempt, max_attempts, reason } => {
                self.set_status(
                    SessionState::PreChecking,
                    SessionStatus::for_state(SessionState::PreChecking, reason)
                        .with_attempt(attempt, max_attempts),
                )
                .await;
            }
            SignalingEvent::PreCheckPassed { attempt } => {
                debug!("[Session] Pre-check passed on attempt {}", attempt);
                let detail = self.peer_detail();
                self.set_state(SessionState::ChannelConnecting, detail).await;
            }
            SignalingEvent::Connected => {
                info!("[Session] pass={} Channel open", self.pass);
                self.restart_attempts = 0;
                let detail = self.peer_detail();
                self.set_state(SessionState::ChannelReady, detail).await;
            }
            SignalingEvent::Disconnected { reason } => match self.state {
                // A failed open; the channel retries on its own.
                SessionState::PreChecking | SessionState::ChannelConnecting => {
                    debug!("[Session] Channel open failed: {}", reason);
                    self.set_state(SessionState::PreChecking, reason).await;
                }
                SessionState::ChannelReady | SessionState::MediaNegotiating | SessionState::Streaming => {
                    self.recover(format!("Channel closed: {reason}")).await;
                }
                _ => trace!("[Session] Disconnected in {}: {}", self.state, reason),
            },
            SignalingEvent::Message(message) => self.on_message(message).await,
            SignalingEvent::Error(e) => {
                if self.state.has_channel() {
                    self.on_error(PairLinkError::from(e)).await;
                }
            }
        }
    }

    async fn on_message(&mut self, message: SignalingMessage) {
        if !self.state.can_send() {
            debug!("[Session] Dropping {} in {}", message.kind(), self.state);
            return;
        }
        match message {
            SignalingMessage::NegotiationOffer { sdp } => self.on_offer(sdp).await,
            SignalingMessage::IceHint(candidate) => self.adapter.add_remote_candidate(candidate),
            SignalingMessage::PlaybackSource { video_id, current_time } => {
                if let Err(e) = self.display.load_source(&video_id, current_time).await {
                    warn!("[Session] Could not load video {}: {}", video_id, e);
                }
            }
            SignalingMessage::PlaybackCommand { command, value } => {
                if let Err(e) = self.display.playback(command, value).await {
                    warn!("[Session] Playback {:?} failed: {}", command, e);
                }
            }
            SignalingMessage::Heartbeat { .. } => trace!("[Session] Heartbeat"),
            SignalingMessage::NegotiationAnswer { .. } | SignalingMessage::QualityRequest(_) => {
                debug!("[Session] Unexpected {} from peer, ignored", message.kind());
            }
        }
    }

    async fn on_offer(&mut self, sdp: String) {
        if self.state == SessionState::Streaming {
            info!("[Session] pass={} Renegotiating", self.pass);
            self.stop_quality();
        }
        self.set_state(SessionState::MediaNegotiating, "").await;

        // The newest offer wins.
        if let Some(previous) = self.negotiation.take() {
            previous.abort();
            let _ = previous.await;
        }
        self.offer = Uuid::new_v4();
        let adapter = Arc::clone(&self.adapter);
        let results = self.negotiation_tx.clone();
        let offer = self.offer;
        self.negotiation = Some(tokio::spawn(async move {
            let result = adapter.apply_offer(&sdp).await;
            let _ = results.send(NegotiationOutcome { offer, result });
        }));
    }

    async fn on_negotiation(&mut self, outcome: NegotiationOutcome) {
        let negotiating = matches!(self.state, SessionState::MediaNegotiating | SessionState::Streaming);
        if outcome.offer != self.offer || !negotiating {
            debug!("[Session] Stale negotiation result dropped");
            return;
        }
        self.negotiation = None;
        match outcome.result {
            Ok(answer) => {
                debug!("[Session] Sending answer");
                self.signaling.send(SignalingMessage::NegotiationAnswer { sdp: answer });
            }
            Err(e) => self.on_negotiation_failed(PairLinkError::from(e)).await,
        }
    }

    /// Rejected offers have their own cap. ChannelReady does not reset it, so
    /// a peer whose offers can never be accepted ends in Failed.
    async fn on_negotiation_failed(&mut self, error: PairLinkError) {
        self.negotiation_failures += 1;
        let max = self.config.recovery.max_restart_attempts;
        warn!(
            "[Session] pass={} {} (negotiation attempt {}/{})",
            self.pass, error, self.negotiation_failures, max
        );

        if self.negotiation_failures > max {
            self.release_media().await;
            self.signaling.disconnect();
            self.signaling_rx = None;
            self.give_up(PairLinkError::Exhausted { attempts: max, cause: error.to_string() }).await;
            return;
        }

        let status = SessionStatus::for_state(SessionState::Recovering, error.to_string())
            .with_attempt(self.negotiation_failures, max);
        self.recover_with(status).await;
    }

    // ── Engine ────────────────────────────────────────────────────────────

    async fn on_engine(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::ConnectionStateChanged(media) => {
                debug!("[Session] Media {} in {}", media, self.state);
                match (media, self.state) {
                    (MediaConnectionState::Connected, SessionState::MediaNegotiating) => {
                        self.enter_streaming().await;
                    }
                    (
                        MediaConnectionState::Disconnected
                        | MediaConnectionState::Failed
                        | MediaConnectionState::Closed,
                        SessionState::MediaNegotiating | SessionState::Streaming,
                    ) => {
                        self.recover(format!("Media {media}")).await;
                    }
                    _ => {}
                }
            }
            EngineEvent::IceCandidateGenerated(candidate) => self.send_local_candidate(candidate),
            EngineEvent::StatsReport(stats) => {
                debug!("[Session] Stats: {}", stats);
                self.last_stats = Some(stats);
            }
        }
    }

    fn send_local_candidate(&self, candidate: IceCandidate) {
        if self.state.can_send() {
            self.signaling.send(SignalingMessage::IceHint(candidate));
        } else {
            trace!("[Session] Local ICE candidate dropped in {}", self.state);
        }
    }

    async fn enter_streaming(&mut self) {
        info!("[Session] pass={} Streaming", self.pass);
        self.negotiation_failures = 0;
        self.display.show_stream().await;
        let detail = self.last_stats.map(|s| s.to_string()).unwrap_or_default();
        self.set_state(SessionState::Streaming, detail).await;
        self.start_quality();
    }

    // ── Quality ───────────────────────────────────────────────────────────

    fn start_quality(&mut self) {
        self.quality.reset();
        let mut interval = time::interval(self.config.quality.tick());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.quality_tick = Some(interval);
    }

    fn stop_quality(&mut self) {
        if self.quality_tick.take().is_some() {
            debug!("[Quality] Stopped");
        }
        self.quality.reset();
    }

    async fn on_quality_tick(&mut self) {
        if self.state != SessionState::Streaming {
            self.stop_quality();
            return;
        }
        let stats = match self.adapter.engine().stats().await {
            Ok(stats) => stats,
            Err(e) => {
                debug!("[Quality] Stats unavailable: {}", e);
                return;
            }
        };
        if let Some(direction) = self.quality.on_sample(stats.decoded_frames, Instant::now()) {
            info!("[Quality] Requesting {}", direction);
            self.signaling.send(SignalingMessage::QualityRequest(direction));
        }
    }

    // ── State ─────────────────────────────────────────────────────────────

    async fn set_state(&mut self, state: SessionState, detail: impl Into<String>) {
        self.set_status(state, SessionStatus::for_state(state, detail)).await;
    }

    async fn set_status(&mut self, state: SessionState, status: SessionStatus) {
        if self.state != state {
            info!("[Session] {} → {}", self.state, state);
            self.state = state;
            self.state_tx.send_replace(state);
        }
        self.display.set_status(&status).await;
    }

    fn peer_detail(&self) -> String {
        self.peer.as_ref().map(ToString::to_string).unwrap_or_default()
    }
}

// MARK: - select! helpers

async fn recv_from<T>(rx: &mut Option<mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use pairlink_core::{PlaybackCommand, QualityDirection};
    use pairlink_discovery::{DiscoveryError, DiscoveryEventSender};
    use pairlink_display::DisplayError;
    use pairlink_negotiation::{EngineError, EngineEventSender};
    use pairlink_signaling::{SignalingError, SignalingEventSender};
    use parking_lot::Mutex;

    // ── Fakes ─────────────────────────────────────────────────────────────

    /// Shared view into every fake: what they were asked to do, and the
    /// senders the controller handed them.
    #[derive(Clone, Default)]
    struct Recorder {
        calls: Arc<Mutex<Vec<String>>>,
        statuses: Arc<Mutex<Vec<SessionStatus>>>,
        sent: Arc<Mutex<Vec<SignalingMessage>>>,
        discovery_tx: Arc<Mutex<Option<DiscoveryEventSender>>>,
        signaling_tx: Arc<Mutex<Option<SignalingEventSender>>>,
        engine_tx: Arc<Mutex<Option<EngineEventSender>>>,
        decoded: Arc<AtomicU64>,
        reject_offers: Arc<AtomicBool>,
        offer_delay: Arc<Mutex<Option<Duration>>>,
        discovery_error: Arc<Mutex<Option<DiscoveryError>>>,
    }

    impl Recorder {
        fn record(&self, call: impl Into<String>) {
            self.calls.lock().push(call.into());
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }

        fn count(&self, call: &str) -> usize {
            self.calls.lock().iter().filter(|c| c.as_str() == call).count()
        }

        fn discovery(&self, event: DiscoveryEvent) {
            let tx = self.discovery_tx.lock().clone().expect("discovery is running");
            tx.send(event).expect("controller listening");
        }

        fn signaling(&self, event: SignalingEvent) {
            let tx = self.signaling_tx.lock().clone().expect("channel is connecting");
            tx.send(event).expect("controller listening");
        }

        fn engine(&self, event: EngineEvent) {
            let tx = self.engine_tx.lock().clone().expect("engine subscribed");
            tx.send(event).expect("controller listening");
        }
    }

    struct FakeDiscovery {
        rec: Recorder,
    }

    impl Discovery for FakeDiscovery {
        fn start(&mut self, events: DiscoveryEventSender) -> Result<(), DiscoveryError> {
            self.rec.record("discovery.start");
            if let Some(err) = self.rec.discovery_error.lock().clone() {
                return Err(err);
            }
            *self.rec.discovery_tx.lock() = Some(events);
            Ok(())
        }

        fn stop(&mut self) {
            self.rec.record("discovery.stop");
            *self.rec.discovery_tx.lock() = None;
        }
    }

    struct FakeSignaling {
        rec: Recorder,
    }

    impl Signaling for FakeSignaling {
        fn connect(&mut self, peer: &PeerEndpoint, events: SignalingEventSender) {
            self.rec.record(format!("signaling.connect {}", peer.socket_addr()));
            *self.rec.signaling_tx.lock() = Some(events);
        }

        fn send(&self, message: SignalingMessage) {
            self.rec.sent.lock().push(message);
        }

        fn disconnect(&mut self) {
            self.rec.record("signaling.disconnect");
            *self.rec.signaling_tx.lock() = None;
        }

        fn is_open(&self) -> bool {
            self.rec.signaling_tx.lock().is_some()
        }
    }

    struct FakeEngine {
        rec: Recorder,
    }

    #[async_trait]
    impl MediaEngine for FakeEngine {
        fn subscribe(&self, events: EngineEventSender) {
            *self.rec.engine_tx.lock() = Some(events);
        }

        async fn apply_remote_offer(&self, _sdp: &str) -> Result<(), EngineError> {
            self.rec.record("engine.offer");
            let delay = *self.rec.offer_delay.lock();
            if let Some(delay) = delay {
                time::sleep(delay).await;
                self.rec.record("engine.offer.applied");
            }
            if self.rec.reject_offers.load(Ordering::SeqCst) {
                return Err(EngineError::RemoteDescription("no decoder".into()));
            }
            Ok(())
        }

        async fn create_answer(&self) -> Result<String, EngineError> {
            Ok("v=0\r\nanswer\r\n".into())
        }

        fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), EngineError> {
            self.rec.record(format!("engine.ice {}", candidate.candidate));
            Ok(())
        }

        async fn stats(&self) -> Result<MediaStats, EngineError> {
            let decoded_frames = self.rec.decoded.fetch_add(20, Ordering::SeqCst) + 20;
            Ok(MediaStats { decoded_frames, ..Default::default() })
        }

        async fn close(&self) {
            self.rec.record("engine.close");
        }
    }

    struct FakeDisplay {
        rec: Recorder,
    }

    #[async_trait]
    impl DisplaySurface for FakeDisplay {
        async fn set_status(&mut self, status: &SessionStatus) {
            self.rec.statuses.lock().push(status.clone());
        }

        async fn show_stream(&mut self) {
            self.rec.record("display.show");
        }

        async fn hide_stream(&mut self) {
            self.rec.record("display.hide");
        }

        async fn load_source(&mut self, video_id: &str, _start_at: f64) -> Result<(), DisplayError> {
            self.rec.record(format!("display.load {video_id}"));
            Ok(())
        }

        async fn playback(&mut self, command: PlaybackCommand, _value: Option<f64>) -> Result<(), DisplayError> {
            self.rec.record(format!("display.playback {command:?}"));
            Ok(())
        }
    }

    // ── Harness ───────────────────────────────────────────────────────────

    fn spawn_with(rec: &Recorder, config: SessionConfig) -> (SessionHandle, JoinHandle<()>) {
        SessionController::spawn(
            config,
            Box::new(FakeDiscovery { rec: rec.clone() }),
            Box::new(FakeSignaling { rec: rec.clone() }),
            Arc::new(FakeEngine { rec: rec.clone() }),
            Box::new(FakeDisplay { rec: rec.clone() }),
        )
    }

    fn spawn(rec: &Recorder) -> (SessionHandle, JoinHandle<()>) {
        spawn_with(rec, SessionConfig::default())
    }

    async fn wait_for(handle: &SessionHandle, state: SessionState) {
        let mut rx = handle.watch_state();
        time::timeout(Duration::from_secs(120), rx.wait_for(|s| *s == state))
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {state}, still {}", handle.state()))
            .expect("controller alive");
    }

    async fn wait_until(what: &str, condition: impl Fn() -> bool) {
        let poll = async {
            while !condition() {
                time::sleep(Duration::from_millis(10)).await;
            }
        };
        time::timeout(Duration::from_secs(120), poll)
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
    }

    fn phone() -> PeerEndpoint {
        PeerEndpoint::new("192.0.2.5".parse().unwrap(), 9000, "Phone")
    }

    async fn reach_channel_ready(rec: &Recorder, handle: &SessionHandle) {
        handle.start().await.unwrap();
        connect_phone(rec, handle).await;
    }

    /// From a fresh discovery pass to an open channel.
    async fn connect_phone(rec: &Recorder, handle: &SessionHandle) {
        wait_for(handle, SessionState::Discovering).await;
        rec.discovery(DiscoveryEvent::PeerFound(phone()));
        wait_for(handle, SessionState::PreChecking).await;
        rec.signaling(SignalingEvent::PreCheckPassed { attempt: 1 });
        wait_for(handle, SessionState::ChannelConnecting).await;
        rec.signaling(SignalingEvent::Connected);
        wait_for(handle, SessionState::ChannelReady).await;
    }

    async fn reach_streaming(rec: &Recorder, handle: &SessionHandle) {
        reach_channel_ready(rec, handle).await;
        rec.signaling(SignalingEvent::Message(SignalingMessage::NegotiationOffer { sdp: "v=0\r\n".into() }));
        wait_for(handle, SessionState::MediaNegotiating).await;
        rec.engine(EngineEvent::ConnectionStateChanged(MediaConnectionState::Connected));
        wait_for(handle, SessionState::Streaming).await;
    }

    fn send_offer(rec: &Recorder) {
        rec.signaling(SignalingEvent::Message(SignalingMessage::NegotiationOffer { sdp: "v=0\r\n".into() }));
    }

    fn last_status(rec: &Recorder) -> SessionStatus {
        rec.statuses.lock().last().cloned().expect("a status was shown")
    }

    fn position(calls: &[String], call: &str) -> usize {
        calls.iter().position(|c| c == call).unwrap_or_else(|| panic!("{call} not in {calls:?}"))
    }

    // ── Tests ─────────────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn discovered_peer_reaches_channel_ready() {
        let rec = Recorder::default();
        let (handle, _task) = spawn(&rec);
        assert_eq!(handle.state(), SessionState::Idle);

        reach_channel_ready(&rec, &handle).await;

        let calls = rec.calls();
        assert!(calls.contains(&"signaling.connect 192.0.2.5:9000".to_string()));
        // Discovery stops before the channel is opened.
        assert!(position(&calls, "discovery.stop") < position(&calls, "signaling.connect 192.0.2.5:9000"));
        let last = rec.statuses.lock().last().cloned().unwrap();
        assert_eq!(last.label, "Connected");
        assert!(last.detail.contains("Phone"));
    }

    #[tokio::test(start_paused = true)]
    async fn second_peer_in_same_pass_is_ignored() {
        let rec = Recorder::default();
        let (handle, _task) = spawn(&rec);
        handle.start().await.unwrap();
        wait_for(&handle, SessionState::Discovering).await;

        let tx = rec.discovery_tx.lock().clone().unwrap();
        tx.send(DiscoveryEvent::PeerFound(phone())).unwrap();
        let other = PeerEndpoint::new("192.0.2.9".parse().unwrap(), 9000, "Tablet");
        let _ = tx.send(DiscoveryEvent::PeerFound(other));

        wait_for(&handle, SessionState::PreChecking).await;
        time::sleep(Duration::from_millis(100)).await;
        assert_eq!(
            rec.calls().iter().filter(|c| c.starts_with("signaling.connect")).count(),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn precheck_failures_show_attempt_counter() {
        let rec = Recorder::default();
        let (handle, _task) = spawn(&rec);
        handle.start().await.unwrap();
        wait_for(&handle, SessionState::Discovering).await;
        rec.discovery(DiscoveryEvent::PeerFound(phone()));
        wait_for(&handle, SessionState::PreChecking).await;

        rec.signaling(SignalingEvent::PreCheckFailed {
            attempt: 2,
            max_attempts: 5,
            reason: "connection refused".into(),
        });
        wait_until("attempt status", || {
            rec.statuses.lock().last().map_or(false, |s| s.attempt.is_some())
        })
        .await;
        let status = rec.statuses.lock().last().cloned().unwrap();
        assert_eq!(status.to_string(), "Checking phone… (attempt 2/5) — connection refused");
        assert_eq!(handle.state(), SessionState::PreChecking);
    }

    #[tokio::test(start_paused = true)]
    async fn offer_is_answered_and_early_hints_replayed() {
        let rec = Recorder::default();
        let (handle, _task) = spawn(&rec);
        reach_channel_ready(&rec, &handle).await;

        rec.signaling(SignalingEvent::Message(SignalingMessage::IceHint(IceCandidate::new("0", 0, "candidate:1"))));
        rec.signaling(SignalingEvent::Message(SignalingMessage::IceHint(IceCandidate::new("0", 0, "candidate:2"))));
        rec.signaling(SignalingEvent::Message(SignalingMessage::NegotiationOffer { sdp: "v=0\r\n".into() }));
        wait_for(&handle, SessionState::MediaNegotiating).await;

        wait_until("answer sent", || {
            rec.sent.lock().iter().any(|m| matches!(m, SignalingMessage::NegotiationAnswer { .. }))
        })
        .await;

        let calls = rec.calls();
        let offer = position(&calls, "engine.offer");
        assert!(offer < position(&calls, "engine.ice candidate:1"));
        assert!(position(&calls, "engine.ice candidate:1") < position(&calls, "engine.ice candidate:2"));
    }

    #[tokio::test(start_paused = true)]
    async fn streaming_sends_quality_increase_after_good_streak() {
        let rec = Recorder::default();
        let (handle, _task) = spawn(&rec);
        reach_streaming(&rec, &handle).await;
        assert!(rec.calls().contains(&"display.show".to_string()));

        wait_until("quality request", || {
            rec.sent.lock().iter().any(|m| matches!(m, SignalingMessage::QualityRequest(_)))
        })
        .await;
        let requests: Vec<_> = rec
            .sent
            .lock()
            .iter()
            .filter_map(|m| match m {
                SignalingMessage::QualityRequest(d) => Some(*d),
                _ => None,
            })
            .collect();
        assert_eq!(requests, vec![QualityDirection::Increase]);
    }

    #[tokio::test(start_paused = true)]
    async fn local_candidates_are_trickled_once_channel_is_open() {
        let rec = Recorder::default();
        let (handle, _task) = spawn(&rec);
        reach_channel_ready(&rec, &handle).await;

        rec.engine(EngineEvent::IceCandidateGenerated(IceCandidate::new("0", 0, "candidate:local")));
        wait_until("local candidate sent", || {
            rec.sent.lock().iter().any(|m| matches!(m, SignalingMessage::IceHint(c) if c.candidate == "candidate:local"))
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn media_loss_recovers_and_restarts_discovery() {
        let rec = Recorder::default();
        let (handle, _task) = spawn(&rec);
        reach_streaming(&rec, &handle).await;

        rec.engine(EngineEvent::ConnectionStateChanged(MediaConnectionState::Failed));
        wait_for(&handle, SessionState::Recovering).await;
        let calls = rec.calls();
        assert!(calls.contains(&"display.hide".to_string()));
        assert!(calls.contains(&"engine.close".to_string()));

        wait_for(&handle, SessionState::Discovering).await;
        assert_eq!(rec.count("discovery.start"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn peer_closing_channel_recovers() {
        let rec = Recorder::default();
        let (handle, _task) = spawn(&rec);
        reach_channel_ready(&rec, &handle).await;

        rec.signaling(SignalingEvent::Disconnected { reason: "peer closed".into() });
        wait_for(&handle, SessionState::Recovering).await;
        wait_for(&handle, SessionState::Discovering).await;
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_offer_takes_recovery_path() {
        let rec = Recorder::default();
        rec.reject_offers.store(true, Ordering::SeqCst);
        let (handle, _task) = spawn(&rec);
        reach_channel_ready(&rec, &handle).await;

        rec.signaling(SignalingEvent::Message(SignalingMessage::NegotiationOffer { sdp: "v=0\r\n".into() }));
        wait_for(&handle, SessionState::Recovering).await;
        let status = rec.statuses.lock().last().cloned().unwrap();
        assert!(status.detail.contains("no decoder"), "{status}");
    }

    #[tokio::test(start_paused = true)]
    async fn playback_is_forwarded_only_with_open_channel() {
        let rec = Recorder::default();
        let (handle, _task) = spawn(&rec);
        handle.start().await.unwrap();
        wait_for(&handle, SessionState::Discovering).await;
        rec.discovery(DiscoveryEvent::PeerFound(phone()));
        wait_for(&handle, SessionState::PreChecking).await;

        rec.signaling(SignalingEvent::Message(SignalingMessage::PlaybackSource {
            video_id: "early".into(),
            current_time: 0.0,
        }));
        rec.signaling(SignalingEvent::PreCheckPassed { attempt: 1 });
        rec.signaling(SignalingEvent::Connected);
        wait_for(&handle, SessionState::ChannelReady).await;

        rec.signaling(SignalingEvent::Message(SignalingMessage::PlaybackSource {
            video_id: "dQw4w9WgXcQ".into(),
            current_time: 12.5,
        }));
        rec.signaling(SignalingEvent::Message(SignalingMessage::PlaybackCommand {
            command: PlaybackCommand::Pause,
            value: None,
        }));
        wait_until("playback forwarded", || rec.count("display.playback Pause") == 1).await;

        assert_eq!(rec.count("display.load early"), 0);
        assert_eq!(rec.count("display.load dQw4w9WgXcQ"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_cap_ends_in_failed_and_restart_leaves_it() {
        let rec = Recorder::default();
        let mut config = SessionConfig::default();
        config.recovery.max_restart_attempts = 2;
        let (handle, _task) = spawn_with(&rec, config);
        handle.start().await.unwrap();

        for _ in 0..3 {
            wait_for(&handle, SessionState::Discovering).await;
            rec.discovery(DiscoveryEvent::PeerFound(phone()));
            wait_for(&handle, SessionState::PreChecking).await;
            rec.signaling(SignalingEvent::Error(SignalingError::PeerUnreachable {
                attempts: 5,
                reason: "connection refused".into(),
            }));
        }
        wait_for(&handle, SessionState::Failed).await;

        let status = rec.statuses.lock().last().cloned().unwrap();
        assert_eq!(status.label, "Connection failed");
        assert!(status.detail.contains("connection refused"), "{status}");

        // Nothing restarts by itself from Failed.
        let starts = rec.count("discovery.start");
        time::sleep(Duration::from_secs(60)).await;
        assert_eq!(rec.count("discovery.start"), starts);
        assert_eq!(handle.state(), SessionState::Failed);

        handle.start().await.unwrap();
        time::sleep(Duration::from_millis(10)).await;
        assert_eq!(handle.state(), SessionState::Failed);

        handle.restart().await.unwrap();
        wait_for(&handle, SessionState::Discovering).await;
    }

    #[tokio::test(start_paused = true)]
    async fn channel_ready_resets_restart_counter() {
        let rec = Recorder::default();
        let mut config = SessionConfig::default();
        config.recovery.max_restart_attempts = 1;
        let (handle, _task) = spawn_with(&rec, config);
        handle.start().await.unwrap();

        // One failure uses the only retry...
        wait_for(&handle, SessionState::Discovering).await;
        rec.discovery(DiscoveryEvent::PeerFound(phone()));
        wait_for(&handle, SessionState::PreChecking).await;
        rec.signaling(SignalingEvent::Error(SignalingError::Transport("reset".into())));
        wait_for(&handle, SessionState::Recovering).await;

        // ...but a successful connection gives it back.
        wait_for(&handle, SessionState::Discovering).await;
        rec.discovery(DiscoveryEvent::PeerFound(phone()));
        wait_for(&handle, SessionState::PreChecking).await;
        rec.signaling(SignalingEvent::Connected);
        wait_for(&handle, SessionState::ChannelReady).await;

        rec.signaling(SignalingEvent::Error(SignalingError::Timeout { operation: "read", ms: 15_000 }));
        wait_for(&handle, SessionState::Recovering).await;
        wait_for(&handle, SessionState::Discovering).await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_from_streaming_releases_in_order() {
        let rec = Recorder::default();
        let (handle, task) = spawn(&rec);
        reach_streaming(&rec, &handle).await;
        rec.calls.lock().clear();

        handle.shutdown().await.unwrap();
        task.await.unwrap();

        let calls = rec.calls();
        let discovery = position(&calls, "discovery.stop");
        let channel = position(&calls, "signaling.disconnect");
        let engine = position(&calls, "engine.close");
        assert!(discovery < channel && channel < engine, "{calls:?}");
        assert_eq!(handle.state(), SessionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_from_discovering() {
        let rec = Recorder::default();
        let (handle, task) = spawn(&rec);
        handle.start().await.unwrap();
        wait_for(&handle, SessionState::Discovering).await;

        handle.shutdown().await.unwrap();
        task.await.unwrap();
        assert!(rec.discovery_tx.lock().is_none());
        assert_eq!(handle.state(), SessionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_mid_retry_cancels_the_timer() {
        let rec = Recorder::default();
        let (handle, task) = spawn(&rec);
        handle.start().await.unwrap();
        wait_for(&handle, SessionState::Discovering).await;
        rec.discovery(DiscoveryEvent::Error("socket closed".into()));
        wait_for(&handle, SessionState::Recovering).await;

        handle.shutdown().await.unwrap();
        task.await.unwrap();

        let starts = rec.count("discovery.start");
        time::sleep(Duration::from_secs(60)).await;
        assert_eq!(rec.count("discovery.start"), starts);
        assert!(handle.start().await.is_err());
        // A second shutdown on a stopped controller is harmless.
        handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_from_failed() {
        let rec = Recorder::default();
        let mut config = SessionConfig::default();
        config.recovery.max_restart_attempts = 0;
        let (handle, task) = spawn_with(&rec, config);
        handle.start().await.unwrap();
        wait_for(&handle, SessionState::Discovering).await;
        rec.discovery(DiscoveryEvent::Error("bind failed".into()));
        wait_for(&handle, SessionState::Failed).await;

        handle.shutdown().await.unwrap();
        task.await.unwrap();
        assert_eq!(handle.state(), SessionState::Idle);
        assert!(rec.calls().contains(&"engine.close".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_offers_across_channel_ready_end_in_failed() {
        let rec = Recorder::default();
        rec.reject_offers.store(true, Ordering::SeqCst);
        let mut config = SessionConfig::default();
        config.recovery.max_restart_attempts = 1;
        let (handle, _task) = spawn_with(&rec, config);

        reach_channel_ready(&rec, &handle).await;
        send_offer(&rec);
        wait_for(&handle, SessionState::Recovering).await;
        assert!(last_status(&rec).to_string().contains("(attempt 1/1)"), "{}", last_status(&rec));

        // ChannelReady on the next pass does not give the attempt back.
        connect_phone(&rec, &handle).await;
        send_offer(&rec);
        wait_for(&handle, SessionState::Failed).await;

        let status = last_status(&rec);
        assert_eq!(status.label, "Connection failed");
        assert!(status.detail.contains("no decoder"), "{status}");
        assert!(rec.signaling_tx.lock().is_none());

        time::sleep(Duration::from_secs(60)).await;
        assert_eq!(rec.count("discovery.start"), 2);
        assert_eq!(handle.state(), SessionState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn streaming_resets_negotiation_attempts() {
        let rec = Recorder::default();
        let mut config = SessionConfig::default();
        config.recovery.max_restart_attempts = 1;
        let (handle, _task) = spawn_with(&rec, config);

        rec.reject_offers.store(true, Ordering::SeqCst);
        reach_channel_ready(&rec, &handle).await;
        send_offer(&rec);
        wait_for(&handle, SessionState::Recovering).await;

        rec.reject_offers.store(false, Ordering::SeqCst);
        connect_phone(&rec, &handle).await;
        send_offer(&rec);
        wait_for(&handle, SessionState::MediaNegotiating).await;
        rec.engine(EngineEvent::ConnectionStateChanged(MediaConnectionState::Connected));
        wait_for(&handle, SessionState::Streaming).await;
        rec.engine(EngineEvent::ConnectionStateChanged(MediaConnectionState::Failed));
        wait_for(&handle, SessionState::Recovering).await;

        rec.reject_offers.store(true, Ordering::SeqCst);
        connect_phone(&rec, &handle).await;
        send_offer(&rec);
        wait_for(&handle, SessionState::Recovering).await;
        assert!(last_status(&rec).to_string().contains("(attempt 1/1)"), "{}", last_status(&rec));
    }

    #[tokio::test(start_paused = true)]
    async fn offer_in_flight_is_cancelled_when_media_is_lost() {
        let rec = Recorder::default();
        *rec.offer_delay.lock() = Some(Duration::from_secs(5));
        let (handle, _task) = spawn(&rec);

        reach_channel_ready(&rec, &handle).await;
        send_offer(&rec);
        wait_for(&handle, SessionState::MediaNegotiating).await;
        wait_until("offer reached engine", || rec.count("engine.offer") == 1).await;

        rec.engine(EngineEvent::ConnectionStateChanged(MediaConnectionState::Failed));
        wait_for(&handle, SessionState::Recovering).await;

        // Next pass: a hint that arrives before the new offer must be held.
        connect_phone(&rec, &handle).await;
        rec.signaling(SignalingEvent::Message(SignalingMessage::IceHint(IceCandidate::new("0", 0, "candidate:early"))));
        time::sleep(Duration::from_secs(10)).await;

        assert_eq!(rec.count("engine.offer.applied"), 0, "{:?}", rec.calls());
        assert_eq!(rec.count("engine.ice candidate:early"), 0, "{:?}", rec.calls());
        assert!(rec.sent.lock().iter().all(|m| !matches!(m, SignalingMessage::NegotiationAnswer { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_offer_in_flight() {
        let rec = Recorder::default();
        *rec.offer_delay.lock() = Some(Duration::from_secs(5));
        let (handle, task) = spawn(&rec);

        reach_channel_ready(&rec, &handle).await;
        send_offer(&rec);
        wait_until("offer reached engine", || rec.count("engine.offer") == 1).await;

        handle.shutdown().await.unwrap();
        task.await.unwrap();
        time::sleep(Duration::from_secs(10)).await;
        assert_eq!(rec.count("engine.offer.applied"), 0, "{:?}", rec.calls());
    }

    #[tokio::test(start_paused = true)]
    async fn discovery_bind_failure_is_retried_up_to_cap() {
        let rec = Recorder::default();
        *rec.discovery_error.lock() =
            Some(DiscoveryError::BindFailed { port: 8888, reason: "address in use".into() });
        let mut config = SessionConfig::default();
        config.recovery.max_restart_attempts = 2;
        let (handle, _task) = spawn_with(&rec, config);

        handle.start().await.unwrap();
        wait_for(&handle, SessionState::Failed).await;

        assert_eq!(rec.count("discovery.start"), 3);
        let statuses = rec.statuses.lock().clone();
        assert!(statuses.iter().any(|s| s.to_string().contains("(attempt 2/2)")), "{statuses:?}");
        let status = last_status(&rec);
        assert_eq!(status.label, "Connection failed");
        assert!(status.detail.contains("address in use"), "{status}");
    }

    #[tokio::test(start_paused = true)]
    async fn discovery_permission_error_fails_without_retry() {
        let rec = Recorder::default();
        *rec.discovery_error.lock() = Some(DiscoveryError::PermissionDenied { port: 80 });
        let (handle, _task) = spawn(&rec);

        handle.start().await.unwrap();
        wait_for(&handle, SessionState::Failed).await;

        assert_eq!(rec.count("discovery.start"), 1);
        let status = last_status(&rec);
        assert_eq!(status.label, "Invalid configuration");
        assert!(status.detail.contains("UDP port 80"), "{status}");
    }
}
