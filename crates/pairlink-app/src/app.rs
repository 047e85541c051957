use std::sync::Arc;

use anyhow::{Context, Result};
use pairlink_core::{SessionConfig, SessionState};
use pairlink_discovery::BroadcastListener;
use pairlink_display::LogSurface;
use pairlink_negotiation::{MediaEngine, PlaceholderEngine};
use pairlink_session::SessionController;
use pairlink_signaling::WebSocketChannel;
use tracing::{info, warn};

/// Main display loop.
///
/// # Configuration
/// `PAIRLINK_CONFIG` names a JSON file (camelCase or snake_case keys, every
/// field optional); `PAIRLINK_DISCOVERY_PORT` overrides the broadcast port.
///
/// # Flow
/// 1. Listen for the phone's broadcast announcement
/// 2. Pre-check its status endpoint, then open the signaling channel
/// 3. Answer its media offer and stream
/// 4. On loss, recover and search again until the restart cap
///
/// Runs until Ctrl-C. A session that ends in Failed stays there; the status
/// line carries the cause.
pub async fn run() -> Result<()> {
    let config = SessionConfig::from_env().context("loading configuration")?;
    info!(
        "Discovery on udp/{} (tag {}), filtering codecs {:?}",
        config.discovery.port, config.discovery.announce_tag, config.negotiation.filtered_codecs
    );

    let discovery = BroadcastListener::new(config.discovery.clone());
    let signaling = WebSocketChannel::new(config.signaling.clone());
    // No media runtime is linked into this build. Every offer is rejected and
    // counts against the restart cap, so a phone that offers video ends in
    // Failed ("Video setup failed" cause) once the cap is used up.
    let engine: Arc<dyn MediaEngine> = Arc::new(PlaceholderEngine);

    let (session, task) = SessionController::spawn(
        config,
        Box::new(discovery),
        Box::new(signaling),
        engine,
        Box::new(LogSurface::new()),
    );
    session.start().await.context("starting session")?;

    let mut state = session.watch_state();
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("waiting for Ctrl-C")?;
                info!("Ctrl-C received, shutting down...");
                break;
            }
            changed = state.changed() => {
                if changed.is_err() {
                    warn!("Session controller stopped unexpectedly");
                    break;
                }
                if *state.borrow_and_update() == SessionState::Failed {
                    warn!("Session failed. Restart the display to search again.");
                }
            }
        }
    }

    session.shutdown().await.context("shutting down session")?;
    task.await.context("session task panicked")?;
    Ok(())
}
