use async_trait::async_trait;
use pairlink_core::{IceCandidate, MediaStats};
use thiserror::Error;
use tokio::sync::mpsc;

// MARK: - MediaEngine trait

/// Interface to the media runtime that decodes the phone's stream.
///
/// The engine owns the negotiation session. It is created lazily by the first
/// [`apply_remote_offer`](MediaEngine::apply_remote_offer) and torn down by
/// [`close`](MediaEngine::close); a later offer creates a fresh one.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Register where engine events go. Called once, before any offer.
    fn subscribe(&self, events: EngineEventSender);

    /// Create the negotiation session if needed and apply the remote offer.
    async fn apply_remote_offer(&self, sdp: &str) -> Result<(), EngineError>;

    /// Produce the local answer for the offer applied last.
    async fn create_answer(&self) -> Result<String, EngineError>;

    /// Hand a remote connectivity hint to the session.
    fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), EngineError>;

    /// Cumulative receive statistics.
    async fn stats(&self) -> Result<MediaStats, EngineError>;

    /// Release the session. Safe to call without one.
    async fn close(&self);
}

// MARK: - EngineEvent

/// Connection state of the engine's media transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl std::fmt::Display for MediaConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone)]
pub enum EngineEvent {
    ConnectionStateChanged(MediaConnectionState),
    /// A local connectivity hint to trickle to the peer.
    IceCandidateGenerated(IceCandidate),
    StatsReport(MediaStats),
}

pub type EngineEventSender = mpsc::UnboundedSender<EngineEvent>;

// MARK: - EngineError

#[derive(Error, Debug, Clone)]
pub enum EngineError {
    #[error("Failed to apply remote description: {0}")]
    RemoteDescription(String),

    #[error("Failed to create answer: {0}")]
    Answer(String),

    #[error("Failed to add ICE candidate: {0}")]
    Candidate(String),

    #[error("No negotiation session")]
    NoSession,

    #[error("Media engine unavailable: {0}")]
    Unavailable(String),
}

// MARK: - PlaceholderEngine

/// Engine para builds sem runtime de mídia. Rejeita toda oferta; cada
/// rejeição conta contra o limite de reinícios da sessão.
pub struct PlaceholderEngine;

#[async_trait]
impl MediaEngine for PlaceholderEngine {
    fn subscribe(&self, _events: EngineEventSender) {}

    async fn apply_remote_offer(&self, _sdp: &str) -> Result<(), EngineError> {
        Err(EngineError::Unavailable("PlaceholderEngine has no media runtime".into()))
    }

    async fn create_answer(&self) -> Result<String, EngineError> {
        Err(EngineError::NoSession)
    }

    fn add_ice_candidate(&self, _candidate: &IceCandidate) -> Result<(), EngineError> {
        Err(EngineError::NoSession)
    }

    async fn stats(&self) -> Result<MediaStats, EngineError> {
        Ok(MediaStats::default())
    }

    async fn close(&self) {}
}
