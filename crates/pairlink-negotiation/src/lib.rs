//! pairlink-negotiation
//!
//! Media negotiation between the phone's offer and the local media engine.
//!
//! ```text
//! Signaling ── offer ──► NegotiationAdapter ── filtered offer ──► MediaEngine
//!           ◄─ answer ──                    ◄─ answer ───────────
//!           ── ICE ────► (queued until the first offer) ─────────►
//! ```

pub mod adapter;
pub mod engine;
pub mod sdp;

pub use adapter::NegotiationAdapter;
pub use engine::{
    EngineError, EngineEvent, EngineEventSender, MediaConnectionState, MediaEngine, PlaceholderEngine,
};
pub use sdp::{filter_codec, filter_codecs};

use pairlink_core::PairLinkError;
use thiserror::Error;

// MARK: - NegotiationError

#[derive(Error, Debug, Clone)]
pub enum NegotiationError {
    #[error("Offer rejected by media engine: {0}")]
    OfferRejected(String),

    #[error("Could not produce answer: {0}")]
    AnswerFailed(String),

    #[error("Session was reset while the offer was being applied")]
    Superseded,
}

impl From<NegotiationError> for PairLinkError {
    fn from(err: NegotiationError) -> Self {
        PairLinkError::Negotiation { reason: err.to_string() }
    }
}
