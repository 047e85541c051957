//! pairlink-signaling
//!
//! Message channel between the display and the paired phone.
//!
//! # Architecture
//!
//! ```text
//! Display (this crate)                      Phone
//! ───────────────────────────────           ──────────────────────────
//! WebSocketChannel ── GET /status ────────► HTTP status endpoint
//!                  ── ws /signaling ──────► signaling server
//!                  ◄── SDP / ICE / VIDEO_* ─
//!                  ─── SDP answer / ICE / QUALITY_CONTROL ──►
//! ```

pub mod channel;
pub mod protocol;

pub use channel::{Signaling, WebSocketChannel};
pub use protocol::{parse_frame, Inbound, ProtocolError, SdpType, SignalingMessage, WireMessage};

use pairlink_core::PairLinkError;
use tokio::sync::mpsc;

// MARK: - SignalingEvent

#[derive(Debug)]
pub enum SignalingEvent {
    /// The status endpoint did not answer; another attempt may follow.
    PreCheckFailed { attempt: u32, max_attempts: u32, reason: String },
    /// The status endpoint answered; the channel is being opened.
    PreCheckPassed { attempt: u32 },
    /// The channel is open.
    Connected,
    /// The channel closed, or an open attempt failed.
    Disconnected { reason: String },
    Message(SignalingMessage),
    /// Retries exhausted, or an open channel timed out or broke.
    Error(SignalingError),
}

impl From<SignalingError> for SignalingEvent {
    fn from(err: SignalingError) -> Self {
        Self::Error(err)
    }
}

pub type SignalingEventSender = mpsc::UnboundedSender<SignalingEvent>;

// MARK: - SignalingError

#[derive(Debug, Clone, thiserror::Error)]
pub enum SignalingError {
    #[error("Peer unreachable after {attempts} attempts: {reason}")]
    PeerUnreachable { attempts: u32, reason: String },

    #[error("Signaling {operation} timed out after {ms}ms")]
    Timeout { operation: &'static str, ms: u64 },

    #[error("Signaling channel failed: {0}")]
    Transport(String),
}

impl From<SignalingError> for PairLinkError {
    fn from(err: SignalingError) -> Self {
        PairLinkError::TransientNetwork { reason: err.to_string() }
    }
}
