//! pairlink-session
//!
//! The session controller: one task that owns the lifecycle state and reacts
//! to discovery, signaling, media-engine and timer events, plus the adaptive
//! quality policy it runs while streaming.

pub mod controller;
pub mod quality;

pub use controller::{SessionController, SessionHandle};
pub use quality::QualityController;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Session controller has stopped")]
    ControllerGone,
}
