use thiserror::Error;

/// Session-level error taxonomy.
///
/// Component crates convert their own errors into one of these classes so the
/// session controller can pick a recovery path without knowing the component.
#[derive(Error, Debug)]
pub enum PairLinkError {
    /// Pre-check failure, channel timeout, socket failure. Retried with backoff.
    #[error("Network unavailable: {reason}")]
    TransientNetwork { reason: String },

    /// Malformed or unknown message. Logged and dropped.
    #[error("Protocol error: {reason}")]
    Protocol { reason: String },

    /// The media engine rejected an offer or could not answer it.
    #[error("Negotiation failed: {reason}")]
    Negotiation { reason: String },

    /// A retry cap was reached; no further automatic action.
    #[error("Gave up after {attempts} attempts: {cause}")]
    Exhausted { attempts: u32, cause: String },

    #[error("Configuration invalid: {reason}")]
    ConfigurationInvalid { reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PairLinkError {
    /// Short label for the status line. The `Display` text is the detail.
    pub fn label(&self) -> &'static str {
        match self {
            Self::TransientNetwork { .. } => "Network problem",
            Self::Protocol { .. } => "Unexpected message",
            Self::Negotiation { .. } => "Video setup failed",
            Self::Exhausted { .. } => "Connection failed",
            Self::ConfigurationInvalid { .. } => "Invalid configuration",
            Self::Io(_) => "System error",
        }
    }

    /// Whether the session controller may retry after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransientNetwork { .. } | Self::Negotiation { .. } | Self::Io(_)
        )
    }
}
