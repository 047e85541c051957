use std::net::{IpAddr, SocketAddr};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

// MARK: - PeerEndpoint

/// A companion device found on the local network.
///
/// Created on the first announcement from a new address and never mutated
/// afterwards. Two endpoints are the same peer when their addresses match.
#[derive(Debug, Clone)]
pub struct PeerEndpoint {
    pub address: IpAddr,
    pub port: u16,
    pub display_name: String,
    pub first_seen_at: SystemTime,
}

impl PeerEndpoint {
    pub fn new(address: IpAddr, port: u16, display_name: impl Into<String>) -> Self {
        Self {
            address,
            port,
            display_name: display_name.into(),
            first_seen_at: SystemTime::now(),
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

impl PartialEq for PeerEndpoint {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Eq for PeerEndpoint {}

impl std::fmt::Display for PeerEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "'{}' at {}", self.display_name, self.socket_addr())
    }
}

// MARK: - SessionState

/// Lifecycle state of the pairing session.
///
/// Owned by the session controller; everything else only observes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Discovering,
    PreChecking,
    ChannelConnecting,
    ChannelReady,
    MediaNegotiating,
    Streaming,
    Recovering,
    Failed,
}

impl SessionState {
    /// Whether negotiation and quality messages may be sent to the peer.
    pub fn can_send(&self) -> bool {
        matches!(self, Self::ChannelReady | Self::MediaNegotiating | Self::Streaming)
    }

    /// Whether a signaling channel attempt is in flight or open.
    pub fn has_channel(&self) -> bool {
        matches!(
            self,
            Self::PreChecking
                | Self::ChannelConnecting
                | Self::ChannelReady
                | Self::MediaNegotiating
                | Self::Streaming
        )
    }

    /// Short user-facing label.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Idle              => "Idle",
            Self::Discovering       => "Searching for phone…",
            Self::PreChecking       => "Checking phone…",
            Self::ChannelConnecting => "Connecting…",
            Self::ChannelReady      => "Connected",
            Self::MediaNegotiating  => "Starting video…",
            Self::Streaming         => "Streaming",
            Self::Recovering        => "Reconnecting…",
            Self::Failed            => "Connection failed",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

// MARK: - QualityDirection

/// Direction of a stream quality change requested from the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityDirection {
    Increase,
    Decrease,
}

impl std::fmt::Display for QualityDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Increase => write!(f, "increase"),
            Self::Decrease => write!(f, "decrease"),
        }
    }
}

// MARK: - IceCandidate

/// A connectivity hint exchanged during media negotiation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    #[serde(rename = "sdpMid")]
    pub sdp_mid: String,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: u16,
    pub candidate: String,
}

impl IceCandidate {
    pub fn new(sdp_mid: impl Into<String>, sdp_mline_index: u16, candidate: impl Into<String>) -> Self {
        Self {
            sdp_mid: sdp_mid.into(),
            sdp_mline_index,
            candidate: candidate.into(),
        }
    }
}

// MARK: - PlaybackCommand

/// Remote control of the secondary video-playback widget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PlaybackCommand {
    Play,
    Pause,
    SeekTo,
    Stop,
}

// MARK: - MediaStats

/// Cumulative receive statistics reported by the media engine.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MediaStats {
    pub decoded_frames: u64,
    pub rtt_ms: f64,
    pub jitter_ms: f64,
    pub fps: f64,
    pub dropped_frames: u64,
}

impl std::fmt::Display for MediaStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:.0} fps, rtt {:.0} ms, jitter {:.1} ms, {} dropped",
            self.fps, self.rtt_ms, self.jitter_ms, self.dropped_frames
        )
    }
}

// MARK: - SessionStatus

/// Retry progress shown next to a status label, e.g. "attempt 2/5".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempt {
    pub current: u32,
    pub max: u32,
}

/// What the display shows about the session: a short label plus detail.
///
/// For failures the detail carries the underlying cause text verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub label: String,
    pub detail: String,
    pub attempt: Option<Attempt>,
}

impl SessionStatus {
    pub fn new(label: impl Into<String>, detail: impl Into<String>) -> Self {
        Self { label: label.into(), detail: detail.into(), attempt: None }
    }

    pub fn for_state(state: SessionState, detail: impl Into<String>) -> Self {
        Self::new(state.label(), detail)
    }

    pub fn with_attempt(mut self, current: u32, max: u32) -> Self {
        self.attempt = Some(Attempt { current, max });
        self
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label)?;
        if let Some(a) = self.attempt {
            write!(f, " (attempt {}/{})", a.current, a.max)?;
        }
        if !self.detail.is_empty() {
            write!(f, " — {}", self.detail)?;
        }
        Ok(())
    }
}
