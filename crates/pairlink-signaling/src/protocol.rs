//! Signaling wire protocol.
//!
//! Every frame is a JSON object with a `type` discriminator:
//!
//! | type              | fields                                          |
//! |-------------------|-------------------------------------------------|
//! | `SDP`             | `sdpType` (`offer`/`answer`), `sdp`             |
//! | `ICE`             | `sdpMid`, `sdpMLineIndex`, `candidate`          |
//! | `VIDEO_URL`       | `videoId`, `currentTime`                        |
//! | `VIDEO_CONTROL`   | `command` (`play`/`pause`/`seekTo`/`stop`), `value`? |
//! | `QUALITY_CONTROL` | `action` (`increase`/`decrease`)                |
//! | `TIMESTAMP`       | heartbeat, contents ignored                     |
//!
//! [`SignalingMessage`] is the domain view; [`WireMessage`] mirrors the JSON
//! layout. Offers and answers share the `SDP` tag on the wire.

use pairlink_core::{IceCandidate, PlaybackCommand, QualityDirection};
use serde::{Deserialize, Serialize};

/// Tags this side understands. Anything else is logged and ignored.
pub const KNOWN_TAGS: &[&str] = &["SDP", "ICE", "VIDEO_URL", "VIDEO_CONTROL", "QUALITY_CONTROL", "TIMESTAMP"];

// MARK: - SignalingMessage

#[derive(Debug, Clone, PartialEq)]
pub enum SignalingMessage {
    NegotiationOffer { sdp: String },
    NegotiationAnswer { sdp: String },
    IceHint(IceCandidate),
    QualityRequest(QualityDirection),
    PlaybackCommand { command: PlaybackCommand, value: Option<f64> },
    PlaybackSource { video_id: String, current_time: f64 },
    Heartbeat { timestamp_ms: Option<u64> },
}

impl SignalingMessage {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NegotiationOffer { .. } => "offer",
            Self::NegotiationAnswer { .. } => "answer",
            Self::IceHint(_) => "ice",
            Self::QualityRequest(_) => "quality",
            Self::PlaybackCommand { .. } => "video_control",
            Self::PlaybackSource { .. } => "video_url",
            Self::Heartbeat { .. } => "heartbeat",
        }
    }

    pub fn to_json(&self) -> String {
        // Every wire variant is made of strings and numbers; this cannot fail.
        serde_json::to_string(&WireMessage::from(self.clone())).unwrap_or_default()
    }
}

// MARK: - Wire layout

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WireMessage {
    #[serde(rename = "SDP")]
    Sdp {
        #[serde(rename = "sdpType")]
        sdp_type: SdpType,
        sdp: String,
    },
    #[serde(rename = "ICE")]
    Ice(IceCandidate),
    #[serde(rename = "VIDEO_URL")]
    VideoUrl {
        #[serde(rename = "videoId")]
        video_id: String,
        #[serde(rename = "currentTime")]
        current_time: f64,
    },
    #[serde(rename = "VIDEO_CONTROL")]
    VideoControl {
        command: PlaybackCommand,
        #[serde(skip_serializing_if = "Option::is_none")]
        value: Option<f64>,
    },
    #[serde(rename = "QUALITY_CONTROL")]
    QualityControl { action: QualityDirection },
    #[serde(rename = "TIMESTAMP")]
    Timestamp {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

impl From<SignalingMessage> for WireMessage {
    fn from(msg: SignalingMessage) -> Self {
        match msg {
            SignalingMessage::NegotiationOffer { sdp } => Self::Sdp { sdp_type: SdpType::Offer, sdp },
            SignalingMessage::NegotiationAnswer { sdp } => Self::Sdp { sdp_type: SdpType::Answer, sdp },
            SignalingMessage::IceHint(candidate) => Self::Ice(candidate),
            SignalingMessage::QualityRequest(action) => Self::QualityControl { action },
            SignalingMessage::PlaybackCommand { command, value } => Self::VideoControl { command, value },
            SignalingMessage::PlaybackSource { video_id, current_time } => {
                Self::VideoUrl { video_id, current_time }
            }
            SignalingMessage::Heartbeat { timestamp_ms } => Self::Timestamp { timestamp: timestamp_ms },
        }
    }
}

impl From<WireMessage> for SignalingMessage {
    fn from(wire: WireMessage) -> Self {
        match wire {
            WireMessage::Sdp { sdp_type: SdpType::Offer, sdp } => Self::NegotiationOffer { sdp },
            WireMessage::Sdp { sdp_type: SdpType::Answer, sdp } => Self::NegotiationAnswer { sdp },
            WireMessage::Ice(candidate) => Self::IceHint(candidate),
            WireMessage::VideoUrl { video_id, current_time } => Self::PlaybackSource { video_id, current_time },
            WireMessage::VideoControl { command, value } => Self::PlaybackCommand { command, value },
            WireMessage::QualityControl { action } => Self::QualityRequest(action),
            WireMessage::Timestamp { timestamp } => Self::Heartbeat { timestamp_ms: timestamp },
        }
    }
}

// MARK: - Parsing

/// Result of decoding one inbound frame.
#[derive(Debug)]
pub enum Inbound {
    Message(SignalingMessage),
    /// Well-formed JSON with a `type` this side does not handle.
    Unknown(String),
}

/// Decode one text frame.
///
/// Unknown tags are not errors; malformed JSON or a known tag with missing or
/// mistyped fields is a [`ProtocolError`].
pub fn parse_frame(text: &str) -> Result<Inbound, ProtocolError> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|e| ProtocolError::MalformedJson(e.to_string()))?;

    let tag = value
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or(ProtocolError::MissingType)?
        .to_owned();

    if !KNOWN_TAGS.contains(&tag.as_str()) {
        return Ok(Inbound::Unknown(tag));
    }

    let wire: WireMessage = serde_json::from_value(value)
        .map_err(|e| ProtocolError::InvalidFields { tag: tag.clone(), reason: e.to_string() })?;
    Ok(Inbound::Message(wire.into()))
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Malformed JSON: {0}")]
    MalformedJson(String),

    #[error("Message has no string `type` field")]
    MissingType,

    #[error("Invalid {tag} message: {reason}")]
    InvalidFields { tag: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> SignalingMessage {
        match parse_frame(text).expect("valid frame") {
            Inbound::Message(m) => m,
            Inbound::Unknown(t) => panic!("unexpected unknown tag {t}"),
        }
    }

    #[test]
    fn decodes_offer_and_answer_from_shared_tag() {
        let offer = parse(r#"{"type":"SDP","sdpType":"offer","sdp":"v=0\r\n"}"#);
        assert_eq!(offer, SignalingMessage::NegotiationOffer { sdp: "v=0\r\n".into() });
        let answer = parse(r#"{"type":"SDP","sdpType":"answer","sdp":"v=0"}"#);
        assert_eq!(answer, SignalingMessage::NegotiationAnswer { sdp: "v=0".into() });
    }

    #[test]
    fn decodes_ice_hint() {
        let msg = parse(r#"{"type":"ICE","sdpMid":"0","sdpMLineIndex":0,"candidate":"candidate:1 1 udp 2122260223 192.0.2.5 50000 typ host"}"#);
        match msg {
            SignalingMessage::IceHint(c) => {
                assert_eq!(c.sdp_mid, "0");
                assert_eq!(c.sdp_mline_index, 0);
                assert!(c.candidate.starts_with("candidate:1"));
            }
            other => panic!("expected ICE, got {other:?}"),
        }
    }

    #[test]
    fn decodes_playback_messages() {
        let url = parse(r#"{"type":"VIDEO_URL","videoId":"dQw4w9WgXcQ","currentTime":12.5}"#);
        assert_eq!(
            url,
            SignalingMessage::PlaybackSource { video_id: "dQw4w9WgXcQ".into(), current_time: 12.5 }
        );
        let seek = parse(r#"{"type":"VIDEO_CONTROL","command":"seekTo","value":42.0}"#);
        assert_eq!(seek, SignalingMessage::PlaybackCommand { command: PlaybackCommand::SeekTo, value: Some(42.0) });
        let pause = parse(r#"{"type":"VIDEO_CONTROL","command":"pause"}"#);
        assert_eq!(pause, SignalingMessage::PlaybackCommand { command: PlaybackCommand::Pause, value: None });
    }

    #[test]
    fn timestamp_is_a_heartbeat_whatever_it_carries() {
        let msg = parse(r#"{"type":"TIMESTAMP","timestamp":1700000000000,"extra":"ignored"}"#);
        assert!(matches!(msg, SignalingMessage::Heartbeat { .. }));
        assert!(matches!(parse(r#"{"type":"TIMESTAMP"}"#), SignalingMessage::Heartbeat { timestamp_ms: None }));
    }

    #[test]
    fn unknown_tags_are_not_errors() {
        match parse_frame(r#"{"type":"BATTERY","level":80}"#).expect("unknown tag is ok") {
            Inbound::Unknown(tag) => assert_eq!(tag, "BATTERY"),
            other => panic!("expected unknown, got {other:?}"),
        }
    }

    #[test]
    fn malformed_known_messages_are_errors() {
        assert!(matches!(parse_frame("{not json"), Err(ProtocolError::MalformedJson(_))));
        assert!(matches!(parse_frame(r#"{"sdp":"v=0"}"#), Err(ProtocolError::MissingType)));
        assert!(matches!(
            parse_frame(r#"{"type":"ICE","sdpMid":"0"}"#),
            Err(ProtocolError::InvalidFields { .. })
        ));
        assert!(matches!(
            parse_frame(r#"{"type":"QUALITY_CONTROL","action":"sideways"}"#),
            Err(ProtocolError::InvalidFields { .. })
        ));
    }

    #[test]
    fn encodes_quality_request_and_answer() {
        let quality: serde_json::Value =
            serde_json::from_str(&SignalingMessage::QualityRequest(QualityDirection::Decrease).to_json()).unwrap();
        assert_eq!(quality, serde_json::json!({"type": "QUALITY_CONTROL", "action": "decrease"}));

        let answer: serde_json::Value =
            serde_json::from_str(&SignalingMessage::NegotiationAnswer { sdp: "v=0".into() }.to_json()).unwrap();
        assert_eq!(answer, serde_json::json!({"type": "SDP", "sdpType": "answer", "sdp": "v=0"}));
    }
}
