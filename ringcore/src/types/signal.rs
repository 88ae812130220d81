//! Call signaling messages.
//!
//! In memory a [`Signal`] is a tagged union: each event carries exactly the
//! fields it needs. On the wire it is the flat JSON object the delivery
//! channel carries, with `event`, the three routing keys and at most one of
//! `type`, `sdp` or `candidate`:
//!
//! ```json
//! {"event":"OFFER","call_id":"..","sender_id":"..","receiver_id":"..","sdp":{"type":"offer","sdp":"v=0.."}}
//! ```

use super::call::{CallId, CallType, UserId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Signal event names as they appear in the `event` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalEvent {
    CallInit,
    CallAccept,
    CallDecline,
    CallEnd,
    Offer,
    Answer,
    IceCandidate,
}

impl SignalEvent {
    pub const ALL: [SignalEvent; 7] = [
        Self::CallInit,
        Self::CallAccept,
        Self::CallDecline,
        Self::CallEnd,
        Self::Offer,
        Self::Answer,
        Self::IceCandidate,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::CallInit => "CALL_INIT",
            Self::CallAccept => "CALL_ACCEPT",
            Self::CallDecline => "CALL_DECLINE",
            Self::CallEnd => "CALL_END",
            Self::Offer => "OFFER",
            Self::Answer => "ANSWER",
            Self::IceCandidate => "ICE_CANDIDATE",
        }
    }

    /// Session descriptions additionally travel the durable path.
    pub const fn is_durable(&self) -> bool {
        matches!(self, Self::Offer | Self::Answer)
    }
}

impl fmt::Display for SignalEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// Session description payload. The SDP text is opaque to this crate apart
/// from the origin line's session version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    /// `<sess-version>` from the `o=` line, if present and numeric.
    pub fn session_version(&self) -> Option<u64> {
        let origin = self.sdp.lines().find_map(|line| line.strip_prefix("o="))?;
        origin.split_whitespace().nth(2)?.parse().ok()
    }
}

/// Network candidate payload, opaque apart from its routing hints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
        }
    }
}

/// Event-specific part of a signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalBody {
    CallInit { call_type: CallType },
    CallAccept,
    CallDecline,
    CallEnd,
    Offer { sdp: SessionDescription },
    Answer { sdp: SessionDescription },
    IceCandidate { candidate: IceCandidate },
}

impl SignalBody {
    pub fn event(&self) -> SignalEvent {
        match self {
            Self::CallInit { .. } => SignalEvent::CallInit,
            Self::CallAccept => SignalEvent::CallAccept,
            Self::CallDecline => SignalEvent::CallDecline,
            Self::CallEnd => SignalEvent::CallEnd,
            Self::Offer { .. } => SignalEvent::Offer,
            Self::Answer { .. } => SignalEvent::Answer,
            Self::IceCandidate { .. } => SignalEvent::IceCandidate,
        }
    }
}

/// One routed message between the two participants of a call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WireSignal", into = "WireSignal")]
pub struct Signal {
    pub call_id: CallId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub body: SignalBody,
}

impl Signal {
    pub fn new(call_id: CallId, sender_id: UserId, receiver_id: UserId, body: SignalBody) -> Self {
        Self {
            call_id,
            sender_id,
            receiver_id,
            body,
        }
    }

    pub fn event(&self) -> SignalEvent {
        self.body.event()
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    pub fn from_json(value: serde_json::Value) -> Result<Self, SignalDecodeError> {
        serde_json::from_value(value).map_err(|e| SignalDecodeError::Json(e.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignalDecodeError {
    #[error("{event} signal is missing `{field}`")]
    MissingField {
        event: SignalEvent,
        field: &'static str,
    },
    #[error("invalid signal: {0}")]
    Json(String),
}

/// Flat wire shape of a signal, with every optional field.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireSignal {
    event: SignalEvent,
    call_id: CallId,
    sender_id: UserId,
    receiver_id: UserId,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    call_type: Option<CallType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sdp: Option<SessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    candidate: Option<IceCandidate>,
}

impl TryFrom<WireSignal> for Signal {
    type Error = SignalDecodeError;

    fn try_from(wire: WireSignal) -> Result<Self, Self::Error> {
        let missing = |field| SignalDecodeError::MissingField {
            event: wire.event,
            field,
        };
        let body = match wire.event {
            SignalEvent::CallInit => SignalBody::CallInit {
                call_type: wire.call_type.ok_or_else(|| missing("type"))?,
            },
            SignalEvent::CallAccept => SignalBody::CallAccept,
            SignalEvent::CallDecline => SignalBody::CallDecline,
            SignalEvent::CallEnd => SignalBody::CallEnd,
            SignalEvent::Offer => SignalBody::Offer {
                sdp: wire.sdp.clone().ok_or_else(|| missing("sdp"))?,
            },
            SignalEvent::Answer => SignalBody::Answer {
                sdp: wire.sdp.clone().ok_or_else(|| missing("sdp"))?,
            },
            SignalEvent::IceCandidate => SignalBody::IceCandidate {
                candidate: wire.candidate.clone().ok_or_else(|| missing("candidate"))?,
            },
        };
        Ok(Signal {
            call_id: wire.call_id,
            sender_id: wire.sender_id,
            receiver_id: wire.receiver_id,
            body,
        })
    }
}

impl From<Signal> for WireSignal {
    fn from(signal: Signal) -> Self {
        let event = signal.event();
        let mut wire = WireSignal {
            event,
            call_id: signal.call_id,
            sender_id: signal.sender_id,
            receiver_id: signal.receiver_id,
            call_type: None,
            sdp: None,
            candidate: None,
        };
        match signal.body {
            SignalBody::CallInit { call_type } => wire.call_type = Some(call_type),
            SignalBody::Offer { sdp } | SignalBody::Answer { sdp } => wire.sdp = Some(sdp),
            SignalBody::IceCandidate { candidate } => wire.candidate = Some(candidate),
            SignalBody::CallAccept | SignalBody::CallDecline | SignalBody::CallEnd => {}
        }
        wire
    }
}
