//! Wire vocabulary shared by the server and the client: presence status,
//! media kinds, the closed set of signal kinds and their typed payloads.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown {what}: {value:?}")]
pub struct UnknownVariant {
    pub what: &'static str,
    pub value: String,
}

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("{kind} payload is malformed: {source}")]
    Malformed {
        kind: SignalKind,
        #[source]
        source: serde_json::Error,
    },

    #[error("{kind} payload carries a {found} description")]
    DescriptionMismatch { kind: SignalKind, found: SdpType },
}

/// Presence of a user as seen by everyone else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserStatus {
    Online,
    Offline,
    OnCall,
}

impl UserStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserStatus::Online => "online",
            UserStatus::Offline => "offline",
            UserStatus::OnCall => "on_call",
        }
    }

    /// Listing tier: online first, then on_call, then offline.
    pub fn tier(&self) -> u8 {
        match self {
            UserStatus::Online => 1,
            UserStatus::OnCall => 2,
            UserStatus::Offline => 3,
        }
    }
}

impl fmt::Display for UserStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UserStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "online" => Ok(UserStatus::Online),
            "offline" => Ok(UserStatus::Offline),
            "on_call" => Ok(UserStatus::OnCall),
            other => Err(UnknownVariant {
                what: "status",
                value: other.to_string(),
            }),
        }
    }
}

/// Media type of a call. Copied onto every signal of the call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallKind {
    #[default]
    Video,
    Audio,
}

impl CallKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallKind::Video => "video",
            CallKind::Audio => "audio",
        }
    }
}

impl fmt::Display for CallKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CallKind {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "video" => Ok(CallKind::Video),
            "audio" => Ok(CallKind::Audio),
            other => Err(UnknownVariant {
                what: "call kind",
                value: other.to_string(),
            }),
        }
    }
}

/// The closed set of mailbox message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
    CallRequest,
    CallAccepted,
    CallRejected,
    CallEnded,
    ReceiverReady,
    VideoStatus,
    AudioStatus,
}

impl SignalKind {
    pub const ALL: [SignalKind; 10] = [
        SignalKind::Offer,
        SignalKind::Answer,
        SignalKind::IceCandidate,
        SignalKind::CallRequest,
        SignalKind::CallAccepted,
        SignalKind::CallRejected,
        SignalKind::CallEnded,
        SignalKind::ReceiverReady,
        SignalKind::VideoStatus,
        SignalKind::AudioStatus,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::IceCandidate => "ice-candidate",
            SignalKind::CallRequest => "call-request",
            SignalKind::CallAccepted => "call-accepted",
            SignalKind::CallRejected => "call-rejected",
            SignalKind::CallEnded => "call-ended",
            SignalKind::ReceiverReady => "receiver-ready",
            SignalKind::VideoStatus => "video-status",
            SignalKind::AudioStatus => "audio-status",
        }
    }

    /// Sticky kinds survive reads and stay in the inbox until the recipient
    /// deletes them. Everything else is consumed by the first fetch.
    pub fn is_sticky(&self) -> bool {
        matches!(self, SignalKind::CallRequest | SignalKind::CallAccepted)
    }

    /// Kinds carried by the negotiation relay between active participants.
    pub fn is_negotiation(&self) -> bool {
        matches!(
            self,
            SignalKind::Offer
                | SignalKind::Answer
                | SignalKind::IceCandidate
                | SignalKind::VideoStatus
                | SignalKind::AudioStatus
        )
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SignalKind {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SignalKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| UnknownVariant {
                what: "signal kind",
                value: s.to_string(),
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

impl fmt::Display for SdpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SdpType::Offer => "offer",
            SdpType::Answer => "answer",
        })
    }
}

/// Session description in the shape browsers serialize it.
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
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

/// Video-on/off or audio-on/off notice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaToggle {
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Typed view of a signal payload. Which variant applies is decided by the
/// signal kind, never by the payload's own shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalPayload {
    /// `offer` and `answer`.
    Description(SessionDescription),
    /// `ice-candidate`.
    Candidate(IceCandidate),
    /// `video-status` and `audio-status`.
    MediaToggle(MediaToggle),
    /// `call-request`.
    Invitation { call_kind: CallKind },
    /// `call-accepted` (true) and `call-rejected` (false).
    Decision { accepted: bool },
    /// `receiver-ready`.
    Ready,
    /// `call-ended`.
    Ended,
}

#[derive(Deserialize)]
struct InvitationWire {
    #[serde(default)]
    call_kind: CallKind,
}

impl SignalPayload {
    pub fn decode(kind: SignalKind, value: &Value) -> Result<Self, PayloadError> {
        let malformed = |source| PayloadError::Malformed { kind, source };

        match kind {
            SignalKind::Offer | SignalKind::Answer => {
                let description: SessionDescription =
                    serde_json::from_value(value.clone()).map_err(malformed)?;
                let expected = if kind == SignalKind::Offer {
                    SdpType::Offer
                } else {
                    SdpType::Answer
                };
                if description.sdp_type != expected {
                    return Err(PayloadError::DescriptionMismatch {
                        kind,
                        found: description.sdp_type,
                    });
                }
                Ok(SignalPayload::Description(description))
            }
            SignalKind::IceCandidate => serde_json::from_value(value.clone())
                .map(SignalPayload::Candidate)
                .map_err(malformed),
            SignalKind::VideoStatus | SignalKind::AudioStatus => {
                serde_json::from_value(value.clone())
                    .map(SignalPayload::MediaToggle)
                    .map_err(malformed)
            }
            SignalKind::CallRequest => {
                let wire: InvitationWire =
                    serde_json::from_value(value.clone()).map_err(malformed)?;
                Ok(SignalPayload::Invitation {
                    call_kind: wire.call_kind,
                })
            }
            SignalKind::CallAccepted => Ok(SignalPayload::Decision { accepted: true }),
            SignalKind::CallRejected => Ok(SignalPayload::Decision { accepted: false }),
            SignalKind::ReceiverReady => Ok(SignalPayload::Ready),
            SignalKind::CallEnded => Ok(SignalPayload::Ended),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            SignalPayload::Description(description) => json!(description),
            SignalPayload::Candidate(candidate) => json!(candidate),
            SignalPayload::MediaToggle(toggle) => json!(toggle),
            SignalPayload::Invitation { call_kind } => json!({ "call_kind": call_kind }),
            SignalPayload::Decision { accepted: true } => json!({ "accepted": true }),
            SignalPayload::Decision { accepted: false } => json!({ "rejected": true }),
            SignalPayload::Ready => json!({ "ready": true }),
            SignalPayload::Ended => json!({ "ended": true }),
        }
    }
}

/// Null, an empty string, an empty array and an empty object all count as
/// "no payload".
pub fn is_empty_payload(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(fields) => fields.is_empty(),
        _ => false,
    }
}

/// A signal as delivered to its recipient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub id: i64,
    pub from_user: String,
    pub from_username: String,
    pub from_avatar_ref: Option<String>,
    pub kind: SignalKind,
    pub payload: Value,
    pub call_kind: CallKind,
}

impl Signal {
    pub fn decode_payload(&self) -> Result<SignalPayload, PayloadError> {
        SignalPayload::decode(self.kind, &self.payload)
    }
}

/// A signal on its way into the mailbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutgoingSignal {
    pub to_user: String,
    pub kind: SignalKind,
    pub payload: Value,
    #[serde(default)]
    pub call_kind: CallKind,
}

impl OutgoingSignal {
    pub fn new(to_user: impl Into<String>, kind: SignalKind, payload: &SignalPayload, call_kind: CallKind) -> Self {
        Self {
            to_user: to_user.into(),
            kind,
            payload: payload.to_value(),
            call_kind,
        }
    }
}

/// One row of the presence listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub id: String,
    pub username: String,
    pub avatar_ref: Option<String>,
    pub status: UserStatus,
    pub last_seen: Option<i64>,
}
