use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::EnvelopeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub u64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(pub u64);

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CallType {
    Audio,
    Video,
}

impl CallType {
    pub fn has_video(self) -> bool {
        matches!(self, CallType::Video)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CallType::Audio => "AUDIO",
            CallType::Video => "VIDEO",
        }
    }
}

impl fmt::Display for CallType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SignalType {
    Invite,
    Accept,
    Reject,
    Hangup,
    Offer,
    Answer,
    Candidate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
}

/// Call control and media negotiation messages, unified into one union.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    Invite {
        call_type: CallType,
        target_user_id: UserId,
    },
    Accept,
    Reject {
        reason: Option<String>,
    },
    Hangup,
    Offer {
        sdp: String,
    },
    Answer {
        sdp: String,
    },
    Candidate(IceCandidate),
}

impl Signal {
    pub fn signal_type(&self) -> SignalType {
        match self {
            Signal::Invite { .. } => SignalType::Invite,
            Signal::Accept => SignalType::Accept,
            Signal::Reject { .. } => SignalType::Reject,
            Signal::Hangup => SignalType::Hangup,
            Signal::Offer { .. } => SignalType::Offer,
            Signal::Answer { .. } => SignalType::Answer,
            Signal::Candidate(_) => SignalType::Candidate,
        }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Signal::Reject {
            reason: Some(reason.into()),
        }
    }

    pub fn from_description(description: SessionDescription) -> Self {
        match description.kind {
            SdpKind::Offer => Signal::Offer {
                sdp: description.sdp,
            },
            SdpKind::Answer => Signal::Answer {
                sdp: description.sdp,
            },
        }
    }
}

/// An envelope as delivered by the relay. `sender_id` is always the
/// relay-stamped identity of the origin connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WireEnvelope", into = "WireEnvelope")]
pub struct Envelope {
    pub sender_id: UserId,
    pub room_id: RoomId,
    pub signal: Signal,
}

impl Envelope {
    pub fn signal_type(&self) -> SignalType {
        self.signal.signal_type()
    }
}

/// An outbound request asking the relay to forward a signal into a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WireEnvelope", into = "WireEnvelope")]
pub struct RelayRequest {
    pub room_id: RoomId,
    pub signal: Signal,
}

impl RelayRequest {
    pub fn new(room_id: RoomId, signal: Signal) -> Self {
        Self { room_id, signal }
    }

    pub fn stamp(self, sender_id: UserId) -> Envelope {
        Envelope {
            sender_id,
            room_id: self.room_id,
            signal: self.signal,
        }
    }
}

/// JSON shape shared by envelopes and relay requests:
/// `{ type, senderId?, roomId, payload? }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireEnvelope {
    #[serde(rename = "type")]
    pub kind: SignalType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<UserId>,
    pub room_id: RoomId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<WirePayload>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WirePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_type: Option<CallType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_user_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
}

fn split_signal(signal: Signal) -> (SignalType, Option<WirePayload>) {
    let kind = signal.signal_type();
    let payload = match signal {
        Signal::Invite {
            call_type,
            target_user_id,
        } => Some(WirePayload {
            call_type: Some(call_type),
            target_user_id: Some(target_user_id),
            ..Default::default()
        }),
        Signal::Accept | Signal::Hangup => None,
        Signal::Reject { reason } => reason.map(|reason| WirePayload {
            reason: Some(reason),
            ..Default::default()
        }),
        Signal::Offer { sdp } | Signal::Answer { sdp } => Some(WirePayload {
            sdp: Some(sdp),
            ..Default::default()
        }),
        Signal::Candidate(candidate) => Some(WirePayload {
            candidate: Some(candidate.candidate),
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            ..Default::default()
        }),
    };
    (kind, payload)
}

fn join_signal(kind: SignalType, payload: Option<WirePayload>) -> Result<Signal, EnvelopeError> {
    let payload = payload.unwrap_or_default();
    let missing = |field: &'static str| EnvelopeError::MissingField { kind, field };
    let signal = match kind {
        SignalType::Invite => Signal::Invite {
            call_type: payload.call_type.ok_or_else(|| missing("callType"))?,
            target_user_id: payload.target_user_id.ok_or_else(|| missing("targetUserId"))?,
        },
        SignalType::Accept => Signal::Accept,
        SignalType::Reject => Signal::Reject {
            reason: payload.reason,
        },
        SignalType::Hangup => Signal::Hangup,
        SignalType::Offer => Signal::Offer {
            sdp: payload.sdp.ok_or_else(|| missing("sdp"))?,
        },
        SignalType::Answer => Signal::Answer {
            sdp: payload.sdp.ok_or_else(|| missing("sdp"))?,
        },
        SignalType::Candidate => Signal::Candidate(IceCandidate {
            candidate: payload.candidate.ok_or_else(|| missing("candidate"))?,
            sdp_mid: payload.sdp_mid,
            sdp_mline_index: payload.sdp_mline_index,
        }),
    };
    Ok(signal)
}

impl From<Envelope> for WireEnvelope {
    fn from(envelope: Envelope) -> Self {
        let (kind, payload) = split_signal(envelope.signal);
        WireEnvelope {
            kind,
            sender_id: Some(envelope.sender_id),
            room_id: envelope.room_id,
            payload,
        }
    }
}

impl TryFrom<WireEnvelope> for Envelope {
    type Error = EnvelopeError;

    fn try_from(wire: WireEnvelope) -> Result<Self, Self::Error> {
        let sender_id = wire.sender_id.ok_or(EnvelopeError::MissingSender)?;
        Ok(Envelope {
            sender_id,
            room_id: wire.room_id,
            signal: join_signal(wire.kind, wire.payload)?,
        })
    }
}

impl From<RelayRequest> for WireEnvelope {
    fn from(request: RelayRequest) -> Self {
        let (kind, payload) = split_signal(request.signal);
        WireEnvelope {
            kind,
            sender_id: None,
            room_id: request.room_id,
            payload,
        }
    }
}

// A client-supplied senderId is accepted on the wire but dropped here.
impl TryFrom<WireEnvelope> for RelayRequest {
    type Error = EnvelopeError;

    fn try_from(wire: WireEnvelope) -> Result<Self, Self::Error> {
        Ok(RelayRequest {
            room_id: wire.room_id,
            signal: join_signal(wire.kind, wire.payload)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn invite_matches_wire_shape() {
        let envelope = Envelope {
            sender_id: UserId(3),
            room_id: RoomId(7),
            signal: Signal::Invite {
                call_type: CallType::Video,
                target_user_id: UserId(42),
            },
        };
        let value = serde_json::to_value(&envelope).expect("serialize");
        assert_eq!(
            value,
            json!({
                "type": "INVITE",
                "senderId": 3,
                "roomId": 7,
                "payload": { "callType": "VIDEO", "targetUserId": 42 }
            })
        );
    }

    #[test]
    fn accept_omits_payload() {
        let request = RelayRequest::new(RoomId(7), Signal::Accept);
        let value = serde_json::to_value(&request).expect("serialize");
        assert_eq!(value, json!({ "type": "ACCEPT", "roomId": 7 }));
    }

    #[test]
    fn relay_request_ignores_claimed_sender() {
        let value = json!({ "type": "HANGUP", "senderId": 99, "roomId": 7 });
        let request: RelayRequest = serde_json::from_value(value).expect("decode");
        let stamped = request.stamp(UserId(5));
        assert_eq!(stamped.sender_id, UserId(5));
        assert_eq!(stamped.signal, Signal::Hangup);
    }

    #[test]
    fn envelope_requires_sender() {
        let value = json!({ "type": "HANGUP", "roomId": 7 });
        let err = serde_json::from_value::<Envelope>(value).expect_err("missing sender");
        assert!(err.to_string().contains("senderId"));
    }

    #[test]
    fn offer_without_sdp_is_rejected() {
        let value = json!({ "type": "OFFER", "senderId": 1, "roomId": 7, "payload": {} });
        let err = serde_json::from_value::<Envelope>(value).expect_err("missing sdp");
        assert!(err.to_string().contains("sdp"));
    }

    #[test]
    fn candidate_keeps_mline_index_spelling() {
        let request = RelayRequest::new(
            RoomId(1),
            Signal::Candidate(IceCandidate {
                candidate: "candidate:1 1 udp 2122260223 10.0.0.2 50000 typ host".into(),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
            }),
        );
        let value = serde_json::to_value(&request).expect("serialize");
        assert_eq!(value["payload"]["sdpMLineIndex"], json!(0));
        assert_eq!(value["payload"]["sdpMid"], json!("0"));
    }

    #[test]
    fn reject_reason_survives_decode() {
        let value = json!({
            "type": "REJECT",
            "senderId": 42,
            "roomId": 7,
            "payload": { "reason": "REJECTED_BY_TARGET" }
        });
        let envelope: Envelope = serde_json::from_value(value).expect("decode");
        assert_eq!(envelope.signal, Signal::reject("REJECTED_BY_TARGET"));
    }
}
