use std::fmt;

use call_signaling::{CallType, RoomId, UserId};
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    #[default]
    Idle,
    Calling,
    Ringing,
    Connected,
    Rejected,
    Ended,
    Error,
}

impl CallStatus {
    /// Calling, ringing or connected.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            CallStatus::Calling | CallStatus::Ringing | CallStatus::Connected
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CallStatus::Rejected | CallStatus::Ended | CallStatus::Error
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CallStatus::Idle => "idle",
            CallStatus::Calling => "calling",
            CallStatus::Ringing => "ringing",
            CallStatus::Connected => "connected",
            CallStatus::Rejected => "rejected",
            CallStatus::Ended => "ended",
            CallStatus::Error => "error",
        }
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The one call a client tracks. Only the transition function produces new
/// values; every transition yields a fresh snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSession {
    pub status: CallStatus,
    pub call_type: Option<CallType>,
    pub caller_id: Option<UserId>,
    pub target_user_id: Option<UserId>,
    pub room_id: Option<RoomId>,
    pub is_initiator: bool,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub reject_reason: Option<String>,
    pub error: Option<String>,
    /// Identity of the session; grows by one for every new call and survives
    /// reset so stale async results can be told apart.
    pub epoch: u64,
}

impl CallSession {
    pub fn idle() -> Self {
        Self::default()
    }

    /// Idle again, with every field cleared except the epoch counter.
    pub fn reset(&self) -> Self {
        Self {
            epoch: self.epoch,
            ..Self::default()
        }
    }

    /// The other party: the target for the caller, the caller for the callee.
    pub fn counterpart(&self) -> Option<UserId> {
        if self.is_initiator {
            self.target_user_id
        } else {
            self.caller_id
        }
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        Some(self.end_time? - self.start_time?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_keeps_only_the_epoch() {
        let session = CallSession {
            status: CallStatus::Ended,
            call_type: Some(CallType::Video),
            caller_id: Some(UserId(1)),
            target_user_id: Some(UserId(2)),
            room_id: Some(RoomId(3)),
            is_initiator: true,
            start_time: Some(Utc::now()),
            end_time: Some(Utc::now()),
            reject_reason: None,
            error: None,
            epoch: 4,
        };
        let reset = session.reset();
        assert_eq!(reset, CallSession { epoch: 4, ..CallSession::idle() });
    }

    #[test]
    fn counterpart_depends_on_role() {
        let mut session = CallSession {
            caller_id: Some(UserId(1)),
            target_user_id: Some(UserId(2)),
            is_initiator: true,
            ..CallSession::idle()
        };
        assert_eq!(session.counterpart(), Some(UserId(2)));
        session.is_initiator = false;
        assert_eq!(session.counterpart(), Some(UserId(1)));
    }

    #[test]
    fn status_serializes_lowercase() {
        let value = serde_json::to_value(CallStatus::Connected).expect("serialize");
        assert_eq!(value, serde_json::json!("connected"));
    }
}
