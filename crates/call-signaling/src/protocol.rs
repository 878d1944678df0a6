use serde::{Deserialize, Serialize};

use crate::envelope::{Envelope, RelayRequest, RoomId, UserId};

/// Messages a client sends to the relay over its websocket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Join {
        user_id: UserId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    Signal {
        envelope: RelayRequest,
    },
    Ping,
}

/// Messages the relay sends to a connected client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Joined { user_id: UserId },
    JoinError { reason: String },
    Signal { envelope: Envelope },
    Pong,
    Error {
        /// Set when the error refers to an envelope sent into this room.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_id: Option<RoomId>,
        message: String,
    },
}
