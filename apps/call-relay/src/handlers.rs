use axum::Json;
use axum::extract::State;
use serde_json::{Value, json};

use crate::websocket::RelayState;

pub async fn health_check(State(state): State<RelayState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "connected_users": state.connected_users(),
        "active_rooms": state.active_rooms(),
    }))
}
