//! Phoenix channel frames as spoken by the realtime endpoint.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::RealtimeError;
use crate::store::models::RawSubscriptionRow;
use crate::store::{ChangeEvent, ChangeNotification};

pub const EVENT_JOIN: &str = "phx_join";
pub const EVENT_REPLY: &str = "phx_reply";
pub const EVENT_CLOSE: &str = "phx_close";
pub const EVENT_ERROR: &str = "phx_error";
pub const EVENT_HEARTBEAT: &str = "heartbeat";
pub const EVENT_POSTGRES_CHANGES: &str = "postgres_changes";
pub const PHOENIX_TOPIC: &str = "phoenix";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhoenixMessage {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "ref", default)]
    pub reference: Option<String>,
}

impl PhoenixMessage {
    pub fn to_text(&self) -> Result<String, RealtimeError> {
        serde_json::to_string(self).map_err(|e| RealtimeError::Protocol(e.to_string()))
    }

    pub fn parse(text: &str) -> Result<Self, RealtimeError> {
        serde_json::from_str(text)
            .map_err(|e| RealtimeError::Protocol(format!("invalid frame: {e}")))
    }
}

pub fn channel_topic(user_id: &str) -> String {
    format!("realtime:vip_updates:{user_id}")
}

/// Subscribes to every change on `table` rows owned by `user_id`.
pub fn join_message(
    topic: &str,
    table: &str,
    user_id: &str,
    access_token: &str,
    reference: u64,
) -> PhoenixMessage {
    PhoenixMessage {
        topic: topic.to_string(),
        event: EVENT_JOIN.to_string(),
        payload: json!({
            "config": {
                "broadcast": { "self": false },
                "presence": { "key": "" },
                "postgres_changes": [{
                    "event": "*",
                    "schema": "public",
                    "table": table,
                    "filter": format!("user_id=eq.{user_id}"),
                }],
            },
            "access_token": access_token,
        }),
        reference: Some(reference.to_string()),
    }
}

pub fn heartbeat_message(reference: u64) -> PhoenixMessage {
    PhoenixMessage {
        topic: PHOENIX_TOPIC.to_string(),
        event: EVENT_HEARTBEAT.to_string(),
        payload: json!({}),
        reference: Some(reference.to_string()),
    }
}

/// Outcome of a `phx_reply` to our join.
pub fn join_reply_status(message: &PhoenixMessage) -> Result<(), RealtimeError> {
    match message.payload.get("status").and_then(Value::as_str) {
        Some("ok") => Ok(()),
        Some(status) => Err(RealtimeError::JoinRejected(format!(
            "{status}: {}",
            message.payload.get("response").cloned().unwrap_or(Value::Null)
        ))),
        None => Err(RealtimeError::Protocol(
            "join reply without status".to_string(),
        )),
    }
}

fn is_empty_record(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::Object(map)) => map.is_empty(),
        Some(_) => false,
    }
}

/// Decodes a `postgres_changes` frame. DELETE frames usually carry only the
/// primary key, so `fallback_user_id` (the channel's filter) fills the owner.
pub fn parse_change(
    message: &PhoenixMessage,
    fallback_user_id: &str,
) -> Result<ChangeNotification, RealtimeError> {
    let data = message
        .payload
        .get("data")
        .ok_or_else(|| RealtimeError::Protocol("change frame without data".to_string()))?;

    let event = match data.get("type").and_then(Value::as_str) {
        Some("INSERT") => ChangeEvent::Insert,
        Some("UPDATE") => ChangeEvent::Update,
        Some("DELETE") => ChangeEvent::Delete,
        other => {
            return Err(RealtimeError::Protocol(format!(
                "unknown change type {other:?}"
            )));
        }
    };

    let record = if is_empty_record(data.get("record")) {
        None
    } else {
        let raw: RawSubscriptionRow = serde_json::from_value(data["record"].clone())
            .map_err(|e| RealtimeError::Protocol(format!("invalid record: {e}")))?;
        Some(
            raw.validate()
                .map_err(|e| RealtimeError::Protocol(e.to_string()))?,
        )
    };

    let user_id = record
        .as_ref()
        .map(|r| r.user_id.clone())
        .or_else(|| {
            data.get("old_record")
                .and_then(|old| old.get("user_id"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| fallback_user_id.to_string());

    Ok(ChangeNotification {
        event,
        user_id,
        record,
    })
}
