use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::StoreError;
use crate::entitlement::Entitlement;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    Active,
    Expired,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Expired => "expired",
        }
    }
}

impl std::str::FromStr for SubscriptionStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SubscriptionStatus::Active),
            "expired" => Ok(SubscriptionStatus::Expired),
            other => Err(StoreError::MalformedResponse(format!(
                "unknown subscription status '{other}'"
            ))),
        }
    }
}

/// A validated row of `vip_subscriptions`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionRecord {
    pub id: String,
    pub user_id: String,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: DateTime<Utc>,
    pub status: SubscriptionStatus,
    pub activated_by_admin: bool,
    pub plan_type: Option<String>,
}

impl SubscriptionRecord {
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.status == SubscriptionStatus::Active && self.end_time > now
    }

    pub fn to_entitlement(&self) -> Entitlement {
        Entitlement {
            expiry: self.end_time,
            subscription_id: Some(self.id.clone()),
            plan_type: self.plan_type.clone(),
        }
    }
}

/// The row exactly as the store sent it. Nothing here is trusted until
/// [`RawSubscriptionRow::validate`] succeeds.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawSubscriptionRow {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub user_id: Option<Value>,
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub end_time: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub activated_by_admin: Option<bool>,
    #[serde(default)]
    pub plan_type: Option<String>,
}

fn id_to_string(field: &str, value: Option<Value>) -> Result<String, StoreError> {
    let id = match value {
        Some(Value::String(s)) => s,
        Some(Value::Number(n)) => n.to_string(),
        Some(other) => {
            return Err(StoreError::MalformedResponse(format!(
                "field '{field}' has unexpected type: {other}"
            )));
        }
        None => {
            return Err(StoreError::MalformedResponse(format!(
                "field '{field}' is missing"
            )));
        }
    };
    if id.trim().is_empty() {
        return Err(StoreError::MalformedResponse(format!(
            "field '{field}' is empty"
        )));
    }
    Ok(id)
}

pub(crate) fn parse_timestamp(field: &str, raw: &str) -> Result<DateTime<Utc>, StoreError> {
    // PostgREST emits `2025-01-01T12:00:00+00:00`; the realtime channel may drop
    // the offset entirely, in which case the value is UTC.
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f"))
        .map(|naive| naive.and_utc())
        .map_err(|e| {
            StoreError::MalformedResponse(format!("field '{field}' is not a timestamp ({raw}): {e}"))
        })
}

impl RawSubscriptionRow {
    pub fn validate(self) -> Result<SubscriptionRecord, StoreError> {
        let id = id_to_string("id", self.id)?;
        let user_id = id_to_string("user_id", self.user_id)?;
        let end_time = match self.end_time.as_deref() {
            Some(raw) => parse_timestamp("end_time", raw)?,
            None => {
                return Err(StoreError::MalformedResponse(format!(
                    "subscription {id} has no end_time"
                )));
            }
        };
        let start_time = self
            .start_time
            .as_deref()
            .map(|raw| parse_timestamp("start_time", raw))
            .transpose()?;
        let status = self
            .status
            .as_deref()
            .ok_or_else(|| {
                StoreError::MalformedResponse(format!("subscription {id} has no status"))
            })?
            .parse()?;

        Ok(SubscriptionRecord {
            id,
            user_id,
            start_time,
            end_time,
            status,
            activated_by_admin: self.activated_by_admin.unwrap_or(false),
            plan_type: self.plan_type,
        })
    }
}

/// Decodes a JSON array body into validated records. One bad row fails the
/// whole response.
pub fn parse_rows(body: &str) -> Result<Vec<SubscriptionRecord>, StoreError> {
    let rows: Vec<RawSubscriptionRow> = serde_json::from_str(body).map_err(|e| {
        StoreError::MalformedResponse(format!("expected an array of subscription rows: {e}"))
    })?;
    rows.into_iter().map(RawSubscriptionRow::validate).collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrantRequest {
    pub user_id: String,
    pub duration: Duration,
    pub activated_by_admin: bool,
    pub plan_type: Option<String>,
}

impl GrantRequest {
    pub fn admin(user_id: impl Into<String>, duration: Duration) -> Self {
        Self {
            user_id: user_id.into(),
            duration,
            activated_by_admin: true,
            plan_type: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeEvent {
    Insert,
    Update,
    Delete,
}

/// A row-level change pushed by the store for one user's subscriptions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeNotification {
    pub event: ChangeEvent,
    pub user_id: String,
    pub record: Option<SubscriptionRecord>,
}

impl ChangeNotification {
    /// True when the change alone proves the entitlement backed by
    /// `held_subscription_id` is gone, so no round trip is needed before
    /// locking. Changes to any other row of the user never revoke.
    pub fn revokes(&self, held_subscription_id: Option<&str>, now: DateTime<Utc>) -> bool {
        let Some(held) = held_subscription_id else {
            return false;
        };
        match (&self.event, &self.record) {
            (ChangeEvent::Delete, _) => false,
            (_, Some(record)) => record.id == held && !record.is_active_at(now),
            (_, None) => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdminLogEntry {
    pub admin_id: Option<String>,
    pub action: String,
    pub details: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewAdminMessage {
    pub sender_id: Option<String>,
    /// `None` broadcasts to every user.
    pub receiver_id: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminMessage {
    pub id: String,
    pub sender_id: Option<String>,
    pub receiver_id: Option<String>,
    pub message: String,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawAdminMessage {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub sender_id: Option<String>,
    #[serde(default)]
    pub receiver_id: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub is_read: Option<bool>,
    #[serde(default)]
    pub created_at: Option<String>,
}

impl RawAdminMessage {
    pub fn validate(self) -> Result<AdminMessage, StoreError> {
        let id = id_to_string("id", self.id)?;
        let message = self.message.ok_or_else(|| {
            StoreError::MalformedResponse(format!("admin message {id} has no text"))
        })?;
        let created_at = match self.created_at.as_deref() {
            Some(raw) => parse_timestamp("created_at", raw)?,
            None => {
                return Err(StoreError::MalformedResponse(format!(
                    "admin message {id} has no created_at"
                )));
            }
        };
        Ok(AdminMessage {
            id,
            sender_id: self.sender_id,
            receiver_id: self.receiver_id,
            message,
            is_read: self.is_read.unwrap_or(false),
            created_at,
        })
    }
}
