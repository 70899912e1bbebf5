//! Admin-side writes against the subscription store: grants, extensions,
//! cancellations and user messages, each followed by an audit log entry.
//!
//! Concurrent edits to the same row are last-write-wins.

use chrono::Duration;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

use crate::entitlement::{Tier, format_remaining};
use crate::store::{
    AdminLogEntry, AdminMessage, GrantRequest, NewAdminMessage, StoreError, SubscriptionRecord,
    SubscriptionStore,
};
use crate::tracker::Clock;

pub const DEFAULT_GRANT_MINUTES: i64 = 30;
pub const EXTENSION_MINUTES: i64 = 30;
const MESSAGE_PREVIEW_CHARS: usize = 20;

pub const ACTION_GIVE_VIP: &str = "GIVE_VIP";
pub const ACTION_EXTEND_VIP: &str = "EXTEND_VIP";
pub const ACTION_CANCEL_VIP: &str = "CANCEL_VIP";
pub const ACTION_SEND_MESSAGE: &str = "SEND_MESSAGE";

/// One row of the admin subscription list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionView {
    #[serde(flatten)]
    pub record: SubscriptionRecord,
    pub is_active: bool,
    pub remaining_ms: u64,
    pub tier: Option<Tier>,
}

impl SubscriptionView {
    pub fn remaining_display(&self) -> String {
        format_remaining(self.remaining_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DashboardStats {
    pub active_vips: u64,
}

pub struct VipManager {
    store: Arc<dyn SubscriptionStore>,
    clock: Arc<dyn Clock>,
}

impl VipManager {
    pub fn new(store: Arc<dyn SubscriptionStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Grants `duration` of VIP starting now, or the default 30 minutes.
    pub async fn grant_vip(
        &self,
        admin_id: Option<&str>,
        user_id: &str,
        duration: Option<Duration>,
    ) -> Result<SubscriptionRecord, StoreError> {
        let user_id = user_id.trim();
        if user_id.is_empty() {
            return Err(StoreError::InvalidInput("user id is required".to_string()));
        }
        let duration = duration.unwrap_or_else(|| Duration::minutes(DEFAULT_GRANT_MINUTES));
        if duration <= Duration::zero() {
            return Err(StoreError::InvalidInput(
                "grant duration must be positive".to_string(),
            ));
        }

        let now = self.clock.now();
        let record = self
            .store
            .grant(&GrantRequest::admin(user_id, duration), now)
            .await?;
        info!(
            user_id = %record.user_id,
            subscription_id = %record.id,
            end_time = %record.end_time,
            "Granted VIP."
        );

        self.audit(
            admin_id,
            ACTION_GIVE_VIP,
            json!({
                "target_user_id": record.user_id,
                "subscription_id": record.id,
                "duration_minutes": duration.num_minutes(),
            }),
        )
        .await;
        Ok(record)
    }

    pub async fn extend_vip(
        &self,
        admin_id: Option<&str>,
        subscription_id: &str,
    ) -> Result<SubscriptionRecord, StoreError> {
        let record = self
            .store
            .extend(subscription_id, Duration::minutes(EXTENSION_MINUTES))
            .await?;
        info!(subscription_id = %record.id, end_time = %record.end_time, "Extended VIP.");

        self.audit(
            admin_id,
            ACTION_EXTEND_VIP,
            json!({
                "target_user_id": record.user_id,
                "subscription_id": record.id,
                "added_minutes": EXTENSION_MINUTES,
            }),
        )
        .await;
        Ok(record)
    }

    /// Expires the subscription immediately.
    pub async fn cancel_vip(
        &self,
        admin_id: Option<&str>,
        subscription_id: &str,
    ) -> Result<SubscriptionRecord, StoreError> {
        let now = self.clock.now();
        let record = self.store.cancel(subscription_id, now).await?;
        info!(subscription_id = %record.id, user_id = %record.user_id, "Cancelled VIP.");

        self.audit(
            admin_id,
            ACTION_CANCEL_VIP,
            json!({
                "target_user_id": record.user_id,
                "subscription_id": record.id,
            }),
        )
        .await;
        Ok(record)
    }

    pub async fn list(&self) -> Result<Vec<SubscriptionView>, StoreError> {
        let now = self.clock.now();
        let rows = self.store.list_subscriptions().await?;
        Ok(rows
            .into_iter()
            .map(|record| {
                let is_active = record.is_active_at(now);
                let remaining_ms = if is_active {
                    record.to_entitlement().remaining_ms(now)
                } else {
                    0
                };
                SubscriptionView {
                    record,
                    is_active,
                    remaining_ms,
                    tier: is_active.then(|| Tier::from_remaining_ms(remaining_ms)),
                }
            })
            .collect())
    }

    pub async fn dashboard_stats(&self) -> Result<DashboardStats, StoreError> {
        let active_vips = self.store.count_active(self.clock.now()).await?;
        Ok(DashboardStats { active_vips })
    }

    /// Sends `text` to `receiver_id`, or to everyone when it is `None`.
    pub async fn send_message(
        &self,
        admin_id: Option<&str>,
        receiver_id: Option<&str>,
        text: &str,
    ) -> Result<AdminMessage, StoreError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(StoreError::InvalidInput(
                "message text must not be empty".to_string(),
            ));
        }
        let receiver_id = receiver_id.map(str::trim).filter(|r| !r.is_empty());

        let stored = self
            .store
            .insert_message(&NewAdminMessage {
                sender_id: admin_id.map(str::to_string),
                receiver_id: receiver_id.map(str::to_string),
                message: text.to_string(),
            })
            .await?;
        info!(
            message_id = %stored.id,
            receiver = receiver_id.unwrap_or("<all>"),
            "Admin message sent."
        );

        self.audit(
            admin_id,
            ACTION_SEND_MESSAGE,
            json!({
                "to": receiver_id.unwrap_or("all"),
                "preview": message_preview(text),
            }),
        )
        .await;
        Ok(stored)
    }

    pub async fn unread_messages(&self, user_id: &str) -> Result<Vec<AdminMessage>, StoreError> {
        self.store.unread_messages(user_id).await
    }

    async fn audit(&self, admin_id: Option<&str>, action: &str, details: serde_json::Value) {
        let entry = AdminLogEntry {
            admin_id: admin_id.map(str::to_string),
            action: action.to_string(),
            details,
        };
        if let Err(e) = self.store.record_admin_action(&entry).await {
            warn!(action = %action, error = %e, "Failed to write admin log entry.");
        }
    }
}

fn message_preview(text: &str) -> String {
    let mut preview: String = text.chars().take(MESSAGE_PREVIEW_CHARS).collect();
    if text.chars().count() > MESSAGE_PREVIEW_CHARS {
        preview.push_str("...");
    }
    preview
}
