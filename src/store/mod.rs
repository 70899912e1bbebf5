use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

pub mod memory;
pub mod models;
pub mod rest;

pub use memory::InMemorySubscriptionStore;
pub use models::{
    AdminLogEntry, AdminMessage, ChangeEvent, ChangeNotification, GrantRequest, NewAdminMessage,
    SubscriptionRecord, SubscriptionStatus,
};
pub use rest::RestSubscriptionStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("Store returned status {status}: {body}")]
    Http { status: u16, body: String },
    #[error("Malformed response: {0}")]
    MalformedResponse(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Whether retrying the same request could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Network(_) => true,
            StoreError::Http { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

/// The hosted table that owns VIP subscriptions, plus the two admin tables
/// written next to it.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// The authoritative row for `user_id`: `status = active AND end_time > now`.
    /// When several rows qualify, the one with the latest `end_time` wins.
    async fn fetch_active(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<SubscriptionRecord>, StoreError>;

    /// Every row, newest `end_time` first.
    async fn list_subscriptions(&self) -> Result<Vec<SubscriptionRecord>, StoreError>;

    async fn grant(
        &self,
        request: &GrantRequest,
        now: DateTime<Utc>,
    ) -> Result<SubscriptionRecord, StoreError>;

    /// Pushes `end_time` forward by `by` from its current value and reactivates.
    async fn extend(
        &self,
        subscription_id: &str,
        by: Duration,
    ) -> Result<SubscriptionRecord, StoreError>;

    /// Forces `status = expired` and `end_time = now`.
    async fn cancel(
        &self,
        subscription_id: &str,
        now: DateTime<Utc>,
    ) -> Result<SubscriptionRecord, StoreError>;

    async fn count_active(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;

    async fn record_admin_action(&self, entry: &AdminLogEntry) -> Result<(), StoreError>;

    async fn insert_message(&self, message: &NewAdminMessage) -> Result<AdminMessage, StoreError>;

    /// Unread direct messages for `user_id` plus broadcasts, newest first.
    async fn unread_messages(&self, user_id: &str) -> Result<Vec<AdminMessage>, StoreError>;
}
