use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};
use uuid::Uuid;

use super::models::{
    AdminLogEntry, AdminMessage, ChangeEvent, ChangeNotification, GrantRequest, NewAdminMessage,
    SubscriptionRecord, SubscriptionStatus,
};
use super::{StoreError, SubscriptionStore};

/// A failure the store reports instead of answering `fetch_active`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InjectedFailure {
    /// Answers with a 503, which callers treat as transient.
    Unavailable,
    /// Answers with a row that fails validation.
    Malformed,
}

/// Process-local stand-in for the hosted store. Every write is echoed on a
/// broadcast channel the same way the realtime channel would push it.
pub struct InMemorySubscriptionStore {
    subscriptions: DashMap<String, SubscriptionRecord>,
    messages: DashMap<String, AdminMessage>,
    admin_logs: Mutex<Vec<AdminLogEntry>>,
    changes: broadcast::Sender<ChangeNotification>,
    failures: Mutex<Vec<InjectedFailure>>,
    fetch_delays: Mutex<Vec<std::time::Duration>>,
    fetch_count: AtomicU64,
}

impl Default for InMemorySubscriptionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemorySubscriptionStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            subscriptions: DashMap::new(),
            messages: DashMap::new(),
            admin_logs: Mutex::new(Vec::new()),
            changes,
            failures: Mutex::new(Vec::new()),
            fetch_delays: Mutex::new(Vec::new()),
            fetch_count: AtomicU64::new(0),
        }
    }

    pub fn subscribe_changes(&self) -> broadcast::Receiver<ChangeNotification> {
        self.changes.subscribe()
    }

    /// Same changes as [`Self::subscribe_changes`], delivered on an `mpsc`
    /// channel the tracker can consume. The forwarding task ends when either
    /// side goes away.
    pub fn change_feed(&self) -> mpsc::Receiver<ChangeNotification> {
        let mut changes = self.changes.subscribe();
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(change) => {
                        if tx.send(change).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "In-memory change feed lagged.");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        rx
    }

    /// Stores a row as-is, bypassing grant semantics.
    pub fn insert_record(&self, record: SubscriptionRecord) {
        self.subscriptions.insert(record.id.clone(), record);
    }

    /// Queues failures consumed one per `fetch_active` call, in order.
    pub fn inject_failures(&self, failures: impl IntoIterator<Item = InjectedFailure>) {
        let mut queue = self.failures.lock().unwrap_or_else(|p| p.into_inner());
        queue.extend(failures);
    }

    /// Queues answer delays, one per `fetch_active` call. The rows are read
    /// before the delay, so a delayed answer reflects the store as it was when
    /// the call started.
    pub fn inject_fetch_delays(&self, delays: impl IntoIterator<Item = std::time::Duration>) {
        let mut queue = self.fetch_delays.lock().unwrap_or_else(|p| p.into_inner());
        queue.extend(delays);
    }

    pub fn fetch_count(&self) -> u64 {
        self.fetch_count.load(Ordering::SeqCst)
    }

    pub fn admin_logs(&self) -> Vec<AdminLogEntry> {
        self.admin_logs
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    fn publish(&self, event: ChangeEvent, record: &SubscriptionRecord) {
        let notification = ChangeNotification {
            event,
            user_id: record.user_id.clone(),
            record: Some(record.clone()),
        };
        if let Err(e) = self.changes.send(notification) {
            debug!("No change subscribers for in-memory store: {}", e);
        }
    }

    fn next_fetch_delay(&self) -> Option<std::time::Duration> {
        let mut queue = self.fetch_delays.lock().unwrap_or_else(|p| p.into_inner());
        if queue.is_empty() {
            None
        } else {
            Some(queue.remove(0))
        }
    }

    fn next_failure(&self) -> Option<InjectedFailure> {
        let mut queue = self.failures.lock().unwrap_or_else(|p| p.into_inner());
        if queue.is_empty() {
            None
        } else {
            Some(queue.remove(0))
        }
    }
}

#[async_trait]
impl SubscriptionStore for InMemorySubscriptionStore {
    async fn fetch_active(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<SubscriptionRecord>, StoreError> {
        self.fetch_count.fetch_add(1, Ordering::SeqCst);
        match self.next_failure() {
            Some(InjectedFailure::Unavailable) => {
                return Err(StoreError::Http {
                    status: 503,
                    body: "service unavailable".to_string(),
                });
            }
            Some(InjectedFailure::Malformed) => {
                return Err(StoreError::MalformedResponse(
                    "subscription row has no end_time".to_string(),
                ));
            }
            None => {}
        }

        let active = self
            .subscriptions
            .iter()
            .filter(|entry| entry.user_id == user_id && entry.is_active_at(now))
            .max_by_key(|entry| entry.end_time)
            .map(|entry| entry.value().clone());
        if let Some(delay) = self.next_fetch_delay() {
            tokio::time::sleep(delay).await;
        }
        Ok(active)
    }

    async fn list_subscriptions(&self) -> Result<Vec<SubscriptionRecord>, StoreError> {
        let mut rows: Vec<SubscriptionRecord> = self
            .subscriptions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        rows.sort_by(|a, b| b.end_time.cmp(&a.end_time));
        Ok(rows)
    }

    async fn grant(
        &self,
        request: &GrantRequest,
        now: DateTime<Utc>,
    ) -> Result<SubscriptionRecord, StoreError> {
        if request.user_id.trim().is_empty() {
            return Err(StoreError::InvalidInput("user_id must not be empty".to_string()));
        }
        let record = SubscriptionRecord {
            id: Uuid::new_v4().to_string(),
            user_id: request.user_id.clone(),
            start_time: Some(now),
            end_time: now + request.duration,
            status: SubscriptionStatus::Active,
            activated_by_admin: request.activated_by_admin,
            plan_type: request.plan_type.clone(),
        };
        self.subscriptions.insert(record.id.clone(), record.clone());
        self.publish(ChangeEvent::Insert, &record);
        Ok(record)
    }

    async fn extend(
        &self,
        subscription_id: &str,
        by: Duration,
    ) -> Result<SubscriptionRecord, StoreError> {
        let record = {
            let mut entry = self
                .subscriptions
                .get_mut(subscription_id)
                .ok_or_else(|| StoreError::NotFound(format!("subscription {subscription_id}")))?;
            entry.end_time += by;
            entry.status = SubscriptionStatus::Active;
            entry.value().clone()
        };
        self.publish(ChangeEvent::Update, &record);
        Ok(record)
    }

    async fn cancel(
        &self,
        subscription_id: &str,
        now: DateTime<Utc>,
    ) -> Result<SubscriptionRecord, StoreError> {
        let record = {
            let mut entry = self
                .subscriptions
                .get_mut(subscription_id)
                .ok_or_else(|| StoreError::NotFound(format!("subscription {subscription_id}")))?;
            entry.status = SubscriptionStatus::Expired;
            entry.end_time = now;
            entry.value().clone()
        };
        self.publish(ChangeEvent::Update, &record);
        Ok(record)
    }

    async fn count_active(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        Ok(self
            .subscriptions
            .iter()
            .filter(|entry| entry.is_active_at(now))
            .count() as u64)
    }

    async fn record_admin_action(&self, entry: &AdminLogEntry) -> Result<(), StoreError> {
        self.admin_logs
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(entry.clone());
        Ok(())
    }

    async fn insert_message(&self, message: &NewAdminMessage) -> Result<AdminMessage, StoreError> {
        let stored = AdminMessage {
            id: Uuid::new_v4().to_string(),
            sender_id: message.sender_id.clone(),
            receiver_id: message.receiver_id.clone(),
            message: message.message.clone(),
            is_read: false,
            created_at: Utc::now(),
        };
        self.messages.insert(stored.id.clone(), stored.clone());
        Ok(stored)
    }

    async fn unread_messages(&self, user_id: &str) -> Result<Vec<AdminMessage>, StoreError> {
        let mut unread: Vec<AdminMessage> = self
            .messages
            .iter()
            .filter(|m| !m.is_read)
            .filter(|m| m.receiver_id.as_deref().is_none_or(|r| r == user_id))
            .map(|m| m.value().clone())
            .collect();
        unread.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(unread)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap()
    }

    fn record(id: &str, user: &str, end: DateTime<Utc>, status: SubscriptionStatus) -> SubscriptionRecord {
        SubscriptionRecord {
            id: id.to_string(),
            user_id: user.to_string(),
            start_time: Some(t0()),
            end_time: end,
            status,
            activated_by_admin: false,
            plan_type: None,
        }
    }

    #[tokio::test]
    async fn test_fetch_active_prefers_latest_end_time() {
        let store = InMemorySubscriptionStore::new();
        store.insert_record(record("a", "u", t0() + Duration::minutes(5), SubscriptionStatus::Active));
        store.insert_record(record("b", "u", t0() + Duration::minutes(50), SubscriptionStatus::Active));
        store.insert_record(record("c", "u", t0() + Duration::hours(2), SubscriptionStatus::Expired));
        store.insert_record(record("d", "other", t0() + Duration::hours(3), SubscriptionStatus::Active));

        let active = store.fetch_active("u", t0()).await.unwrap().unwrap();
        assert_eq!(active.id, "b");
    }

    #[tokio::test]
    async fn test_fetch_active_ignores_elapsed_rows() {
        let store = InMemorySubscriptionStore::new();
        store.insert_record(record("a", "u", t0(), SubscriptionStatus::Active));
        assert_eq!(store.fetch_active("u", t0()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_grant_extend_cancel_publish_changes() {
        let store = InMemorySubscriptionStore::new();
        let mut changes = store.subscribe_changes();

        let granted = store
            .grant(&GrantRequest::admin("u", Duration::minutes(30)), t0())
            .await
            .unwrap();
        assert_eq!(granted.end_time, t0() + Duration::minutes(30));
        assert_eq!(changes.recv().await.unwrap().event, ChangeEvent::Insert);

        let extended = store.extend(&granted.id, Duration::minutes(30)).await.unwrap();
        assert_eq!(extended.end_time, t0() + Duration::minutes(60));

        let cancelled = store.cancel(&granted.id, t0() + Duration::minutes(1)).await.unwrap();
        assert_eq!(cancelled.status, SubscriptionStatus::Expired);
        assert_eq!(cancelled.end_time, t0() + Duration::minutes(1));

        let _ = changes.recv().await.unwrap();
        let last = changes.recv().await.unwrap();
        assert!(last.revokes(Some(granted.id.as_str()), t0()));
    }

    #[tokio::test]
    async fn test_extend_unknown_row_is_not_found() {
        let store = InMemorySubscriptionStore::new();
        assert!(matches!(
            store.extend("missing", Duration::minutes(30)).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed_in_order() {
        let store = InMemorySubscriptionStore::new();
        store.inject_failures([InjectedFailure::Unavailable, InjectedFailure::Malformed]);

        let first = store.fetch_active("u", t0()).await.unwrap_err();
        assert!(first.is_transient());
        let second = store.fetch_active("u", t0()).await.unwrap_err();
        assert!(!second.is_transient());
        assert_eq!(store.fetch_active("u", t0()).await.unwrap(), None);
        assert_eq!(store.fetch_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_fetch_answers_with_rows_read_at_call_time() {
        let store = InMemorySubscriptionStore::new();
        let granted = store
            .grant(&GrantRequest::admin("u", Duration::minutes(30)), t0())
            .await
            .unwrap();
        store.inject_fetch_delays([std::time::Duration::from_secs(5)]);

        let started = tokio::time::Instant::now();
        let (answer, _) = tokio::join!(store.fetch_active("u", t0()), async {
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            store.cancel(&granted.id, t0()).await.unwrap();
        });
        assert_eq!(answer.unwrap().map(|r| r.id), Some(granted.id));
        assert!(started.elapsed() >= std::time::Duration::from_secs(5));
        assert_eq!(store.fetch_active("u", t0()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unread_messages_include_broadcasts() {
        let store = InMemorySubscriptionStore::new();
        for receiver in [Some("u"), None, Some("other")] {
            store
                .insert_message(&NewAdminMessage {
                    sender_id: Some("admin".into()),
                    receiver_id: receiver.map(str::to_string),
                    message: "hello".into(),
                })
                .await
                .unwrap();
        }
        let unread = store.unread_messages("u").await.unwrap();
        assert_eq!(unread.len(), 2);
        assert!(unread.iter().all(|m| m.receiver_id.as_deref() != Some("other")));
    }
}
