//! The shared entitlement service.
//!
//! One tracker task per user owns the [`EntitlementState`]. UI surfaces read it
//! through `watch` receivers handed out by [`TrackerHandle::subscribe`], so no
//! screen runs its own timer against the store.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior, interval, interval_at};
use tracing::{debug, info, warn};

use crate::config::TrackerConfig;
use crate::entitlement::{Entitlement, EntitlementState};
use crate::store::{ChangeNotification, StoreError, SubscriptionStore};

pub mod clock;

pub use clock::{Clock, ManualClock, SystemClock};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerSettings {
    pub tick_interval: Duration,
    pub poll_interval: Duration,
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self::from(&TrackerConfig::default())
    }
}

impl From<&TrackerConfig> for TrackerSettings {
    fn from(config: &TrackerConfig) -> Self {
        Self {
            tick_interval: config.tick_interval(),
            poll_interval: config.poll_interval(),
            max_attempts: config.refresh_max_attempts.max(1),
            backoff: config.refresh_backoff(),
        }
    }
}

struct TrackerInner {
    store: Arc<dyn SubscriptionStore>,
    clock: Arc<dyn Clock>,
    settings: TrackerSettings,
}

#[derive(Clone)]
pub struct EntitlementTracker {
    inner: Arc<TrackerInner>,
}

impl EntitlementTracker {
    pub fn new(
        store: Arc<dyn SubscriptionStore>,
        clock: Arc<dyn Clock>,
        settings: TrackerSettings,
    ) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                store,
                clock,
                settings,
            }),
        }
    }

    pub fn from_config(store: Arc<dyn SubscriptionStore>, config: &TrackerConfig) -> Self {
        Self::new(store, Arc::new(SystemClock), TrackerSettings::from(config))
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }

    pub fn settings(&self) -> TrackerSettings {
        self.inner.settings
    }

    /// Strict refresh: transient store failures are retried with exponential
    /// backoff up to `max_attempts`; anything else is returned as-is.
    pub async fn try_refresh(&self, user_id: &str) -> Result<Option<Entitlement>, StoreError> {
        if user_id.trim().is_empty() {
            return Ok(None);
        }

        let settings = self.inner.settings;
        let mut attempt: u32 = 1;
        loop {
            let now = self.inner.clock.now();
            match self.inner.store.fetch_active(user_id, now).await {
                Ok(record) => return Ok(record.map(|r| r.to_entitlement())),
                Err(e) if e.is_transient() && attempt < settings.max_attempts => {
                    let delay = settings.backoff * 2u32.saturating_pow(attempt - 1);
                    warn!(
                        user_id = %user_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Subscription fetch failed, retrying."
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Fail-closed refresh: every error reads as "no entitlement".
    pub async fn refresh(&self, user_id: &str) -> Option<Entitlement> {
        match self.try_refresh(user_id).await {
            Ok(entitlement) => entitlement,
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "Entitlement check failed; treating as no entitlement.");
                None
            }
        }
    }

    /// Starts the shared service for `user_id`. `notifications` is the push
    /// channel; without it the tracker relies on polling alone.
    pub fn spawn(
        &self,
        user_id: impl Into<String>,
        notifications: Option<mpsc::Receiver<ChangeNotification>>,
    ) -> TrackerHandle {
        let user_id = user_id.into();
        let (state_tx, state_rx) = watch::channel(EntitlementState::NoEntitlement);
        let (command_tx, command_rx) = mpsc::channel(16);
        let tracker = self.clone();
        let task = tokio::spawn(async move {
            tracker
                .run(user_id, state_tx, command_rx, notifications)
                .await;
        });
        TrackerHandle {
            state_rx,
            command_tx,
            task: Some(task),
        }
    }

    async fn run(
        self,
        user_id: String,
        state_tx: watch::Sender<EntitlementState>,
        mut command_rx: mpsc::Receiver<TrackerCommand>,
        mut notifications: Option<mpsc::Receiver<ChangeNotification>>,
    ) {
        info!(user_id = %user_id, "Entitlement tracker started.");
        let settings = self.inner.settings;
        let mut refreshes: JoinSet<(u64, Option<Entitlement>)> = JoinSet::new();
        let mut issued_seq: u64 = 0;
        let mut applied_seq: u64 = 0;

        self.start_refresh(&mut refreshes, &mut issued_seq, &user_id);

        let mut ticker = interval(settings.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut poller = interval_at(Instant::now() + settings.poll_interval, settings.poll_interval);
        poller.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = command_rx.recv() => match command {
                    Some(TrackerCommand::Refresh) => {
                        self.start_refresh(&mut refreshes, &mut issued_seq, &user_id);
                    }
                    Some(TrackerCommand::Shutdown) | None => break,
                },
                _ = ticker.tick() => {
                    let now = self.inner.clock.now();
                    let next = state_tx.borrow().ticked(now);
                    publish(&state_tx, &user_id, next);
                }
                _ = poller.tick() => {
                    self.start_refresh(&mut refreshes, &mut issued_seq, &user_id);
                }
                Some(joined) = refreshes.join_next() => match joined {
                    Ok((seq, entitlement)) if seq > applied_seq => {
                        applied_seq = seq;
                        let now = self.inner.clock.now();
                        publish(&state_tx, &user_id, EntitlementState::resolve(entitlement, now));
                    }
                    Ok((seq, _)) => {
                        debug!(user_id = %user_id, seq, applied_seq, "Discarding out-of-order refresh result.");
                    }
                    Err(e) => {
                        warn!(user_id = %user_id, error = %e, "Refresh task failed.");
                    }
                },
                notification = next_notification(&mut notifications) => match notification {
                    Some(change) if change.user_id == user_id => {
                        let now = self.inner.clock.now();
                        let held = state_tx
                            .borrow()
                            .entitlement()
                            .and_then(|e| e.subscription_id.clone());
                        if change.revokes(held.as_deref(), now) {
                            // Results from refreshes already in flight predate the revocation.
                            applied_seq = issued_seq;
                            publish(&state_tx, &user_id, EntitlementState::NoEntitlement);
                        }
                        // Another row of the user may still be active.
                        self.start_refresh(&mut refreshes, &mut issued_seq, &user_id);
                    }
                    Some(change) => {
                        debug!(user_id = %user_id, other = %change.user_id, "Ignoring change for another user.");
                    }
                    None => {
                        warn!(user_id = %user_id, "Change notification channel closed; continuing with polling only.");
                        notifications = None;
                    }
                },
            }
        }

        refreshes.abort_all();
        info!(user_id = %user_id, "Entitlement tracker stopped.");
    }

    fn start_refresh(
        &self,
        refreshes: &mut JoinSet<(u64, Option<Entitlement>)>,
        issued_seq: &mut u64,
        user_id: &str,
    ) {
        *issued_seq += 1;
        let seq = *issued_seq;
        let tracker = self.clone();
        let user_id = user_id.to_string();
        refreshes.spawn(async move { (seq, tracker.refresh(&user_id).await) });
    }
}

async fn next_notification(
    notifications: &mut Option<mpsc::Receiver<ChangeNotification>>,
) -> Option<ChangeNotification> {
    match notifications {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn publish(state_tx: &watch::Sender<EntitlementState>, user_id: &str, next: EntitlementState) {
    let previous = state_tx.send_replace(next);
    let current = state_tx.borrow();
    match (previous.is_unlocked(), current.is_unlocked()) {
        (false, true) => info!(
            user_id = %user_id,
            expiry = ?current.expiry(),
            "VIP entitlement active."
        ),
        (true, false) => info!(user_id = %user_id, "VIP entitlement ended; features locked."),
        _ => {}
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TrackerCommand {
    Refresh,
    Shutdown,
}

/// Owner of a running tracker. Dropping it stops the tracker and its timers.
pub struct TrackerHandle {
    state_rx: watch::Receiver<EntitlementState>,
    command_tx: mpsc::Sender<TrackerCommand>,
    task: Option<JoinHandle<()>>,
}

impl TrackerHandle {
    pub fn subscribe(&self) -> watch::Receiver<EntitlementState> {
        self.state_rx.clone()
    }

    pub fn current(&self) -> EntitlementState {
        self.state_rx.borrow().clone()
    }

    pub fn is_unlocked(&self) -> bool {
        self.state_rx.borrow().is_unlocked()
    }

    /// Asks for an immediate refresh, e.g. right after a payment confirmation.
    pub async fn refresh_now(&self) {
        if self.command_tx.send(TrackerCommand::Refresh).await.is_err() {
            warn!("Tracker is no longer running; refresh request dropped.");
        }
    }

    /// Stops the tracker and waits for its task to finish.
    pub async fn shutdown(mut self) {
        let _ = self.command_tx.send(TrackerCommand::Shutdown).await;
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "Tracker task ended abnormally.");
            }
        }
    }
}

impl Drop for TrackerHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::{InMemorySubscriptionStore, InjectedFailure};
    use crate::store::{ChangeEvent, GrantRequest, SubscriptionRecord, SubscriptionStatus};
    use chrono::{DateTime, TimeZone, Utc};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap()
    }

    fn tracker(store: Arc<InMemorySubscriptionStore>, clock: ManualClock) -> EntitlementTracker {
        let settings = TrackerSettings {
            tick_interval: Duration::from_secs(1),
            poll_interval: Duration::from_secs(30),
            max_attempts: 3,
            backoff: Duration::from_millis(100),
        };
        EntitlementTracker::new(store, Arc::new(clock), settings)
    }

    fn row(id: &str, end_time: DateTime<Utc>, status: SubscriptionStatus) -> SubscriptionRecord {
        SubscriptionRecord {
            id: id.to_string(),
            user_id: "u".to_string(),
            start_time: Some(t0() - chrono::Duration::days(2)),
            end_time,
            status,
            activated_by_admin: false,
            plan_type: None,
        }
    }

    fn held_id(handle: &TrackerHandle) -> Option<String> {
        handle
            .current()
            .entitlement()
            .and_then(|e| e.subscription_id.clone())
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test]
    async fn test_refresh_empty_user_skips_store() {
        let store = Arc::new(InMemorySubscriptionStore::new());
        let tracker = tracker(store.clone(), ManualClock::new(t0()));
        assert_eq!(tracker.refresh("").await, None);
        assert_eq!(tracker.refresh("   ").await, None);
        assert_eq!(store.fetch_count(), 0);
    }

    #[tokio::test]
    async fn test_refresh_no_row_is_none() {
        let store = Arc::new(InMemorySubscriptionStore::new());
        let tracker = tracker(store, ManualClock::new(t0()));
        assert_eq!(tracker.try_refresh("u").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_refresh_is_idempotent() {
        let store = Arc::new(InMemorySubscriptionStore::new());
        store
            .grant(&GrantRequest::admin("u", chrono::Duration::minutes(30)), t0())
            .await
            .unwrap();
        let tracker = tracker(store, ManualClock::new(t0()));
        let first = tracker.refresh("u").await.unwrap();
        let second = tracker.refresh("u").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.expiry, t0() + chrono::Duration::minutes(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let store = Arc::new(InMemorySubscriptionStore::new());
        store
            .grant(&GrantRequest::admin("u", chrono::Duration::minutes(30)), t0())
            .await
            .unwrap();
        store.inject_failures([InjectedFailure::Unavailable, InjectedFailure::Unavailable]);
        let tracker = tracker(store.clone(), ManualClock::new(t0()));

        assert!(tracker.refresh("u").await.is_some());
        assert_eq!(store.fetch_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_are_bounded_and_fail_closed() {
        let store = Arc::new(InMemorySubscriptionStore::new());
        store
            .grant(&GrantRequest::admin("u", chrono::Duration::minutes(30)), t0())
            .await
            .unwrap();
        store.inject_failures(vec![InjectedFailure::Unavailable; 5]);
        let tracker = tracker(store.clone(), ManualClock::new(t0()));

        assert_eq!(tracker.refresh("u").await, None);
        assert_eq!(store.fetch_count(), 3);
    }

    #[tokio::test]
    async fn test_malformed_response_is_not_retried() {
        let store = Arc::new(InMemorySubscriptionStore::new());
        store.inject_failures([InjectedFailure::Malformed]);
        let tracker = tracker(store.clone(), ManualClock::new(t0()));

        assert!(matches!(
            tracker.try_refresh("u").await,
            Err(StoreError::MalformedResponse(_))
        ));
        assert_eq!(store.fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_refresh_uses_latest_end_time_when_rows_overlap() {
        let store = Arc::new(InMemorySubscriptionStore::new());
        for (id, minutes) in [("short", 5), ("long", 45)] {
            store.insert_record(SubscriptionRecord {
                id: id.to_string(),
                user_id: "u".to_string(),
                start_time: Some(t0()),
                end_time: t0() + chrono::Duration::minutes(minutes),
                status: SubscriptionStatus::Active,
                activated_by_admin: false,
                plan_type: None,
            });
        }
        let tracker = tracker(store, ManualClock::new(t0()));
        let entitlement = tracker.refresh("u").await.unwrap();
        assert_eq!(entitlement.subscription_id.as_deref(), Some("long"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_to_another_inactive_row_keeps_user_unlocked() {
        let store = Arc::new(InMemorySubscriptionStore::new());
        store.insert_record(row("current", t0() + chrono::Duration::minutes(30), SubscriptionStatus::Active));
        let old = row("old", t0() - chrono::Duration::days(1), SubscriptionStatus::Expired);
        store.insert_record(old.clone());

        let (changes_tx, changes_rx) = mpsc::channel(8);
        let handle = tracker(store, ManualClock::new(t0())).spawn("u", Some(changes_rx));
        settle().await;
        assert!(handle.is_unlocked());

        changes_tx
            .send(ChangeNotification {
                event: ChangeEvent::Update,
                user_id: "u".to_string(),
                record: Some(old),
            })
            .await
            .unwrap();
        settle().await;

        assert!(handle.is_unlocked());
        assert_eq!(held_id(&handle).as_deref(), Some("current"));
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelling_held_row_falls_back_to_overlapping_row() {
        let store = Arc::new(InMemorySubscriptionStore::new());
        store.insert_record(row("short", t0() + chrono::Duration::minutes(5), SubscriptionStatus::Active));
        store.insert_record(row("long", t0() + chrono::Duration::minutes(45), SubscriptionStatus::Active));

        let handle = tracker(store.clone(), ManualClock::new(t0())).spawn("u", Some(store.change_feed()));
        settle().await;
        assert_eq!(held_id(&handle).as_deref(), Some("long"));

        store.cancel("long", t0()).await.unwrap();
        settle().await;

        assert!(handle.is_unlocked());
        assert_eq!(held_id(&handle).as_deref(), Some("short"));
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_older_refresh_finishing_last_is_discarded() {
        let store = Arc::new(InMemorySubscriptionStore::new());
        store.insert_record(row("s", t0() + chrono::Duration::minutes(30), SubscriptionStatus::Active));
        // The initial refresh reads the active row but answers after five seconds.
        store.inject_fetch_delays([Duration::from_secs(5)]);

        let handle = tracker(store.clone(), ManualClock::new(t0())).spawn("u", None);
        tokio::time::sleep(Duration::from_secs(1)).await;
        store.cancel("s", t0()).await.unwrap();
        handle.refresh_now().await;
        settle().await;
        assert!(!handle.is_unlocked());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(store.fetch_count(), 2);
        assert!(!handle.is_unlocked());
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_revocation_discards_refresh_already_in_flight() {
        let store = Arc::new(InMemorySubscriptionStore::new());
        store.insert_record(row("s", t0() + chrono::Duration::minutes(30), SubscriptionStatus::Active));
        store.inject_fetch_delays([Duration::ZERO, Duration::from_secs(5)]);

        let handle = tracker(store.clone(), ManualClock::new(t0())).spawn("u", Some(store.change_feed()));
        settle().await;
        assert!(handle.is_unlocked());

        // Reads the still-active row, answers five seconds later.
        handle.refresh_now().await;
        settle().await;

        store.cancel("s", t0()).await.unwrap();
        settle().await;
        assert!(!handle.is_unlocked());

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(!handle.is_unlocked());
        handle.shutdown().await;
    }
}
