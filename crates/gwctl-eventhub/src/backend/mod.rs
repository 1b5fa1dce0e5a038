//! The event hub: lifecycle, caller-facing operations and background loops.
//!
//! ```text
//! Uninitialized --initialize--> Initialized --close--> Closed
//! ```
//!
//! `initialize` compiles the hot statements and spawns the poll and cleanup
//! loops; every other operation fails with `NotInitialized` outside the
//! `Initialized` state. `close` cancels both loops and waits for them, so no
//! query runs against the store after it returns.

mod cleanup;
mod poll;

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use chrono::{DateTime, Utc};
use gwctl_core::EventHubConfig;
use gwctl_core::types::{NewEvent, OrganizationState};
use serde::Serialize;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::db::SharedConnection;
use crate::error::{EventHubError, Result, StoreError};
use crate::registry::{EventBatch, OrganizationRegistry, PollCursor, Subscriber};
use crate::statements::PreparedStatements;
use crate::store::Store;

pub use cleanup::CleanupReport;
pub use poll::PollReport;

/// Lifecycle state of an [`EventHub`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum HubState {
    Uninitialized = 0,
    Initialized = 1,
    Closed = 2,
}

impl HubState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => HubState::Initialized,
            2 => HubState::Closed,
            _ => HubState::Uninitialized,
        }
    }
}

/// Handles of the two background loops.
struct Workers {
    poll_cancel: CancellationToken,
    cleanup_cancel: CancellationToken,
    poll_task: JoinHandle<()>,
    cleanup_task: JoinHandle<()>,
}

impl Workers {
    fn cancel(&self) {
        self.poll_cancel.cancel();
        self.cleanup_cancel.cancel();
    }

    async fn shutdown(self) {
        self.cancel();
        for (name, task) in [("poll", self.poll_task), ("cleanup", self.cleanup_task)] {
            if let Err(e) = task.await {
                warn!(task = name, error = %e, "eventhub loop ended abnormally");
            }
        }
    }
}

enum Lifecycle {
    Uninitialized,
    Initialized(Workers),
    Closed,
}

pub(crate) struct HubInner {
    config: EventHubConfig,
    registry: OrganizationRegistry,
    store: Store,
    statements: PreparedStatements,
    state: AtomicU8,
    lifecycle: Mutex<Lifecycle>,
}

impl HubInner {
    fn state(&self) -> HubState {
        HubState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: HubState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn ensure_initialized(&self) -> Result<()> {
        match self.state() {
            HubState::Initialized => Ok(()),
            _ => Err(EventHubError::NotInitialized),
        }
    }

    /// Run a store call on the blocking pool, re-preparing an invalidated
    /// statement once.
    async fn run_store<T, F>(self: &Arc<Self>, operation: &'static str, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: Fn(&Store) -> std::result::Result<T, StoreError> + Send + 'static,
    {
        let inner = Arc::clone(self);
        tokio::task::spawn_blocking(move || inner.statements.execute(&inner.store, op))
            .await?
            .map_err(|source| EventHubError::Store { operation, source })
    }
}

/// Polling, SQLite-backed publish/subscribe bus scoped by organization.
///
/// Publishers append events through [`publish`](Self::publish); the poll
/// loop notices version changes and delivers new events in batches to every
/// subscriber channel of the organization. Delivery is at-least-once: a full
/// channel defers the whole batch to the next tick.
pub struct EventHub {
    inner: Arc<HubInner>,
}

impl EventHub {
    /// Build a hub over an opened and migrated connection.
    pub fn new(conn: SharedConnection, config: EventHubConfig) -> Self {
        Self {
            inner: Arc::new(HubInner {
                config,
                registry: OrganizationRegistry::new(),
                store: Store::new(conn),
                statements: PreparedStatements::new(),
                state: AtomicU8::new(HubState::Uninitialized as u8),
                lifecycle: Mutex::new(Lifecycle::Uninitialized),
            }),
        }
    }

    pub fn state(&self) -> HubState {
        self.inner.state()
    }

    pub fn config(&self) -> &EventHubConfig {
        &self.inner.config
    }

    /// Prepare statements and start the poll and cleanup loops.
    ///
    /// Both loops run under their own child of `parent`; cancelling `parent`
    /// stops them too. Calling this again while initialized is a no-op.
    pub async fn initialize(&self, parent: &CancellationToken) -> Result<()> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        match *lifecycle {
            Lifecycle::Initialized(_) => {
                debug!("eventhub already initialized");
                return Ok(());
            }
            Lifecycle::Closed => return Err(EventHubError::Closed),
            Lifecycle::Uninitialized => {}
        }

        self.inner.config.validate()?;

        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || inner.statements.prepare_all(&inner.store))
            .await?
            .map_err(|source| EventHubError::Store {
                operation: "prepare statements",
                source,
            })?;

        let poll_cancel = parent.child_token();
        let cleanup_cancel = parent.child_token();
        let poll_task = tokio::spawn(poll::run(Arc::clone(&self.inner), poll_cancel.clone()));
        let cleanup_task =
            tokio::spawn(cleanup::run(Arc::clone(&self.inner), cleanup_cancel.clone()));

        *lifecycle = Lifecycle::Initialized(Workers {
            poll_cancel,
            cleanup_cancel,
            poll_task,
            cleanup_task,
        });
        self.inner.set_state(HubState::Initialized);

        info!(
            poll_interval_ms = self.inner.config.poll_interval.as_millis() as u64,
            cleanup_interval_ms = self.inner.config.cleanup_interval.as_millis() as u64,
            retention_ms = self.inner.config.retention_period.as_millis() as u64,
            "eventhub initialized"
        );
        Ok(())
    }

    /// Register an organization: persist its state row, then add it to the
    /// registry with its cursor at now, so older events are never replayed.
    pub async fn register_organization(&self, organization_id: &str) -> Result<()> {
        self.inner.ensure_initialized()?;
        if self.inner.registry.contains(organization_id) {
            return Err(EventHubError::AlreadyExists(organization_id.to_owned()));
        }

        let id = organization_id.to_owned();
        self.inner
            .run_store("initialize organization state", move |store| {
                store.initialize_state(&id)
            })
            .await?;

        self.inner.registry.register(organization_id)?;
        info!(organization_id = %organization_id, "organization registered");
        Ok(())
    }

    /// Append an event and bump the organization's version atomically.
    ///
    /// Returns the new version token. Failures are returned as-is; the caller
    /// decides whether to retry.
    pub async fn publish(
        &self,
        organization_id: &str,
        event_type: &str,
        action: &str,
        entity_id: &str,
        correlation_id: Option<&str>,
        payload: Vec<u8>,
    ) -> Result<String> {
        let mut event = NewEvent::new(event_type, action, entity_id).with_payload(payload);
        if let Some(correlation_id) = correlation_id {
            event = event.with_correlation_id(correlation_id);
        }
        self.publish_event(organization_id, event).await
    }

    /// [`publish`](Self::publish) with a prebuilt event, e.g. one carrying
    /// its own originated timestamp.
    pub async fn publish_event(&self, organization_id: &str, event: NewEvent) -> Result<String> {
        self.inner.ensure_initialized()?;
        self.inner.registry.get(organization_id)?;

        let id = organization_id.to_owned();
        let event_type = event.event_type.clone();
        let entity_id = event.entity_id.clone();
        let version = self
            .inner
            .run_store("publish event", move |store| {
                store.publish_event_atomic(&id, &event)
            })
            .await?;

        debug!(
            organization_id = %organization_id,
            event_type = %event_type,
            entity_id = %entity_id,
            version = %version,
            "event published"
        );
        Ok(version)
    }

    /// Attach a subscriber channel to an organization.
    pub fn subscribe(&self, organization_id: &str, tx: Subscriber) -> Result<()> {
        self.inner.ensure_initialized()?;
        self.inner.registry.add_subscriber(organization_id, tx)?;
        debug!(organization_id = %organization_id, "subscriber added");
        Ok(())
    }

    /// Create a channel of `capacity` batches, subscribe its sender and hand
    /// back the receiver.
    pub fn subscribe_channel(
        &self,
        organization_id: &str,
        capacity: usize,
    ) -> Result<mpsc::Receiver<EventBatch>> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.subscribe(organization_id, tx)?;
        Ok(rx)
    }

    /// Detach a subscriber. Unknown channels are ignored.
    pub fn unsubscribe(&self, organization_id: &str, tx: &Subscriber) -> Result<()> {
        self.inner.ensure_initialized()?;
        self.inner.registry.remove_subscriber(organization_id, tx)?;
        debug!(organization_id = %organization_id, "subscriber removed");
        Ok(())
    }

    /// Delete events processed before `older_than`. Returns rows deleted.
    pub async fn cleanup(&self, older_than: DateTime<Utc>) -> Result<usize> {
        self.inner.ensure_initialized()?;
        let deleted = self
            .inner
            .run_store("cleanup old events", move |store| {
                store.cleanup_older_than(older_than)
            })
            .await?;
        info!(deleted, older_than = %older_than, "cleaned up events");
        Ok(deleted)
    }

    /// Delete events processed in `[from, to)`. Returns rows deleted.
    pub async fn cleanup_range(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<usize> {
        self.inner.ensure_initialized()?;
        let deleted = self
            .inner
            .run_store("cleanup event range", move |store| store.cleanup_range(from, to))
            .await?;
        info!(deleted, from = %from, to = %to, "cleaned up event range");
        Ok(deleted)
    }

    /// Persisted version row of a registered organization.
    pub async fn organization_state(
        &self,
        organization_id: &str,
    ) -> Result<Option<OrganizationState>> {
        self.inner.ensure_initialized()?;
        self.inner.registry.get(organization_id)?;
        let id = organization_id.to_owned();
        self.inner
            .run_store("get organization state", move |store| store.state(&id))
            .await
    }

    /// The poller's view of a registered organization.
    pub fn poll_cursor(&self, organization_id: &str) -> Result<PollCursor> {
        self.inner.ensure_initialized()?;
        self.inner.registry.cursor(organization_id)
    }

    /// Stop both loops, wait for them to exit and release statements.
    ///
    /// Idempotent.
    pub async fn close(&self) -> Result<()> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        let previous = std::mem::replace(&mut *lifecycle, Lifecycle::Closed);
        self.inner.set_state(HubState::Closed);

        let workers = match previous {
            Lifecycle::Initialized(workers) => workers,
            Lifecycle::Uninitialized | Lifecycle::Closed => return Ok(()),
        };
        workers.shutdown().await;

        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || inner.statements.release(&inner.store)).await?;

        info!("eventhub closed");
        Ok(())
    }
}

impl Drop for EventHub {
    fn drop(&mut self) {
        // Best effort: loops hold their own Arc and would otherwise outlive us.
        if let Ok(lifecycle) = self.inner.lifecycle.try_lock() {
            if let Lifecycle::Initialized(workers) = &*lifecycle {
                workers.cancel();
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::db;

    /// Loops that never tick on their own during a test.
    fn quiet_config() -> EventHubConfig {
        EventHubConfig {
            poll_interval: Duration::from_secs(3600),
            cleanup_interval: Duration::from_secs(3600),
            retention_period: Duration::from_secs(7200),
        }
    }

    async fn running_hub() -> EventHub {
        let hub = EventHub::new(db::open_in_memory().unwrap(), quiet_config());
        hub.initialize(&CancellationToken::new()).await.unwrap();
        hub
    }

    #[tokio::test]
    async fn operations_fail_before_initialize() {
        let hub = EventHub::new(db::open_in_memory().unwrap(), quiet_config());
        assert_eq!(hub.state(), HubState::Uninitialized);

        assert!(matches!(
            hub.register_organization("acme").await,
            Err(EventHubError::NotInitialized)
        ));
        assert!(matches!(
            hub.publish("acme", "api", "update", "api-1", None, Vec::new()).await,
            Err(EventHubError::NotInitialized)
        ));
        let (tx, _rx) = mpsc::channel(1);
        assert!(matches!(
            hub.subscribe("acme", tx.clone()),
            Err(EventHubError::NotInitialized)
        ));
        assert!(matches!(
            hub.unsubscribe("acme", &tx),
            Err(EventHubError::NotInitialized)
        ));
        assert!(matches!(
            hub.cleanup(Utc::now()).await,
            Err(EventHubError::NotInitialized)
        ));
        assert!(matches!(
            hub.cleanup_range(Utc::now(), Utc::now()).await,
            Err(EventHubError::NotInitialized)
        ));
    }

    #[tokio::test]
    async fn initialize_twice_is_noop() {
        let hub = running_hub().await;
        hub.initialize(&CancellationToken::new()).await.unwrap();
        assert_eq!(hub.state(), HubState::Initialized);
        hub.close().await.unwrap();
    }

    #[tokio::test]
    async fn initialize_rejects_invalid_config() {
        let config = EventHubConfig {
            poll_interval: Duration::ZERO,
            ..quiet_config()
        };
        let hub = EventHub::new(db::open_in_memory().unwrap(), config);
        let err = hub.initialize(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, EventHubError::Config(_)));
        assert_eq!(hub.state(), HubState::Uninitialized);
    }

    #[tokio::test]
    async fn initialize_prepares_every_statement() {
        let hub = running_hub().await;
        for id in crate::statements::StatementId::ALL {
            assert!(hub.inner.statements.is_prepared(id), "{id} not prepared");
        }
        hub.close().await.unwrap();
        for id in crate::statements::StatementId::ALL {
            assert!(!hub.inner.statements.is_prepared(id), "{id} still prepared");
        }
    }

    #[tokio::test]
    async fn close_is_idempotent_and_final() {
        let hub = running_hub().await;
        hub.close().await.unwrap();
        hub.close().await.unwrap();
        assert_eq!(hub.state(), HubState::Closed);

        assert!(matches!(
            hub.register_organization("acme").await,
            Err(EventHubError::NotInitialized)
        ));
        assert!(matches!(
            hub.initialize(&CancellationToken::new()).await,
            Err(EventHubError::Closed)
        ));
    }

    #[tokio::test]
    async fn close_before_initialize_is_ok() {
        let hub = EventHub::new(db::open_in_memory().unwrap(), quiet_config());
        hub.close().await.unwrap();
        assert_eq!(hub.state(), HubState::Closed);
    }

    #[tokio::test]
    async fn close_joins_both_loops() {
        let hub = running_hub().await;
        let (poll_cancel, cleanup_cancel) = {
            let lifecycle = hub.inner.lifecycle.lock().await;
            match &*lifecycle {
                Lifecycle::Initialized(w) => (w.poll_cancel.clone(), w.cleanup_cancel.clone()),
                _ => panic!("hub should be initialized"),
            }
        };
        hub.close().await.unwrap();
        assert!(poll_cancel.is_cancelled());
        assert!(cleanup_cancel.is_cancelled());
        // Only this handle is left once both loops have dropped theirs.
        assert_eq!(Arc::strong_count(&hub.inner), 1);
    }

    #[tokio::test]
    async fn register_twice_is_already_exists() {
        let hub = running_hub().await;
        hub.register_organization("acme").await.unwrap();
        let (tx, _rx) = mpsc::channel(1);
        hub.subscribe("acme", tx).unwrap();
        let cursor = hub.poll_cursor("acme").unwrap();

        let err = hub.register_organization("acme").await.unwrap_err();
        assert!(matches!(err, EventHubError::AlreadyExists(_)));
        assert_eq!(hub.poll_cursor("acme").unwrap(), cursor);
        assert_eq!(hub.inner.registry.get("acme").unwrap().subscriber_count(), 1);
        hub.close().await.unwrap();
    }

    #[tokio::test]
    async fn register_persists_empty_state_row() {
        let hub = running_hub().await;
        hub.register_organization("acme").await.unwrap();
        let state = hub.organization_state("acme").await.unwrap().unwrap();
        assert_eq!(state.organization_id, "acme");
        assert!(!state.is_published());
        hub.close().await.unwrap();
    }

    #[tokio::test]
    async fn publish_to_unknown_organization_is_not_found() {
        let hub = running_hub().await;
        let err = hub
            .publish("ghost", "api", "update", "api-1", None, Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EventHubError::NotFound(_)));
        hub.close().await.unwrap();
    }

    #[tokio::test]
    async fn publish_returns_persisted_version() {
        let hub = running_hub().await;
        hub.register_organization("acme").await.unwrap();
        let version = hub
            .publish("acme", "policy", "update", "api-1", Some("corr-1"), b"{}".to_vec())
            .await
            .unwrap();
        let state = hub.organization_state("acme").await.unwrap().unwrap();
        assert_eq!(state.version_id, version);
        hub.close().await.unwrap();
    }

    #[tokio::test]
    async fn subscribe_unknown_organization_is_not_found() {
        let hub = running_hub().await;
        assert!(matches!(
            hub.subscribe_channel("ghost", 4),
            Err(EventHubError::NotFound(_))
        ));
        hub.close().await.unwrap();
    }

    #[tokio::test]
    async fn cleanup_range_deletes_only_inside_window() {
        let hub = running_hub().await;
        hub.register_organization("acme").await.unwrap();
        let from = Utc::now();
        hub.publish("acme", "api", "create", "api-1", None, Vec::new())
            .await
            .unwrap();
        let to = Utc::now() + chrono::Duration::seconds(1);

        assert_eq!(hub.cleanup_range(from, to).await.unwrap(), 1);
        assert_eq!(hub.cleanup(Utc::now()).await.unwrap(), 0);
        hub.close().await.unwrap();
    }

    #[tokio::test]
    async fn cancelling_parent_stops_loops() {
        let parent = CancellationToken::new();
        let hub = EventHub::new(db::open_in_memory().unwrap(), quiet_config());
        hub.initialize(&parent).await.unwrap();
        parent.cancel();

        // Loops exit on their own; close still joins cleanly.
        tokio::time::timeout(Duration::from_secs(2), hub.close())
            .await
            .expect("close should not hang")
            .unwrap();
    }
}
