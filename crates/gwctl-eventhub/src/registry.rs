//! In-memory bookkeeping of registered organizations.
//!
//! The registry is the authority on which organizations exist in this
//! process. It holds each organization's subscriber channels and poll
//! cursor; it performs no I/O.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use gwctl_core::types::Event;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;

use crate::error::{EventHubError, Result};

/// A batch of events for one organization, oldest first.
pub type EventBatch = Vec<Event>;

/// Delivery sink for one consumer.
pub type Subscriber = mpsc::Sender<EventBatch>;

/// What the poller has already seen for one organization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollCursor {
    /// Version token observed on the last successful tick. Empty until the
    /// first publish is observed.
    pub known_version: String,
    /// Lower bound (exclusive) for the next event fetch.
    pub last_polled: DateTime<Utc>,
}

#[derive(Debug)]
struct OrganizationInner {
    subscribers: Vec<Subscriber>,
    cursor: PollCursor,
}

/// One registered organization. Its lock covers only its own subscribers
/// and cursor.
#[derive(Debug)]
pub struct Organization {
    id: String,
    inner: Mutex<OrganizationInner>,
}

impl Organization {
    fn new(id: String, now: DateTime<Utc>) -> Self {
        Self {
            id,
            inner: Mutex::new(OrganizationInner {
                subscribers: Vec::new(),
                cursor: PollCursor {
                    known_version: String::new(),
                    last_polled: now,
                },
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn cursor(&self) -> PollCursor {
        self.inner.lock().cursor.clone()
    }

    /// Copy of the subscriber list, safe to iterate while others subscribe.
    pub fn subscribers(&self) -> Vec<Subscriber> {
        self.inner.lock().subscribers.clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }

    /// Record a successful tick. `last_polled` never moves backwards.
    pub fn advance_cursor(&self, version: &str, last_polled: Option<DateTime<Utc>>) {
        let mut inner = self.inner.lock();
        inner.cursor.known_version = version.to_owned();
        if let Some(ts) = last_polled {
            if ts > inner.cursor.last_polled {
                inner.cursor.last_polled = ts;
            }
        }
    }

    fn add_subscriber(&self, tx: Subscriber) {
        self.inner.lock().subscribers.push(tx);
    }

    fn remove_subscriber(&self, tx: &Subscriber) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.subscribers.len();
        inner.subscribers.retain(|s| !s.same_channel(tx));
        inner.subscribers.len() != before
    }

    /// Drop subscribers whose receiving half is gone. Returns how many.
    pub fn prune_closed(&self) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.subscribers.len();
        inner.subscribers.retain(|s| !s.is_closed());
        before - inner.subscribers.len()
    }
}

/// Registry of organizations keyed by id.
#[derive(Debug, Default)]
pub struct OrganizationRegistry {
    organizations: RwLock<HashMap<String, Arc<Organization>>>,
}

impl OrganizationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an entry with no subscribers and `last_polled = now`.
    pub fn register(&self, organization_id: &str) -> Result<Arc<Organization>> {
        self.register_at(organization_id, Utc::now())
    }

    fn register_at(&self, organization_id: &str, now: DateTime<Utc>) -> Result<Arc<Organization>> {
        let mut organizations = self.organizations.write();
        if organizations.contains_key(organization_id) {
            return Err(EventHubError::AlreadyExists(organization_id.to_owned()));
        }
        let org = Arc::new(Organization::new(organization_id.to_owned(), now));
        organizations.insert(organization_id.to_owned(), Arc::clone(&org));
        Ok(org)
    }

    pub fn get(&self, organization_id: &str) -> Result<Arc<Organization>> {
        self.organizations
            .read()
            .get(organization_id)
            .cloned()
            .ok_or_else(|| EventHubError::NotFound(organization_id.to_owned()))
    }

    pub fn contains(&self, organization_id: &str) -> bool {
        self.organizations.read().contains_key(organization_id)
    }

    pub fn add_subscriber(&self, organization_id: &str, tx: Subscriber) -> Result<()> {
        self.get(organization_id)?.add_subscriber(tx);
        Ok(())
    }

    /// Remove `tx` from the organization. Unknown channels are ignored.
    pub fn remove_subscriber(&self, organization_id: &str, tx: &Subscriber) -> Result<()> {
        self.get(organization_id)?.remove_subscriber(tx);
        Ok(())
    }

    pub fn subscribers(&self, organization_id: &str) -> Result<Vec<Subscriber>> {
        Ok(self.get(organization_id)?.subscribers())
    }

    pub fn cursor(&self, organization_id: &str) -> Result<PollCursor> {
        Ok(self.get(organization_id)?.cursor())
    }

    /// Snapshot of every organization.
    pub fn all(&self) -> Vec<Arc<Organization>> {
        self.organizations.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.organizations.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.organizations.read().is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
