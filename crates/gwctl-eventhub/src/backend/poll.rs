//! Change detection and delivery.
//!
//! One tick: fetch every organization's version in a single query, and for
//! each registered organization whose version moved, fetch the events after
//! its cursor and offer them to every subscriber without blocking. The
//! cursor advances only if every live subscriber accepted the batch.

use std::sync::Arc;

use gwctl_core::types::Event;
use serde::Serialize;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::HubInner;
use crate::error::Result;
use crate::registry::{EventBatch, Organization};

/// Outcome counters of one poll tick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PollReport {
    /// Registered organizations with a state row.
    pub checked: usize,
    /// Organizations whose version differed from the cursor.
    pub changed: usize,
    /// Organizations whose batch reached every subscriber.
    pub delivered: usize,
    /// Organizations left for the next tick because a channel was full.
    pub deferred: usize,
    /// Organizations whose event fetch failed.
    pub failed: usize,
    pub events_delivered: usize,
}

/// Result of offering one batch to an organization's subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DeliveryOutcome {
    Delivered { receivers: usize },
    Backpressure { full: usize, receivers: usize },
}

pub(crate) async fn run(inner: Arc<HubInner>, cancel: CancellationToken) {
    let period = inner.config.poll_interval;
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(interval_ms = period.as_millis() as u64, "eventhub poll loop started");

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                match inner.poll_once().await {
                    Ok(report) if report.changed > 0 => {
                        debug!(?report, "poll tick complete");
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "poll tick failed, retrying next tick"),
                }
            }
        }
    }
    info!("eventhub poll loop stopped");
}

impl HubInner {
    pub(crate) async fn poll_once(self: &Arc<Self>) -> Result<PollReport> {
        let states = self
            .run_store("get all organization states", |store| store.all_states())
            .await?;

        let mut report = PollReport::default();
        for state in states {
            let Ok(org) = self.registry.get(&state.organization_id) else {
                continue;
            };
            report.checked += 1;

            let cursor = org.cursor();
            if state.version_id == cursor.known_version {
                continue;
            }
            report.changed += 1;

            let id = state.organization_id.clone();
            let since = cursor.last_polled;
            let events = match self
                .run_store("get events since", move |store| store.events_since(&id, since))
                .await
            {
                Ok(events) => events,
                Err(e) => {
                    warn!(
                        organization_id = %state.organization_id,
                        error = %e,
                        "failed to fetch events, retrying next tick"
                    );
                    report.failed += 1;
                    continue;
                }
            };

            let Some(newest) = events.last().map(|e| e.processed_timestamp) else {
                org.advance_cursor(&state.version_id, None);
                continue;
            };

            match deliver(&org, &events) {
                DeliveryOutcome::Delivered { receivers } => {
                    org.advance_cursor(&state.version_id, Some(newest));
                    report.delivered += 1;
                    report.events_delivered += events.len();
                    debug!(
                        organization_id = %state.organization_id,
                        events = events.len(),
                        receivers,
                        version = %state.version_id,
                        "delivered events"
                    );
                }
                DeliveryOutcome::Backpressure { full, receivers } => {
                    report.deferred += 1;
                    warn!(
                        organization_id = %state.organization_id,
                        events = events.len(),
                        full,
                        receivers,
                        "subscriber channel full, deferring batch to next tick"
                    );
                }
            }
        }
        Ok(report)
    }
}

/// Offer `events` to every subscriber of `org` without waiting.
///
/// Subscribers whose receiver was dropped are pruned and don't count
/// against delivery.
pub(crate) fn deliver(org: &Organization, events: &[Event]) -> DeliveryOutcome {
    let subscribers = org.subscribers();
    let mut full = 0;
    let mut closed = 0;
    for tx in &subscribers {
        let batch: EventBatch = events.to_vec();
        match tx.try_send(batch) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => full += 1,
            Err(TrySendError::Closed(_)) => closed += 1,
        }
    }

    if closed > 0 {
        let pruned = org.prune_closed();
        debug!(organization_id = %org.id(), pruned, "pruned closed subscribers");
    }

    let receivers = subscribers.len() - closed;
    if full > 0 {
        DeliveryOutcome::Backpressure { full, receivers }
    } else {
        DeliveryOutcome::Delivered { receivers }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use gwctl_core::EventHubConfig;
    use tokio::sync::mpsc;

    use super::*;
    use crate::backend::EventHub;
    use crate::db;

    fn quiet_config() -> EventHubConfig {
        EventHubConfig {
            poll_interval: Duration::from_secs(3600),
            cleanup_interval: Duration::from_secs(3600),
            retention_period: Duration::from_secs(7200),
        }
    }

    async fn hub_with(orgs: &[&str]) -> EventHub {
        let hub = EventHub::new(db::open_in_memory().unwrap(), quiet_config());
        hub.initialize(&CancellationToken::new()).await.unwrap();
        for org in orgs {
            hub.register_organization(org).await.unwrap();
        }
        hub
    }

    async fn publish(hub: &EventHub, org: &str, entity_id: &str) -> String {
        hub.publish(org, "policy", "update", entity_id, None, Vec::new())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn single_publish_delivers_one_batch() {
        let hub = hub_with(&["acme"]).await;
        let mut rx = hub.subscribe_channel("acme", 10).unwrap();

        let version = publish(&hub, "acme", "api-1").await;
        let report = hub.inner.poll_once().await.unwrap();

        let batch = rx.try_recv().expect("one batch");
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].entity_id, "api-1");
        assert_eq!(batch[0].event_type, "policy");
        assert_eq!(batch[0].action, "update");
        assert!(rx.try_recv().is_err(), "exactly one batch");

        assert_eq!(hub.poll_cursor("acme").unwrap().known_version, version);
        assert_eq!(report.delivered, 1);
        assert_eq!(report.events_delivered, 1);
        hub.close().await.unwrap();
    }

    #[tokio::test]
    async fn publishes_between_ticks_arrive_as_one_ordered_batch() {
        let hub = hub_with(&["acme"]).await;
        let mut rx = hub.subscribe_channel("acme", 10).unwrap();

        publish(&hub, "acme", "api-1").await;
        publish(&hub, "acme", "api-2").await;
        hub.inner.poll_once().await.unwrap();

        let batch = rx.try_recv().unwrap();
        let ids: Vec<&str> = batch.iter().map(|e| e.entity_id.as_str()).collect();
        assert_eq!(ids, vec!["api-1", "api-2"]);
        assert!(rx.try_recv().is_err());
        hub.close().await.unwrap();
    }

    #[tokio::test]
    async fn unchanged_version_is_skipped() {
        let hub = hub_with(&["acme"]).await;
        let mut rx = hub.subscribe_channel("acme", 10).unwrap();
        publish(&hub, "acme", "api-1").await;

        hub.inner.poll_once().await.unwrap();
        rx.try_recv().unwrap();

        let report = hub.inner.poll_once().await.unwrap();
        assert_eq!(report.checked, 1);
        assert_eq!(report.changed, 0);
        assert!(rx.try_recv().is_err(), "no redelivery without a new publish");
        hub.close().await.unwrap();
    }

    #[tokio::test]
    async fn full_channel_defers_then_redelivers_same_batch() {
        let hub = hub_with(&["acme"]).await;
        let (tx, mut rx) = mpsc::channel(1);
        hub.subscribe("acme", tx.clone()).unwrap();
        tx.try_send(Vec::new()).unwrap(); // occupy the only slot

        let version = publish(&hub, "acme", "api-1").await;
        let report = hub.inner.poll_once().await.unwrap();
        assert_eq!(report.deferred, 1);
        assert_ne!(hub.poll_cursor("acme").unwrap().known_version, version);

        assert!(rx.try_recv().unwrap().is_empty()); // drain the filler
        publish(&hub, "acme", "api-2").await;
        hub.inner.poll_once().await.unwrap();

        let batch = rx.try_recv().unwrap();
        let ids: Vec<&str> = batch.iter().map(|e| e.entity_id.as_str()).collect();
        assert_eq!(ids, vec!["api-1", "api-2"], "deferred events are not lost");
        hub.close().await.unwrap();
    }

    #[tokio::test]
    async fn backpressure_on_one_subscriber_blocks_cursor_for_all() {
        let hub = hub_with(&["acme"]).await;
        let mut roomy = hub.subscribe_channel("acme", 10).unwrap();
        let (tight, mut tight_rx) = mpsc::channel(1);
        hub.subscribe("acme", tight.clone()).unwrap();
        tight.try_send(Vec::new()).unwrap();

        publish(&hub, "acme", "api-1").await;
        hub.inner.poll_once().await.unwrap();
        assert_eq!(roomy.try_recv().unwrap().len(), 1);

        tight_rx.try_recv().unwrap();
        hub.inner.poll_once().await.unwrap();

        // The roomy subscriber sees the batch again: at-least-once.
        assert_eq!(roomy.try_recv().unwrap()[0].entity_id, "api-1");
        assert_eq!(tight_rx.try_recv().unwrap()[0].entity_id, "api-1");
        hub.close().await.unwrap();
    }

    #[tokio::test]
    async fn no_subscribers_advances_cursor() {
        let hub = hub_with(&["acme"]).await;
        let version = publish(&hub, "acme", "api-1").await;
        hub.inner.poll_once().await.unwrap();
        assert_eq!(hub.poll_cursor("acme").unwrap().known_version, version);

        // A late subscriber does not receive history.
        let mut rx = hub.subscribe_channel("acme", 10).unwrap();
        hub.inner.poll_once().await.unwrap();
        assert!(rx.try_recv().is_err());
        hub.close().await.unwrap();
    }

    #[tokio::test]
    async fn dropped_receiver_is_pruned_not_blocking() {
        let hub = hub_with(&["acme"]).await;
        let dead = hub.subscribe_channel("acme", 1).unwrap();
        drop(dead);
        let mut live = hub.subscribe_channel("acme", 10).unwrap();

        let version = publish(&hub, "acme", "api-1").await;
        let report = hub.inner.poll_once().await.unwrap();

        assert_eq!(report.delivered, 1);
        assert_eq!(live.try_recv().unwrap().len(), 1);
        assert_eq!(hub.poll_cursor("acme").unwrap().known_version, version);
        assert_eq!(hub.inner.registry.get("acme").unwrap().subscriber_count(), 1);
        hub.close().await.unwrap();
    }

    #[tokio::test]
    async fn unsubscribed_channel_receives_nothing() {
        let hub = hub_with(&["acme"]).await;
        let (tx, mut rx) = mpsc::channel(10);
        hub.subscribe("acme", tx.clone()).unwrap();
        hub.unsubscribe("acme", &tx).unwrap();

        publish(&hub, "acme", "api-1").await;
        hub.inner.poll_once().await.unwrap();
        assert!(rx.try_recv().is_err());
        hub.close().await.unwrap();
    }

    #[tokio::test]
    async fn events_before_registration_are_not_replayed() {
        let conn = db::open_in_memory().unwrap();
        crate::store::Store::new(conn.clone())
            .publish_event_atomic("acme", &gwctl_core::types::NewEvent::new("api", "create", "old"))
            .unwrap();

        let hub = EventHub::new(conn, quiet_config());
        hub.initialize(&CancellationToken::new()).await.unwrap();
        hub.register_organization("acme").await.unwrap();
        let mut rx = hub.subscribe_channel("acme", 10).unwrap();

        hub.inner.poll_once().await.unwrap();
        assert!(rx.try_recv().is_err(), "history must not be replayed");

        publish(&hub, "acme", "new").await;
        hub.inner.poll_once().await.unwrap();
        let batch = rx.try_recv().unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].entity_id, "new");
        hub.close().await.unwrap();
    }

    #[tokio::test]
    async fn unregistered_state_rows_are_ignored() {
        let conn = db::open_in_memory().unwrap();
        crate::store::Store::new(conn.clone())
            .initialize_state("stranger")
            .unwrap();
        let hub = EventHub::new(conn, quiet_config());
        hub.initialize(&CancellationToken::new()).await.unwrap();
        hub.register_organization("acme").await.unwrap();

        let report = hub.inner.poll_once().await.unwrap();
        assert_eq!(report.checked, 1);
        hub.close().await.unwrap();
    }

    #[tokio::test]
    async fn organizations_are_isolated() {
        let hub = hub_with(&["acme", "globex"]).await;
        let mut acme = hub.subscribe_channel("acme", 10).unwrap();
        let mut globex = hub.subscribe_channel("globex", 10).unwrap();

        publish(&hub, "acme", "api-1").await;
        hub.inner.poll_once().await.unwrap();

        assert_eq!(acme.try_recv().unwrap()[0].organization_id, "acme");
        assert!(globex.try_recv().is_err());
        hub.close().await.unwrap();
    }

    #[test]
    fn deliver_reports_full_channels() {
        let registry = crate::registry::OrganizationRegistry::new();
        let org = registry.register("acme").unwrap();
        let (tx, _rx) = mpsc::channel(1);
        tx.try_send(Vec::new()).unwrap();
        registry.add_subscriber("acme", tx).unwrap();

        assert_eq!(
            deliver(&org, &[]),
            DeliveryOutcome::Backpressure {
                full: 1,
                receivers: 1
            }
        );
    }
}
