//! Retention: periodically delete events older than the retention window.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::HubInner;
use crate::error::Result;

/// Outcome of one cleanup tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub cutoff: Option<DateTime<Utc>>,
    pub deleted: usize,
}

pub(crate) async fn run(inner: Arc<HubInner>, cancel: CancellationToken) {
    let period = inner.config.cleanup_interval;
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(interval_ms = period.as_millis() as u64, "eventhub cleanup loop started");

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                match inner.cleanup_once(Utc::now()).await {
                    Ok(report) if report.deleted > 0 => {
                        info!(deleted = report.deleted, cutoff = ?report.cutoff, "expired events removed");
                    }
                    Ok(_) => debug!("cleanup tick found nothing to remove"),
                    Err(e) => warn!(error = %e, "cleanup tick failed, retrying next tick"),
                }
            }
        }
    }
    info!("eventhub cleanup loop stopped");
}

/// `now - retention`, or `None` if that falls before the representable range.
pub(crate) fn retention_cutoff(now: DateTime<Utc>, retention: Duration) -> Option<DateTime<Utc>> {
    let retention = TimeDelta::from_std(retention).ok()?;
    now.checked_sub_signed(retention)
}

impl HubInner {
    pub(crate) async fn cleanup_once(self: &Arc<Self>, now: DateTime<Utc>) -> Result<CleanupReport> {
        let Some(cutoff) = retention_cutoff(now, self.config.retention_period) else {
            return Ok(CleanupReport {
                cutoff: None,
                deleted: 0,
            });
        };
        let deleted = self
            .run_store("cleanup expired events", move |store| {
                store.cleanup_older_than(cutoff)
            })
            .await?;
        Ok(CleanupReport {
            cutoff: Some(cutoff),
            deleted,
        })
    }
}
