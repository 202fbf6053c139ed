//! Telemetry and site-visit sinks, plus the fire-and-forget dispatcher.
//!
//! The sampling path never waits on the network. Each push becomes its own
//! tokio task; a slow or failed push for one sample has no effect on the next.
//! Outcomes are logged, never retried, and discarded entirely once the session
//! that produced them has ended.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::{self, BoxFuture, FutureExt};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;

use crate::{PositionSample, Result, SiteVisitEvent, Timestamp, VisitKind};

/// Body of a telemetry push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryRecord {
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy: f64,
    pub device_class: String,
    pub observed_at: DateTime<Utc>,
}

impl TelemetryRecord {
    pub fn from_sample(sample: &PositionSample, device_class: &str) -> Self {
        Self {
            latitude: sample.latitude,
            longitude: sample.longitude,
            accuracy: sample.accuracy,
            device_class: device_class.to_string(),
            observed_at: to_datetime(sample.captured_at),
        }
    }
}

/// Body of a site-visit push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteVisitRecord {
    pub owner_entity_id: String,
    pub geofence_id: String,
    pub kind: VisitKind,
    pub occurred_at: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy: f64,
}

impl From<&SiteVisitEvent> for SiteVisitRecord {
    fn from(event: &SiteVisitEvent) -> Self {
        Self {
            owner_entity_id: event.owner_id.clone(),
            geofence_id: event.geofence_id.clone(),
            kind: event.kind,
            occurred_at: to_datetime(event.occurred_at),
            latitude: event.sample.latitude,
            longitude: event.sample.longitude,
            accuracy: event.sample.accuracy,
        }
    }
}

fn to_datetime(millis: Timestamp) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

/// Receives every accepted sample.
///
/// The returned future must not do any work until polled; the dispatcher
/// creates it on the sampling path and polls it on a separate task.
pub trait TelemetrySink: Send + Sync {
    fn push_position(&self, record: TelemetryRecord) -> BoxFuture<'static, Result<()>>;
}

/// Receives every arrival and departure.
pub trait SiteVisitSink: Send + Sync {
    fn push_visit(&self, record: SiteVisitRecord) -> BoxFuture<'static, Result<()>>;
}

/// Sink that only writes to the log, for hosts without a backend.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingSink;

impl TelemetrySink for LoggingSink {
    fn push_position(&self, record: TelemetryRecord) -> BoxFuture<'static, Result<()>> {
        debug!(
            "[LoggingSink] position ({:.6}, {:.6}) ±{:.0}m at {}",
            record.latitude, record.longitude, record.accuracy, record.observed_at
        );
        future::ready(Ok(())).boxed()
    }
}

impl SiteVisitSink for LoggingSink {
    fn push_visit(&self, record: SiteVisitRecord) -> BoxFuture<'static, Result<()>> {
        info!(
            "[LoggingSink] {} geofence {} (owner {}) at {}",
            record.kind, record.geofence_id, record.owner_entity_id, record.occurred_at
        );
        future::ready(Ok(())).boxed()
    }
}

/// Spawns sink pushes without awaiting them.
///
/// Every session gets an epoch. Ending the session retires its epoch; pushes
/// still in flight from a retired epoch finish, but their outcome is dropped.
pub struct Dispatcher {
    runtime: Handle,
    telemetry: Arc<dyn TelemetrySink>,
    site_visits: Arc<dyn SiteVisitSink>,
    epoch: Arc<AtomicU64>,
    in_flight: Arc<AtomicUsize>,
}

impl Dispatcher {
    pub fn new(
        runtime: Handle,
        telemetry: Arc<dyn TelemetrySink>,
        site_visits: Arc<dyn SiteVisitSink>,
    ) -> Self {
        Self {
            runtime,
            telemetry,
            site_visits,
            epoch: Arc::new(AtomicU64::new(0)),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn push_position(&self, record: TelemetryRecord) {
        let push = self.telemetry.push_position(record);
        self.spawn("telemetry", push);
    }

    pub fn push_visit(&self, record: SiteVisitRecord) {
        let push = self.site_visits.push_visit(record);
        self.spawn("site-visit", push);
    }

    /// End the current epoch; results of pushes started before now are discarded.
    pub fn retire_epoch(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Pushes spawned but not yet finished.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    fn spawn(&self, sink: &'static str, push: BoxFuture<'static, Result<()>>) {
        let started_in = self.epoch.load(Ordering::Acquire);
        let epoch = Arc::clone(&self.epoch);
        let in_flight = Arc::clone(&self.in_flight);
        in_flight.fetch_add(1, Ordering::AcqRel);

        self.runtime.spawn(async move {
            let outcome = push.await;
            in_flight.fetch_sub(1, Ordering::AcqRel);

            if epoch.load(Ordering::Acquire) != started_in {
                debug!("[Dispatcher] Discarding {} result from an ended session", sink);
                return;
            }
            match outcome {
                Ok(()) => debug!("[Dispatcher] {} push delivered", sink),
                Err(e) => warn!("[Dispatcher] {} push failed: {}", sink, e),
            }
        });
    }
}
