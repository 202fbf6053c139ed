//! Fakes shared by the unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::{self, BoxFuture, FutureExt};
use tokio::runtime::Handle;
use tokio::sync::mpsc;

use crate::{
    Clock, Collaborators, Dispatcher, Geofence, GeofenceFetcher, HostPositionSource, Result,
    SiteVisitRecord, SiteVisitSink, TaggedFix, TelemetryRecord, TelemetrySink, Timestamp,
    TrackingError,
};

/// Records every push; optionally answers each one with an error.
#[derive(Default)]
pub struct RecordingSink {
    positions: Mutex<Vec<TelemetryRecord>>,
    visits: Mutex<Vec<SiteVisitRecord>>,
    failure: Option<TrackingError>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(error: TrackingError) -> Self {
        Self { failure: Some(error), ..Self::default() }
    }

    pub fn positions(&self) -> Vec<TelemetryRecord> {
        self.positions.lock().unwrap().clone()
    }

    pub fn visits(&self) -> Vec<SiteVisitRecord> {
        self.visits.lock().unwrap().clone()
    }

    fn outcome(&self) -> BoxFuture<'static, Result<()>> {
        let outcome = match &self.failure {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        };
        future::ready(outcome).boxed()
    }
}

impl TelemetrySink for RecordingSink {
    fn push_position(&self, record: TelemetryRecord) -> BoxFuture<'static, Result<()>> {
        self.positions.lock().unwrap().push(record);
        self.outcome()
    }
}

impl SiteVisitSink for RecordingSink {
    fn push_visit(&self, record: SiteVisitRecord) -> BoxFuture<'static, Result<()>> {
        self.visits.lock().unwrap().push(record);
        self.outcome()
    }
}

/// Sink whose pushes never complete, like a backend that stopped answering.
#[derive(Default)]
pub struct HangingSink;

impl TelemetrySink for HangingSink {
    fn push_position(&self, _record: TelemetryRecord) -> BoxFuture<'static, Result<()>> {
        future::pending().boxed()
    }
}

impl SiteVisitSink for HangingSink {
    fn push_visit(&self, _record: SiteVisitRecord) -> BoxFuture<'static, Result<()>> {
        future::pending().boxed()
    }
}

/// Answers fetches from a script; once exhausted every fetch fails.
pub struct ScriptedFetcher {
    script: Mutex<VecDeque<Result<Vec<Geofence>>>>,
}

impl ScriptedFetcher {
    pub fn new(script: Vec<Result<Vec<Geofence>>>) -> Self {
        Self { script: Mutex::new(script.into()) }
    }
}

impl GeofenceFetcher for ScriptedFetcher {
    fn fetch(&self) -> BoxFuture<'static, Result<Vec<Geofence>>> {
        let next = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(TrackingError::RegistryFetch("script exhausted".into())));
        future::ready(next).boxed()
    }
}

/// Clock the test moves by hand.
#[derive(Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn at(now: Timestamp) -> Self {
        Self { now: AtomicI64::new(now) }
    }

    pub fn set(&self, now: Timestamp) {
        self.now.store(now, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> Timestamp {
        self.now.load(Ordering::SeqCst)
    }
}

/// Everything a session needs, with handles kept for assertions.
pub struct Harness {
    pub source: Arc<HostPositionSource>,
    pub sink: Arc<RecordingSink>,
    pub clock: Arc<ManualClock>,
    pub fixes: mpsc::UnboundedReceiver<TaggedFix>,
    pub fix_tx: mpsc::UnboundedSender<TaggedFix>,
}

impl Harness {
    pub fn new() -> Self {
        let (fix_tx, fixes) = mpsc::unbounded_channel();
        Self {
            source: Arc::new(HostPositionSource::new()),
            sink: Arc::new(RecordingSink::new()),
            clock: Arc::new(ManualClock::at(0)),
            fixes,
            fix_tx,
        }
    }

    pub fn collaborators(&self, fetcher: Arc<dyn GeofenceFetcher>) -> Collaborators {
        Collaborators {
            source: self.source.clone(),
            fetcher,
            telemetry: self.sink.clone(),
            site_visits: self.sink.clone(),
            clock: self.clock.clone(),
            runtime: Handle::current(),
        }
    }
}

/// Yield until every spawned push has run.
pub async fn settle(dispatcher: &Dispatcher) {
    for _ in 0..100 {
        if dispatcher.in_flight() == 0 {
            break;
        }
        tokio::task::yield_now().await;
    }
}
