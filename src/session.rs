//! The tracking session controller.
//!
//! ```text
//! Stopped --start--> Starting --registry loaded--> Active <--visibility--> Paused
//!    ^                                               |                       |
//!    +------------------ stop / sign-out ------------+-----------------------+
//! ```
//!
//! The controller is plain synchronous state behind `&mut self`. Everything
//! that touches it (fixes, visibility, sign-in changes, commands) is
//! serialized by its owner, normally the task spawned by
//! [`spawn_tracker`](crate::spawn_tracker), so no locking happens here.

use std::sync::Arc;

use log::{debug, info, warn};
use tokio::runtime::Handle;
use tokio::sync::mpsc;

use crate::{
    geofences_containing, Actor, Bounds, Clock, ContainmentState, Dispatcher, FixError, FixSender,
    GateDecision, Geofence, GeofenceFetcher, GeofenceRegistry, PositionSample, PositionSource,
    Result, SampleGate, SiteVisitEvent, SiteVisitRecord, SiteVisitSink, SubscriptionId, TaggedFix,
    TelemetryRecord, TelemetrySink, TrackerConfig, TrackingError, TransitionDetector, VisitKind,
    WatchOptions,
};

/// External collaborators of a session.
#[derive(Clone)]
pub struct Collaborators {
    pub source: Arc<dyn PositionSource>,
    pub fetcher: Arc<dyn GeofenceFetcher>,
    pub telemetry: Arc<dyn TelemetrySink>,
    pub site_visits: Arc<dyn SiteVisitSink>,
    pub clock: Arc<dyn Clock>,
    /// Runtime the fire-and-forget pushes are spawned on
    pub runtime: Handle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Stopped,
    Starting,
    Active,
    Paused,
}

/// Host page (or app) visibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Visibility {
    #[default]
    Visible,
    Hidden,
}

/// What happened to a delivered fix.
#[derive(Debug, Clone, PartialEq)]
pub enum FixOutcome {
    /// Not active, or the fix belongs to an old subscription
    Ignored,
    /// The platform reported an error instead of a fix, or the fix was stale
    Failed(TrackingError),
    Rejected(GateDecision),
    Accepted {
        sample: PositionSample,
        events: Vec<SiteVisitEvent>,
    },
}

pub struct SessionController {
    config: TrackerConfig,
    source: Arc<dyn PositionSource>,
    registry: GeofenceRegistry,
    dispatcher: Dispatcher,
    clock: Arc<dyn Clock>,
    fix_tx: mpsc::UnboundedSender<TaggedFix>,

    phase: SessionPhase,
    visibility: Visibility,
    actor: Option<Actor>,
    /// Last identity reported by the auth provider, kept across stops
    signed_in: Option<Actor>,
    gate: SampleGate,
    transitions: TransitionDetector,
    current_site_owner_id: Option<String>,
    subscription: Option<SubscriptionId>,
    generation: u64,
    last_error: Option<TrackingError>,
}

impl SessionController {
    /// Create a stopped controller. Fixes from the position source arrive on
    /// the receiving end of `fix_tx` and must be fed back through [`Self::on_fix`].
    pub fn new(
        config: TrackerConfig,
        collaborators: Collaborators,
        fix_tx: mpsc::UnboundedSender<TaggedFix>,
    ) -> Self {
        let Collaborators { source, fetcher, telemetry, site_visits, clock, runtime } = collaborators;
        Self {
            gate: SampleGate::from_config(&config),
            config,
            source,
            registry: GeofenceRegistry::new(fetcher),
            dispatcher: Dispatcher::new(runtime, telemetry, site_visits),
            clock,
            fix_tx,
            phase: SessionPhase::Stopped,
            visibility: Visibility::Visible,
            actor: None,
            signed_in: None,
            transitions: TransitionDetector::new(),
            current_site_owner_id: None,
            subscription: None,
            generation: 0,
            last_error: None,
        }
    }

    // ------------------------------------------------------------------------
    // Exposed state
    // ------------------------------------------------------------------------

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// True while a session exists, including while paused.
    pub fn is_tracking(&self) -> bool {
        matches!(self.phase, SessionPhase::Active | SessionPhase::Paused)
    }

    pub fn actor(&self) -> Option<&Actor> {
        self.actor.as_ref()
    }

    pub fn last_position(&self) -> Option<PositionSample> {
        self.gate.last_accepted().copied()
    }

    pub fn geofences(&self) -> Arc<[Geofence]> {
        self.registry.current()
    }

    pub fn geofence_bounds(&self) -> Option<Bounds> {
        self.registry.bounds()
    }

    pub fn current_site_owner_id(&self) -> Option<&str> {
        self.current_site_owner_id.as_deref()
    }

    pub fn containment(&self) -> &ContainmentState {
        self.transitions.current()
    }

    pub fn last_error(&self) -> Option<&TrackingError> {
        self.last_error.as_ref()
    }

    pub fn visibility(&self) -> Visibility {
        self.visibility
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Start tracking for `actor`.
    ///
    /// Fails without leaving `Stopped` when nobody is signed in or the platform
    /// cannot produce positions. A failed geofence load does not stop the
    /// start: the session runs with the last good snapshot, or none.
    pub async fn start(&mut self, actor: Option<Actor>) -> Result<()> {
        let Some(actor) = actor else {
            return self.fail_start(TrackingError::NotAuthenticated);
        };

        match self.phase {
            SessionPhase::Stopped => {}
            _ if self.actor.as_ref() == Some(&actor) => {
                debug!("[Session] Already tracking {}", actor.id);
                return Ok(());
            }
            _ => {
                info!("[Session] Switching tracked actor to {}", actor.id);
                self.stop();
            }
        }

        if let Err(e) = self.source.capability() {
            return self.fail_start(e);
        }

        info!("[Session] Starting tracking for {}", actor.id);
        self.phase = SessionPhase::Starting;
        self.actor = Some(actor);
        self.last_error = None;

        if let Err(e) = self.registry.load().await {
            debug!("[Session] Continuing without a fresh geofence snapshot: {}", e);
        }

        self.activate()
    }

    /// Stop tracking and forget the session entirely.
    ///
    /// After this returns no fix from the old subscription is processed, and
    /// results of sink pushes still in flight are discarded.
    pub fn stop(&mut self) {
        if self.phase == SessionPhase::Stopped {
            return;
        }
        info!(
            "[Session] Stopping tracking for {}",
            self.actor.as_ref().map_or("<none>", |a| a.id.as_str())
        );
        self.reset_session();
    }

    /// React to the host becoming hidden or visible again.
    pub fn set_visibility(&mut self, visibility: Visibility) {
        self.visibility = visibility;

        match (self.phase, visibility) {
            (SessionPhase::Active, Visibility::Hidden) => {
                info!("[Session] Host hidden, pausing position updates");
                self.unsubscribe();
                self.phase = SessionPhase::Paused;
            }
            (SessionPhase::Paused, Visibility::Visible) if self.actor.is_some() => {
                info!("[Session] Host visible, resuming position updates");
                match self.subscribe() {
                    Ok(()) => self.phase = SessionPhase::Active,
                    Err(e) if e.is_capability_error() => {
                        warn!("[Session] Cannot resume tracking: {}", e);
                        self.reset_session();
                        self.last_error = Some(e);
                    }
                    Err(e) => {
                        warn!("[Session] Resubscribe failed, staying paused: {}", e);
                        self.last_error = Some(e);
                    }
                }
            }
            _ => {}
        }
    }

    /// React to sign-in state changes from the auth provider.
    ///
    /// Signing out stops the session and drops the geofence snapshot; signing
    /// in as someone new starts a fresh session when `auto_start` is set.
    pub async fn on_actor_change(&mut self, actor: Option<Actor>) {
        // Providers may re-send an unchanged identity (token refresh); that
        // must not undo an explicit stop
        if self.signed_in == actor {
            debug!("[Session] Sign-in state unchanged, ignoring");
            return;
        }
        self.signed_in = actor.clone();

        match actor {
            None => {
                if self.phase != SessionPhase::Stopped {
                    info!("[Session] Actor signed out");
                    self.stop();
                }
                self.registry.clear();
            }
            Some(actor) => {
                if self.actor.as_ref() == Some(&actor) {
                    return;
                }
                self.stop();
                // A different actor may belong to a different tenant
                self.registry.clear();
                if self.config.auto_start {
                    if let Err(e) = self.start(Some(actor)).await {
                        debug!("[Session] Auto-start failed: {}", e);
                    }
                }
            }
        }
    }

    /// Refresh the geofence snapshot. The previous snapshot survives a failure.
    pub async fn reload_geofences(&mut self) -> Result<usize> {
        self.registry.load().await.map(|snapshot| snapshot.len())
    }

    // ------------------------------------------------------------------------
    // Fix handling
    // ------------------------------------------------------------------------

    /// Process one delivery from the position source.
    pub fn on_fix(&mut self, tagged: TaggedFix) -> FixOutcome {
        if self.phase != SessionPhase::Active
            || self.subscription.is_none()
            || tagged.generation != self.generation
        {
            debug!(
                "[Session] Ignoring fix from generation {} (current {}, {:?})",
                tagged.generation, self.generation, self.phase
            );
            return FixOutcome::Ignored;
        }

        let sample = match tagged.fix {
            Ok(sample) => sample,
            Err(FixError::Timeout) => {
                let e = TrackingError::SampleTimeout(self.config.fix_timeout_ms);
                warn!("[Session] {}", e);
                return FixOutcome::Failed(e);
            }
            Err(FixError::PositionUnavailable(reason)) => {
                let e = TrackingError::CapabilityUnavailable(reason);
                warn!("[Session] {}", e);
                return FixOutcome::Failed(e);
            }
            Err(FixError::PermissionDenied) => {
                warn!("[Session] Location permission revoked, stopping");
                self.reset_session();
                self.last_error = Some(TrackingError::PermissionDenied);
                return FixOutcome::Failed(TrackingError::PermissionDenied);
            }
        };

        let max_age_ms = i64::try_from(self.config.max_fix_age_ms).unwrap_or(i64::MAX);
        let age_ms = self.clock.now_millis().saturating_sub(sample.captured_at);
        if age_ms > max_age_ms {
            let e = TrackingError::StaleFix { age_ms, max_age_ms: self.config.max_fix_age_ms };
            warn!("[Session] {}", e);
            self.last_error = Some(e.clone());
            return FixOutcome::Failed(e);
        }

        let decision = self.gate.offer(&sample);
        if !decision.is_accepted() {
            return FixOutcome::Rejected(decision);
        }

        if matches!(self.last_error, Some(TrackingError::StaleFix { .. })) {
            self.last_error = None;
        }
        let events = self.process_accepted(&sample);
        FixOutcome::Accepted { sample, events }
    }

    fn process_accepted(&mut self, sample: &PositionSample) -> Vec<SiteVisitEvent> {
        debug!(
            "[Session] Accepted fix ({:.6}, {:.6}) ±{:.0}m",
            sample.latitude, sample.longitude, sample.accuracy
        );
        self.dispatcher
            .push_position(TelemetryRecord::from_sample(sample, &self.config.device_class));

        let geofences = self.registry.current();
        let containment = geofences_containing(sample, geofences.iter());
        let events = self.transitions.evaluate(containment, sample);

        for event in &events {
            info!(
                "[Session] {} geofence {} (owner {})",
                event.kind, event.geofence_id, event.owner_id
            );
            self.dispatcher.push_visit(SiteVisitRecord::from(event));
        }
        self.update_current_site(&events);

        events
    }

    /// The current site is the owner of the most recently entered geofence. It
    /// is cleared on departure only once no contained geofence has that owner.
    fn update_current_site(&mut self, events: &[SiteVisitEvent]) {
        for event in events {
            match event.kind {
                VisitKind::Arrival => {
                    self.current_site_owner_id = Some(event.owner_id.clone());
                }
                VisitKind::Departure => {
                    let left_current = self.current_site_owner_id.as_deref() == Some(event.owner_id.as_str());
                    if left_current && !self.transitions.current().has_owner(&event.owner_id) {
                        self.current_site_owner_id = None;
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    fn activate(&mut self) -> Result<()> {
        if self.visibility == Visibility::Hidden {
            info!("[Session] Host hidden at start, waiting to subscribe");
            self.phase = SessionPhase::Paused;
            return Ok(());
        }

        match self.subscribe() {
            Ok(()) => {
                self.phase = SessionPhase::Active;
                Ok(())
            }
            Err(e) => {
                warn!("[Session] Subscribe failed: {}", e);
                self.reset_session();
                self.last_error = Some(e.clone());
                Err(e)
            }
        }
    }

    fn fail_start(&mut self, e: TrackingError) -> Result<()> {
        warn!("[Session] Tracking not started: {}", e);
        self.last_error = Some(e.clone());
        Err(e)
    }

    /// Replace any existing subscription with a fresh one.
    fn subscribe(&mut self) -> Result<()> {
        self.unsubscribe();
        self.generation += 1;
        let sender = FixSender::new(self.generation, self.fix_tx.clone());
        let id = self.source.subscribe(&WatchOptions::from(&self.config), sender)?;
        debug!("[Session] Subscribed {:?} (generation {})", id, self.generation);
        self.subscription = Some(id);
        Ok(())
    }

    fn unsubscribe(&mut self) {
        if let Some(id) = self.subscription.take() {
            self.source.unsubscribe(id);
            debug!("[Session] Unsubscribed {:?}", id);
        }
    }

    fn reset_session(&mut self) {
        self.unsubscribe();
        self.dispatcher.retire_epoch();
        self.gate.reset();
        self.transitions.reset();
        self.current_site_owner_id = None;
        self.actor = None;
        self.phase = SessionPhase::Stopped;
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{settle, Harness, ScriptedFetcher};
    use crate::{StaticGeofences, Timestamp};

    const SEC: Timestamp = 1_000;

    fn g1() -> Geofence {
        Geofence::new("G1", "site-1", 32.7767, -96.7970, 100.0)
    }

    fn controller(h: &Harness, geofences: Vec<Geofence>) -> SessionController {
        let fetcher = Arc::new(StaticGeofences::new(geofences));
        SessionController::new(TrackerConfig::default(), h.collaborators(fetcher), h.fix_tx.clone())
    }

    fn worker() -> Option<Actor> {
        Some(Actor::new("worker-1"))
    }

    /// Push a fix through the host source and hand whatever arrives to the session.
    fn deliver(h: &mut Harness, ctl: &mut SessionController, lat: f64, lon: f64, t: Timestamp) -> FixOutcome {
        h.clock.set(t);
        assert!(h.source.push(Ok(PositionSample::new(lat, lon, 5.0, t))));
        ctl.on_fix(h.fixes.try_recv().unwrap())
    }

    fn events_of(outcome: &FixOutcome) -> Vec<(String, VisitKind)> {
        match outcome {
            FixOutcome::Accepted { events, .. } => {
                events.iter().map(|e| (e.geofence_id.clone(), e.kind)).collect()
            }
            other => panic!("expected an accepted fix, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_start_requires_actor() {
        let h = Harness::new();
        let mut ctl = controller(&h, vec![]);
        assert_eq!(ctl.start(None).await, Err(TrackingError::NotAuthenticated));
        assert_eq!(ctl.phase(), SessionPhase::Stopped);
        assert!(!h.source.is_subscribed());
    }

    #[tokio::test]
    async fn test_start_without_capability_stays_stopped() {
        let h = Harness::new();
        h.source.set_capability(Err(TrackingError::CapabilityUnavailable("no GPS".into())));
        let mut ctl = controller(&h, vec![g1()]);

        let err = ctl.start(worker()).await.unwrap_err();
        assert_eq!(err, TrackingError::CapabilityUnavailable("no GPS".into()));
        assert_eq!(ctl.phase(), SessionPhase::Stopped);
        assert_eq!(ctl.last_error(), Some(&err));
        assert!(ctl.geofences().is_empty());
        assert_eq!(h.source.subscribe_count(), 0);
    }

    #[tokio::test]
    async fn test_start_permission_denied() {
        let h = Harness::new();
        h.source.set_capability(Err(TrackingError::PermissionDenied));
        let mut ctl = controller(&h, vec![]);
        assert_eq!(ctl.start(worker()).await, Err(TrackingError::PermissionDenied));
        assert!(!ctl.is_tracking());
    }

    #[tokio::test]
    async fn test_start_loads_geofences_and_subscribes() {
        let h = Harness::new();
        let mut ctl = controller(&h, vec![g1()]);
        ctl.start(worker()).await.unwrap();

        assert_eq!(ctl.phase(), SessionPhase::Active);
        assert!(ctl.is_tracking());
        assert_eq!(ctl.geofences().len(), 1);
        assert!(ctl.geofence_bounds().is_some());
        assert_eq!(ctl.actor(), Some(&Actor::new("worker-1")));
        assert!(h.source.is_subscribed());
        assert_eq!(h.source.watch_options(), Some(WatchOptions::from(&TrackerConfig::default())));

        // Starting again for the same actor is a no-op
        ctl.start(worker()).await.unwrap();
        assert_eq!(h.source.subscribe_count(), 1);
    }

    #[tokio::test]
    async fn test_registry_failure_does_not_block_start() {
        let mut h = Harness::new();
        let fetcher = Arc::new(ScriptedFetcher::new(vec![Err(TrackingError::RegistryFetch("HTTP 502".into()))]));
        let mut ctl = SessionController::new(TrackerConfig::default(), h.collaborators(fetcher), h.fix_tx.clone());

        ctl.start(worker()).await.unwrap();
        assert_eq!(ctl.phase(), SessionPhase::Active);

        let outcome = deliver(&mut h, &mut ctl, 32.7767, -96.7970, 0);
        assert!(events_of(&outcome).is_empty());
        assert!(ctl.containment().is_empty());
    }

    #[tokio::test]
    async fn test_end_to_end_arrival_departure() {
        let mut h = Harness::new();
        let mut ctl = controller(&h, vec![g1()]);
        ctl.start(worker()).await.unwrap();

        // A: at the center
        let a = deliver(&mut h, &mut ctl, 32.7767, -96.7970, 0);
        assert_eq!(events_of(&a), vec![("G1".to_string(), VisitKind::Arrival)]);
        assert_eq!(ctl.current_site_owner_id(), Some("site-1"));

        // B: ~145m north, 70s later
        let b = deliver(&mut h, &mut ctl, 32.7780, -96.7970, 70 * SEC);
        assert_eq!(events_of(&b), vec![("G1".to_string(), VisitKind::Departure)]);
        assert!(ctl.containment().is_empty());
        assert_eq!(ctl.current_site_owner_id(), None);

        // C: same spot as B at 140s
        let c = deliver(&mut h, &mut ctl, 32.7780, -96.7970, 140 * SEC);
        assert_eq!(c, FixOutcome::Rejected(GateDecision::TooClose));
        assert_eq!(ctl.last_position().unwrap().captured_at, 70 * SEC);

        settle(ctl.dispatcher()).await;
        assert_eq!(h.sink.positions().len(), 2);
        let visits = h.sink.visits();
        assert_eq!(visits.len(), 2);
        assert_eq!(visits[0].kind, VisitKind::Arrival);
        assert_eq!(visits[0].owner_entity_id, "site-1");
        assert_eq!(visits[1].kind, VisitKind::Departure);
        assert_eq!(visits[1].latitude, 32.7780);
    }

    #[tokio::test]
    async fn test_rejected_fix_has_no_side_effects() {
        let mut h = Harness::new();
        let mut ctl = controller(&h, vec![g1()]);
        ctl.start(worker()).await.unwrap();

        deliver(&mut h, &mut ctl, 32.7767, -96.7970, 0);
        let outcome = deliver(&mut h, &mut ctl, 32.7800, -96.7970, 10 * SEC);
        assert_eq!(outcome, FixOutcome::Rejected(GateDecision::TooSoon));

        settle(ctl.dispatcher()).await;
        assert_eq!(h.sink.positions().len(), 1);
        assert!(ctl.containment().contains("G1"));
    }

    #[tokio::test]
    async fn test_restart_re_emits_arrival() {
        let mut h = Harness::new();
        let mut ctl = controller(&h, vec![g1()]);

        ctl.start(worker()).await.unwrap();
        let first = deliver(&mut h, &mut ctl, 32.7767, -96.7970, 0);
        assert_eq!(events_of(&first), vec![("G1".to_string(), VisitKind::Arrival)]);

        ctl.stop();
        assert_eq!(ctl.phase(), SessionPhase::Stopped);
        assert!(ctl.last_position().is_none());
        assert!(ctl.containment().is_empty());
        assert!(ctl.current_site_owner_id().is_none());
        assert!(!h.source.is_subscribed());

        ctl.start(worker()).await.unwrap();
        // Same place, only a second later: a fresh session accepts it and re-arrives
        let again = deliver(&mut h, &mut ctl, 32.7767, -96.7970, SEC);
        assert_eq!(events_of(&again), vec![("G1".to_string(), VisitKind::Arrival)]);
    }

    #[tokio::test]
    async fn test_fix_after_stop_is_ignored() {
        let mut h = Harness::new();
        let mut ctl = controller(&h, vec![g1()]);
        ctl.start(worker()).await.unwrap();

        // Queued before stop, handled after
        assert!(h.source.push(Ok(PositionSample::new(32.7767, -96.7970, 5.0, 0))));
        ctl.stop();
        let late = h.fixes.try_recv().unwrap();
        assert_eq!(ctl.on_fix(late), FixOutcome::Ignored);
        assert!(!h.source.push(Ok(PositionSample::new(32.7767, -96.7970, 5.0, 0))));
        assert_eq!(ctl.dispatcher().epoch(), 1);
    }

    #[tokio::test]
    async fn test_pause_and_resume_keep_session_state() {
        let mut h = Harness::new();
        let mut ctl = controller(&h, vec![g1()]);
        ctl.start(worker()).await.unwrap();
        deliver(&mut h, &mut ctl, 32.7767, -96.7970, 0);

        assert!(h.source.push(Ok(PositionSample::new(32.7790, -96.7970, 5.0, 90 * SEC))));
        ctl.set_visibility(Visibility::Hidden);
        assert_eq!(ctl.phase(), SessionPhase::Paused);
        assert!(ctl.is_tracking());
        assert!(!h.source.is_subscribed());
        // Queued from the old subscription
        assert_eq!(ctl.on_fix(h.fixes.try_recv().unwrap()), FixOutcome::Ignored);

        // State survives the pause
        assert!(ctl.containment().contains("G1"));
        assert!(ctl.last_position().is_some());

        ctl.set_visibility(Visibility::Visible);
        assert_eq!(ctl.phase(), SessionPhase::Active);
        assert_eq!(h.source.subscribe_count(), 2);

        // Still inside: no second arrival
        let inside = deliver(&mut h, &mut ctl, 32.7767, -96.7976, 120 * SEC);
        assert!(events_of(&inside).is_empty());
    }

    #[tokio::test]
    async fn test_start_while_hidden_waits_for_visibility() {
        let h = Harness::new();
        let mut ctl = controller(&h, vec![g1()]);
        ctl.set_visibility(Visibility::Hidden);
        ctl.start(worker()).await.unwrap();
        assert_eq!(ctl.phase(), SessionPhase::Paused);
        assert!(!h.source.is_subscribed());

        ctl.set_visibility(Visibility::Visible);
        assert_eq!(ctl.phase(), SessionPhase::Active);
        assert!(h.source.is_subscribed());
    }

    #[tokio::test]
    async fn test_resume_without_permission_stops() {
        let h = Harness::new();
        let mut ctl = controller(&h, vec![g1()]);
        ctl.start(worker()).await.unwrap();
        ctl.set_visibility(Visibility::Hidden);

        h.source.set_capability(Err(TrackingError::PermissionDenied));
        ctl.set_visibility(Visibility::Visible);
        assert_eq!(ctl.phase(), SessionPhase::Stopped);
        assert_eq!(ctl.last_error(), Some(&TrackingError::PermissionDenied));
    }

    #[tokio::test]
    async fn test_timeout_and_unavailable_keep_session_active() {
        let mut h = Harness::new();
        let mut ctl = controller(&h, vec![g1()]);
        ctl.start(worker()).await.unwrap();

        assert!(h.source.push(Err(FixError::Timeout)));
        assert_eq!(
            ctl.on_fix(h.fixes.try_recv().unwrap()),
            FixOutcome::Failed(TrackingError::SampleTimeout(30_000))
        );
        assert!(h.source.push(Err(FixError::PositionUnavailable("no satellites".into()))));
        assert!(matches!(
            ctl.on_fix(h.fixes.try_recv().unwrap()),
            FixOutcome::Failed(TrackingError::CapabilityUnavailable(_))
        ));
        assert_eq!(ctl.phase(), SessionPhase::Active);

        let next = deliver(&mut h, &mut ctl, 32.7767, -96.7970, 0);
        assert_eq!(events_of(&next).len(), 1);
    }

    #[tokio::test]
    async fn test_permission_revoked_mid_session_stops() {
        let mut h = Harness::new();
        let mut ctl = controller(&h, vec![g1()]);
        ctl.start(worker()).await.unwrap();
        deliver(&mut h, &mut ctl, 32.7767, -96.7970, 0);

        assert!(h.source.push(Err(FixError::PermissionDenied)));
        assert_eq!(
            ctl.on_fix(h.fixes.try_recv().unwrap()),
            FixOutcome::Failed(TrackingError::PermissionDenied)
        );
        assert_eq!(ctl.phase(), SessionPhase::Stopped);
        assert!(ctl.containment().is_empty());
        assert!(!h.source.is_subscribed());
    }

    #[tokio::test]
    async fn test_stale_fix_rejected() {
        let mut h = Harness::new();
        let mut ctl = controller(&h, vec![g1()]);
        ctl.start(worker()).await.unwrap();

        h.clock.set(200 * SEC);
        assert!(h.source.push(Ok(PositionSample::new(32.7767, -96.7970, 5.0, 100 * SEC))));
        let outcome = ctl.on_fix(h.fixes.try_recv().unwrap());
        assert_eq!(
            outcome,
            FixOutcome::Failed(TrackingError::StaleFix { age_ms: 100 * SEC, max_age_ms: 60_000 })
        );
        assert!(ctl.last_position().is_none());
        assert!(ctl.last_error().is_some());

        // A fresh fix is accepted and clears the error
        deliver(&mut h, &mut ctl, 32.7767, -96.7970, 201 * SEC);
        assert!(ctl.last_error().is_none());
    }

    #[tokio::test]
    async fn test_sign_out_and_sign_in() {
        let h = Harness::new();
        let mut ctl = controller(&h, vec![g1()]);

        ctl.on_actor_change(worker()).await;
        assert_eq!(ctl.phase(), SessionPhase::Active);

        ctl.on_actor_change(None).await;
        assert_eq!(ctl.phase(), SessionPhase::Stopped);
        assert!(ctl.geofences().is_empty());
        assert!(!h.source.is_subscribed());

        ctl.on_actor_change(Some(Actor::new("worker-2"))).await;
        assert_eq!(ctl.actor(), Some(&Actor::new("worker-2")));
        assert_eq!(ctl.geofences().len(), 1);
    }

    #[tokio::test]
    async fn test_sign_in_without_auto_start() {
        let h = Harness::new();
        let config = TrackerConfig { auto_start: false, ..Default::default() };
        let fetcher = Arc::new(StaticGeofences::new(vec![g1()]));
        let mut ctl = SessionController::new(config, h.collaborators(fetcher), h.fix_tx.clone());

        ctl.on_actor_change(worker()).await;
        assert_eq!(ctl.phase(), SessionPhase::Stopped);
    }

    #[tokio::test]
    async fn test_current_site_survives_partial_departure() {
        let mut h = Harness::new();
        let fences = vec![
            Geofence::new("a", "site-1", 32.0, -96.0, 200.0),
            Geofence::new("b", "site-1", 32.002, -96.0, 200.0),
        ];
        let mut ctl = controller(&h, fences);
        ctl.start(worker()).await.unwrap();

        let both = deliver(&mut h, &mut ctl, 32.001, -96.0, 0);
        assert_eq!(events_of(&both).len(), 2);
        assert_eq!(ctl.current_site_owner_id(), Some("site-1"));

        let only_a = deliver(&mut h, &mut ctl, 31.9995, -96.0, 60 * SEC);
        assert_eq!(events_of(&only_a), vec![("b".to_string(), VisitKind::Departure)]);
        assert_eq!(ctl.current_site_owner_id(), Some("site-1"));

        let gone = deliver(&mut h, &mut ctl, 31.99, -96.0, 120 * SEC);
        assert_eq!(events_of(&gone), vec![("a".to_string(), VisitKind::Departure)]);
        assert_eq!(ctl.current_site_owner_id(), None);
    }

    #[tokio::test]
    async fn test_current_site_follows_latest_arrival() {
        let mut h = Harness::new();
        let fences = vec![
            Geofence::new("a", "site-1", 32.0, -96.0, 100.0),
            Geofence::new("c", "site-2", 32.0, -96.0015, 100.0),
        ];
        let mut ctl = controller(&h, fences);
        ctl.start(worker()).await.unwrap();

        deliver(&mut h, &mut ctl, 32.0, -96.0, 0);
        assert_eq!(ctl.current_site_owner_id(), Some("site-1"));

        let overlap = deliver(&mut h, &mut ctl, 32.0, -96.00075, 60 * SEC);
        assert_eq!(events_of(&overlap), vec![("c".to_string(), VisitKind::Arrival)]);
        assert_eq!(ctl.current_site_owner_id(), Some("site-2"));

        let leave_a = deliver(&mut h, &mut ctl, 32.0, -96.0015, 120 * SEC);
        assert_eq!(events_of(&leave_a), vec![("a".to_string(), VisitKind::Departure)]);
        assert_eq!(ctl.current_site_owner_id(), Some("site-2"));
    }

    #[tokio::test]
    async fn test_reload_removes_geofence_on_next_sample() {
        let mut h = Harness::new();
        let fetcher = Arc::new(ScriptedFetcher::new(vec![Ok(vec![g1()]), Ok(vec![])]));
        let mut ctl = SessionController::new(TrackerConfig::default(), h.collaborators(fetcher), h.fix_tx.clone());
        ctl.start(worker()).await.unwrap();
        deliver(&mut h, &mut ctl, 32.7767, -96.7970, 0);

        assert_eq!(ctl.reload_geofences().await, Ok(0));
        let next = deliver(&mut h, &mut ctl, 32.7767, -96.7962, 60 * SEC);
        assert_eq!(events_of(&next), vec![("G1".to_string(), VisitKind::Departure)]);
        assert_eq!(ctl.current_site_owner_id(), None);
    }

    #[tokio::test]
    async fn test_sink_failure_does_not_reject_samples() {
        let mut h = Harness::new();
        h.sink = Arc::new(crate::testing::RecordingSink::failing(TrackingError::SinkPush {
            sink: "telemetry",
            reason: "connection reset".into(),
        }));
        let mut ctl = controller(&h, vec![g1()]);
        ctl.start(worker()).await.unwrap();

        let a = deliver(&mut h, &mut ctl, 32.7767, -96.7970, 0);
        assert_eq!(events_of(&a).len(), 1);
        let b = deliver(&mut h, &mut ctl, 32.7780, -96.7970, 70 * SEC);
        assert_eq!(events_of(&b).len(), 1);

        settle(ctl.dispatcher()).await;
        assert_eq!(h.sink.positions().len(), 2);
        assert_eq!(h.sink.visits().len(), 2);
    }

    #[tokio::test]
    async fn test_hung_sink_does_not_delay_next_sample() {
        let mut h = Harness::new();
        let hanging = Arc::new(crate::testing::HangingSink);
        let collaborators = Collaborators {
            telemetry: hanging.clone(),
            site_visits: hanging,
            ..h.collaborators(Arc::new(StaticGeofences::new(vec![g1()])))
        };
        let mut ctl = SessionController::new(TrackerConfig::default(), collaborators, h.fix_tx.clone());
        ctl.start(worker()).await.unwrap();

        let a = deliver(&mut h, &mut ctl, 32.7767, -96.7970, 0);
        assert_eq!(events_of(&a), vec![("G1".to_string(), VisitKind::Arrival)]);
        let b = deliver(&mut h, &mut ctl, 32.7780, -96.7970, 70 * SEC);
        assert_eq!(events_of(&b), vec![("G1".to_string(), VisitKind::Departure)]);

        // Two telemetry pushes and two visit pushes, none finished
        tokio::task::yield_now().await;
        assert_eq!(ctl.dispatcher().in_flight(), 4);
    }

    #[tokio::test]
    async fn test_unchanged_sign_in_does_not_undo_stop() {
        let h = Harness::new();
        let mut ctl = controller(&h, vec![g1()]);

        ctl.on_actor_change(worker()).await;
        assert_eq!(ctl.phase(), SessionPhase::Active);

        ctl.stop();
        ctl.on_actor_change(worker()).await;
        assert_eq!(ctl.phase(), SessionPhase::Stopped);
        assert!(!h.source.is_subscribed());
        assert_eq!(ctl.geofences().len(), 1);

        // A real sign-out and sign-in starts again
        ctl.on_actor_change(None).await;
        ctl.on_actor_change(worker()).await;
        assert_eq!(ctl.phase(), SessionPhase::Active);
    }

    #[tokio::test]
    async fn test_drop_unsubscribes() {
        let h = Harness::new();
        let mut ctl = controller(&h, vec![]);
        ctl.start(worker()).await.unwrap();
        assert!(h.source.is_subscribed());
        drop(ctl);
        assert!(!h.source.is_subscribed());
    }
}
