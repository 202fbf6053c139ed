//! Offline replay of recorded tracks and site-visit summaries.
//!
//! Replay runs a recorded track through the same gate, containment and
//! transition steps as a live session, so back-filled events match what the
//! device would have reported.

use std::collections::{BTreeMap, HashMap};

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::{
    geofences_containing, Geofence, PositionSample, SampleGate, SiteVisitEvent, Timestamp,
    TrackerConfig, TransitionDetector, VisitKind,
};

/// A recorded track for one actor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActorTrack {
    pub actor_id: String,
    pub samples: Vec<PositionSample>,
}

/// Replay output for one actor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActorVisits {
    pub actor_id: String,
    pub events: Vec<SiteVisitEvent>,
}

/// A stay inside one geofence, from arrival to departure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteVisit {
    pub geofence_id: String,
    pub owner_id: String,
    pub arrived_at: Timestamp,
    /// None while the actor is still inside
    pub departed_at: Option<Timestamp>,
    pub dwell_ms: i64,
}

impl SiteVisit {
    pub fn is_open(&self) -> bool {
        self.departed_at.is_none()
    }
}

/// Total time spent at one site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerDwell {
    pub owner_id: String,
    pub visit_count: u32,
    pub total_dwell_ms: i64,
}

/// Replay a recorded track as if it had been observed live.
///
/// Samples are offered in the order given; out-of-order samples fail the time
/// gate the same way they would on a device.
pub fn replay_track(
    track: &[PositionSample],
    geofences: &[Geofence],
    config: &TrackerConfig,
) -> Vec<SiteVisitEvent> {
    let mut gate = SampleGate::from_config(config);
    let mut detector = TransitionDetector::new();
    let mut events = Vec::new();
    let mut accepted = 0usize;

    for sample in track {
        if !gate.offer(sample).is_accepted() {
            continue;
        }
        accepted += 1;
        let containment = geofences_containing(sample, geofences);
        events.extend(detector.evaluate(containment, sample));
    }

    debug!(
        "[Analytics] Replayed {} fixes ({} accepted) into {} events",
        track.len(),
        accepted,
        events.len()
    );
    events
}

/// Replay many actors' tracks one after another.
pub fn replay_tracks(
    tracks: &[ActorTrack],
    geofences: &[Geofence],
    config: &TrackerConfig,
) -> Vec<ActorVisits> {
    info!("[Analytics] Replaying {} tracks sequentially", tracks.len());
    tracks
        .iter()
        .map(|track| replay_one(track, geofences, config))
        .collect()
}

/// Replay many actors' tracks using parallel processing.
///
/// Same output as [`replay_tracks`], in the same order. Each track is
/// independent, so they are spread across the rayon pool.
#[cfg(feature = "parallel")]
pub fn replay_tracks_parallel(
    tracks: &[ActorTrack],
    geofences: &[Geofence],
    config: &TrackerConfig,
) -> Vec<ActorVisits> {
    use rayon::prelude::*;

    info!("[Analytics] Replaying {} tracks in parallel (rayon)", tracks.len());
    tracks
        .par_iter()
        .map(|track| replay_one(track, geofences, config))
        .collect()
}

fn replay_one(track: &ActorTrack, geofences: &[Geofence], config: &TrackerConfig) -> ActorVisits {
    ActorVisits {
        actor_id: track.actor_id.clone(),
        events: replay_track(&track.samples, geofences, config),
    }
}

/// Pair arrivals with departures into visits.
///
/// A visit with no departure yet is closed at `until` for its dwell time but
/// keeps `departed_at` empty. Departures without a matching arrival are
/// skipped. Visits come back ordered by arrival time.
pub fn summarize_visits(events: &[SiteVisitEvent], until: Timestamp) -> Vec<SiteVisit> {
    let mut open: BTreeMap<&str, &SiteVisitEvent> = BTreeMap::new();
    let mut visits = Vec::new();

    for event in events {
        match event.kind {
            VisitKind::Arrival => {
                open.entry(event.geofence_id.as_str()).or_insert(event);
            }
            VisitKind::Departure => match open.remove(event.geofence_id.as_str()) {
                Some(arrival) => visits.push(SiteVisit {
                    geofence_id: arrival.geofence_id.clone(),
                    owner_id: arrival.owner_id.clone(),
                    arrived_at: arrival.occurred_at,
                    departed_at: Some(event.occurred_at),
                    dwell_ms: (event.occurred_at - arrival.occurred_at).max(0),
                }),
                None => debug!(
                    "[Analytics] Departure from {} without an arrival, skipping",
                    event.geofence_id
                ),
            },
        }
    }

    visits.extend(open.into_values().map(|arrival| SiteVisit {
        geofence_id: arrival.geofence_id.clone(),
        owner_id: arrival.owner_id.clone(),
        arrived_at: arrival.occurred_at,
        departed_at: None,
        dwell_ms: (until - arrival.occurred_at).max(0),
    }));

    visits.sort_by(|a, b| {
        a.arrived_at
            .cmp(&b.arrived_at)
            .then_with(|| a.geofence_id.cmp(&b.geofence_id))
    });
    visits
}

/// Total dwell per owner, longest first.
pub fn dwell_by_owner(visits: &[SiteVisit]) -> Vec<OwnerDwell> {
    let mut totals: HashMap<&str, (u32, i64)> = HashMap::new();
    for visit in visits {
        let entry = totals.entry(visit.owner_id.as_str()).or_insert((0, 0));
        entry.0 += 1;
        entry.1 += visit.dwell_ms;
    }

    let mut dwell: Vec<OwnerDwell> = totals
        .into_iter()
        .map(|(owner_id, (visit_count, total_dwell_ms))| OwnerDwell {
            owner_id: owner_id.to_string(),
            visit_count,
            total_dwell_ms,
        })
        .collect();
    dwell.sort_by(|a, b| {
        b.total_dwell_ms
            .cmp(&a.total_dwell_ms)
            .then_with(|| a.owner_id.cmp(&b.owner_id))
    });
    dwell
}
