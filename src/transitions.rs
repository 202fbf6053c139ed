//! Arrival/departure detection.
//!
//! Events are edge-triggered: they come from the difference between the
//! previous and the new containment set, never from the level of a single
//! sample. Staying inside a geofence across any number of samples produces
//! exactly one arrival.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{ContainmentState, PositionSample, Timestamp};

/// Direction of a containment transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "ffi", derive(uniffi::Enum))]
#[serde(rename_all = "lowercase")]
pub enum VisitKind {
    Arrival,
    Departure,
}

impl VisitKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            VisitKind::Arrival => "arrival",
            VisitKind::Departure => "departure",
        }
    }
}

impl fmt::Display for VisitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One arrival at or departure from a geofence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
#[serde(rename_all = "camelCase")]
pub struct SiteVisitEvent {
    pub geofence_id: String,
    pub owner_id: String,
    pub kind: VisitKind,
    pub occurred_at: Timestamp,
    /// The accepted sample that revealed the transition
    pub sample: PositionSample,
}

/// Diff two containment sets into events.
///
/// Departures (`previous \ next`) come first, then arrivals (`next \ previous`),
/// each in ascending geofence id order. Ids in both sets produce nothing.
pub fn detect_transitions(
    previous: &ContainmentState,
    next: &ContainmentState,
    sample: &PositionSample,
) -> Vec<SiteVisitEvent> {
    let event = |geofence_id: &str, owner_id: &str, kind: VisitKind| SiteVisitEvent {
        geofence_id: geofence_id.to_string(),
        owner_id: owner_id.to_string(),
        kind,
        occurred_at: sample.captured_at,
        sample: *sample,
    };

    let departures = previous
        .iter()
        .filter(|(id, _)| !next.contains(id))
        .map(|(id, owner)| event(id, owner, VisitKind::Departure));
    let arrivals = next
        .iter()
        .filter(|(id, _)| !previous.contains(id))
        .map(|(id, owner)| event(id, owner, VisitKind::Arrival));

    departures.chain(arrivals).collect()
}

/// Holds the previous containment set between evaluations.
#[derive(Debug, Clone, Default)]
pub struct TransitionDetector {
    previous: ContainmentState,
}

impl TransitionDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Emit the events for moving to `next`, then make `next` the previous set.
    ///
    /// The swap happens even when no events were produced.
    pub fn evaluate(&mut self, next: ContainmentState, sample: &PositionSample) -> Vec<SiteVisitEvent> {
        let events = detect_transitions(&self.previous, &next, sample);
        self.previous = next;
        events
    }

    /// The containment set from the last evaluation.
    pub fn current(&self) -> &ContainmentState {
        &self.previous
    }

    /// Forget history: the next evaluation treats every contained geofence as new.
    pub fn reset(&mut self) {
        self.previous = ContainmentState::new();
    }
}
