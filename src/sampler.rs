//! Time- and distance-gated sampling of raw position fixes.
//!
//! The platform reports a fix every second or so while the device moves. Most
//! of those are noise around the same spot, and every accepted sample costs a
//! telemetry request plus a containment pass. The gate accepts a fix only when
//! enough time has passed *and* the device has moved far enough since the last
//! accepted one.

use log::debug;
use crate::{PositionSample, Timestamp, TrackerConfig};

/// Why a fix was (or was not) accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Accepted,
    /// Coordinates or accuracy outside their valid range
    InvalidFix,
    /// Accuracy worse than the configured cutoff
    TooInaccurate,
    /// Less than the minimum interval since the last accepted sample
    TooSoon,
    /// Less than the minimum distance from the last accepted sample
    TooClose,
}

impl GateDecision {
    pub fn is_accepted(self) -> bool {
        self == GateDecision::Accepted
    }
}

/// Gating state for one tracking session.
///
/// Rejected fixes leave the state untouched; an accepted fix becomes the new
/// reference for both gates in the same call.
#[derive(Debug, Clone)]
pub struct SampleGate {
    min_update_interval_ms: i64,
    min_distance_meters: f64,
    max_accuracy_meters: Option<f64>,
    last_accepted: Option<PositionSample>,
}

impl SampleGate {
    pub fn new(min_update_interval_ms: u64, min_distance_meters: f64) -> Self {
        Self {
            min_update_interval_ms: i64::try_from(min_update_interval_ms).unwrap_or(i64::MAX),
            min_distance_meters,
            max_accuracy_meters: None,
            last_accepted: None,
        }
    }

    pub fn from_config(config: &TrackerConfig) -> Self {
        let mut gate = Self::new(config.min_update_interval_ms, config.min_distance_meters);
        gate.max_accuracy_meters = config.max_accuracy_meters;
        gate
    }

    /// Offer a raw fix to the gate.
    ///
    /// The first valid fix is always accepted. After that both the time gate and
    /// the distance gate have to pass.
    ///
    /// # Example
    /// ```
    /// use site_tracker::{PositionSample, SampleGate, GateDecision};
    ///
    /// let mut gate = SampleGate::new(60_000, 50.0);
    /// assert_eq!(gate.offer(&PositionSample::new(32.0, -96.0, 5.0, 0)), GateDecision::Accepted);
    /// assert_eq!(gate.offer(&PositionSample::new(32.0, -96.0, 5.0, 10_000)), GateDecision::TooSoon);
    /// ```
    pub fn offer(&mut self, fix: &PositionSample) -> GateDecision {
        let decision = self.evaluate(fix);
        if decision.is_accepted() {
            self.last_accepted = Some(*fix);
        } else {
            debug!(
                "[SampleGate] Rejected fix ({:.6}, {:.6}) at {}: {:?}",
                fix.latitude, fix.longitude, fix.captured_at, decision
            );
        }
        decision
    }

    fn evaluate(&self, fix: &PositionSample) -> GateDecision {
        if !fix.is_valid() {
            return GateDecision::InvalidFix;
        }

        if let Some(max_accuracy) = self.max_accuracy_meters {
            if fix.accuracy > max_accuracy {
                return GateDecision::TooInaccurate;
            }
        }

        let Some(prev) = self.last_accepted else {
            return GateDecision::Accepted;
        };

        if fix.captured_at.saturating_sub(prev.captured_at) < self.min_update_interval_ms {
            return GateDecision::TooSoon;
        }

        if prev.distance_to(fix) < self.min_distance_meters {
            return GateDecision::TooClose;
        }

        GateDecision::Accepted
    }

    /// The most recent accepted sample, if any.
    pub fn last_accepted(&self) -> Option<&PositionSample> {
        self.last_accepted.as_ref()
    }

    /// Capture time of the most recent accepted sample, 0 before the first one.
    pub fn last_accepted_at(&self) -> Timestamp {
        self.last_accepted.map_or(0, |s| s.captured_at)
    }

    /// Forget gating history so the next valid fix is accepted unconditionally.
    pub fn reset(&mut self) {
        self.last_accepted = None;
    }
}
