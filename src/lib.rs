//! # Site Tracker
//!
//! Continuous GPS tracking with geofence arrival/departure detection for field crews.
//!
//! This library provides:
//! - Time- and distance-gated sampling of a noisy position stream
//! - Containment testing against a tenant's circular geofences
//! - Edge-triggered arrival/departure events (one per transition, never per sample)
//! - A session controller that survives visibility changes and logouts
//!
//! ## Features
//!
//! - **`http`** - Enable HTTP adapters for the geofence registry and event sinks
//! - **`parallel`** - Enable parallel batch replay with rayon
//! - **`ffi`** - Enable FFI bindings for mobile platforms (iOS/Android)
//! - **`full`** - Enable all features
//!
//! ## Quick Start
//!
//! ```rust
//! use site_tracker::{Geofence, PositionSample, TransitionDetector, VisitKind, geofences_containing};
//!
//! let office = Geofence::new("g1", "project-7", 32.7767, -96.7970, 100.0);
//! let mut detector = TransitionDetector::new();
//!
//! let at_site = PositionSample::new(32.7767, -96.7970, 8.0, 0);
//! let events = detector.evaluate(geofences_containing(&at_site, [&office]), &at_site);
//! assert_eq!(events.len(), 1);
//! assert_eq!(events[0].kind, VisitKind::Arrival);
//!
//! // Still inside: no second arrival
//! let events = detector.evaluate(geofences_containing(&at_site, [&office]), &at_site);
//! assert!(events.is_empty());
//! ```

use serde::{Deserialize, Serialize};

pub mod error;
pub use error::{Result, TrackingError};

pub mod geo_utils;

pub mod sampler;
pub use sampler::{GateDecision, SampleGate};

pub mod geofence;
pub use geofence::{Geofence, GeofenceFetcher, GeofenceRegistry, StaticGeofences};

pub mod containment;
pub use containment::{geofences_containing, nearest_geofence, ContainmentState, NearestGeofence};

pub mod transitions;
pub use transitions::{detect_transitions, SiteVisitEvent, TransitionDetector, VisitKind};

pub mod source;
pub use source::{FixError, FixResult, FixSender, HostPositionSource, PositionSource, SubscriptionId, TaggedFix, WatchOptions};

pub mod sinks;
pub use sinks::{Dispatcher, LoggingSink, SiteVisitRecord, SiteVisitSink, TelemetryRecord, TelemetrySink};

pub mod session;
pub use session::{Collaborators, FixOutcome, SessionController, SessionPhase, Visibility};

pub mod tracker;
pub use tracker::{spawn_tracker, TrackerHandle, TrackerState};

pub mod analytics;
pub use analytics::{dwell_by_owner, replay_track, replay_tracks, summarize_visits, ActorTrack, ActorVisits, OwnerDwell, SiteVisit};

#[cfg(feature = "parallel")]
pub use analytics::replay_tracks_parallel;

// HTTP adapters for the registry fetch and the event sinks
#[cfg(feature = "http")]
pub mod http;

#[cfg(feature = "http")]
pub use http::{ApiClient, ApiConfig, Credential};

#[cfg(test)]
pub(crate) mod testing;

#[cfg(feature = "ffi")]
uniffi::setup_scaffolding!();

/// Initialize logging for Android (only used in FFI)
#[cfg(all(feature = "ffi", target_os = "android"))]
fn init_logging() {
    use android_logger::Config;
    use log::LevelFilter;

    android_logger::init_once(
        Config::default()
            .with_max_level(LevelFilter::Debug)
            .with_tag("SiteTrackerRust")
    );
}

#[cfg(all(feature = "ffi", not(target_os = "android")))]
fn init_logging() {
    // No-op on non-Android platforms
}

// ============================================================================
// Core Types
// ============================================================================

/// Unix epoch milliseconds.
pub type Timestamp = i64;

/// A single position fix as reported by the platform location service.
///
/// Every raw tick produces one of these; only the ones that pass the
/// [`SampleGate`] become accepted samples.
///
/// # Example
/// ```
/// use site_tracker::PositionSample;
/// let fix = PositionSample::new(32.7767, -96.7970, 12.0, 1_700_000_000_000);
/// assert!(fix.is_valid());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
#[serde(rename_all = "camelCase")]
pub struct PositionSample {
    pub latitude: f64,
    pub longitude: f64,
    /// Sensor-reported accuracy radius in meters
    pub accuracy: f64,
    pub captured_at: Timestamp,
}

impl PositionSample {
    /// Create a new position sample.
    pub fn new(latitude: f64, longitude: f64, accuracy: f64, captured_at: Timestamp) -> Self {
        Self { latitude, longitude, accuracy, captured_at }
    }

    /// Check if the fix has usable coordinates and accuracy.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && self.latitude >= -90.0
            && self.latitude <= 90.0
            && self.longitude >= -180.0
            && self.longitude <= 180.0
            && self.accuracy.is_finite()
            && self.accuracy >= 0.0
    }

    /// Great-circle distance to another sample in meters.
    #[inline]
    pub fn distance_to(&self, other: &PositionSample) -> f64 {
        geo_utils::haversine_distance(self, other)
    }
}

impl From<&PositionSample> for geo::Point<f64> {
    fn from(sample: &PositionSample) -> Self {
        geo::Point::new(sample.longitude, sample.latitude)
    }
}

/// Bounding box in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
#[serde(rename_all = "camelCase")]
pub struct Bounds {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lng: f64,
    pub max_lng: f64,
}

impl Bounds {
    /// Smallest box covering both `self` and `other`.
    pub fn union(&self, other: &Bounds) -> Bounds {
        Bounds {
            min_lat: self.min_lat.min(other.min_lat),
            max_lat: self.max_lat.max(other.max_lat),
            min_lng: self.min_lng.min(other.min_lng),
            max_lng: self.max_lng.max(other.max_lng),
        }
    }

    /// Get the center point of the bounds as `(latitude, longitude)`.
    pub fn center(&self) -> (f64, f64) {
        (
            (self.min_lat + self.max_lat) / 2.0,
            (self.min_lng + self.max_lng) / 2.0,
        )
    }

    /// Check whether a coordinate falls inside the box (edges included).
    pub fn contains(&self, latitude: f64, longitude: f64) -> bool {
        latitude >= self.min_lat
            && latitude <= self.max_lat
            && longitude >= self.min_lng
            && longitude <= self.max_lng
    }
}

/// The authenticated user a tracking session belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
}

impl Actor {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// Source of "now" for fix-age checks.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> Timestamp;
}

/// Wall clock backed by the system time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> Timestamp {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Configuration for sampling, the position subscription and sink payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
#[serde(default)]
pub struct TrackerConfig {
    /// Minimum time between accepted samples.
    /// Default: 60_000 ms
    pub min_update_interval_ms: u64,

    /// Minimum movement between accepted samples.
    /// Default: 50.0 meters
    pub min_distance_meters: f64,

    /// Ask the platform for its most accurate positioning mode.
    /// Default: true
    pub high_accuracy: bool,

    /// Per-fix timeout handed to the position source.
    /// Default: 30_000 ms
    pub fix_timeout_ms: u64,

    /// Fixes older than this are rejected as a capability error.
    /// Default: 60_000 ms
    pub max_fix_age_ms: u64,

    /// Device label sent with every telemetry record.
    /// Default: "mobile"
    pub device_class: String,

    /// Optional accuracy cutoff for accepting a fix. `None` accepts any accuracy,
    /// including a poor first fix.
    /// Default: None
    pub max_accuracy_meters: Option<f64>,

    /// Start tracking automatically when an actor signs in.
    /// Default: true
    pub auto_start: bool,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            min_update_interval_ms: 60_000,
            min_distance_meters: 50.0,
            high_accuracy: true,
            fix_timeout_ms: 30_000,
            max_fix_age_ms: 60_000,
            device_class: "mobile".to_string(),
            max_accuracy_meters: None,
            auto_start: true,
        }
    }
}

impl TrackerConfig {
    /// Reject settings the gate or the sinks cannot work with.
    pub fn validate(&self) -> Result<()> {
        if !self.min_distance_meters.is_finite() || self.min_distance_meters < 0.0 {
            return Err(TrackingError::InvalidConfig(format!(
                "min_distance_meters must be a non-negative number, got {}",
                self.min_distance_meters
            )));
        }
        if let Some(max) = self.max_accuracy_meters {
            if !max.is_finite() || max <= 0.0 {
                return Err(TrackingError::InvalidConfig(format!(
                    "max_accuracy_meters must be positive, got {}",
                    max
                )));
            }
        }
        if self.device_class.trim().is_empty() {
            return Err(TrackingError::InvalidConfig("device_class is empty".into()));
        }
        Ok(())
    }
}

// ============================================================================
// FFI Exports (only when feature enabled)
// ============================================================================

#[cfg(feature = "ffi")]
mod ffi {
    use super::*;
    use log::info;

    /// Great-circle distance in meters between two coordinates.
    #[uniffi::export]
    pub fn ffi_distance_meters(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
        geo_utils::distance_meters(lat1, lon1, lat2, lon2)
    }

    /// Ids of the active geofences containing the given fix.
    #[uniffi::export]
    pub fn containing_geofence_ids(sample: PositionSample, geofences: Vec<Geofence>) -> Vec<String> {
        init_logging();
        geofences_containing(&sample, &geofences)
            .ids()
            .map(str::to_string)
            .collect()
    }

    /// Replay a recorded track through the gate and transition pipeline.
    #[uniffi::export]
    pub fn replay_site_visits(
        track: Vec<PositionSample>,
        geofences: Vec<Geofence>,
        config: TrackerConfig,
    ) -> Vec<SiteVisitEvent> {
        init_logging();
        info!("[SiteTrackerRust] replay_site_visits: {} fixes against {} geofences", track.len(), geofences.len());
        let start = std::time::Instant::now();
        let events = replay_track(&track, &geofences, &config);
        info!("[SiteTrackerRust] {} site-visit events in {:?}", events.len(), start.elapsed());
        events
    }

    /// Get default configuration.
    #[uniffi::export]
    pub fn default_tracker_config() -> TrackerConfig {
        init_logging();
        TrackerConfig::default()
    }
}

// ============================================================================
// Tests
// ============================================================================
