//! # Geographic Utilities
//!
//! Core geographic computation shared by the sampler, the containment test and
//! the live map helpers.
//!
//! ## Overview
//!
//! | Function | Description |
//! |----------|-------------|
//! | [`distance_meters`] | Great-circle distance between two coordinates |
//! | [`haversine_distance`] | Same, for two [`PositionSample`]s |
//! | [`destination`] | Great-circle destination from a bearing and distance |
//! | [`circle_bounds`] | Bounding box of a circular region |
//! | [`geofence_bounds`] | Viewport covering a set of geofences |
//!
//! ## Example
//!
//! ```rust
//! use site_tracker::geo_utils;
//!
//! // ~55m east at 32°N
//! let d = geo_utils::distance_meters(32.0, -96.0, 32.0, -96.0006);
//! assert!(d > 50.0 && d < 60.0);
//! ```
//!
//! ## Algorithm Notes
//!
//! ### Haversine Formula
//!
//! The distance gate and the containment test must agree on geometry, so both
//! go through [`distance_meters`] with a single Earth radius constant
//! ([`EARTH_RADIUS_METERS`]).
//!
//! Reference: [Haversine formula (Wikipedia)](https://en.wikipedia.org/wiki/Haversine_formula)
//!
//! ### Coordinate System
//!
//! All functions expect WGS84 coordinates (latitude/longitude in degrees).

use geo::Point;
use crate::{Bounds, Geofence, PositionSample};

/// Mean Earth radius used for every distance in this crate.
pub const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

// =============================================================================
// Distance Functions
// =============================================================================

/// Calculate the great-circle distance between two coordinates using the Haversine formula.
///
/// Total: never fails. Any NaN input produces a NaN result.
///
/// # Example
///
/// ```rust
/// use site_tracker::geo_utils::distance_meters;
///
/// let london_paris = distance_meters(51.5074, -0.1278, 48.8566, 2.3522);
/// assert!((london_paris - 343_500.0).abs() < 1_000.0);
/// assert!(distance_meters(f64::NAN, 0.0, 0.0, 0.0).is_nan());
/// ```
#[inline]
pub fn distance_meters(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lon2 - lon1).to_radians();

    let a = (d_phi / 2.0).sin().powi(2)
        + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    // max() keeps rounding noise above 1.0 from producing NaN; a NaN `a`
    // still propagates through atan2's first argument
    let c = 2.0 * a.sqrt().atan2((1.0 - a).max(0.0).sqrt());

    EARTH_RADIUS_METERS * c
}

/// Calculate the great-circle distance between two position samples in meters.
#[inline]
pub fn haversine_distance(p1: &PositionSample, p2: &PositionSample) -> f64 {
    distance_meters(p1.latitude, p1.longitude, p2.latitude, p2.longitude)
}

// =============================================================================
// Bounding Box Functions
// =============================================================================

/// Point reached by travelling `distance_meters` from `origin` along the great
/// circle with the given initial bearing (degrees clockwise from north).
///
/// Uses [`EARTH_RADIUS_METERS`], so `distance_meters` from the origin to the
/// result equals the requested distance.
pub fn destination(origin: Point<f64>, bearing_degrees: f64, distance_meters: f64) -> Point<f64> {
    let delta = distance_meters / EARTH_RADIUS_METERS;
    let theta = bearing_degrees.to_radians();
    let phi1 = origin.y().to_radians();
    let lambda1 = origin.x().to_radians();

    let phi2 = (phi1.sin() * delta.cos() + phi1.cos() * delta.sin() * theta.cos()).asin();
    let lambda2 = lambda1
        + (theta.sin() * delta.sin() * phi1.cos()).atan2(delta.cos() - phi1.sin() * phi2.sin());

    Point::new(lambda2.to_degrees(), phi2.to_degrees())
}

/// Bounding box of a circle of `radius_meters` around a center point.
///
/// Display-only: the box is built from the four cardinal destinations, which is
/// plenty for fitting a map viewport.
pub fn circle_bounds(latitude: f64, longitude: f64, radius_meters: f64) -> Bounds {
    let center = Point::new(longitude, latitude);
    let north = destination(center, 0.0, radius_meters);
    let east = destination(center, 90.0, radius_meters);
    let south = destination(center, 180.0, radius_meters);
    let west = destination(center, 270.0, radius_meters);

    Bounds {
        min_lat: south.y(),
        max_lat: north.y(),
        min_lng: west.x(),
        max_lng: east.x(),
    }
}

/// Compute a viewport covering every active geofence.
///
/// Returns `None` when there is nothing active to show.
///
/// # Example
///
/// ```rust
/// use site_tracker::{Geofence, geo_utils};
///
/// let fences = vec![
///     Geofence::new("a", "p1", 32.77, -96.80, 100.0),
///     Geofence::new("b", "p2", 32.80, -96.75, 100.0),
/// ];
/// let bounds = geo_utils::geofence_bounds(&fences).unwrap();
/// assert!(bounds.min_lat < 32.77 && bounds.max_lat > 32.80);
/// ```
pub fn geofence_bounds<'a>(geofences: impl IntoIterator<Item = &'a Geofence>) -> Option<Bounds> {
    geofences
        .into_iter()
        .filter(|g| g.active)
        .map(Geofence::bounds)
        .reduce(|acc, b| acc.union(&b))
}

// =============================================================================
// Unit Tests
// =============================================================================
