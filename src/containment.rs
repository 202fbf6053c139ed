//! Which geofences contain a sample.
//!
//! Containment is multi-membership: overlapping geofences all count, there is
//! no "closest wins" assignment. The set is recomputed in full for every
//! accepted sample, so geofences added or removed by a reload are picked up
//! on the next evaluation without any patching.

use std::collections::BTreeMap;

use crate::{Geofence, PositionSample};

/// Geofence ids containing the latest accepted sample.
///
/// Each id remembers the owner of its geofence, so a departure can still be
/// attributed after the geofence disappeared from a reloaded snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainmentState {
    members: BTreeMap<String, String>,
}

impl ContainmentState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, geofence_id: impl Into<String>, owner_id: impl Into<String>) {
        self.members.insert(geofence_id.into(), owner_id.into());
    }

    pub fn contains(&self, geofence_id: &str) -> bool {
        self.members.contains_key(geofence_id)
    }

    /// Geofence ids in ascending order.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.members.keys().map(String::as_str)
    }

    /// `(geofence_id, owner_id)` pairs in ascending geofence id order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.members.iter().map(|(id, owner)| (id.as_str(), owner.as_str()))
    }

    pub fn owner_of(&self, geofence_id: &str) -> Option<&str> {
        self.members.get(geofence_id).map(String::as_str)
    }

    /// Whether any contained geofence belongs to `owner_id`.
    pub fn has_owner(&self, owner_id: &str) -> bool {
        self.members.values().any(|owner| owner == owner_id)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Compute the set of active geofences containing `sample`.
///
/// A sample exactly on the radius counts as inside. Linear in the number of
/// geofences; tenants have tens of them per day, not thousands.
///
/// # Example
/// ```
/// use site_tracker::{Geofence, PositionSample, geofences_containing};
///
/// let fences = vec![
///     Geofence::new("yard", "p1", 32.7767, -96.7970, 100.0),
///     Geofence::new("annex", "p1", 32.7770, -96.7970, 100.0),
///     Geofence::new("far", "p2", 33.0, -97.0, 100.0),
/// ];
/// let here = PositionSample::new(32.7768, -96.7970, 5.0, 0);
/// let inside = geofences_containing(&here, &fences);
/// assert_eq!(inside.ids().collect::<Vec<_>>(), vec!["annex", "yard"]);
/// ```
pub fn geofences_containing<'a>(
    sample: &PositionSample,
    geofences: impl IntoIterator<Item = &'a Geofence>,
) -> ContainmentState {
    let mut state = ContainmentState::new();
    for geofence in geofences {
        if geofence.active && geofence.contains(sample) {
            state.insert(geofence.id.clone(), geofence.owner_id.clone());
        }
    }
    state
}

/// Closest active geofence to a sample, for "next stop" displays.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
pub struct NearestGeofence {
    pub geofence_id: String,
    pub owner_id: String,
    pub distance_to_center: f64,
    /// Negative when the sample is inside the geofence
    pub distance_to_edge: f64,
}

/// Find the active geofence whose edge is closest to `sample`.
pub fn nearest_geofence<'a>(
    sample: &PositionSample,
    geofences: impl IntoIterator<Item = &'a Geofence>,
) -> Option<NearestGeofence> {
    geofences
        .into_iter()
        .filter(|g| g.active)
        .map(|g| {
            let distance_to_center = g.distance_from_center(sample);
            NearestGeofence {
                geofence_id: g.id.clone(),
                owner_id: g.owner_id.clone(),
                distance_to_center,
                distance_to_edge: distance_to_center - g.radius_meters,
            }
        })
        .filter(|n| n.distance_to_edge.is_finite())
        .min_by(|a, b| a.distance_to_edge.total_cmp(&b.distance_to_edge))
}
