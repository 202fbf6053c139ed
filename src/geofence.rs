//! Geofences and the per-session registry snapshot.
//!
//! The registry holds an immutable snapshot of the tenant's geofences. A reload
//! swaps in a new `Arc<[Geofence]>` as a whole, so anything still holding the
//! previous snapshot keeps reading a consistent list.

use std::collections::HashSet;
use std::sync::Arc;

use futures::future::{self, BoxFuture, FutureExt};
use log::{info, warn};
use serde::{Deserialize, Deserializer, Serialize};

use crate::{geo_utils, Bounds, PositionSample, Result};

/// A circular region tied to a site (project, job, customer location).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
#[serde(rename_all = "camelCase")]
pub struct Geofence {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    /// The site this geofence belongs to
    #[serde(rename = "ownerEntityId", deserialize_with = "string_or_number")]
    pub owner_id: String,
    pub center_latitude: f64,
    pub center_longitude: f64,
    pub radius_meters: f64,
    /// Display label
    #[serde(default)]
    pub address: String,
    /// Inactive geofences are kept for display but never evaluated
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

/// Backends disagree on whether ids are numbers or strings; accept both.
fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Text(String),
        Number(i64),
    }

    Ok(match Id::deserialize(deserializer)? {
        Id::Text(s) => s,
        Id::Number(n) => n.to_string(),
    })
}

impl Geofence {
    /// Create an active geofence with an empty address.
    pub fn new(
        id: impl Into<String>,
        owner_id: impl Into<String>,
        center_latitude: f64,
        center_longitude: f64,
        radius_meters: f64,
    ) -> Self {
        Self {
            id: id.into(),
            owner_id: owner_id.into(),
            center_latitude,
            center_longitude,
            radius_meters,
            address: String::new(),
            active: true,
        }
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    pub fn deactivated(mut self) -> Self {
        self.active = false;
        self
    }

    /// Distance from the sample to the geofence center in meters.
    #[inline]
    pub fn distance_from_center(&self, sample: &PositionSample) -> f64 {
        geo_utils::distance_meters(
            sample.latitude,
            sample.longitude,
            self.center_latitude,
            self.center_longitude,
        )
    }

    /// Whether the sample lies inside the circle. The boundary counts as inside.
    ///
    /// Ignores `active`; callers decide whether inactive geofences matter.
    #[inline]
    pub fn contains(&self, sample: &PositionSample) -> bool {
        self.distance_from_center(sample) <= self.radius_meters
    }

    /// Bounding box of the circle, for fitting a map viewport.
    pub fn bounds(&self) -> Bounds {
        geo_utils::circle_bounds(self.center_latitude, self.center_longitude, self.radius_meters)
    }
}

/// Fetches the current tenant's geofences from wherever they live.
pub trait GeofenceFetcher: Send + Sync {
    fn fetch(&self) -> BoxFuture<'static, Result<Vec<Geofence>>>;
}

/// A fixed geofence list, for offline use and demos.
#[derive(Debug, Clone, Default)]
pub struct StaticGeofences {
    geofences: Vec<Geofence>,
}

impl StaticGeofences {
    pub fn new(geofences: Vec<Geofence>) -> Self {
        Self { geofences }
    }
}

impl GeofenceFetcher for StaticGeofences {
    fn fetch(&self) -> BoxFuture<'static, Result<Vec<Geofence>>> {
        future::ready(Ok(self.geofences.clone())).boxed()
    }
}

/// Cached geofence snapshot plus the fetcher used to refresh it.
pub struct GeofenceRegistry {
    fetcher: Arc<dyn GeofenceFetcher>,
    snapshot: Option<Arc<[Geofence]>>,
}

impl GeofenceRegistry {
    pub fn new(fetcher: Arc<dyn GeofenceFetcher>) -> Self {
        Self { fetcher, snapshot: None }
    }

    /// Fetch a fresh snapshot and swap it in.
    ///
    /// On failure the previous snapshot stays in place and the error is
    /// returned for logging; with no snapshot ever loaded the registry simply
    /// stays empty.
    pub async fn load(&mut self) -> Result<Arc<[Geofence]>> {
        match self.fetcher.fetch().await {
            Ok(geofences) => {
                let geofences = dedupe_by_id(geofences);
                let active = geofences.iter().filter(|g| g.active).count();
                let snapshot: Arc<[Geofence]> = Arc::from(geofences);
                info!(
                    "[GeofenceRegistry] Loaded {} geofences ({} active)",
                    snapshot.len(),
                    active
                );
                self.snapshot = Some(Arc::clone(&snapshot));
                Ok(snapshot)
            }
            Err(e) => {
                match &self.snapshot {
                    Some(previous) => warn!(
                        "[GeofenceRegistry] Reload failed, keeping previous {} geofences: {}",
                        previous.len(),
                        e
                    ),
                    None => warn!(
                        "[GeofenceRegistry] Load failed with no snapshot, geofence evaluation disabled: {}",
                        e
                    ),
                }
                Err(e)
            }
        }
    }

    /// The cached snapshot; empty before the first successful load.
    pub fn current(&self) -> Arc<[Geofence]> {
        match &self.snapshot {
            Some(snapshot) => Arc::clone(snapshot),
            None => Arc::from(Vec::<Geofence>::new()),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.snapshot.is_some()
    }

    /// Viewport covering all active geofences.
    pub fn bounds(&self) -> Option<Bounds> {
        self.snapshot
            .as_deref()
            .and_then(|snapshot| geo_utils::geofence_bounds(snapshot))
    }

    /// Drop the snapshot, e.g. when the signed-in tenant changes.
    pub fn clear(&mut self) {
        self.snapshot = None;
    }
}

fn dedupe_by_id(geofences: Vec<Geofence>) -> Vec<Geofence> {
    let mut seen = HashSet::with_capacity(geofences.len());
    let total = geofences.len();
    let unique: Vec<Geofence> = geofences
        .into_iter()
        .filter(|g| seen.insert(g.id.clone()))
        .collect();
    if unique.len() != total {
        warn!(
            "[GeofenceRegistry] Dropped {} geofences with duplicate ids",
            total - unique.len()
        );
    }
    unique
}
