use thiserror::Error;

/// Everything that can go wrong while tracking.
///
/// None of these escape the session as a panic; start failures are returned to
/// the caller and everything else is logged and, where the host UI cares,
/// recorded in the exposed state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TrackingError {
    #[error("position capability unavailable: {0}")]
    CapabilityUnavailable(String),

    #[error("location permission denied")]
    PermissionDenied,

    #[error("no authenticated actor")]
    NotAuthenticated,

    #[error("no position fix within {0} ms")]
    SampleTimeout(u64),

    #[error("position fix is {age_ms} ms old (max {max_age_ms} ms)")]
    StaleFix { age_ms: i64, max_age_ms: u64 },

    #[error("geofence registry fetch failed: {0}")]
    RegistryFetch(String),

    #[error("{sink} push failed: {reason}")]
    SinkPush { sink: &'static str, reason: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("tracker task has shut down")]
    TrackerClosed,
}

impl TrackingError {
    /// Errors that keep tracking from starting at all.
    pub fn is_capability_error(&self) -> bool {
        matches!(
            self,
            TrackingError::CapabilityUnavailable(_)
                | TrackingError::PermissionDenied
                | TrackingError::StaleFix { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, TrackingError>;
