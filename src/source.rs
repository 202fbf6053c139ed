//! The boundary to the platform location service.
//!
//! A [`PositionSource`] hands out one subscription at a time. Fixes travel back
//! through a [`FixSender`] tagged with the generation of the subscription they
//! belong to, so the session can drop anything that arrives after it
//! unsubscribed or resubscribed.

use std::sync::{Mutex, MutexGuard, PoisonError};

use log::debug;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::{PositionSample, Result, TrackerConfig};

/// Options passed to the platform when subscribing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchOptions {
    pub high_accuracy: bool,
    /// How long the platform may take to produce a fix
    pub timeout_ms: u64,
    /// Oldest cached fix the platform may hand back
    pub max_age_ms: u64,
}

impl From<&TrackerConfig> for WatchOptions {
    fn from(config: &TrackerConfig) -> Self {
        Self {
            high_accuracy: config.high_accuracy,
            timeout_ms: config.fix_timeout_ms,
            max_age_ms: config.max_fix_age_ms,
        }
    }
}

/// Failures reported by the platform instead of a fix.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FixError {
    #[error("location permission denied")]
    PermissionDenied,
    #[error("position unavailable: {0}")]
    PositionUnavailable(String),
    #[error("timed out waiting for a position fix")]
    Timeout,
}

pub type FixResult = std::result::Result<PositionSample, FixError>;

/// Handle for an active subscription, returned by [`PositionSource::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// A fix together with the generation of the subscription that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct TaggedFix {
    pub generation: u64,
    pub fix: FixResult,
}

/// Delivery end of a subscription, owned by the position source.
#[derive(Debug, Clone)]
pub struct FixSender {
    generation: u64,
    tx: mpsc::UnboundedSender<TaggedFix>,
}

impl FixSender {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<TaggedFix>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Queue a fix for the session. Returns false once the session is gone.
    pub fn send(&self, fix: FixResult) -> bool {
        self.tx
            .send(TaggedFix { generation: self.generation, fix })
            .is_ok()
    }
}

/// A continuous position feed.
///
/// Implementations must deliver fixes asynchronously through the sender, never
/// from inside `subscribe` itself.
pub trait PositionSource: Send + Sync {
    /// Whether the platform can produce fixes at all right now.
    fn capability(&self) -> Result<()>;

    fn subscribe(&self, options: &WatchOptions, sender: FixSender) -> Result<SubscriptionId>;

    /// Stop delivering fixes for `id`. Unknown ids are ignored.
    fn unsubscribe(&self, id: SubscriptionId);
}

/// Position source fed by the host: a mobile shell, a browser bridge or a test.
///
/// The host calls [`HostPositionSource::push`] for every platform callback; the
/// fix goes to whichever session currently holds the subscription.
#[derive(Debug)]
pub struct HostPositionSource {
    inner: Mutex<HostState>,
}

#[derive(Debug)]
struct HostState {
    capability: Result<()>,
    next_id: u64,
    active: Option<(SubscriptionId, FixSender)>,
    options: Option<WatchOptions>,
    subscribe_count: u32,
}

impl Default for HostPositionSource {
    fn default() -> Self {
        Self::new()
    }
}

impl HostPositionSource {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HostState {
                capability: Ok(()),
                next_id: 1,
                active: None,
                options: None,
                subscribe_count: 0,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, HostState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Change what [`PositionSource::capability`] reports, e.g. after the user
    /// revoked location permission.
    pub fn set_capability(&self, capability: Result<()>) {
        self.state().capability = capability;
    }

    /// Forward a platform callback to the current subscriber.
    ///
    /// Returns false when nobody is subscribed; the fix is dropped.
    pub fn push(&self, fix: FixResult) -> bool {
        let state = self.state();
        match &state.active {
            Some((_, sender)) => sender.send(fix),
            None => {
                debug!("[HostPositionSource] Dropping fix with no subscriber");
                false
            }
        }
    }

    pub fn is_subscribed(&self) -> bool {
        self.state().active.is_some()
    }

    /// Options of the current (or last) subscription.
    pub fn watch_options(&self) -> Option<WatchOptions> {
        self.state().options.clone()
    }

    /// Total number of subscriptions handed out.
    pub fn subscribe_count(&self) -> u32 {
        self.state().subscribe_count
    }
}

impl PositionSource for HostPositionSource {
    fn capability(&self) -> Result<()> {
        self.state().capability.clone()
    }

    fn subscribe(&self, options: &WatchOptions, sender: FixSender) -> Result<SubscriptionId> {
        let mut state = self.state();
        state.capability.clone()?;
        if let Some((previous, _)) = state.active.take() {
            debug!("[HostPositionSource] Replacing subscription {:?}", previous);
        }
        let id = SubscriptionId(state.next_id);
        state.next_id += 1;
        state.subscribe_count += 1;
        state.options = Some(options.clone());
        state.active = Some((id, sender));
        Ok(id)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        let mut state = self.state();
        if matches!(&state.active, Some((active, _)) if *active == id) {
            state.active = None;
        }
    }
}
