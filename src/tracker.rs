//! Async driver that owns a [`SessionController`] and exposes it to the host.
//!
//! One tokio task receives position fixes, sign-in changes, visibility changes
//! and commands from [`TrackerHandle`]s, and applies them to the controller one
//! at a time. After each step the observable [`TrackerState`] is republished on
//! a `watch` channel.

use std::sync::Arc;

use log::{debug, info};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::{
    Actor, Collaborators, Geofence, PositionSample, Result, SessionController, SessionPhase,
    TaggedFix, TrackerConfig, TrackingError, Visibility,
};

/// What the host UI renders.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackerState {
    pub is_tracking: bool,
    pub phase: SessionPhase,
    pub last_position: Option<PositionSample>,
    pub geofences: Arc<[Geofence]>,
    /// Owner of the geofence the actor most recently arrived at
    pub current_site_owner_id: Option<String>,
    pub last_error: Option<TrackingError>,
}

impl Default for TrackerState {
    fn default() -> Self {
        Self {
            is_tracking: false,
            phase: SessionPhase::Stopped,
            last_position: None,
            geofences: Arc::from(Vec::<Geofence>::new()),
            current_site_owner_id: None,
            last_error: None,
        }
    }
}

impl From<&SessionController> for TrackerState {
    fn from(controller: &SessionController) -> Self {
        Self {
            is_tracking: controller.is_tracking(),
            phase: controller.phase(),
            last_position: controller.last_position(),
            geofences: controller.geofences(),
            current_site_owner_id: controller.current_site_owner_id().map(str::to_string),
            last_error: controller.last_error().cloned(),
        }
    }
}

enum Command {
    Start(oneshot::Sender<Result<()>>),
    Stop(oneshot::Sender<()>),
    Reload(oneshot::Sender<Result<usize>>),
}

/// Cloneable handle to a running tracker.
///
/// The driver task ends once every handle has been dropped.
#[derive(Clone)]
pub struct TrackerHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<TrackerState>,
}

impl TrackerHandle {
    /// Start tracking for whoever is currently signed in.
    pub async fn start(&self) -> Result<()> {
        self.request(Command::Start).await?
    }

    pub async fn stop(&self) -> Result<()> {
        self.request(Command::Stop).await
    }

    /// Refresh the geofence list; returns the number of geofences loaded.
    pub async fn reload_geofences(&self) -> Result<usize> {
        self.request(Command::Reload).await?
    }

    pub fn state(&self) -> TrackerState {
        self.state.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<TrackerState> {
        self.state.clone()
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .map_err(|_| TrackingError::TrackerClosed)?;
        response.await.map_err(|_| TrackingError::TrackerClosed)
    }
}

/// Spawn the driver task on the collaborators' runtime.
///
/// `auth` reports the signed-in actor and `visibility` the host's foreground
/// state. Both are read once at spawn time, so a tracker spawned while signed
/// in (and with `auto_start`) begins tracking right away.
pub fn spawn_tracker(
    config: TrackerConfig,
    collaborators: Collaborators,
    auth: watch::Receiver<Option<Actor>>,
    visibility: watch::Receiver<Visibility>,
) -> Result<(TrackerHandle, JoinHandle<()>)> {
    config.validate()?;

    let runtime = collaborators.runtime.clone();
    let (fix_tx, fixes) = mpsc::unbounded_channel();
    let (commands_tx, commands) = mpsc::unbounded_channel();
    let (state_tx, state_rx) = watch::channel(TrackerState::default());

    let driver = Driver {
        controller: SessionController::new(config, collaborators, fix_tx),
        commands,
        fixes,
        auth,
        visibility,
        state: state_tx,
    };
    let task = runtime.spawn(driver.run());

    Ok((TrackerHandle { commands: commands_tx, state: state_rx }, task))
}

struct Driver {
    controller: SessionController,
    commands: mpsc::UnboundedReceiver<Command>,
    fixes: mpsc::UnboundedReceiver<TaggedFix>,
    auth: watch::Receiver<Option<Actor>>,
    visibility: watch::Receiver<Visibility>,
    state: watch::Sender<TrackerState>,
}

impl Driver {
    async fn run(mut self) {
        info!("[Tracker] Driver started");

        let visibility = *self.visibility.borrow_and_update();
        self.controller.set_visibility(visibility);
        let actor = self.auth.borrow_and_update().clone();
        if actor.is_some() {
            self.controller.on_actor_change(actor).await;
        }
        self.publish();

        let mut auth_open = true;
        let mut visibility_open = true;

        loop {
            tokio::select! {
                biased;

                command = self.commands.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },

                changed = self.auth.changed(), if auth_open => match changed {
                    Ok(()) => {
                        let actor = self.auth.borrow_and_update().clone();
                        self.controller.on_actor_change(actor).await;
                    }
                    Err(_) => {
                        debug!("[Tracker] Auth provider closed");
                        auth_open = false;
                    }
                },

                changed = self.visibility.changed(), if visibility_open => match changed {
                    Ok(()) => {
                        let visibility = *self.visibility.borrow_and_update();
                        self.controller.set_visibility(visibility);
                    }
                    Err(_) => {
                        debug!("[Tracker] Visibility provider closed");
                        visibility_open = false;
                    }
                },

                Some(fix) = self.fixes.recv() => {
                    self.controller.on_fix(fix);
                }

                else => break,
            }
            self.publish();
        }

        self.controller.stop();
        self.publish();
        info!("[Tracker] Driver stopped");
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Start(reply) => {
                let actor = self.auth.borrow().clone();
                let result = self.controller.start(actor).await;
                self.publish();
                let _ = reply.send(result);
            }
            Command::Stop(reply) => {
                self.controller.stop();
                self.publish();
                let _ = reply.send(());
            }
            Command::Reload(reply) => {
                let result = self.controller.reload_geofences().await;
                self.publish();
                let _ = reply.send(result);
            }
        }
    }

    /// Notify watchers only when something visible changed.
    fn publish(&self) {
        let next = TrackerState::from(&self.controller);
        self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}
