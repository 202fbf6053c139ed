//! Drive a tracking session through a simulated crew shift.
//!
//! Run with: cargo run --example simulated_shift

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use site_tracker::{
    Actor, Clock, Collaborators, FixOutcome, Geofence, HostPositionSource, LoggingSink,
    PositionSample, SessionController, StaticGeofences, Timestamp, TrackerConfig, TrackingError,
    Visibility,
};
use tokio::runtime::Handle;
use tokio::sync::mpsc;

/// Clock that follows the simulated timeline instead of the wall clock.
#[derive(Default)]
struct SimulatedClock(AtomicI64);

impl Clock for SimulatedClock {
    fn now_millis(&self) -> Timestamp {
        self.0.load(Ordering::SeqCst)
    }
}

const MIN: Timestamp = 60_000;

#[tokio::main]
async fn main() -> Result<(), TrackingError> {
    // Two job sites in Dallas
    let geofences = vec![
        Geofence::new("gf-1", "job-101", 32.7767, -96.7970, 100.0).with_address("Main St Tower"),
        Geofence::new("gf-2", "job-102", 32.7900, -96.7970, 120.0).with_address("Elm St Lofts"),
    ];

    let source = Arc::new(HostPositionSource::new());
    let clock = Arc::new(SimulatedClock::default());
    let collaborators = Collaborators {
        source: source.clone(),
        fetcher: Arc::new(StaticGeofences::new(geofences)),
        telemetry: Arc::new(LoggingSink),
        site_visits: Arc::new(LoggingSink),
        clock: clock.clone(),
        runtime: Handle::current(),
    };

    let (fix_tx, mut fixes) = mpsc::unbounded_channel();
    let mut session = SessionController::new(TrackerConfig::default(), collaborators, fix_tx);
    session.start(Some(Actor::new("crew-12"))).await?;
    println!("Tracking started, {} geofences loaded\n", session.geofences().len());

    let shift = [
        ("arrive at Main St", 32.7767, -96.7970, 0),
        ("GPS jitter", 32.7768, -96.7971, 20_000),
        ("walk to the trailer", 32.7770, -96.7975, 2 * MIN),
        ("drive off", 32.7780, -96.7970, 3 * MIN),
        ("parked, same spot", 32.7780, -96.7970, 5 * MIN),
        ("arrive at Elm St", 32.7900, -96.7970, 25 * MIN),
    ];

    for (label, lat, lon, t) in shift {
        clock.0.store(t, Ordering::SeqCst);
        source.push(Ok(PositionSample::new(lat, lon, 8.0, t)));
        let Some(fix) = fixes.recv().await else { break };

        print!("t={:>3}min  {:<22}", t / MIN, label);
        match session.on_fix(fix) {
            FixOutcome::Accepted { events, .. } if events.is_empty() => println!("accepted"),
            FixOutcome::Accepted { events, .. } => {
                let summary: Vec<String> = events
                    .iter()
                    .map(|e| format!("{} {} ({})", e.kind, e.geofence_id, e.owner_id))
                    .collect();
                println!("accepted -> {}", summary.join(", "));
            }
            FixOutcome::Rejected(decision) => println!("rejected: {:?}", decision),
            FixOutcome::Failed(e) => println!("error: {}", e),
            FixOutcome::Ignored => println!("ignored"),
        }
        println!(
            "          current site: {}",
            session.current_site_owner_id().unwrap_or("-")
        );
    }

    // App goes to the background: the subscription is released, state is kept
    session.set_visibility(Visibility::Hidden);
    println!("\nHidden: phase={:?}, subscribed={}", session.phase(), source.is_subscribed());
    session.set_visibility(Visibility::Visible);
    println!("Visible: phase={:?}, subscribed={}", session.phase(), source.is_subscribed());

    session.stop();
    println!("Stopped: tracking={}", session.is_tracking());
    Ok(())
}
