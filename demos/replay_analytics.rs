//! Replay recorded crew tracks and summarize time on site.
//!
//! Run with: cargo run --example replay_analytics --features parallel

use site_tracker::geo_utils::geofence_bounds;
use site_tracker::{
    dwell_by_owner, nearest_geofence, replay_tracks_parallel, summarize_visits, ActorTrack,
    Geofence, PositionSample, Timestamp, TrackerConfig,
};

const MIN: Timestamp = 60_000;

/// A track that parks at each stop for `stay` minutes, one fix per minute.
fn track(actor_id: &str, stops: &[(f64, f64)], stay: i64) -> ActorTrack {
    let mut samples = Vec::new();
    let mut t = 0;
    for (i, &(lat, lon)) in stops.iter().enumerate() {
        for minute in 0..stay {
            // Drift a little so the distance gate sees movement on site
            let drift = if minute % 2 == 0 { 0.0 } else { 0.0006 };
            samples.push(PositionSample::new(lat + drift, lon, 6.0, t));
            t += MIN;
        }
        // Travel time between stops
        t += (10 + i as i64) * MIN;
    }
    ActorTrack { actor_id: actor_id.to_string(), samples }
}

fn main() {
    let geofences = vec![
        Geofence::new("gf-1", "job-101", 32.7767, -96.7970, 150.0),
        Geofence::new("gf-2", "job-102", 32.7900, -96.7970, 150.0),
        Geofence::new("gf-3", "job-103", 32.8000, -96.8100, 150.0),
        Geofence::new("gf-old", "job-099", 32.7000, -96.7000, 150.0).deactivated(),
    ];

    let tracks = vec![
        track("crew-1", &[(32.7767, -96.7970), (32.7900, -96.7970)], 30),
        track("crew-2", &[(32.8000, -96.8100)], 90),
        track("crew-3", &[(32.7900, -96.7970), (32.8000, -96.8100), (32.7767, -96.7970)], 20),
    ];

    let config = TrackerConfig::default();
    let results = replay_tracks_parallel(&tracks, &geofences, &config);

    println!("Site visits per crew\n");
    let until = 24 * 60 * MIN;
    let mut all_visits = Vec::new();
    for result in &results {
        let visits = summarize_visits(&result.events, until);
        println!("{}: {} events, {} visits", result.actor_id, result.events.len(), visits.len());
        for visit in &visits {
            let state = if visit.is_open() { " (still on site)" } else { "" };
            println!(
                "   {} / {}: {} min{}",
                visit.owner_id,
                visit.geofence_id,
                visit.dwell_ms / MIN,
                state
            );
        }
        all_visits.extend(visits);
    }

    println!("\nTotal time on site");
    for owner in dwell_by_owner(&all_visits) {
        println!(
            "   {}: {} visits, {} min",
            owner.owner_id,
            owner.visit_count,
            owner.total_dwell_ms / MIN
        );
    }

    if let Some(bounds) = geofence_bounds(&geofences) {
        let (lat, lng) = bounds.center();
        println!("\nMap viewport centered on ({:.4}, {:.4})", lat, lng);
    }

    let here = PositionSample::new(32.7850, -96.7990, 5.0, 0);
    if let Some(next) = nearest_geofence(&here, &geofences) {
        println!(
            "Nearest site from ({:.4}, {:.4}): {} ({:.0} m to the edge)",
            here.latitude, here.longitude, next.owner_id, next.distance_to_edge
        );
    }
}
