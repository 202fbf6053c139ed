//! Fetch a tenant's geofences and push one test sample.
//! Run with: cargo run --example fetch_geofences --features http -- <base-url> <api-key>

use std::time::Instant;

use site_tracker::{
    ApiClient, ApiConfig, Credential, GeofenceFetcher, PositionSample, SystemClock, Clock,
    TelemetryRecord, TelemetrySink,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(1);
    let base_url = args.next().unwrap_or_else(|| "http://localhost:3000".to_string());
    let credential = match args.next() {
        Some(key) => Credential::ApiKey(key),
        None => Credential::None,
    };

    let client = ApiClient::new(&ApiConfig::new(base_url.clone(), credential))?;

    let start = Instant::now();
    let geofences = client.fetch().await?;
    println!("Fetched {} geofences from {} in {:?}", geofences.len(), base_url, start.elapsed());
    for g in &geofences {
        println!(
            "   {} owner={} ({:.5}, {:.5}) r={}m{}",
            g.id,
            g.owner_id,
            g.center_latitude,
            g.center_longitude,
            g.radius_meters,
            if g.active { "" } else { " [inactive]" }
        );
    }

    let sample = PositionSample::new(32.7767, -96.7970, 10.0, SystemClock.now_millis());
    match client.push_position(TelemetryRecord::from_sample(&sample, "demo")).await {
        Ok(()) => println!("\nTelemetry push delivered"),
        Err(e) => println!("\nTelemetry push failed: {}", e),
    }
    Ok(())
}
