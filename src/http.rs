//! HTTP adapters for the tenant backend.
//!
//! [`ApiClient`] is the geofence fetcher and both event sinks in one:
//! - `GET  {base}/api/geofences` for the registry snapshot
//! - `POST {base}/api/gps-tracking` per accepted sample
//! - `POST {base}/api/site-visits` per arrival or departure
//!
//! Sink pushes are sent once. They are never retried here; the dispatcher
//! logs failures and the next sample carries on.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine;
use futures::future::{BoxFuture, FutureExt};
use log::{debug, info};
use reqwest::header::AUTHORIZATION;
use reqwest::{Client, Method, RequestBuilder};
use serde::Serialize;

use crate::{
    Geofence, GeofenceFetcher, Result, SiteVisitRecord, SiteVisitSink, TelemetryRecord,
    TelemetrySink, TrackingError,
};

const DEFAULT_TIMEOUT_SECS: u64 = 15;
const MAX_IDLE_PER_HOST: usize = 4;

/// How requests authenticate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    None,
    /// Session token from the host's sign-in
    Bearer(String),
    /// Static API key, sent as HTTP Basic `API_KEY:<key>`
    ApiKey(String),
}

impl Credential {
    fn header_value(&self) -> Option<String> {
        match self {
            Credential::None => None,
            Credential::Bearer(token) => Some(format!("Bearer {}", token)),
            Credential::ApiKey(key) => {
                let encoded = base64::engine::general_purpose::STANDARD
                    .encode(format!("API_KEY:{}", key));
                Some(format!("Basic {}", encoded))
            }
        }
    }
}

/// Where the backend lives and how to reach it.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub base_url: String,
    pub credential: Credential,
    pub geofences_path: String,
    pub telemetry_path: String,
    pub site_visits_path: String,
    /// Applies to each request as a whole
    pub timeout: Duration,
}

impl ApiConfig {
    pub fn new(base_url: impl Into<String>, credential: Credential) -> Self {
        Self {
            base_url: base_url.into(),
            credential,
            geofences_path: "/api/geofences".to_string(),
            telemetry_path: "/api/gps-tracking".to_string(),
            site_visits_path: "/api/site-visits".to_string(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

#[derive(Debug, Default)]
struct PushStats {
    delivered: AtomicU32,
    failed: AtomicU32,
}

impl PushStats {
    fn record(&self, outcome: &Result<()>) {
        let counter = if outcome.is_ok() { &self.delivered } else { &self.failed };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// reqwest-backed registry fetcher and event sink.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    auth_header: Option<String>,
    geofences_url: String,
    telemetry_url: String,
    site_visits_url: String,
    stats: Arc<PushStats>,
}

impl ApiClient {
    pub fn new(config: &ApiConfig) -> Result<Self> {
        if config.base_url.trim().is_empty() {
            return Err(TrackingError::InvalidConfig("API base URL is empty".into()));
        }

        let client = Client::builder()
            .pool_max_idle_per_host(MAX_IDLE_PER_HOST)
            .pool_idle_timeout(Duration::from_secs(60))
            .tcp_keepalive(Duration::from_secs(30))
            .timeout(config.timeout)
            .build()
            .map_err(|e| TrackingError::InvalidConfig(format!("Failed to create HTTP client: {}", e)))?;

        info!("[ApiClient] Using backend {}", config.base_url);

        Ok(Self {
            client,
            auth_header: config.credential.header_value(),
            geofences_url: config.url(&config.geofences_path),
            telemetry_url: config.url(&config.telemetry_path),
            site_visits_url: config.url(&config.site_visits_path),
            stats: Arc::new(PushStats::default()),
        })
    }

    /// Sink pushes that got a 2xx response.
    pub fn pushes_delivered(&self) -> u32 {
        self.stats.delivered.load(Ordering::Relaxed)
    }

    /// Sink pushes that failed, for any reason.
    pub fn pushes_failed(&self) -> u32 {
        self.stats.failed.load(Ordering::Relaxed)
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.auth_header {
            Some(auth) => builder.header(AUTHORIZATION, auth),
            None => builder,
        }
    }

    fn post<T: Serialize>(&self, sink: &'static str, url: &str, body: &T) -> BoxFuture<'static, Result<()>> {
        let request = self.request(Method::POST, url).json(body);
        let stats = Arc::clone(&self.stats);

        async move {
            let req_start = Instant::now();
            let outcome = match request.send().await {
                Ok(resp) if resp.status().is_success() => Ok(()),
                Ok(resp) => Err(TrackingError::SinkPush {
                    sink,
                    reason: format!("HTTP {}", resp.status()),
                }),
                Err(e) => Err(TrackingError::SinkPush {
                    sink,
                    reason: format!("Request error: {}", e),
                }),
            };
            debug!("[ApiClient] {} push finished in {:?}", sink, req_start.elapsed());
            stats.record(&outcome);
            outcome
        }
        .boxed()
    }
}

impl GeofenceFetcher for ApiClient {
    fn fetch(&self) -> BoxFuture<'static, Result<Vec<Geofence>>> {
        let request = self.request(Method::GET, &self.geofences_url);

        async move {
            let req_start = Instant::now();
            let resp = request
                .send()
                .await
                .map_err(|e| TrackingError::RegistryFetch(format!("Request error: {}", e)))?;

            let status = resp.status();
            if !status.is_success() {
                return Err(TrackingError::RegistryFetch(format!("HTTP {}", status)));
            }

            let bytes = resp
                .bytes()
                .await
                .map_err(|e| TrackingError::RegistryFetch(format!("Body download error: {}", e)))?;
            let geofences: Vec<Geofence> = serde_json::from_slice(&bytes)
                .map_err(|e| TrackingError::RegistryFetch(format!("JSON parse error: {}", e)))?;

            info!(
                "[ApiClient] Fetched {} geofences ({:.1}KB) in {:?}",
                geofences.len(),
                bytes.len() as f64 / 1024.0,
                req_start.elapsed()
            );
            Ok(geofences)
        }
        .boxed()
    }
}

impl TelemetrySink for ApiClient {
    fn push_position(&self, record: TelemetryRecord) -> BoxFuture<'static, Result<()>> {
        self.post("telemetry", &self.telemetry_url, &record)
    }
}

impl SiteVisitSink for ApiClient {
    fn push_visit(&self, record: SiteVisitRecord) -> BoxFuture<'static, Result<()>> {
        self.post("site-visit", &self.site_visits_url, &record)
    }
}
