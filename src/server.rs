//! The HTTP side of the exporter.
//!
//! Serves the prometheus text exposition on `/metrics` and named health
//! checks on `/live` and `/ready`. The scrape handler merges the registry's
//! own families (message counters, optional process metrics) with the
//! snapshot store's dynamic families.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use prometheus::{Encoder, Registry, TextEncoder};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::snapshot::MetricSnapshots;

/// A named health check. Returns an error description when unhealthy.
type HealthCheck = Arc<dyn Fn() -> Result<(), String> + Send + Sync>;

/// A named list of health checks backing one endpoint.
#[derive(Clone, Default)]
struct HealthChecks {
    checks: Vec<(String, HealthCheck)>,
}

impl HealthChecks {
    fn add(
        &mut self,
        name: impl Into<String>,
        check: impl Fn() -> Result<(), String> + Send + Sync + 'static,
    ) {
        self.checks.push((name.into(), Arc::new(check)));
    }

    /// Run all checks; the result maps failing check names to their errors.
    fn run(&self) -> BTreeMap<String, String> {
        self.checks
            .iter()
            .filter_map(|(name, check)| check().err().map(|error| (name.clone(), error)))
            .collect()
    }
}

/// HTTP server exposing metrics and health.
pub struct MetricsServer {
    port: u16,
    registry: Registry,
    store: Option<Arc<MetricSnapshots>>,
    liveness: HealthChecks,
    readiness: HealthChecks,
}

impl std::fmt::Debug for MetricsServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsServer")
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}

struct ServerState {
    registry: Registry,
    store: Option<Arc<MetricSnapshots>>,
    liveness: HealthChecks,
    readiness: HealthChecks,
}

impl MetricsServer {
    /// Create a server that will listen on the given port.
    pub fn new(port: u16) -> Self {
        Self {
            port,
            registry: Registry::new(),
            store: None,
            liveness: HealthChecks::default(),
            readiness: HealthChecks::default(),
        }
    }

    /// The registry served on `/metrics`.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Attach the snapshot store whose families are merged into scrapes.
    pub fn set_store(&mut self, store: Arc<MetricSnapshots>) {
        self.store = Some(store);
    }

    /// Register a liveness check served on `/live`.
    pub fn add_liveness_check(
        &mut self,
        name: impl Into<String>,
        check: impl Fn() -> Result<(), String> + Send + Sync + 'static,
    ) {
        self.liveness.add(name, check);
    }

    /// Register a readiness check served on `/ready`.
    pub fn add_readiness_check(
        &mut self,
        name: impl Into<String>,
        check: impl Fn() -> Result<(), String> + Send + Sync + 'static,
    ) {
        self.readiness.add(name, check);
    }

    /// The router serving `/metrics`, `/live` and `/ready`.
    pub fn router(&self) -> Router {
        let state = Arc::new(ServerState {
            registry: self.registry.clone(),
            store: self.store.clone(),
            liveness: self.liveness.clone(),
            readiness: self.readiness.clone(),
        });
        Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/live", get(live_handler))
            .route("/ready", get(ready_handler))
            .with_state(state)
    }

    /// Serve until the token is cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> std::io::Result<()> {
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", self.port)).await?;
        info!(address = %listener.local_addr()?, "serving metrics");
        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
    }
}

async fn metrics_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let mut families = state.registry.gather();
    if let Some(store) = &state.store {
        families.extend(store.collect_families());
    }

    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(e) = encoder.encode(&families, &mut buffer) {
        error!(error = %e, "can not encode metrics");
        return (StatusCode::INTERNAL_SERVER_ERROR, String::new()).into_response();
    }

    (
        [(header::CONTENT_TYPE, encoder.format_type().to_owned())],
        buffer,
    )
        .into_response()
}

async fn live_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    health_response(&state.liveness)
}

async fn ready_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    health_response(&state.readiness)
}

fn health_response(checks: &HealthChecks) -> (StatusCode, Json<BTreeMap<String, String>>) {
    let failures = checks.run();
    let status = if failures.is_empty() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(failures))
}
