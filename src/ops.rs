//! Operations Surface
//!
//! HTTP endpoints for health checks and monitoring:
//!
//! | Path       | Response                                     |
//! |------------|----------------------------------------------|
//! | `/healthz` | `ok` while the process serves requests       |
//! | `/readyz`  | `ok` when the key-value store answers a ping |
//! | `/status`  | scheduler job status as JSON                 |
//! | `/metrics` | Prometheus text exposition                   |
//!
//! Gauges are refreshed from component snapshots on every scrape, so the
//! components themselves carry no Prometheus types.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{Encoder, Gauge, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::coordinator::Coordinator;
use crate::error::{Error, Result};

const NAMESPACE: &str = "marketcache";

// =============================================================================
// Prometheus Gauges
// =============================================================================

/// Gauges mirroring the component snapshots
pub struct OpsMetrics {
    registry: Registry,

    cache_hits: IntGauge,
    cache_misses: IntGauge,
    cache_bypasses: IntGauge,
    cache_hit_ratio: Gauge,
    cache_serialization_errors: IntGauge,
    cache_bytes_saved: IntGauge,
    swr_stale_serves: IntGauge,
    swr_refreshes_failed: IntGauge,
    prefetch_scheduled: IntGauge,
    batch_source_calls: IntGauge,

    views_buffered: IntGauge,
    views_dropped: IntGauge,
    views_stranded: IntGauge,
    views_flushed: IntGauge,
    view_flush_failures: IntGauge,

    offers_expired: IntGauge,
    offers_superseded: IntGauge,
    offers_expire_failed: IntGauge,

    job_runs: IntGaugeVec,
    job_failures: IntGaugeVec,
    job_running: IntGaugeVec,
}

fn prom_err(e: prometheus::Error) -> Error {
    Error::Internal(format!("prometheus: {}", e))
}

impl OpsMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new_custom(Some(NAMESPACE.to_string()), None).map_err(prom_err)?;

        let gauge = |name: &str, help: &str| -> Result<IntGauge> {
            let g = IntGauge::new(name, help).map_err(prom_err)?;
            registry.register(Box::new(g.clone())).map_err(prom_err)?;
            Ok(g)
        };
        let job_gauge = |name: &str, help: &str| -> Result<IntGaugeVec> {
            let g = IntGaugeVec::new(Opts::new(name, help), &["job"]).map_err(prom_err)?;
            registry.register(Box::new(g.clone())).map_err(prom_err)?;
            Ok(g)
        };

        let cache_hit_ratio = Gauge::new("cache_hit_ratio", "Cache hits over store lookups")
            .map_err(prom_err)?;
        registry
            .register(Box::new(cache_hit_ratio.clone()))
            .map_err(prom_err)?;

        Ok(Self {
            cache_hits: gauge("cache_hits_total", "Cache hits")?,
            cache_misses: gauge("cache_misses_total", "Cache misses")?,
            cache_bypasses: gauge("cache_bypasses_total", "Reads that bypassed an unavailable store")?,
            cache_hit_ratio,
            cache_serialization_errors: gauge(
                "cache_serialization_errors_total",
                "Malformed cache entries discarded",
            )?,
            cache_bytes_saved: gauge("cache_compression_bytes_saved_total", "Bytes saved by compression")?,
            swr_stale_serves: gauge("swr_stale_serves_total", "Stale values served while refreshing")?,
            swr_refreshes_failed: gauge("swr_refreshes_failed_total", "Background refreshes that failed")?,
            prefetch_scheduled: gauge("prefetch_scheduled_total", "Next-page prefetches scheduled")?,
            batch_source_calls: gauge("batch_source_calls_total", "Batched source calls for cache misses")?,

            views_buffered: gauge("views_buffered_total", "View increments accepted")?,
            views_dropped: gauge("views_dropped_total", "View increments lost to store outages")?,
            views_stranded: gauge("views_stranded_total", "View deltas buffered without a dirty marker")?,
            views_flushed: gauge("views_flushed_total", "View deltas pushed to the durable store")?,
            view_flush_failures: gauge("view_flush_failures_total", "Per-entity flush failures")?,

            offers_expired: gauge("offers_expired_total", "Offers transitioned to expired")?,
            offers_superseded: gauge("offers_superseded_total", "Due offers that had already ended another way")?,
            offers_expire_failed: gauge("offers_expire_failed_total", "Expiration writes retried")?,

            job_runs: job_gauge("job_runs_total", "Scheduled job invocations")?,
            job_failures: job_gauge("job_failures_total", "Scheduled job failures")?,
            job_running: job_gauge("job_running", "Whether a job invocation is in flight")?,

            registry,
        })
    }

    /// Copy the current snapshots into the gauges
    pub fn refresh(&self, coordinator: &Coordinator) {
        let cache = coordinator.cache_metrics();
        self.cache_hits.set(cache.hits as i64);
        self.cache_misses.set(cache.misses as i64);
        self.cache_bypasses.set(cache.bypasses as i64);
        self.cache_hit_ratio.set(cache.hit_ratio());
        self.cache_serialization_errors
            .set(cache.serialization_errors as i64);
        self.cache_bytes_saved.set(cache.bytes_saved as i64);
        self.swr_stale_serves.set(cache.swr_stale_serves as i64);
        self.swr_refreshes_failed.set(cache.swr_refreshes_failed as i64);
        self.prefetch_scheduled.set(cache.prefetch_scheduled as i64);
        self.batch_source_calls.set(cache.batch_source_calls as i64);

        let views = coordinator.view_stats();
        self.views_buffered.set(views.increments as i64);
        self.views_dropped.set(views.dropped as i64);
        self.views_stranded.set(views.stranded as i64);
        self.views_flushed.set(views.flushed_total);
        self.view_flush_failures.set(views.failures as i64);

        let reaper = coordinator.reaper_stats();
        self.offers_expired.set(reaper.expired as i64);
        self.offers_superseded.set(reaper.superseded as i64);
        self.offers_expire_failed.set(reaper.failed as i64);

        for job in coordinator.status() {
            let labels = [job.job_id.as_str()];
            self.job_runs.with_label_values(&labels).set(job.runs as i64);
            self.job_failures
                .with_label_values(&labels)
                .set(job.failures as i64);
            self.job_running
                .with_label_values(&labels)
                .set(i64::from(job.running));
        }
    }

    /// Prometheus text exposition of every gauge
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(prom_err)?;
        Ok(buffer)
    }
}

impl std::fmt::Debug for OpsMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpsMetrics").finish_non_exhaustive()
    }
}

// =============================================================================
// HTTP Server
// =============================================================================

struct OpsState {
    coordinator: Arc<Coordinator>,
    metrics: OpsMetrics,
}

fn text(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
}

fn with_content_type(mut response: Response<Full<Bytes>>, value: &'static str) -> Response<Full<Bytes>> {
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(value));
    response
}

async fn route(state: &OpsState, path: &str) -> Response<Full<Bytes>> {
    match path {
        "/healthz" | "/livez" => text(StatusCode::OK, "ok"),
        "/readyz" => match state.coordinator.ping().await {
            Ok(()) => text(StatusCode::OK, "ok"),
            Err(e) => {
                debug!(error = %e, "Readiness check failed");
                text(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
            }
        },
        "/status" => match serde_json::to_vec(&state.coordinator.status()) {
            Ok(body) => with_content_type(text(StatusCode::OK, body), "application/json"),
            Err(e) => text(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        },
        "/metrics" => {
            state.metrics.refresh(&state.coordinator);
            match state.metrics.encode() {
                Ok(body) => with_content_type(
                    text(StatusCode::OK, body),
                    "text/plain; version=0.0.4",
                ),
                Err(e) => text(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            }
        }
        _ => text(StatusCode::NOT_FOUND, "not found"),
    }
}

/// Serve the operations endpoints on `addr` until `shutdown` fires
pub async fn serve(
    addr: &str,
    coordinator: Arc<Coordinator>,
    shutdown: CancellationToken,
) -> Result<()> {
    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Config(format!("Invalid ops server address {}: {}", addr, e)))?;
    let state = Arc::new(OpsState {
        coordinator,
        metrics: OpsMetrics::new()?,
    });

    let listener = TcpListener::bind(addr).await?;
    info!("Ops server listening on {}", addr);

    loop {
        let (stream, _) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted?,
        };

        let io = TokioIo::new(stream);
        let state = state.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req: Request<Incoming>| {
                let state = state.clone();
                async move { Ok::<_, Infallible>(route(&state, req.uri().path()).await) }
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!("Ops server connection error: {}", e);
            }
        });
    }

    info!("Ops server stopped");
    Ok(())
}
