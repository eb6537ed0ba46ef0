use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::dictionary::ResolutionStats;
use crate::ingest::worker::FileReport;

/// Prometheus metrics for ingestion runs.
///
/// All metrics use the "potiron" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Files by outcome (ingested, skipped, failed).
    pub files: CounterVec,
    /// Total records folded into histograms.
    pub records: Counter,
    /// Total histogram increments submitted.
    pub histogram_increments: Counter,
    /// Annotation resolutions by outcome.
    pub dictionary_resolutions: CounterVec,
    /// Per-file processing duration (10ms-5min buckets).
    pub file_duration: Histogram,
    /// Workers currently processing a file.
    pub active_workers: Gauge,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let files = CounterVec::new(
            Opts::new("files_total", "Input files processed by outcome.").namespace("potiron"),
            &["outcome"],
        )?;
        let records = Counter::with_opts(
            Opts::new("records_total", "Total records folded into histograms.")
                .namespace("potiron"),
        )?;
        let histogram_increments = Counter::with_opts(
            Opts::new(
                "histogram_increments_total",
                "Total histogram increments submitted to the store.",
            )
            .namespace("potiron"),
        )?;
        let dictionary_resolutions = CounterVec::new(
            Opts::new(
                "dictionary_resolutions_total",
                "Annotation value resolutions by outcome.",
            )
            .namespace("potiron"),
            &["outcome"],
        )?;
        let file_duration = Histogram::with_opts(
            HistogramOpts::new(
                "file_duration_seconds",
                "Time to ingest one file, batch flush included.",
            )
            .namespace("potiron")
            .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0]),
        )?;
        let active_workers = Gauge::with_opts(
            Opts::new("active_workers", "Workers currently processing a file.")
                .namespace("potiron"),
        )?;

        registry.register(Box::new(files.clone()))?;
        registry.register(Box::new(records.clone()))?;
        registry.register(Box::new(histogram_increments.clone()))?;
        registry.register(Box::new(dictionary_resolutions.clone()))?;
        registry.register(Box::new(file_duration.clone()))?;
        registry.register(Box::new(active_workers.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            files,
            records,
            histogram_increments,
            dictionary_resolutions,
            file_duration,
            active_workers,
        })
    }

    /// Records a successfully ingested file.
    pub fn observe_report(&self, report: &FileReport) {
        self.files.with_label_values(&["ingested"]).inc();
        self.records.inc_by(report.records as f64);
        self.histogram_increments.inc_by(report.increments as f64);
        self.file_duration.observe(report.elapsed.as_secs_f64());
        self.observe_resolutions(&report.resolutions);
    }

    fn observe_resolutions(&self, stats: &ResolutionStats) {
        for (outcome, count) in [
            ("existing", stats.existing),
            ("committed", stats.committed),
            ("adopted", stats.adopted),
            ("unresolved", stats.unresolved),
        ] {
            if count > 0 {
                self.dictionary_resolutions
                    .with_label_values(&[outcome])
                    .inc_by(count as f64);
            }
        }
    }

    /// Renders the registry in Prometheus text format.
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .context("encoding metrics")?;
        String::from_utf8(buffer).context("converting metrics to string")
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let registry = self.registry.clone();
        let app_state = Arc::new(AppState { registry });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = state.registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "encoding metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "encoding error".to_string(),
        );
    }

    match String::from_utf8(buffer) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "converting metrics to string");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}
