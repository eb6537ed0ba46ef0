//! Fixed-size worker pool: one task per input file, each with its own
//! store connection.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::export::health::HealthMetrics;
use crate::store::Store;

use super::dissector::Dissector;
use super::worker::{process_file, FileOutcome, IngestContext};

/// Aggregate result of one ingestion run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestSummary {
    pub ingested: usize,
    /// Already imported or claimed elsewhere.
    pub skipped: usize,
    /// Failed files with their error chain.
    pub failed: Vec<(PathBuf, String)>,
    /// Files never started because the run was cancelled.
    pub cancelled: usize,
}

impl IngestSummary {
    /// True when no file failed. Skipped files count as success.
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

enum TaskResult {
    Done(PathBuf, anyhow::Result<FileOutcome>),
    Cancelled,
}

/// Processes `files` with at most `workers` files in flight.
///
/// A failing file never stops the pool. Cancellation stops new files from
/// starting; files already in flight run to completion.
pub async fn run_pool<S: Store, D: Dissector>(
    ctx: Arc<IngestContext>,
    store: S,
    dissector: Arc<D>,
    files: Vec<PathBuf>,
    workers: usize,
    cancel: CancellationToken,
    metrics: Option<Arc<HealthMetrics>>,
) -> IngestSummary {
    let semaphore = Arc::new(Semaphore::new(workers.max(1)));
    let mut in_flight = JoinSet::new();

    tracing::info!(
        files = files.len(),
        workers,
        store = store.name(),
        dissector = dissector.name(),
        "starting ingestion",
    );

    for path in files {
        let ctx = Arc::clone(&ctx);
        let store = store.clone();
        let dissector = Arc::clone(&dissector);
        let semaphore = Arc::clone(&semaphore);
        let cancel = cancel.clone();
        let metrics = metrics.clone();

        in_flight.spawn(async move {
            let permit = tokio::select! {
                permit = semaphore.acquire_owned() => permit,
                () = cancel.cancelled() => return TaskResult::Cancelled,
            };
            let _permit = match permit {
                Ok(permit) => permit,
                Err(e) => {
                    tracing::warn!(error = %e, "worker semaphore closed");
                    return TaskResult::Cancelled;
                }
            };
            if cancel.is_cancelled() {
                return TaskResult::Cancelled;
            }

            if let Some(m) = &metrics {
                m.active_workers.inc();
            }
            let result = run_one(&ctx, &store, dissector.as_ref(), &path).await;
            if let Some(m) = &metrics {
                m.active_workers.dec();
            }

            TaskResult::Done(path, result)
        });
    }

    let mut summary = IngestSummary::default();
    while let Some(joined) = in_flight.join_next().await {
        let (path, result) = match joined {
            Ok(TaskResult::Done(path, result)) => (path, result),
            Ok(TaskResult::Cancelled) => {
                summary.cancelled += 1;
                continue;
            }
            Err(e) => {
                tracing::error!(error = %e, "ingestion task panicked");
                summary
                    .failed
                    .push((PathBuf::new(), format!("worker task failed: {e}")));
                continue;
            }
        };

        match result {
            Ok(FileOutcome::Ingested(report)) => {
                summary.ingested += 1;
                if let Some(m) = &metrics {
                    m.observe_report(&report);
                }
            }
            Ok(FileOutcome::AlreadyImported | FileOutcome::ClaimedElsewhere) => {
                summary.skipped += 1;
                if let Some(m) = &metrics {
                    m.files.with_label_values(&["skipped"]).inc();
                }
            }
            Err(e) => {
                tracing::error!(file = %path.display(), error = format!("{e:#}"), "file failed");
                summary.failed.push((path, format!("{e:#}")));
                if let Some(m) = &metrics {
                    m.files.with_label_values(&["failed"]).inc();
                }
            }
        }
    }

    tracing::info!(
        ingested = summary.ingested,
        skipped = summary.skipped,
        failed = summary.failed.len(),
        cancelled = summary.cancelled,
        "ingestion finished",
    );

    summary
}

async fn run_one<S: Store, D: Dissector>(
    ctx: &IngestContext,
    store: &S,
    dissector: &D,
    path: &std::path::Path,
) -> anyhow::Result<FileOutcome> {
    use anyhow::Context;

    let conn = store
        .connect_worker()
        .await
        .context("opening worker store connection")?;
    process_file(ctx, &conn, dissector, path).await
}
