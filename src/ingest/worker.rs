//! Full pipeline for one input file.

use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};

use crate::dictionary::{AnnotationField, GlobalReconciler, ResolutionStats};
use crate::field::normalize::Normalizer;
use crate::field::FieldValue;
use crate::histogram::HistogramBuffer;
use crate::route::KeyRouter;
use crate::store::Store;

use super::dissector::Dissector;
use super::document::AnnotatedDocument;
use super::params::{record_parameters, RunParameters};
use super::registry::{Admission, FileRegistry};

const MIN_RENEWAL: Duration = Duration::from_millis(100);

/// Immutable state shared by every worker of a run.
#[derive(Debug, Clone)]
pub struct IngestContext {
    pub params: RunParameters,
    pub normalizer: Normalizer,
    pub router: KeyRouter,
    /// Sensor name override. Derived per file when `None`.
    pub sensor: Option<String>,
    pub claim_ttl: Duration,
    /// Claim owner recorded in `CLAIM:<file>`.
    pub owner: String,
}

impl IngestContext {
    /// Creates a new context, building the normalizer and router once.
    pub fn new(
        params: RunParameters,
        router: KeyRouter,
        sensor: Option<String>,
        claim_ttl: Duration,
    ) -> Self {
        let normalizer = Normalizer::new(params.fields.clone());
        Self {
            params,
            normalizer,
            router,
            sensor,
            claim_ttl,
            owner: format!("potiron-{}", std::process::id()),
        }
    }
}

/// Kind of input file, from its extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    /// Packet capture handed to the dissector.
    Capture,
    /// Annotated JSON document.
    Document,
}

impl InputKind {
    pub fn of(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?;
        let name = name.strip_suffix(".gz").unwrap_or(name);
        if name.ends_with(".cap") || name.ends_with(".pcap") {
            Some(Self::Capture)
        } else if name.ends_with(".json") {
            Some(Self::Document)
        } else {
            None
        }
    }
}

/// What ingesting one file achieved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileReport {
    pub file: String,
    pub sensor: String,
    pub records: u64,
    pub increments: usize,
    pub resolutions: ResolutionStats,
    pub elapsed: Duration,
}

/// Result of processing one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOutcome {
    Ingested(FileReport),
    /// Already in the file registry. Nothing was written.
    AlreadyImported,
    /// Another worker is ingesting the same file. Nothing was written.
    ClaimedElsewhere,
}

/// Derives `prefix-sensor-instance` from `prefix-sensor-instance-date.ext`.
pub fn derive_sensor_name(file: &str) -> Option<String> {
    let parts: Vec<&str> = file.split('-').collect();
    match parts.as_slice() {
        [prefix, sensor, instance, _date]
            if !prefix.is_empty() && !sensor.is_empty() && !instance.is_empty() =>
        {
            Some(format!("{prefix}-{sensor}-{instance}"))
        }
        _ => None,
    }
}

/// Runs the full pipeline for `path` against one worker connection.
///
/// The file's batch is applied only after every record was processed, and
/// the file is registered only after the batch was applied. The claim is
/// renewed every third of its TTL while the file is in flight; losing it
/// aborts the file. Run parameters
/// are recorded right before the batch, so a store instance is initialized
/// by its first successful file. Any error
/// releases the claim and leaves the file retryable.
pub async fn process_file<S: Store, D: Dissector>(
    ctx: &IngestContext,
    store: &S,
    dissector: &D,
    path: &Path,
) -> Result<FileOutcome> {
    let started = Instant::now();
    let basename = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow!("{}: not a file name", path.display()))?
        .to_string();
    let kind = InputKind::of(path)
        .ok_or_else(|| anyhow!("{basename}: unsupported input extension"))?;

    let document = match kind {
        InputKind::Capture => None,
        InputKind::Document => {
            let doc = AnnotatedDocument::load(path)
                .with_context(|| format!("reading document {basename}"))?;
            doc.header
                .check(&ctx.params.display_filter, &ctx.params.record_fields())
                .with_context(|| format!("checking document {basename}"))?;
            Some(doc)
        }
    };

    let file = document
        .as_ref()
        .and_then(|d| d.header.filename.clone())
        .unwrap_or(basename);

    let registry = FileRegistry::new(store, ctx.owner.as_str(), ctx.claim_ttl);
    match registry.admit(&file).await? {
        Admission::AlreadyImported => {
            tracing::info!(file = %file, "already imported, skipping");
            return Ok(FileOutcome::AlreadyImported);
        }
        Admission::ClaimedElsewhere => {
            tracing::info!(file = %file, "being ingested by another worker, skipping");
            return Ok(FileOutcome::ClaimedElsewhere);
        }
        Admission::Claimed => {}
    }

    let work = ingest_claimed(ctx, store, dissector, path, &file, document);
    tokio::pin!(work);
    let mut renewal = tokio::time::interval((ctx.claim_ttl / 3).max(MIN_RENEWAL));
    renewal.tick().await;
    let result = loop {
        tokio::select! {
            result = &mut work => break result,
            _ = renewal.tick() => match registry.renew(&file).await {
                Ok(true) => {}
                Ok(false) => {
                    break Err(anyhow!("{file}: claim expired or taken over while ingesting"));
                }
                Err(e) => tracing::warn!(file = %file, error = %e, "failed to renew claim"),
            },
        }
    };

    let report = match result {
        Ok(report) => report,
        Err(err) => {
            if let Err(release_err) = registry.release(&file).await {
                tracing::warn!(file = %file, error = %release_err, "failed to release claim");
            }
            return Err(err);
        }
    };

    registry.commit(&file).await?;

    let report = FileReport {
        elapsed: started.elapsed(),
        ..report
    };
    tracing::info!(
        file = %report.file,
        sensor = %report.sensor,
        records = report.records,
        increments = report.increments,
        elapsed_ms = report.elapsed.as_millis() as u64,
        "file ingested",
    );

    Ok(FileOutcome::Ingested(report))
}

async fn ingest_claimed<S: Store, D: Dissector>(
    ctx: &IngestContext,
    store: &S,
    dissector: &D,
    path: &Path,
    file: &str,
    document: Option<AnnotatedDocument>,
) -> Result<FileReport> {
    let mut buffer = HistogramBuffer::new();
    let mut resolutions = ResolutionStats::default();

    let sensor = match &document {
        Some(doc) => ctx
            .sensor
            .clone()
            .or_else(|| doc.header.sensorname.clone())
            .or_else(|| derive_sensor_name(file)),
        None => ctx.sensor.clone().or_else(|| derive_sensor_name(file)),
    }
    .ok_or_else(|| anyhow!("{file}: cannot derive sensor name, set --sensor"))?;

    match document {
        None => {
            let lines = dissector
                .dissect(
                    path,
                    &ctx.normalizer.dissector_fields(),
                    &ctx.params.display_filter,
                )
                .await
                .with_context(|| format!("dissecting {file}"))?;

            for (idx, line) in lines.iter().enumerate() {
                let record = ctx
                    .normalizer
                    .normalize(idx + 1, line)
                    .with_context(|| format!("normalizing {file}"))?;
                let prefix = ctx
                    .router
                    .route(&sensor, &record)
                    .with_context(|| format!("{file}: routing line {}", idx + 1))?;
                buffer.record(&prefix, &record);
            }
        }
        Some(doc) => {
            let mut reconciler = GlobalReconciler::new(store);
            for (idx, mut record) in doc.packets.into_iter().enumerate() {
                let annotations: Vec<(String, FieldValue)> = record
                    .iter()
                    .filter(|(name, _)| AnnotationField::is_annotation(name))
                    .map(|(name, value)| (name.to_string(), value.clone()))
                    .collect();

                for (name, local_value) in annotations {
                    let (field, id) = reconciler
                        .translate(&name, &local_value, &doc.local)
                        .await
                        .with_context(|| format!("{file}: translating {name}"))?;
                    record.insert(name, id.0);

                    let Some(field) = field.filter(|_| id.is_resolved()) else {
                        continue;
                    };
                    match record.get(field.origin_field()) {
                        Some(origin) if !origin.is_empty() => {
                            buffer.link_origin(field.kind.origin_link_key(&origin.to_string()), id.0);
                        }
                        _ => tracing::debug!(field = %field, "annotation without origin object"),
                    }
                }

                let prefix = ctx
                    .router
                    .route(&sensor, &record)
                    .with_context(|| format!("{file}: routing packet {}", idx + 1))?;
                buffer.record(&prefix, &record);
            }
            resolutions = reconciler.stats();
        }
    }

    let records = buffer.records();
    let batch = buffer.into_batch();
    let increments = batch.increments();

    record_parameters(store, &ctx.params)
        .await
        .with_context(|| format!("recording run parameters for {file}"))?;

    store
        .apply(&batch)
        .await
        .with_context(|| format!("applying batch for {file}"))?;

    Ok(FileReport {
        file: file.to_string(),
        sensor,
        records,
        increments,
        resolutions,
        elapsed: Duration::ZERO,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_derive_sensor_name() {
        assert_eq!(
            derive_sensor_name("honeypot-sensor1-00-20240101.cap.gz").as_deref(),
            Some("honeypot-sensor1-00")
        );
        assert_eq!(derive_sensor_name("cap1.cap"), None);
        assert_eq!(derive_sensor_name("a-b-c-d-e.cap"), None);
    }

    #[test]
    fn test_input_kind() {
        assert_eq!(InputKind::of(&PathBuf::from("a.cap")), Some(InputKind::Capture));
        assert_eq!(InputKind::of(&PathBuf::from("a.pcap.gz")), Some(InputKind::Capture));
        assert_eq!(InputKind::of(&PathBuf::from("a.json.gz")), Some(InputKind::Document));
        assert_eq!(InputKind::of(&PathBuf::from("a.txt")), None);
    }
}
