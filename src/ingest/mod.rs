//! Ingestion runs: parameter gate, file dedup guard and the worker pool.

pub mod dissector;
pub mod document;
pub mod params;
pub mod pool;
pub mod registry;
pub mod worker;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio_util::sync::CancellationToken;

use crate::export::health::HealthMetrics;
use crate::store::Store;

use self::dissector::Dissector;
use self::params::{check_parameters, GateOutcome};
use self::pool::{run_pool, IngestSummary};
use self::worker::{IngestContext, InputKind};

/// Expands `inputs` into the list of files to ingest.
///
/// Directories are walked recursively for captures and annotated documents.
/// Files named explicitly are taken as is when their extension is known.
/// Duplicate basenames are collapsed, keeping the first occurrence, since
/// the file registry is keyed by basename.
pub fn collect_inputs(inputs: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for input in inputs {
        let meta = std::fs::metadata(input)
            .with_context(|| format!("input {} not found", input.display()))?;
        if meta.is_dir() {
            walk(input, &mut files)?;
        } else if InputKind::of(input).is_some() {
            files.push(input.clone());
        } else {
            bail!("input {} is not a capture or annotated document", input.display());
        }
    }

    let mut seen = HashSet::new();
    files.retain(|path| {
        let name = path.file_name().map(|n| n.to_os_string());
        match name {
            Some(name) if seen.insert(name.clone()) => true,
            _ => {
                tracing::warn!(file = %path.display(), "duplicate input basename, ignoring");
                false
            }
        }
    });

    if files.is_empty() {
        bail!("no input files found");
    }

    Ok(files)
}

fn walk(dir: &Path, files: &mut Vec<PathBuf>) -> Result<()> {
    let mut entries: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("reading directory {}", dir.display()))?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<std::io::Result<_>>()
        .with_context(|| format!("reading directory {}", dir.display()))?;
    entries.sort();

    for path in entries {
        if path.is_dir() {
            walk(&path, files)?;
        } else if InputKind::of(&path).is_some() {
            files.push(path);
        }
    }
    Ok(())
}

/// Runs one ingestion: the parameter gate first, then every file through
/// the worker pool.
///
/// A parameter mismatch fails the whole run before any file is touched.
pub async fn ingest<S: Store, D: Dissector>(
    store: S,
    dissector: Arc<D>,
    ctx: Arc<IngestContext>,
    files: Vec<PathBuf>,
    workers: usize,
    cancel: CancellationToken,
    metrics: Option<Arc<HealthMetrics>>,
) -> Result<IngestSummary> {
    match check_parameters(&store, &ctx.params).await? {
        GateOutcome::Uninitialized => {
            tracing::info!(
                mode = %ctx.params.mode,
                strategy = %ctx.params.strategy.label(),
                "new store instance, run parameters are recorded with the first ingested file",
            );
        }
        GateOutcome::Matched { warnings } => {
            tracing::debug!(warnings = warnings.len(), "run parameters match");
        }
    }

    Ok(run_pool(ctx, store, dissector, files, workers, cancel, metrics).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collect_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("2024").join("01");
        std::fs::create_dir_all(&nested).unwrap();
        for name in ["a-s-0-20240101.cap.gz", "notes.txt", "b.json"] {
            std::fs::write(nested.join(name), b"").unwrap();
        }
        std::fs::write(dir.path().join("c.pcap"), b"").unwrap();

        let files = collect_inputs(&[dir.path().to_path_buf()]).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["a-s-0-20240101.cap.gz", "b.json", "c.pcap"]);
    }

    #[test]
    fn test_collect_inputs_dedups_basenames() {
        let dir = tempfile::tempdir().unwrap();
        let other = dir.path().join("other");
        std::fs::create_dir(&other).unwrap();
        std::fs::write(dir.path().join("cap1.cap"), b"").unwrap();
        std::fs::write(other.join("cap1.cap"), b"").unwrap();

        let files = collect_inputs(&[dir.path().join("cap1.cap"), other]).unwrap();
        assert_eq!(files, vec![dir.path().join("cap1.cap")]);
    }

    #[test]
    fn test_collect_inputs_errors() {
        let dir = tempfile::tempdir().unwrap();
        assert!(collect_inputs(&[dir.path().to_path_buf()]).is_err());
        assert!(collect_inputs(&[dir.path().join("missing.cap")]).is_err());

        let txt = dir.path().join("notes.txt");
        std::fs::write(&txt, b"").unwrap();
        assert!(collect_inputs(&[txt]).is_err());
    }
}
