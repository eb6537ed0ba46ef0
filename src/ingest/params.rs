//! Run parameters and the consistency gate that guards a store instance
//! against mixing incompatible datasets.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Context, Result};
use thiserror::Error;

use crate::config::Config;
use crate::field::catalog::{self, FieldSpec};
use crate::field::strategy::ParseStrategy;
use crate::route::KeyMode;
use crate::store::{keys, Store};

pub const FILTER: &str = "tshark_filter";
pub const FIELDS: &str = "fields";
pub const COMBINED_KEYS: &str = "ck";
pub const STRATEGY: &str = "strategy";
pub const LOG_LEVEL: &str = "log_level";

/// A run parameter that disagrees with the one recorded for the store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{parameter} mismatch: this run uses {incoming:?} but the store instance was initialized with {stored:?}")]
pub struct ParameterMismatch {
    pub parameter: &'static str,
    pub incoming: String,
    pub stored: String,
}

/// Immutable parameters of one ingestion run, shared by every worker.
#[derive(Debug, Clone)]
pub struct RunParameters {
    pub display_filter: String,
    pub fields: Vec<&'static FieldSpec>,
    pub mode: KeyMode,
    pub strategy: ParseStrategy,
    pub log_level: String,
}

impl RunParameters {
    /// Creates run parameters, selecting the parse strategy for `fields`.
    pub fn new(
        display_filter: impl Into<String>,
        fields: Vec<&'static FieldSpec>,
        mode: KeyMode,
        log_level: impl Into<String>,
    ) -> Self {
        let strategy = ParseStrategy::for_fields(&fields);
        Self {
            display_filter: display_filter.into(),
            fields,
            mode,
            strategy,
            log_level: log_level.into(),
        }
    }

    pub fn from_config(cfg: &Config) -> Result<Self> {
        let fields = catalog::resolve_filter(&cfg.ingest.field_filter)
            .context("resolving field filter")?;
        Ok(Self::new(
            cfg.display_filter(),
            fields,
            KeyMode::from_flag(cfg.ingest.combined_keys),
            cfg.log_level.clone(),
        ))
    }

    /// Dissector field names, in extraction order.
    pub fn dissector_fields(&self) -> Vec<&'static str> {
        self.fields.iter().map(|f| f.dissector).collect()
    }

    /// Field names of the normalized records this run produces.
    pub fn record_fields(&self) -> Vec<&'static str> {
        self.strategy.record_fields(&self.fields)
    }

    fn critical(&self) -> [(&'static str, String); 3] {
        [
            (FILTER, self.display_filter.clone()),
            (FIELDS, self.dissector_fields().join(" ")),
            (COMBINED_KEYS, self.mode.as_str().to_string()),
        ]
    }

    fn non_critical(&self) -> [(&'static str, String); 2] {
        [
            (STRATEGY, self.strategy.label()),
            (LOG_LEVEL, self.log_level.clone()),
        ]
    }
}

/// Result of a successful gate check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateOutcome {
    /// The store holds no parameters yet. They are recorded by the first
    /// file that is ingested successfully.
    Uninitialized,
    /// The critical parameters match. Non-critical differences are listed.
    Matched { warnings: Vec<String> },
}

/// Compares `params` against the store's canonical parameters.
///
/// Read-only: critical mismatches fail with [`ParameterMismatch`] and
/// nothing is written either way. See [`record_parameters`].
pub async fn check_parameters<S: Store>(store: &S, params: &RunParameters) -> Result<GateOutcome> {
    let stored = store
        .hash_get_all(keys::PARAMETERS)
        .await
        .context("reading run parameters")?;
    compare_critical(&stored, params)?;

    if stored.is_empty() {
        return Ok(GateOutcome::Uninitialized);
    }

    let mut warnings = Vec::new();
    for (name, value) in params.non_critical() {
        if let Some(previous) = stored.get(name).filter(|p| **p != value) {
            tracing::warn!(
                parameter = name,
                incoming = %value,
                stored = %previous,
                "non-critical run parameter differs",
            );
            warnings.push(format!("{name}: {value} (stored {previous})"));
        }
    }

    Ok(GateOutcome::Matched { warnings })
}

/// Records `params` as the store's canonical parameters where absent.
///
/// Called by a worker once its file is fully processed and before the
/// file's batch is applied, so only a successful ingestion initializes a
/// store instance. Fields are written with set-if-absent and re-read, so
/// two first runs racing each other agree on one record and the loser
/// fails with [`ParameterMismatch`] before writing its batch. Returns true
/// if this call wrote anything.
pub async fn record_parameters<S: Store>(store: &S, params: &RunParameters) -> Result<bool> {
    let stored = store
        .hash_get_all(keys::PARAMETERS)
        .await
        .context("reading run parameters")?;
    compare_critical(&stored, params)?;

    let mut written = false;
    for (name, value) in params.critical().into_iter().chain(params.non_critical()) {
        if !stored.contains_key(name) {
            written |= store
                .hash_set_nx(keys::PARAMETERS, name, &value)
                .await
                .with_context(|| format!("recording run parameter {name}"))?;
        }
    }

    if written {
        let recorded = store
            .hash_get_all(keys::PARAMETERS)
            .await
            .context("re-reading run parameters")?;
        compare_critical(&recorded, params)?;

        tracing::info!(
            filter = %params.display_filter,
            mode = %params.mode,
            fields = params.fields.len(),
            "recorded run parameters",
        );
    }

    Ok(written)
}

fn compare_critical(
    stored: &BTreeMap<String, String>,
    params: &RunParameters,
) -> Result<(), ParameterMismatch> {
    for (name, incoming) in params.critical() {
        let Some(previous) = stored.get(name) else {
            continue;
        };
        let equal = match name {
            FIELDS => as_set(previous) == as_set(&incoming),
            COMBINED_KEYS => previous.parse::<KeyMode>().ok() == Some(params.mode),
            _ => *previous == incoming,
        };
        if !equal {
            return Err(ParameterMismatch {
                parameter: name,
                incoming,
                stored: previous.clone(),
            });
        }
    }
    Ok(())
}

fn as_set(fields: &str) -> BTreeSet<&str> {
    fields.split_whitespace().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryState;
    use crate::store::MemoryStore;

    fn params(filter: &str, fields: &[&str], mode: KeyMode) -> RunParameters {
        let fields: Vec<String> = fields.iter().map(|s| s.to_string()).collect();
        RunParameters::new(
            filter,
            catalog::resolve_filter(&fields).unwrap(),
            mode,
            "info",
        )
    }

    #[tokio::test]
    async fn test_gate_on_empty_store_writes_nothing() {
        let store = MemoryStore::new();
        let p = params("F1", &["ip.src"], KeyMode::Plain);
        assert_eq!(
            check_parameters(&store, &p).await.unwrap(),
            GateOutcome::Uninitialized
        );
        assert_eq!(store.snapshot(), MemoryState::default());
    }

    #[tokio::test]
    async fn test_record_initializes_once() {
        let store = MemoryStore::new();
        let p = params("F1", &["ip.src"], KeyMode::Plain);
        assert!(record_parameters(&store, &p).await.unwrap());
        assert!(!record_parameters(&store, &p).await.unwrap());

        let stored = store.hash_get_all(keys::PARAMETERS).await.unwrap();
        assert_eq!(stored[FILTER], "F1");
        assert_eq!(stored[FIELDS], "frame.time_epoch ip.proto ip.src");
        assert_eq!(stored[COMBINED_KEYS], "false");
        assert!(stored.contains_key(STRATEGY));
        assert_eq!(stored[LOG_LEVEL], "info");
    }

    #[tokio::test]
    async fn test_record_rejects_racing_first_run() {
        let store = MemoryStore::new();
        record_parameters(&store, &params("F1", &["ip.src"], KeyMode::Plain))
            .await
            .unwrap();

        let err = record_parameters(&store, &params("F2", &["ip.src"], KeyMode::Plain))
            .await
            .unwrap_err();
        assert_eq!(err.downcast_ref::<ParameterMismatch>().unwrap().parameter, FILTER);
    }

    #[tokio::test]
    async fn test_matching_run_passes() {
        let store = MemoryStore::new();
        let p = params("F1", &["ip.src", "ip.dst"], KeyMode::Combined);
        record_parameters(&store, &p).await.unwrap();

        let reordered = params("F1", &["ip.dst", "ip.src"], KeyMode::Combined);
        assert_eq!(
            check_parameters(&store, &reordered).await.unwrap(),
            GateOutcome::Matched {
                warnings: Vec::new()
            }
        );
    }

    #[tokio::test]
    async fn test_filter_mismatch_is_rejected_without_writes() {
        let store = MemoryStore::new();
        record_parameters(&store, &params("F1", &["ip.src"], KeyMode::Plain))
            .await
            .unwrap();
        let before = store.snapshot();

        let err = check_parameters(&store, &params("F2", &["ip.src"], KeyMode::Plain))
            .await
            .unwrap_err();
        let mismatch = err.downcast_ref::<ParameterMismatch>().unwrap();
        assert_eq!(mismatch.parameter, FILTER);
        assert_eq!(mismatch.incoming, "F2");
        assert_eq!(mismatch.stored, "F1");
        assert_eq!(store.snapshot(), before);
    }

    #[tokio::test]
    async fn test_field_and_mode_mismatch() {
        let store = MemoryStore::new();
        record_parameters(&store, &params("F1", &["ip.src"], KeyMode::Plain))
            .await
            .unwrap();

        let err = check_parameters(&store, &params("F1", &["ip.dst"], KeyMode::Plain))
            .await
            .unwrap_err();
        assert_eq!(err.downcast_ref::<ParameterMismatch>().unwrap().parameter, FIELDS);

        let err = check_parameters(&store, &params("F1", &["ip.src"], KeyMode::Combined))
            .await
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<ParameterMismatch>().unwrap().parameter,
            COMBINED_KEYS
        );
    }

    #[tokio::test]
    async fn test_non_critical_difference_warns() {
        let store = MemoryStore::new();
        record_parameters(&store, &params("F1", &["ip.src"], KeyMode::Plain))
            .await
            .unwrap();

        let mut verbose = params("F1", &["ip.src"], KeyMode::Plain);
        verbose.log_level = "debug".to_string();
        match check_parameters(&store, &verbose).await.unwrap() {
            GateOutcome::Matched { warnings } => {
                assert_eq!(warnings.len(), 1);
                assert!(warnings[0].starts_with(LOG_LEVEL));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }
}
