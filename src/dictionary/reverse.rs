//! Global id to value index.
//!
//! Building the index reads every registration hash and rewrites the
//! matching `TR_a_*` hash. It must only run while no worker is ingesting.

use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};

use crate::store::{keys, Store};

use super::{AnnotationField, AnnotationKind, GlobalId};

const REGISTRATION_PREFIX: &str = "RT_a_";

/// Outcome of a reverse index build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReverseReport {
    pub keys: usize,
    pub entries: usize,
}

/// Builds `TR_a_*` from every `RT_a_*` key listed in `RTK`.
///
/// Refuses to run while files are being ingested unless `force` is set.
pub async fn build_reverse_index<S: Store>(store: &S, force: bool) -> Result<ReverseReport> {
    let active = store
        .members(keys::INGESTING)
        .await
        .context("reading active ingestions")?;
    if !active.is_empty() {
        if !force {
            bail!(
                "{} file(s) are being ingested ({}); rerun when idle or pass --force",
                active.len(),
                active.join(", ")
            );
        }
        tracing::warn!(active = active.len(), "building reverse index during ingestion");
    }

    let mut registrations = store
        .members(keys::RTK)
        .await
        .context("reading annotation key registry")?;
    registrations.sort();

    let mut report = ReverseReport::default();
    for registration in registrations {
        let Some(field) = registration
            .strip_prefix(REGISTRATION_PREFIX)
            .and_then(|rest| AnnotationField::parse(&format!("a_{rest}")).ok())
        else {
            tracing::warn!(key = %registration, "skipping malformed registration key");
            continue;
        };

        let forward = store
            .hash_get_all(&registration)
            .await
            .with_context(|| format!("reading {registration}"))?;
        let reverse: BTreeMap<String, String> =
            forward.into_iter().map(|(value, id)| (id, value)).collect();

        store
            .hash_set_all(&field.reverse_key(), &reverse)
            .await
            .with_context(|| format!("writing {}", field.reverse_key()))?;

        tracing::debug!(key = %field.reverse_key(), entries = reverse.len(), "reverse index written");
        report.keys += 1;
        report.entries += reverse.len();
    }

    Ok(report)
}

/// One annotation known about an object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginAnnotation {
    pub kind: AnnotationKind,
    pub field: String,
    pub id: GlobalId,
    /// `None` when the reverse index has not been built for this id yet.
    pub value: Option<String>,
}

/// Returns what is known about `origin` (e.g. an IP address) across every
/// annotation kind.
pub async fn annotations_for<S: Store>(store: &S, origin: &str) -> Result<Vec<OriginAnnotation>> {
    let mut registrations = store
        .members(keys::RTK)
        .await
        .context("reading annotation key registry")?;
    registrations.sort();

    let mut out = Vec::new();
    for kind in AnnotationKind::all() {
        let link = kind.origin_link_key(origin);
        let Some(raw) = store
            .get(&link)
            .await
            .with_context(|| format!("reading {link}"))?
        else {
            continue;
        };
        let id = GlobalId(
            raw.parse()
                .with_context(|| format!("{link}: invalid id {raw:?}"))?,
        );
        if !id.is_resolved() {
            continue;
        }

        let fields = registrations
            .iter()
            .filter_map(|r| r.strip_prefix(REGISTRATION_PREFIX))
            .filter_map(|rest| AnnotationField::parse(&format!("a_{rest}")).ok())
            .filter(|f| f.kind == *kind);

        let mut found = false;
        for field in fields {
            let value = store
                .hash_get(&field.reverse_key(), &id.to_string())
                .await
                .with_context(|| format!("reading {}", field.reverse_key()))?;
            if let Some(value) = value {
                found = true;
                out.push(OriginAnnotation {
                    kind: *kind,
                    field: field.to_string(),
                    id,
                    value: Some(value),
                });
            }
        }

        if !found {
            tracing::info!(link = %link, "no reverse entry, reverse index not built?");
            out.push(OriginAnnotation {
                kind: *kind,
                field: String::new(),
                id,
                value: None,
            });
        }
    }

    Ok(out)
}
