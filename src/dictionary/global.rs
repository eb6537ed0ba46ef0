use std::collections::{HashMap, HashSet};

use anyhow::{bail, Context, Result};

use crate::field::FieldValue;
use crate::store::{keys, Store};

use super::{AnnotationField, AnnotationValue, GlobalId, LocalDictionary, LocalId};

/// How a value obtained its global id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The value was already registered.
    Existing(GlobalId),
    /// This worker's candidate became canonical.
    Committed(GlobalId),
    /// Another worker registered the value first; its id was adopted and
    /// the local candidate left as a gap in the counter.
    Adopted { winner: GlobalId, discarded: GlobalId },
}

impl Resolution {
    pub fn id(self) -> GlobalId {
        match self {
            Self::Existing(id) | Self::Committed(id) => id,
            Self::Adopted { winner, .. } => winner,
        }
    }
}

/// Allocate-if-absent protocol for one `(field, value)` pair.
///
/// `Lookup -> Done(Existing)`, or `Lookup -> Propose -> Done(Committed)`,
/// or `Lookup -> Propose -> Conflict -> Done(Adopted)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationState {
    Lookup,
    Propose(GlobalId),
    Conflict { discarded: GlobalId },
    Done(Resolution),
}

/// Per-file resolution counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolutionStats {
    pub existing: u64,
    pub committed: u64,
    pub adopted: u64,
    pub unresolved: u64,
}

impl ResolutionStats {
    fn record(&mut self, resolution: Resolution) {
        match resolution {
            Resolution::Existing(_) => self.existing += 1,
            Resolution::Committed(_) => self.committed += 1,
            Resolution::Adopted { .. } => self.adopted += 1,
        }
    }
}

/// Maps local annotation values onto the store-wide numbering.
///
/// One reconciler is used per file. Its cache only short-cuts repeated
/// values within that file; the store stays authoritative.
pub struct GlobalReconciler<'a, S: Store> {
    store: &'a S,
    cache: HashMap<(AnnotationField, AnnotationValue), GlobalId>,
    registered: HashSet<String>,
    stats: ResolutionStats,
}

impl<'a, S: Store> GlobalReconciler<'a, S> {
    /// Creates a new reconciler over a worker's store connection.
    pub fn new(store: &'a S) -> Self {
        Self {
            store,
            cache: HashMap::new(),
            registered: HashSet::new(),
            stats: ResolutionStats::default(),
        }
    }

    pub fn stats(&self) -> ResolutionStats {
        self.stats
    }

    /// Resolves the global id of `value` for `field`, allocating one if the
    /// value has never been seen.
    pub async fn resolve(
        &mut self,
        field: &AnnotationField,
        value: &AnnotationValue,
    ) -> Result<Resolution> {
        let cache_key = (field.clone(), value.clone());
        if let Some(id) = self.cache.get(&cache_key) {
            return Ok(Resolution::Existing(*id));
        }

        let registration = field.registration_key();
        if !self.registered.contains(&registration) {
            self.store
                .add_members(keys::RTK, std::slice::from_ref(&registration))
                .await
                .context("registering annotation key")?;
            self.registered.insert(registration);
        }

        let mut state = AllocationState::Lookup;
        let resolution = loop {
            state = self.step(field, value, state).await?;
            if let AllocationState::Done(resolution) = state {
                break resolution;
            }
        };

        match resolution {
            Resolution::Adopted { winner, discarded } => tracing::debug!(
                field = %field,
                winner = %winner,
                discarded = %discarded,
                "lost allocation race, adopting winner",
            ),
            Resolution::Committed(id) => {
                tracing::debug!(field = %field, id = %id, "allocated annotation id")
            }
            Resolution::Existing(_) => {}
        }

        self.stats.record(resolution);
        self.cache.insert(cache_key, resolution.id());
        Ok(resolution)
    }

    /// Advances the allocation state machine by one store round-trip.
    pub async fn step(
        &self,
        field: &AnnotationField,
        value: &AnnotationValue,
        state: AllocationState,
    ) -> Result<AllocationState> {
        let registration = field.registration_key();
        match state {
            AllocationState::Lookup => {
                match self.read_id(&registration, value).await? {
                    Some(id) => Ok(AllocationState::Done(Resolution::Existing(id))),
                    None => {
                        let candidate = self
                            .store
                            .incr(&field.kind.counter_key())
                            .await
                            .context("allocating annotation id")?;
                        Ok(AllocationState::Propose(GlobalId(candidate)))
                    }
                }
            }
            AllocationState::Propose(candidate) => {
                let committed = self
                    .store
                    .hash_set_nx(&registration, value.as_str(), &candidate.to_string())
                    .await
                    .context("registering annotation value")?;
                if committed {
                    Ok(AllocationState::Done(Resolution::Committed(candidate)))
                } else {
                    Ok(AllocationState::Conflict {
                        discarded: candidate,
                    })
                }
            }
            AllocationState::Conflict { discarded } => {
                match self.read_id(&registration, value).await? {
                    Some(winner) => Ok(AllocationState::Done(Resolution::Adopted {
                        winner,
                        discarded,
                    })),
                    None => bail!(
                        "{registration}: registration of {value} vanished after conflict"
                    ),
                }
            }
            AllocationState::Done(_) => Ok(state),
        }
    }

    /// Translates the local id carried by an annotation field of a packet.
    ///
    /// Malformed field names and local ids missing from `local` resolve to
    /// [`GlobalId::UNRESOLVED`]; only store failures are errors.
    pub async fn translate(
        &mut self,
        field_name: &str,
        local_value: &FieldValue,
        local: &LocalDictionary,
    ) -> Result<(Option<AnnotationField>, GlobalId)> {
        let field = match AnnotationField::parse(field_name) {
            Ok(field) => field,
            Err(err) => {
                tracing::info!(error = %err, "unresolvable annotation reference");
                self.stats.unresolved += 1;
                return Ok((None, GlobalId::UNRESOLVED));
            }
        };

        let value = local_value
            .as_int()
            .map(LocalId)
            .and_then(|id| local.get(field.kind, id));

        let Some(value) = value else {
            tracing::info!(
                field = %field,
                local_id = %local_value,
                "local annotation id not found in dictionary",
            );
            self.stats.unresolved += 1;
            return Ok((Some(field), GlobalId::UNRESOLVED));
        };

        let value = value.clone();
        let resolution = self.resolve(&field, &value).await?;
        Ok((Some(field), resolution.id()))
    }

    async fn read_id(&self, registration: &str, value: &AnnotationValue) -> Result<Option<GlobalId>> {
        let raw = self
            .store
            .hash_get(registration, value.as_str())
            .await
            .with_context(|| format!("reading {registration}"))?;

        match raw {
            Some(raw) => {
                let id: i64 = raw
                    .parse()
                    .with_context(|| format!("{registration}: invalid id {raw:?}"))?;
                Ok(Some(GlobalId(id)))
            }
            None => Ok(None),
        }
    }
}
