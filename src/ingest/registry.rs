//! File dedup guard.
//!
//! `FILES` holds every file that was fully committed. An expiring
//! `CLAIM:<file>` key keeps two concurrent workers from both ingesting the
//! same file; a worker that dies leaves the claim to expire and the file
//! retryable.

use std::time::Duration;

use anyhow::{Context, Result};

use crate::store::{keys, Store};

/// Outcome of asking to ingest one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The caller holds the claim and must commit or release it.
    Claimed,
    /// The file was already ingested. Nothing was written.
    AlreadyImported,
    /// Another worker holds the claim. Nothing was written.
    ClaimedElsewhere,
}

/// Registry of ingested files for one worker.
pub struct FileRegistry<'a, S: Store> {
    store: &'a S,
    owner: String,
    claim_ttl: Duration,
}

impl<'a, S: Store> FileRegistry<'a, S> {
    /// Creates a new registry view. `owner` identifies the claiming worker.
    pub fn new(store: &'a S, owner: impl Into<String>, claim_ttl: Duration) -> Self {
        Self {
            store,
            owner: owner.into(),
            claim_ttl,
        }
    }

    /// Checks the registry and claims `file` if it is neither ingested nor
    /// claimed.
    pub async fn admit(&self, file: &str) -> Result<Admission> {
        if self.is_imported(file).await? {
            return Ok(Admission::AlreadyImported);
        }

        let claimed = self
            .store
            .set_nx_ex(&keys::claim(file), &self.owner, self.claim_ttl)
            .await
            .with_context(|| format!("claiming {file}"))?;
        if !claimed {
            return Ok(Admission::ClaimedElsewhere);
        }

        // A worker may have committed and released between the two checks.
        if self.is_imported(file).await? {
            self.store
                .delete(&keys::claim(file))
                .await
                .with_context(|| format!("releasing claim on {file}"))?;
            return Ok(Admission::AlreadyImported);
        }

        self.store
            .add_members(keys::INGESTING, &[file.to_string()])
            .await
            .with_context(|| format!("marking {file} as ingesting"))?;

        Ok(Admission::Claimed)
    }

    pub async fn is_imported(&self, file: &str) -> Result<bool> {
        self.store
            .is_member(keys::FILES, file)
            .await
            .with_context(|| format!("checking registry for {file}"))
    }

    /// Registers `file` as ingested and releases the claim. Only called
    /// once the file's batch has been applied.
    pub async fn commit(&self, file: &str) -> Result<()> {
        self.store
            .add_members(keys::FILES, &[file.to_string()])
            .await
            .with_context(|| format!("registering {file}"))?;
        self.release(file).await
    }

    /// Extends this worker's claim on `file` by the claim TTL. Returns false
    /// if the claim expired or is now held by another worker.
    pub async fn renew(&self, file: &str) -> Result<bool> {
        let claim = keys::claim(file);
        let holder = self
            .store
            .get(&claim)
            .await
            .with_context(|| format!("reading claim on {file}"))?;
        if holder.as_deref() != Some(self.owner.as_str()) {
            return Ok(false);
        }
        self.store
            .expire(&claim, self.claim_ttl)
            .await
            .with_context(|| format!("renewing claim on {file}"))
    }

    /// Drops the claim on `file` without registering it.
    pub async fn release(&self, file: &str) -> Result<()> {
        let claim = keys::claim(file);
        let holder = self
            .store
            .get(&claim)
            .await
            .with_context(|| format!("reading claim on {file}"))?;
        if holder.as_deref() == Some(self.owner.as_str()) {
            self.store
                .delete(&claim)
                .await
                .with_context(|| format!("releasing claim on {file}"))?;
        } else {
            tracing::warn!(file, "claim expired or taken over before release");
        }
        self.store
            .remove_member(keys::INGESTING, file)
            .await
            .with_context(|| format!("unmarking {file}"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryState;
    use crate::store::MemoryStore;

    const TTL: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn test_claim_commit_then_already_imported() {
        let store = MemoryStore::new();
        let registry = FileRegistry::new(&store, "w1", TTL);

        assert_eq!(registry.admit("cap1").await.unwrap(), Admission::Claimed);
        assert!(store.is_member(keys::INGESTING, "cap1").await.unwrap());
        registry.commit("cap1").await.unwrap();

        assert!(store.is_member(keys::FILES, "cap1").await.unwrap());
        assert!(store.get(&keys::claim("cap1")).await.unwrap().is_none());
        assert!(store.members(keys::INGESTING).await.unwrap().is_empty());

        let before = store.snapshot();
        assert_eq!(
            registry.admit("cap1").await.unwrap(),
            Admission::AlreadyImported
        );
        assert_eq!(store.snapshot(), before);
    }

    #[tokio::test]
    async fn test_second_worker_sees_claim() {
        let store = MemoryStore::new();
        let first = FileRegistry::new(&store, "w1", TTL);
        let second = FileRegistry::new(&store, "w2", TTL);

        assert_eq!(first.admit("cap1").await.unwrap(), Admission::Claimed);
        let before = store.snapshot();
        assert_eq!(
            second.admit("cap1").await.unwrap(),
            Admission::ClaimedElsewhere
        );
        assert_eq!(store.snapshot(), before);
    }

    #[tokio::test]
    async fn test_renew_keeps_claim_alive() {
        let store = MemoryStore::new();
        let ttl = Duration::from_millis(300);
        let registry = FileRegistry::new(&store, "w1", ttl);

        assert_eq!(registry.admit("cap1").await.unwrap(), Admission::Claimed);
        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(150)).await;
            assert!(registry.renew("cap1").await.unwrap());
        }
        assert_eq!(
            store.get(&keys::claim("cap1")).await.unwrap().as_deref(),
            Some("w1")
        );
    }

    #[tokio::test]
    async fn test_renew_fails_after_takeover() {
        let store = MemoryStore::new();
        let first = FileRegistry::new(&store, "w1", Duration::from_millis(50));
        let second = FileRegistry::new(&store, "w2", TTL);

        assert_eq!(first.admit("cap1").await.unwrap(), Admission::Claimed);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(second.admit("cap1").await.unwrap(), Admission::Claimed);

        assert!(!first.renew("cap1").await.unwrap());
        assert_eq!(
            store.get(&keys::claim("cap1")).await.unwrap().as_deref(),
            Some("w2")
        );
    }

    #[tokio::test]
    async fn test_release_leaves_file_retryable() {
        let store = MemoryStore::new();
        let registry = FileRegistry::new(&store, "w1", TTL);

        assert_eq!(registry.admit("cap1").await.unwrap(), Admission::Claimed);
        registry.release("cap1").await.unwrap();
        assert!(!registry.is_imported("cap1").await.unwrap());
        assert_eq!(store.snapshot(), MemoryState::default());

        assert_eq!(registry.admit("cap1").await.unwrap(), Admission::Claimed);
    }
}
