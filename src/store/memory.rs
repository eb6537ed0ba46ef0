use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use parking_lot::Mutex;

use crate::histogram::{WriteBatch, WriteOp};

use super::Store;

/// Contents of a [`MemoryStore`], comparable for before/after assertions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryState {
    pub sets: BTreeMap<String, BTreeSet<String>>,
    pub hashes: BTreeMap<String, BTreeMap<String, String>>,
    pub strings: BTreeMap<String, String>,
    pub sorted_sets: BTreeMap<String, BTreeMap<String, u64>>,
    expiry: BTreeMap<String, Instant>,
}

impl MemoryState {
    fn purge_expired(&mut self, key: &str) {
        if let Some(deadline) = self.expiry.get(key) {
            if *deadline <= Instant::now() {
                self.expiry.remove(key);
                self.strings.remove(key);
            }
        }
    }

    /// Fails when `key` already holds a value of another type, like a
    /// `WRONGTYPE` reply.
    fn check_type(&self, key: &str, want: &str) -> Result<()> {
        let holders = [
            ("set", self.sets.contains_key(key)),
            ("hash", self.hashes.contains_key(key)),
            ("string", self.strings.contains_key(key)),
            ("zset", self.sorted_sets.contains_key(key)),
        ];
        if let Some((kind, _)) = holders.iter().find(|(kind, held)| *held && *kind != want) {
            bail!("key {key} holds a {kind}, not a {want}");
        }
        Ok(())
    }

    fn apply_op(&mut self, op: &WriteOp) {
        match op {
            WriteOp::SetAdd { key, members } => {
                self.sets
                    .entry(key.clone())
                    .or_default()
                    .extend(members.iter().cloned());
            }
            WriteOp::IncrementBy {
                key,
                member,
                amount,
            } => {
                *self
                    .sorted_sets
                    .entry(key.clone())
                    .or_default()
                    .entry(member.clone())
                    .or_insert(0) += amount;
            }
            WriteOp::SetValue { key, value } => {
                self.expiry.remove(key);
                self.strings.insert(key.clone(), value.clone());
            }
        }
    }
}

/// In-process store with the same semantics as [`super::RedisStore`].
///
/// Every primitive takes the lock once. Operations yield to the scheduler
/// first so that concurrent workers interleave between primitives the way
/// they would against a remote store.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    /// Creates a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the current contents.
    pub fn snapshot(&self) -> MemoryState {
        self.state.lock().clone()
    }
}

impl Store for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn connect_worker(&self) -> Result<Self> {
        Ok(self.clone())
    }

    async fn apply(&self, batch: &WriteBatch) -> Result<()> {
        tokio::task::yield_now().await;
        let mut state = self.state.lock();
        for op in batch.ops() {
            let (key, want) = match op {
                WriteOp::SetAdd { key, .. } => (key, "set"),
                WriteOp::IncrementBy { key, .. } => (key, "zset"),
                WriteOp::SetValue { key, .. } => (key, "string"),
            };
            state.check_type(key, want)?;
        }
        for op in batch.ops() {
            state.apply_op(op);
        }
        Ok(())
    }

    async fn is_member(&self, key: &str, member: &str) -> Result<bool> {
        tokio::task::yield_now().await;
        let state = self.state.lock();
        Ok(state.sets.get(key).is_some_and(|s| s.contains(member)))
    }

    async fn members(&self, key: &str) -> Result<Vec<String>> {
        tokio::task::yield_now().await;
        let state = self.state.lock();
        Ok(state
            .sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn add_members(&self, key: &str, members: &[String]) -> Result<u64> {
        tokio::task::yield_now().await;
        let mut state = self.state.lock();
        state.check_type(key, "set")?;
        let set = state.sets.entry(key.to_string()).or_default();
        let added = members.iter().filter(|m| set.insert((*m).clone())).count();
        Ok(added as u64)
    }

    async fn remove_member(&self, key: &str, member: &str) -> Result<bool> {
        tokio::task::yield_now().await;
        let mut state = self.state.lock();
        let Some(set) = state.sets.get_mut(key) else {
            return Ok(false);
        };
        let removed = set.remove(member);
        if set.is_empty() {
            state.sets.remove(key);
        }
        Ok(removed)
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>> {
        tokio::task::yield_now().await;
        let state = self.state.lock();
        Ok(state.hashes.get(key).and_then(|h| h.get(field)).cloned())
    }

    async fn hash_get_all(&self, key: &str) -> Result<BTreeMap<String, String>> {
        tokio::task::yield_now().await;
        let state = self.state.lock();
        Ok(state.hashes.get(key).cloned().unwrap_or_default())
    }

    async fn hash_set_nx(&self, key: &str, field: &str, value: &str) -> Result<bool> {
        tokio::task::yield_now().await;
        let mut state = self.state.lock();
        state.check_type(key, "hash")?;
        let hash = state.hashes.entry(key.to_string()).or_default();
        if hash.contains_key(field) {
            return Ok(false);
        }
        hash.insert(field.to_string(), value.to_string());
        Ok(true)
    }

    async fn hash_set_all(&self, key: &str, entries: &BTreeMap<String, String>) -> Result<()> {
        tokio::task::yield_now().await;
        if entries.is_empty() {
            return Ok(());
        }
        let mut state = self.state.lock();
        state.check_type(key, "hash")?;
        state
            .hashes
            .entry(key.to_string())
            .or_default()
            .extend(entries.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        tokio::task::yield_now().await;
        let mut state = self.state.lock();
        state.purge_expired(key);
        state.check_type(key, "string")?;
        let current = match state.strings.get(key) {
            Some(v) => match v.parse::<i64>() {
                Ok(n) => n,
                Err(_) => bail!("value at {key} is not an integer"),
            },
            None => 0,
        };
        let next = current + 1;
        state.strings.insert(key.to_string(), next.to_string());
        Ok(next)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        tokio::task::yield_now().await;
        let mut state = self.state.lock();
        state.purge_expired(key);
        Ok(state.strings.get(key).cloned())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        tokio::task::yield_now().await;
        let mut state = self.state.lock();
        state.purge_expired(key);
        state.check_type(key, "string")?;
        if state.strings.contains_key(key) {
            return Ok(false);
        }
        state.strings.insert(key.to_string(), value.to_string());
        state.expiry.insert(key.to_string(), Instant::now() + ttl);
        Ok(true)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        tokio::task::yield_now().await;
        let mut state = self.state.lock();
        state.purge_expired(key);
        if !state.strings.contains_key(key) {
            return Ok(false);
        }
        state.expiry.insert(key.to_string(), Instant::now() + ttl);
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        tokio::task::yield_now().await;
        let mut state = self.state.lock();
        state.expiry.remove(key);
        let removed = state.sets.remove(key).is_some()
            | state.hashes.remove(key).is_some()
            | state.strings.remove(key).is_some()
            | state.sorted_sets.remove(key).is_some();
        Ok(removed)
    }

    async fn scores(&self, key: &str) -> Result<BTreeMap<String, u64>> {
        tokio::task::yield_now().await;
        let state = self.state.lock();
        Ok(state.sorted_sets.get(key).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_hash_set_nx_only_once() {
        let store = MemoryStore::new();
        assert!(store.hash_set_nx("RT_a_13_ipsrc", "AS1", "1").await.unwrap());
        assert!(!store.hash_set_nx("RT_a_13_ipsrc", "AS1", "2").await.unwrap());
        assert_eq!(
            store.hash_get("RT_a_13_ipsrc", "AS1").await.unwrap().as_deref(),
            Some("1")
        );
    }

    #[tokio::test]
    async fn test_incr_counts_from_one() {
        let store = MemoryStore::new();
        assert_eq!(store.incr("RTI_13").await.unwrap(), 1);
        assert_eq!(store.incr("RTI_13").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_apply_batch() {
        let store = MemoryStore::new();
        let mut batch = WriteBatch::new();
        batch.set_add("DAYS", vec!["20240101".to_string()]);
        batch.increment_by("s:20240101:dport", "80", 2);
        batch.increment_by("s:20240101:dport", "80", 1);
        batch.set_value("AR_13_10.0.0.1", "1");
        store.apply(&batch).await.unwrap();

        let scores = store.scores("s:20240101:dport").await.unwrap();
        assert_eq!(scores.get("80"), Some(&3));
        assert!(store.is_member("DAYS", "20240101").await.unwrap());
        assert_eq!(store.get("AR_13_10.0.0.1").await.unwrap().as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_apply_rejects_wrong_type_without_partial_writes() {
        let store = MemoryStore::new();
        store.hash_set_nx("DAYS", "x", "y").await.unwrap();
        let before = store.snapshot();

        let mut batch = WriteBatch::new();
        batch.increment_by("s:20240101:dport", "80", 1);
        batch.set_add("DAYS", vec!["20240101".to_string()]);
        assert!(store.apply(&batch).await.is_err());
        assert_eq!(store.snapshot(), before);
    }

    #[tokio::test]
    async fn test_set_nx_ex_expires() {
        let store = MemoryStore::new();
        assert!(store
            .set_nx_ex("CLAIM:a", "w1", Duration::from_millis(20))
            .await
            .unwrap());
        assert!(!store
            .set_nx_ex("CLAIM:a", "w2", Duration::from_secs(5))
            .await
            .unwrap());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(store
            .set_nx_ex("CLAIM:a", "w2", Duration::from_secs(5))
            .await
            .unwrap());
        assert_eq!(store.get("CLAIM:a").await.unwrap().as_deref(), Some("w2"));
    }

    #[tokio::test]
    async fn test_remove_last_member_drops_key() {
        let store = MemoryStore::new();
        store
            .add_members("INGESTING", &["a".to_string()])
            .await
            .unwrap();
        assert!(store.remove_member("INGESTING", "a").await.unwrap());
        assert!(store.members("INGESTING").await.unwrap().is_empty());
        assert_eq!(store.snapshot(), MemoryState::default());
    }
}
