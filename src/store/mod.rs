//! Shared key-value store access.
//!
//! All coordination between workers goes through the primitives of the
//! [`Store`] trait: additive increments, set-if-absent registrations,
//! set membership and atomic counters. No component relies on locking.

pub mod memory;
pub mod redis;

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Result;

use crate::histogram::WriteBatch;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

/// Well-known store keys.
pub mod keys {
    /// Set of ingested file basenames.
    pub const FILES: &str = "FILES";
    /// Set of ingested `YYYYMMDD` days.
    pub const DAYS: &str = "DAYS";
    /// Set of protocol names seen in combined mode.
    pub const PROTOCOLS: &str = "PROTOCOLS";
    /// Hash of canonical run parameters.
    pub const PARAMETERS: &str = "PARAMETERS";
    /// Set of every annotation registration key.
    pub const RTK: &str = "RTK";
    /// Set of files currently claimed by a worker.
    pub const INGESTING: &str = "INGESTING";

    /// In-flight claim for one file.
    pub fn claim(file: &str) -> String {
        format!("CLAIM:{file}")
    }
}

/// Store primitives used by ingestion.
pub trait Store: Clone + Send + Sync + 'static {
    /// Returns the backend name for logging.
    fn name(&self) -> &str;

    /// Opens an independent connection for one worker.
    fn connect_worker(&self) -> impl std::future::Future<Output = Result<Self>> + Send;

    /// Applies every operation of `batch` as one unit.
    fn apply(&self, batch: &WriteBatch) -> impl std::future::Future<Output = Result<()>> + Send;

    fn is_member(
        &self,
        key: &str,
        member: &str,
    ) -> impl std::future::Future<Output = Result<bool>> + Send;

    fn members(&self, key: &str) -> impl std::future::Future<Output = Result<Vec<String>>> + Send;

    /// Adds members, returning how many were new.
    fn add_members(
        &self,
        key: &str,
        members: &[String],
    ) -> impl std::future::Future<Output = Result<u64>> + Send;

    fn remove_member(
        &self,
        key: &str,
        member: &str,
    ) -> impl std::future::Future<Output = Result<bool>> + Send;

    fn hash_get(
        &self,
        key: &str,
        field: &str,
    ) -> impl std::future::Future<Output = Result<Option<String>>> + Send;

    fn hash_get_all(
        &self,
        key: &str,
    ) -> impl std::future::Future<Output = Result<BTreeMap<String, String>>> + Send;

    /// Sets `field` only if it is absent. Returns true if this call set it.
    fn hash_set_nx(
        &self,
        key: &str,
        field: &str,
        value: &str,
    ) -> impl std::future::Future<Output = Result<bool>> + Send;

    fn hash_set_all(
        &self,
        key: &str,
        entries: &BTreeMap<String, String>,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Atomically increments a counter and returns the new value.
    fn incr(&self, key: &str) -> impl std::future::Future<Output = Result<i64>> + Send;

    fn get(&self, key: &str) -> impl std::future::Future<Output = Result<Option<String>>> + Send;

    /// Sets `key` only if it is absent, expiring after `ttl`. Returns true
    /// if this call set it.
    fn set_nx_ex(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> impl std::future::Future<Output = Result<bool>> + Send;

    /// Resets the expiry of `key` to `ttl`. Returns false if the key does
    /// not exist.
    fn expire(
        &self,
        key: &str,
        ttl: Duration,
    ) -> impl std::future::Future<Output = Result<bool>> + Send;

    fn delete(&self, key: &str) -> impl std::future::Future<Output = Result<bool>> + Send;

    /// Member scores of a sorted set.
    fn scores(
        &self,
        key: &str,
    ) -> impl std::future::Future<Output = Result<BTreeMap<String, u64>>> + Send;
}
