//! Discovery store abstraction
//!
//! The coordinator runs over any hierarchical key-value store that can do
//! atomic set-with-TTL, compare-and-swap, and recursive watches with
//! consistent snapshots (etcd and friends). Production deployments plug a
//! real client in behind the [`Discovery`] trait; tests and the in-process
//! local mode use [`MemoryDiscovery`].

pub mod memory;

pub use memory::MemoryDiscovery;

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::watch;

use crate::common::Result;

/// A consistent snapshot of a watched subtree: every live key under the
/// prefix mapped to its current value.
pub type Snapshot = BTreeMap<String, String>;

/// Capability set the coordinator needs from a discovery store.
///
/// Keys form a `/`-separated hierarchy. A prefix covers the key itself and
/// everything below it (`a/b` covers `a/b` and `a/b/c`, not `a/bc`).
#[async_trait]
pub trait Discovery: Send + Sync + 'static {
    /// Write a value, optionally leased. Re-setting an identical value
    /// refreshes the lease. Idempotent.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Write a value only if the key is absent. Returns whether the write
    /// happened.
    async fn create(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool>;

    /// Write a value only if the current value equals `expected`. Returns
    /// whether the write happened.
    async fn check_and_set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
        expected: &str,
    ) -> Result<bool>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn get_all(&self, prefix: &str) -> Result<Snapshot>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Watch a subtree. The receiver is primed with the current snapshot and
    /// observes a fresh snapshot after every change; intermediate snapshots
    /// may coalesce, but the latest state is always delivered. A receiver
    /// whose store side went away errors out of `changed()`; callers surface
    /// that as a non-Cancelled store error.
    async fn watch_all(&self, prefix: &str) -> Result<watch::Receiver<Snapshot>>;
}

/// Is `key` the prefix itself or inside its subtree?
pub(crate) fn key_in_prefix(key: &str, prefix: &str) -> bool {
    match key.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_in_prefix() {
        assert!(key_in_prefix("a/b", "a/b"));
        assert!(key_in_prefix("a/b/c", "a/b"));
        assert!(!key_in_prefix("a/bc", "a/b"));
        assert!(!key_in_prefix("a", "a/b"));
    }
}
