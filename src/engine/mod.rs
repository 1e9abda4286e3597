//! Local shard engine contract
//!
//! The filesystem layer that actually mounts shard data and serves reads
//! and writes lives behind [`ShardEngine`]. The coordinator only drives it:
//! mount on role grant, unmount on role retirement. Calls may be
//! long-running; the coordinator treats them as blocking operations with
//! error returns.

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Mutex;

use crate::common::Result;

#[async_trait]
pub trait ShardEngine: Send + Sync + 'static {
    /// Shards currently mounted locally
    async fn local_shards(&self) -> Result<BTreeSet<u64>>;

    /// Mount a shard's data locally
    async fn add_shard(&self, shard: u64) -> Result<()>;

    /// Unmount a shard
    async fn remove_shard(&self, shard: u64) -> Result<()>;

    /// Become master for a shard (roler mode)
    async fn master(&self, shard: u64) -> Result<()>;

    /// Stop mastering a shard (roler mode)
    async fn clear(&self, shard: u64) -> Result<()>;
}

/// In-memory shard engine: tracks the mounted set and counts operations.
/// Used by the integration tests and `shardd local` mode.
#[derive(Default)]
pub struct MemoryEngine {
    state: Mutex<EngineState>,
}

#[derive(Default)]
struct EngineState {
    mounted: BTreeSet<u64>,
    adds: u64,
    removes: u64,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the mounted shard set
    pub fn mounted(&self) -> BTreeSet<u64> {
        self.state.lock().unwrap().mounted.clone()
    }

    /// Total add_shard calls observed
    pub fn add_count(&self) -> u64 {
        self.state.lock().unwrap().adds
    }

    /// Total remove_shard calls observed
    pub fn remove_count(&self) -> u64 {
        self.state.lock().unwrap().removes
    }
}

#[async_trait]
impl ShardEngine for MemoryEngine {
    async fn local_shards(&self) -> Result<BTreeSet<u64>> {
        Ok(self.mounted())
    }

    async fn add_shard(&self, shard: u64) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.mounted.insert(shard);
        state.adds += 1;
        Ok(())
    }

    async fn remove_shard(&self, shard: u64) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.mounted.remove(&shard);
        state.removes += 1;
        Ok(())
    }

    async fn master(&self, shard: u64) -> Result<()> {
        self.add_shard(shard).await
    }

    async fn clear(&self, shard: u64) -> Result<()> {
        self.remove_shard(shard).await
    }
}
