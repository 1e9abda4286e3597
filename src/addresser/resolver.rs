//! Versioned address lookups for request routing
//!
//! Addresses snapshots never mutate, so decoded versions are cached
//! indefinitely; a version is fetched from the store at most once per
//! process.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::debug;

use super::types::{decode, Addresses};
use super::Addresser;
use crate::common::{Error, Result};
use crate::discovery::Discovery;

impl<D: Discovery> Addresser<D> {
    async fn addresses(&self, version: i64) -> Result<Arc<Addresses>> {
        if let Some(addresses) = self.cache.read().unwrap().get(&version).cloned() {
            return Ok(addresses);
        }
        let key = self.addresses_key(version);
        let Some(encoded) = self.discovery.get(&key).await? else {
            return Err(Error::VersionNotFound(version));
        };
        let addresses: Arc<Addresses> = Arc::new(decode(&key, &encoded)?);
        debug!(version, "cached addresses snapshot");
        self.cache.write().unwrap().insert(version, addresses.clone());
        Ok(addresses)
    }

    /// The address serving reads and writes for `shard` under `version`.
    pub async fn get_master_address(&self, shard: u64, version: i64) -> Result<String> {
        let addresses = self.addresses(version).await?;
        let shard_addresses = addresses
            .addresses
            .get(&shard)
            .ok_or(Error::ShardNotFound { shard, version })?;
        debug!(shard, version, master = %shard_addresses.master, "resolved master address");
        Ok(shard_addresses.master.clone())
    }

    /// The addresses mirroring `shard` under `version`.
    pub async fn get_replica_addresses(&self, shard: u64, version: i64) -> Result<BTreeSet<String>> {
        let addresses = self.addresses(version).await?;
        let shard_addresses = addresses
            .addresses
            .get(&shard)
            .ok_or(Error::ShardNotFound { shard, version })?;
        debug!(shard, version, replicas = shard_addresses.replicas.len(), "resolved replica addresses");
        Ok(shard_addresses.replicas.clone())
    }

    /// Full `shard → master address` table for `version`.
    pub async fn get_shard_to_master_address(&self, version: i64) -> Result<BTreeMap<u64, String>> {
        let addresses = self.addresses(version).await?;
        Ok(addresses
            .addresses
            .iter()
            .map(|(&shard, shard_addresses)| (shard, shard_addresses.master.clone()))
            .collect())
    }

    /// Full `shard → replica addresses` table for `version`.
    pub async fn get_shard_to_replica_addresses(
        &self,
        version: i64,
    ) -> Result<BTreeMap<u64, BTreeSet<String>>> {
        let addresses = self.addresses(version).await?;
        Ok(addresses
            .addresses
            .iter()
            .map(|(&shard, shard_addresses)| (shard, shard_addresses.replicas.clone()))
            .collect())
    }
}
