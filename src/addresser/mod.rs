//! Shard-role coordination over the discovery store
//!
//! The addresser owns three duties, one per submodule:
//! - [`registrar`]: publish the local server's leased heartbeat state and
//!   apply role changes to the local shard engine
//! - [`assigner`]: the cluster singleton that watches membership and
//!   publishes versioned role assignments
//! - [`resolver`]: read-only `(shard, version) → address` lookups for
//!   request routing
//!
//! All coordination state lives in one namespace of the store:
//!
//! ```text
//! {ns}/pfs/server/state/{id}            leased ServerState heartbeats
//! {ns}/pfs/server/role/{id}/{version}   ServerRole assignments
//! {ns}/pfs/roles/{version}              immutable Addresses snapshots
//! {ns}/pfs/shard/master/{shard}         unversioned claims (roler mode)
//! ```

pub mod assigner;
pub mod registrar;
pub mod resolver;
pub mod types;

pub use types::{Addresses, ServerRole, ServerState, ShardAddresses, NEVER_ASSIGNED};

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::common::{Error, Result};
use crate::discovery::Discovery;
use crate::sharder::Sharder;
use types::decode;

pub struct Addresser<D> {
    discovery: Arc<D>,
    sharder: Sharder,
    namespace: String,
    hold_ttl: Duration,
    /// Decoded Addresses by version. Versions never mutate, so entries are
    /// immutable and the cache is never invalidated.
    cache: RwLock<HashMap<i64, Arc<Addresses>>>,
}

impl<D: Discovery> Addresser<D> {
    pub fn new(discovery: Arc<D>, sharder: Sharder, namespace: impl Into<String>, hold_ttl: Duration) -> Self {
        Self {
            discovery,
            sharder,
            namespace: namespace.into(),
            hold_ttl,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn sharder(&self) -> &Sharder {
        &self.sharder
    }

    // === Key layout ===

    fn server_dir(&self) -> String {
        format!("{}/pfs/server", self.namespace)
    }

    pub(crate) fn server_state_dir(&self) -> String {
        format!("{}/state", self.server_dir())
    }

    pub(crate) fn server_state_key(&self, id: &str) -> String {
        format!("{}/{}", self.server_state_dir(), id)
    }

    pub(crate) fn server_role_dir(&self) -> String {
        format!("{}/role", self.server_dir())
    }

    pub(crate) fn server_role_key(&self, id: &str) -> String {
        format!("{}/{}", self.server_role_dir(), id)
    }

    pub(crate) fn server_role_version_key(&self, id: &str, version: i64) -> String {
        format!("{}/{}", self.server_role_key(id), version)
    }

    pub(crate) fn addresses_dir(&self) -> String {
        format!("{}/pfs/roles", self.namespace)
    }

    pub(crate) fn addresses_key(&self, version: i64) -> String {
        format!("{}/{}", self.addresses_dir(), version)
    }

    fn shard_master_dir(&self) -> String {
        format!("{}/pfs/shard/master", self.namespace)
    }

    fn shard_master_key(&self, shard: u64) -> String {
        format!("{}/{}", self.shard_master_dir(), shard)
    }

    // === Cluster-wide observations ===

    /// The minimum assignment version any live server has applied, or `None`
    /// when no server is registered.
    pub async fn version(&self) -> Result<Option<i64>> {
        let states = self.discovery.get_all(&self.server_state_dir()).await?;
        let mut min_version: Option<i64> = None;
        for (key, value) in &states {
            let state: ServerState = decode(key, value)?;
            min_version = Some(match min_version {
                Some(min) => min.min(state.version),
                None => state.version,
            });
        }
        debug!(version = ?min_version, "observed cluster version");
        Ok(min_version)
    }

    /// Boot/test helper: resolve once every server in `ids` is registered,
    /// all report the same non-negative version, and no role entry from any
    /// other version remains. Any other snapshot is ignored.
    pub async fn wait_for_availability(
        &self,
        ids: &[String],
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<()> {
        let state_dir = self.server_state_dir();
        let role_dir = self.server_role_dir();
        let mut watch = self.discovery.watch_all(&self.server_dir()).await?;
        loop {
            tokio::select! {
                _ = shutdown.recv() => return Err(Error::Cancelled),
                changed = watch.changed() => {
                    changed.map_err(|_| Error::Store("server watch terminated".to_string()))?;
                    let snapshot = watch.borrow_and_update().clone();
                    if self.available(ids, &state_dir, &role_dir, &snapshot)? {
                        info!(servers = ids.len(), "cluster available");
                        return Ok(());
                    }
                }
            }
        }
    }

    fn available(
        &self,
        ids: &[String],
        state_dir: &str,
        role_dir: &str,
        snapshot: &crate::discovery::Snapshot,
    ) -> Result<bool> {
        let mut states: HashMap<String, ServerState> = HashMap::new();
        let mut roles: Vec<ServerRole> = Vec::new();
        for (key, value) in snapshot {
            if crate::discovery::key_in_prefix(key, state_dir) {
                let state: ServerState = decode(key, value)?;
                states.insert(state.id.clone(), state);
            } else if crate::discovery::key_in_prefix(key, role_dir) {
                roles.push(decode(key, value)?);
            }
        }
        if states.len() != ids.len() || ids.iter().any(|id| !states.contains_key(id)) {
            return Ok(false);
        }
        let mut versions = states.values().map(|state| state.version);
        let Some(first) = versions.next() else {
            return Ok(false);
        };
        if first == NEVER_ASSIGNED || versions.any(|version| version != first) {
            return Ok(false);
        }
        Ok(roles.iter().all(|role| role.version == first))
    }

    // === Unversioned master claims (roler mode) ===

    /// Current `shard → master address` map from the claim tree.
    pub async fn get_shard_to_master(&self) -> Result<HashMap<u64, String>> {
        let dir = self.shard_master_dir();
        let claims = self.discovery.get_all(&dir).await?;
        let mut result = HashMap::new();
        for (key, value) in claims {
            let shard: u64 = key
                .rsplit('/')
                .next()
                .and_then(|segment| segment.parse().ok())
                .ok_or_else(|| Error::Decode {
                    key: key.clone(),
                    reason: "claim key does not end in a shard id".to_string(),
                })?;
            result.insert(shard, value);
        }
        Ok(result)
    }

    /// Pessimistically claim a shard's master slot for `address` and hold it
    /// until the hold is lost or `shutdown` fires.
    ///
    /// A fresh claim (`stolen_from` = None) only succeeds on an open slot; a
    /// steal swaps the claim atomically against the victim's address. Returns
    /// Ok when the claim was lost or never acquired, `Cancelled` on shutdown.
    pub async fn hold_master_address(
        &self,
        shard: u64,
        address: &str,
        stolen_from: Option<&str>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<()> {
        let key = self.shard_master_key(shard);
        let ttl = Some(self.hold_ttl);
        let claimed = match stolen_from {
            None => self.discovery.create(&key, address, ttl).await?,
            Some(victim) => self.discovery.check_and_set(&key, address, ttl, victim).await?,
        };
        if !claimed {
            debug!(shard, address, "lost the race for a master claim");
            return Ok(());
        }
        info!(shard, address, stolen_from = ?stolen_from, "holding master claim");
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    // release only if still ours
                    if self.discovery.get(&key).await?.as_deref() == Some(address) {
                        self.discovery.delete(&key).await?;
                    }
                    return Err(Error::Cancelled);
                }
                _ = tokio::time::sleep(self.hold_ttl / 2) => {
                    if !self.discovery.check_and_set(&key, address, ttl, address).await? {
                        info!(shard, address, "master claim lost");
                        return Ok(());
                    }
                }
            }
        }
    }
}
