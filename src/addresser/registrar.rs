//! Server registration: leased heartbeats plus local role application
//!
//! `register` runs two cooperating loops until one fails or the caller
//! cancels. The announce loop leases the server's state into the store; the
//! role loop watches this server's role subtree and drives the shard engine
//! to match it. A one-slot channel carries the last version the role loop
//! has fully mounted, so the next heartbeat advertises it and the assigner
//! can retire older versions.

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::types::{decode, encode, ServerRole, ServerState};
use super::Addresser;
use crate::common::{Error, Result};
use crate::discovery::Discovery;
use crate::engine::ShardEngine;

impl<D: Discovery> Addresser<D> {
    /// Register the local server and keep it converged on its assigned
    /// roles. Runs until cancelled (returns `Cancelled`) or either loop
    /// fails; the first of {cancel, announce error, apply error} wins and
    /// tears the other loop down.
    pub async fn register<E: ShardEngine>(
        &self,
        id: &str,
        address: &str,
        engine: Arc<E>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<()> {
        info!(id, address, "registering server");
        let (version_tx, version_rx) = mpsc::channel::<i64>(1);
        let result = tokio::select! {
            res = self.announce_state(id, address, engine.clone(), version_rx) => res,
            res = self.fill_roles(id, engine, version_tx) => res,
            _ = shutdown.recv() => Err(Error::Cancelled),
        };
        match &result {
            Err(err) if err.is_cancelled() => info!(id, "register cancelled"),
            Err(err) => warn!(id, error = %err, "register failed"),
            Ok(()) => {}
        }
        result
    }

    /// Lease the server's state every `hold_ttl / 2`, or immediately when
    /// the role loop reports a newly applied version.
    async fn announce_state<E: ShardEngine>(
        &self,
        id: &str,
        address: &str,
        engine: Arc<E>,
        mut version_rx: mpsc::Receiver<i64>,
    ) -> Result<()> {
        let key = self.server_state_key(id);
        let mut state = ServerState::new(id, address);
        loop {
            state.shards = engine.local_shards().await?;
            let encoded = encode(&state)?;
            self.discovery.set(&key, &encoded, Some(self.hold_ttl)).await?;
            debug!(
                id,
                version = state.version,
                shards = state.shards.len(),
                "announced server state"
            );
            tokio::select! {
                version = version_rx.recv() => match version {
                    Some(version) => state.version = version,
                    None => return Err(Error::Internal("role loop went away".to_string())),
                },
                _ = tokio::time::sleep(self.hold_ttl / 2) => {}
            }
        }
    }

    /// Watch this server's role subtree and converge the engine on it:
    /// mount shards of newly published versions in ascending order, unmount
    /// shards only once no live version claims them.
    async fn fill_roles<E: ShardEngine>(
        &self,
        id: &str,
        engine: Arc<E>,
        version_tx: mpsc::Sender<i64>,
    ) -> Result<()> {
        let mut watch = self.discovery.watch_all(&self.server_role_key(id)).await?;
        let mut applied: BTreeMap<i64, ServerRole> = BTreeMap::new();
        loop {
            watch
                .changed()
                .await
                .map_err(|_| Error::Store("server role watch terminated".to_string()))?;
            let snapshot = watch.borrow_and_update().clone();

            let mut roles: BTreeMap<i64, ServerRole> = BTreeMap::new();
            let mut undecodable = None;
            for (key, value) in &snapshot {
                match decode::<ServerRole>(key, value) {
                    Ok(role) => {
                        roles.insert(role.version, role);
                    }
                    Err(err) => {
                        undecodable = Some(err);
                        break;
                    }
                }
            }
            if let Some(err) = undecodable {
                // a later snapshot may decode fine
                warn!(id, error = %err, "skipping undecodable role snapshot");
                continue;
            }

            // Mount new versions in ascending order. A shard already held by
            // an applied version needs no second mount.
            for (&version, role) in &roles {
                if applied.contains_key(&version) {
                    continue;
                }
                info!(
                    id,
                    version,
                    masters = role.masters.len(),
                    replicas = role.replicas.len(),
                    "applying server role"
                );
                let mut join = JoinSet::new();
                for shard in role.shards() {
                    if !contains_shard(&applied, shard) {
                        let engine = engine.clone();
                        join.spawn(async move {
                            engine
                                .add_shard(shard)
                                .await
                                .map_err(|e| Error::shard_op(shard, e))
                        });
                    }
                }
                join_all(join).await?;
                applied.insert(version, role.clone());
                if version_tx.send(version).await.is_err() {
                    return Err(Error::Internal("announce loop went away".to_string()));
                }
            }

            // Unmount shards of retired versions that no live version claims.
            // This is the handoff guarantee: a shard stays mounted while any
            // version still naming it exists.
            let mut join = JoinSet::new();
            for (version, role) in &applied {
                if roles.contains_key(version) {
                    continue;
                }
                info!(id, version = *version, "retiring server role");
                for shard in role.shards() {
                    if !contains_shard(&roles, shard) {
                        let engine = engine.clone();
                        join.spawn(async move {
                            engine
                                .remove_shard(shard)
                                .await
                                .map_err(|e| Error::shard_op(shard, e))
                        });
                    }
                }
            }
            let removed = join_all(join).await;
            applied = roles;
            removed?;
        }
    }
}

/// Does any of these roles claim `shard`?
fn contains_shard(roles: &BTreeMap<i64, ServerRole>, shard: u64) -> bool {
    roles.values().any(|role| role.has_shard(shard))
}

/// Wait for every spawned shard operation; the first error wins, the rest
/// are logged.
async fn join_all(mut join: JoinSet<Result<()>>) -> Result<()> {
    let mut first_err: Option<Error> = None;
    while let Some(joined) = join.join_next().await {
        let result = match joined {
            Ok(result) => result,
            Err(e) => Err(Error::Internal(format!("shard task panicked: {}", e))),
        };
        if let Err(err) = result {
            if first_err.is_some() {
                warn!(error = %err, "additional shard operation failure");
            } else {
                first_err = Some(err);
            }
        }
    }
    match first_err {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn role(version: i64, masters: &[u64], replicas: &[u64]) -> ServerRole {
        let mut role = ServerRole::new("a", version);
        role.masters = masters.iter().copied().collect();
        role.replicas = replicas.iter().copied().collect();
        role
    }

    #[test]
    fn test_contains_shard_spans_versions() {
        let mut roles = BTreeMap::new();
        roles.insert(0, role(0, &[1], &[2]));
        roles.insert(1, role(1, &[3], &[]));
        assert!(contains_shard(&roles, 1));
        assert!(contains_shard(&roles, 2));
        assert!(contains_shard(&roles, 3));
        assert!(!contains_shard(&roles, 4));
    }
}
