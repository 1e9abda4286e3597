//! Role assignment: the cluster-singleton placement loop
//!
//! Watches the server state tree; every membership change produces a new
//! numbered assignment. Placement prefers wherever a shard already lives
//! (prior master, prior replicas, any server reporting the shard mounted)
//! before falling back to any server, so a single join or leave moves at
//! most `ceil(num_shards / servers)` masters.
//!
//! Per-server budgets are `num_shards / servers` masters (and the
//! replica-weighted analogue) with the division remainder handed out
//! first-come: a server sitting exactly at the budget may take one more
//! role while remainder lasts. The arithmetic admits budget+1 for such a
//! server; the balance invariant (max - min <= 1) still holds.

use std::collections::HashMap;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::types::{decode, encode, Addresses, ServerRole, ServerState, ShardAddresses};
use super::Addresser;
use crate::common::{Error, Result};
use crate::discovery::{Discovery, Snapshot};

/// The assigner's process-local memory between snapshots. Lost on restart;
/// the version counter resumes from the store instead.
struct AssignMemory {
    version: i64,
    old_servers: HashMap<String, ServerState>,
    old_masters: HashMap<u64, String>,
    old_replicas: HashMap<u64, Vec<String>>,
    old_min_version: i64,
}

impl<D: Discovery> Addresser<D> {
    /// Run the assignment loop until cancelled or the store fails. At most
    /// one assigner is expected per cluster; election is the supervisor's
    /// concern. A second assigner is wasteful but safe: every write it
    /// would make is an idempotent label.
    pub async fn assign_roles(&self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let mut memory = AssignMemory {
            version: self.next_unpublished_version().await?,
            old_servers: HashMap::new(),
            old_masters: HashMap::new(),
            old_replicas: HashMap::new(),
            old_min_version: 0,
        };
        info!(version = memory.version, "assigner starting");
        let mut watch = self.discovery.watch_all(&self.server_state_dir()).await?;
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("assigner cancelled");
                    return Err(Error::Cancelled);
                }
                changed = watch.changed() => {
                    changed.map_err(|_| Error::Store("server state watch terminated".to_string()))?;
                    let snapshot = watch.borrow_and_update().clone();
                    match self.assign_step(&mut memory, &snapshot).await {
                        Ok(()) => {}
                        // a later snapshot may decode fine; the store itself
                        // failing is not recoverable here
                        Err(err @ Error::Decode { .. }) => {
                            warn!(error = %err, "skipping undecodable snapshot")
                        }
                        Err(err) => return Err(err),
                    }
                }
            }
        }
    }

    /// Resume numbering after the highest Addresses snapshot already in the
    /// store, so a restarted assigner keeps versions monotone.
    async fn next_unpublished_version(&self) -> Result<i64> {
        let published = self.discovery.get_all(&self.addresses_dir()).await?;
        let mut next = 0;
        for key in published.keys() {
            if let Some(version) = key.rsplit('/').next().and_then(|s| s.parse::<i64>().ok()) {
                next = next.max(version + 1);
            }
        }
        Ok(next)
    }

    async fn assign_step(&self, memory: &mut AssignMemory, snapshot: &Snapshot) -> Result<()> {
        if snapshot.is_empty() {
            return Ok(());
        }

        let mut new_servers: HashMap<String, ServerState> = HashMap::new();
        let mut new_roles: HashMap<String, ServerRole> = HashMap::new();
        let mut shard_locations: HashMap<u64, Vec<String>> = HashMap::new();
        for (key, value) in snapshot {
            let state: ServerState = decode(key, value)?;
            new_roles.insert(state.id.clone(), ServerRole::new(&state.id, memory.version));
            for &shard in &state.shards {
                shard_locations.entry(shard).or_default().push(state.id.clone());
            }
            new_servers.insert(state.id.clone(), state);
        }

        // Retire role entries every live server has moved past. A min that
        // appears to decrease is a stale snapshot; skip the GC opportunity.
        let min_version = new_servers
            .values()
            .map(|state| state.version)
            .min()
            .unwrap_or(super::NEVER_ASSIGNED);
        if min_version > memory.old_min_version {
            memory.old_min_version = min_version;
            let roles = self.discovery.get_all(&self.server_role_dir()).await?;
            for (key, value) in roles {
                let role: ServerRole = decode(&key, &value)?;
                if role.version < min_version {
                    self.discovery.delete(&key).await?;
                    info!(id = %role.id, version = role.version, "deleted retired server role");
                }
            }
        }

        // Unchanged membership assigns shards the same way; nothing to publish.
        if same_servers(&memory.old_servers, &new_servers) {
            return Ok(());
        }

        let num_shards = self.sharder().num_shards();
        let num_replicas = self.sharder().num_replicas();
        let servers = new_servers.len() as u64;
        let master_per_server = num_shards / servers;
        let mut master_remainder = num_shards % servers;
        let replica_per_server = (num_shards * num_replicas) / servers;
        let mut replica_remainder = (num_shards * num_replicas) % servers;

        let mut new_masters: HashMap<u64, String> = HashMap::new();
        let mut new_replicas: HashMap<u64, Vec<String>> = HashMap::new();

        'master: for shard in 0..num_shards {
            if let Some(id) = memory.old_masters.get(&shard).cloned() {
                if assign_master(
                    &mut new_roles,
                    &mut new_masters,
                    &id,
                    shard,
                    master_per_server,
                    &mut master_remainder,
                ) {
                    continue 'master;
                }
            }
            for id in candidate_ids(memory.old_replicas.get(&shard)) {
                if assign_master(
                    &mut new_roles,
                    &mut new_masters,
                    &id,
                    shard,
                    master_per_server,
                    &mut master_remainder,
                ) {
                    continue 'master;
                }
            }
            for id in candidate_ids(shard_locations.get(&shard)) {
                if assign_master(
                    &mut new_roles,
                    &mut new_masters,
                    &id,
                    shard,
                    master_per_server,
                    &mut master_remainder,
                ) {
                    continue 'master;
                }
            }
            for id in new_servers.keys().cloned().collect::<Vec<_>>() {
                if assign_master(
                    &mut new_roles,
                    &mut new_masters,
                    &id,
                    shard,
                    master_per_server,
                    &mut master_remainder,
                ) {
                    continue 'master;
                }
            }
            debug!(shard, "no server can master this shard, abandoning snapshot");
            return Ok(());
        }

        for _replica in 0..num_replicas {
            'replica: for shard in 0..num_shards {
                if let Some(id) = memory.old_masters.get(&shard).cloned() {
                    if assign_replica(
                        &mut new_roles,
                        &mut new_replicas,
                        &id,
                        shard,
                        replica_per_server,
                        &mut replica_remainder,
                    ) {
                        continue 'replica;
                    }
                }
                for id in candidate_ids(memory.old_replicas.get(&shard)) {
                    if assign_replica(
                        &mut new_roles,
                        &mut new_replicas,
                        &id,
                        shard,
                        replica_per_server,
                        &mut replica_remainder,
                    ) {
                        continue 'replica;
                    }
                }
                for id in candidate_ids(shard_locations.get(&shard)) {
                    if assign_replica(
                        &mut new_roles,
                        &mut new_replicas,
                        &id,
                        shard,
                        replica_per_server,
                        &mut replica_remainder,
                    ) {
                        continue 'replica;
                    }
                }
                for id in new_servers.keys().cloned().collect::<Vec<_>>() {
                    if assign_replica(
                        &mut new_roles,
                        &mut new_replicas,
                        &id,
                        shard,
                        replica_per_server,
                        &mut replica_remainder,
                    ) {
                        continue 'replica;
                    }
                }
                for id in new_servers.keys().cloned().collect::<Vec<_>>() {
                    if swap_replica(&mut new_roles, &mut new_replicas, &id, shard, replica_per_server) {
                        continue 'replica;
                    }
                }
                debug!(shard, "no server can replicate this shard, abandoning snapshot");
                return Ok(());
            }
        }

        // Publish: every ServerRole first, the Addresses snapshot last, so
        // a visible version always has its full role set behind it.
        let mut addresses = Addresses {
            version: memory.version,
            addresses: (0..num_shards).map(|shard| (shard, ShardAddresses::default())).collect(),
        };
        for (id, role) in &new_roles {
            let encoded = encode(role)?;
            self.discovery
                .set(&self.server_role_version_key(id, memory.version), &encoded, None)
                .await?;
            info!(
                id = %id,
                version = memory.version,
                masters = role.masters.len(),
                replicas = role.replicas.len(),
                "published server role"
            );
            let address = &new_servers[id].address;
            for &shard in &role.masters {
                addresses.addresses.entry(shard).or_default().master = address.clone();
            }
            for &shard in &role.replicas {
                addresses
                    .addresses
                    .entry(shard)
                    .or_default()
                    .replicas
                    .insert(address.clone());
            }
        }
        let encoded = encode(&addresses)?;
        self.discovery
            .set(&self.addresses_key(memory.version), &encoded, None)
            .await?;
        info!(version = memory.version, servers, "published addresses");

        memory.version += 1;
        memory.old_servers = new_servers;
        memory.old_masters = new_masters;
        memory.old_replicas = new_replicas;
        Ok(())
    }
}

fn candidate_ids(ids: Option<&Vec<String>>) -> Vec<String> {
    ids.map(|ids| ids.to_vec()).unwrap_or_default()
}

/// Same membership by id set; shard inventories and versions may differ.
fn same_servers(
    old_servers: &HashMap<String, ServerState>,
    new_servers: &HashMap<String, ServerState>,
) -> bool {
    old_servers.len() == new_servers.len()
        && old_servers.keys().all(|id| new_servers.contains_key(id))
}

/// Try to give `id` the master role for `shard`. A server at its budget may
/// still take the role while remainder lasts, consuming one unit.
fn assign_master(
    roles: &mut HashMap<String, ServerRole>,
    masters: &mut HashMap<u64, String>,
    id: &str,
    shard: u64,
    per_server: u64,
    remainder: &mut u64,
) -> bool {
    let Some(role) = roles.get_mut(id) else {
        return false;
    };
    let held = role.masters.len() as u64;
    if held > per_server {
        return false;
    }
    if held == per_server && *remainder == 0 {
        return false;
    }
    if role.has_shard(shard) {
        return false;
    }
    if held == per_server {
        *remainder -= 1;
    }
    role.masters.insert(shard);
    masters.insert(shard, id.to_string());
    true
}

/// Replica analogue of [`assign_master`].
fn assign_replica(
    roles: &mut HashMap<String, ServerRole>,
    replicas: &mut HashMap<u64, Vec<String>>,
    id: &str,
    shard: u64,
    per_server: u64,
    remainder: &mut u64,
) -> bool {
    let Some(role) = roles.get_mut(id) else {
        return false;
    };
    let held = role.replicas.len() as u64;
    if held > per_server {
        return false;
    }
    if held == per_server && *remainder == 0 {
        return false;
    }
    if role.has_shard(shard) {
        return false;
    }
    if held == per_server {
        *remainder -= 1;
    }
    role.replicas.insert(shard);
    replicas.entry(shard).or_default().push(id.to_string());
    true
}

/// Last-resort replica placement: `id` is under budget but blocked on
/// `shard` (it already holds it), so trade with a server that holds some
/// other replica shard `id` can take and that can itself take `shard`.
fn swap_replica(
    roles: &mut HashMap<String, ServerRole>,
    replicas: &mut HashMap<u64, Vec<String>>,
    id: &str,
    shard: u64,
    per_server: u64,
) -> bool {
    let Some(role) = roles.get(id) else {
        return false;
    };
    if role.replicas.len() as u64 >= per_server {
        return false;
    }
    let candidates: Vec<(String, u64)> = roles
        .iter()
        .filter(|(other, _)| other.as_str() != id)
        .flat_map(|(other, other_role)| {
            other_role
                .replicas
                .iter()
                .map(|&swap_shard| (other.clone(), swap_shard))
                .collect::<Vec<_>>()
        })
        .collect();
    for (victim, swap_shard) in candidates {
        if roles[id].has_shard(swap_shard) || roles[&victim].has_shard(shard) {
            continue;
        }
        if let Some(victim_role) = roles.get_mut(&victim) {
            victim_role.replicas.remove(&swap_shard);
        }
        if let Some(holders) = replicas.get_mut(&swap_shard) {
            holders.retain(|holder| holder != &victim);
        }
        // The victim replaces a shard it gave up, so it gets no cap; we
        // already know `id` is under its own cap. Neither consumes remainder.
        let mut no_remainder = 0;
        assign_replica(roles, replicas, &victim, shard, u64::MAX, &mut no_remainder);
        assign_replica(roles, replicas, id, swap_shard, per_server, &mut no_remainder);
        return true;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn roles_of(servers: &[&str], version: i64) -> HashMap<String, ServerRole> {
        servers
            .iter()
            .map(|id| (id.to_string(), ServerRole::new(*id, version)))
            .collect()
    }

    #[test]
    fn test_assign_master_respects_budget() {
        let mut roles = roles_of(&["a"], 0);
        let mut masters = HashMap::new();
        let mut remainder = 0;

        assert!(assign_master(&mut roles, &mut masters, "a", 0, 1, &mut remainder));
        assert!(!assign_master(&mut roles, &mut masters, "a", 1, 1, &mut remainder));
        assert_eq!(masters.len(), 1);
    }

    #[test]
    fn test_assign_master_remainder_admits_budget_plus_one() {
        // A server at its budget takes one more role while remainder lasts.
        let mut roles = roles_of(&["a"], 0);
        let mut masters = HashMap::new();
        let mut remainder = 1;

        assert!(assign_master(&mut roles, &mut masters, "a", 0, 1, &mut remainder));
        assert!(assign_master(&mut roles, &mut masters, "a", 1, 1, &mut remainder));
        assert_eq!(remainder, 0);
        assert_eq!(roles["a"].masters.len(), 2);
        assert!(!assign_master(&mut roles, &mut masters, "a", 2, 1, &mut remainder));
    }

    #[test]
    fn test_assign_master_rejects_duplicate_roles_on_one_server() {
        let mut roles = roles_of(&["a"], 0);
        roles.get_mut("a").unwrap().replicas.insert(4);
        let mut masters = HashMap::new();
        let mut remainder = 0;

        // already a replica of 4, cannot also master it
        assert!(!assign_master(&mut roles, &mut masters, "a", 4, 2, &mut remainder));
        assert!(assign_master(&mut roles, &mut masters, "a", 5, 2, &mut remainder));
    }

    #[test]
    fn test_assign_replica_respects_budget_and_remainder() {
        let mut roles = roles_of(&["a"], 0);
        let mut replicas = HashMap::new();
        let mut remainder = 1;

        assert!(assign_replica(&mut roles, &mut replicas, "a", 0, 1, &mut remainder));
        assert!(assign_replica(&mut roles, &mut replicas, "a", 1, 1, &mut remainder));
        assert!(!assign_replica(&mut roles, &mut replicas, "a", 2, 1, &mut remainder));
        assert_eq!(replicas[&0], vec!["a".to_string()]);
    }

    #[test]
    fn test_swap_replica_unblocks_final_shard() {
        // Mid-fill deadlock: shard 1 needs a second replica. a is under
        // budget but already holds 1; b masters 1; c is full. Only a trade
        // between a and c resolves it.
        let mut roles = roles_of(&["a", "b", "c"], 0);
        roles.get_mut("a").unwrap().masters = BTreeSet::from([0]);
        roles.get_mut("a").unwrap().replicas = BTreeSet::from([1]);
        roles.get_mut("b").unwrap().masters = BTreeSet::from([1]);
        roles.get_mut("b").unwrap().replicas = BTreeSet::from([0, 2]);
        roles.get_mut("c").unwrap().masters = BTreeSet::from([2]);
        roles.get_mut("c").unwrap().replicas = BTreeSet::from([0, 2]);

        let mut replicas: HashMap<u64, Vec<String>> = HashMap::new();
        replicas.insert(0, vec!["b".to_string(), "c".to_string()]);
        replicas.insert(1, vec!["a".to_string()]);
        replicas.insert(2, vec!["b".to_string(), "c".to_string()]);

        let per_server = 2;
        assert!(!assign_replica(&mut roles, &mut replicas, "a", 1, per_server, &mut 0));
        assert!(!assign_replica(&mut roles, &mut replicas, "b", 1, per_server, &mut 0));
        assert!(!assign_replica(&mut roles, &mut replicas, "c", 1, per_server, &mut 0));

        let swapped = ["a", "b", "c"]
            .iter()
            .any(|id| swap_replica(&mut roles, &mut replicas, id, 1, per_server));
        assert!(swapped);

        // every shard now has two replicas, nobody is master and replica of
        // the same shard, and budgets still hold
        for shard in 0..3u64 {
            assert_eq!(replicas[&shard].len(), 2, "shard {shard}");
        }
        for role in roles.values() {
            assert!(role.replicas.len() as u64 <= per_server);
            for &shard in &role.masters {
                assert!(!role.replicas.contains(&shard));
            }
        }
    }

    #[test]
    fn test_same_servers_compares_id_sets_only() {
        let mut old_servers = HashMap::new();
        let mut state = ServerState::new("a", "addr-1");
        state.version = 0;
        old_servers.insert("a".to_string(), state);

        let mut new_servers = HashMap::new();
        let mut state = ServerState::new("a", "addr-1");
        state.version = 3;
        state.shards = BTreeSet::from([1, 2]);
        new_servers.insert("a".to_string(), state);

        assert!(same_servers(&old_servers, &new_servers));

        new_servers.insert("b".to_string(), ServerState::new("b", "addr-2"));
        assert!(!same_servers(&old_servers, &new_servers));
    }
}
