//! Placement invariants across cluster shapes, plus roler convergence

use minishard::{Addresser, MemoryDiscovery, MemoryEngine, Roler, ServerRole, Sharder};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

const HOLD_TTL: Duration = Duration::from_secs(4);
const NAMESPACE: &str = "test";

async fn eventually<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..300 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("never reached: {what}");
}

/// Boot an assigner plus `servers` registrars and return every published
/// role once the cluster has converged on one version.
async fn converge(
    num_shards: u64,
    num_replicas: u64,
    servers: usize,
) -> (Vec<ServerRole>, broadcast::Sender<()>) {
    let discovery = Arc::new(MemoryDiscovery::new());
    let addresser = Arc::new(Addresser::new(
        discovery.clone(),
        Sharder::new(num_shards, num_replicas).unwrap(),
        NAMESPACE,
        HOLD_TTL,
    ));

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    {
        let addresser = addresser.clone();
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let _ = addresser.assign_roles(shutdown).await;
        });
    }

    let ids: Vec<String> = (0..servers).map(|i| format!("server-{}", i)).collect();
    let mut engines = Vec::new();
    for id in &ids {
        let engine = Arc::new(MemoryEngine::new());
        engines.push(engine.clone());
        let addresser = addresser.clone();
        let id = id.clone();
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let address = format!("addr-{}", id);
            let _ = addresser.register(&id, &address, engine, shutdown).await;
        });
    }

    addresser
        .wait_for_availability(&ids, shutdown_tx.subscribe())
        .await
        .unwrap();

    // after availability every role entry carries the same version
    use minishard::Discovery;
    let stored = discovery
        .get_all(&format!("{}/pfs/server/role", NAMESPACE))
        .await
        .unwrap();
    let roles: Vec<ServerRole> = stored
        .values()
        .map(|value| serde_json::from_str(value).unwrap())
        .collect();

    // every engine settles on exactly the shards its live role names
    let expected: HashMap<String, BTreeSet<u64>> = roles
        .iter()
        .map(|role| (role.id.clone(), role.shards().collect()))
        .collect();
    for (id, engine) in ids.iter().zip(&engines) {
        let want = expected.get(id).cloned().unwrap_or_default();
        let engine = engine.clone();
        let what = format!("engine of {} mounts exactly its role", id);
        eventually(&what, move || {
            let engine = engine.clone();
            let want = want.clone();
            async move { engine.mounted() == want }
        })
        .await;
    }

    (roles, shutdown_tx)
}

fn check_invariants(roles: &[ServerRole], num_shards: u64, num_replicas: u64) {
    // each shard has exactly one master
    let mut masters: BTreeMap<u64, &str> = BTreeMap::new();
    for role in roles {
        for &shard in &role.masters {
            assert!(
                masters.insert(shard, &role.id).is_none(),
                "shard {shard} has two masters"
            );
        }
    }
    assert_eq!(
        masters.keys().copied().collect::<BTreeSet<_>>(),
        (0..num_shards).collect::<BTreeSet<_>>(),
        "masters must partition the shard space"
    );

    // nobody is master and replica of the same shard
    for role in roles {
        for &shard in &role.masters {
            assert!(
                !role.replicas.contains(&shard),
                "server {} is master and replica of shard {shard}",
                role.id
            );
        }
    }

    // every shard carries its full replica set
    let mut replica_counts: BTreeMap<u64, u64> = BTreeMap::new();
    for role in roles {
        for &shard in &role.replicas {
            *replica_counts.entry(shard).or_insert(0) += 1;
        }
    }
    for shard in 0..num_shards {
        assert_eq!(
            replica_counts.get(&shard).copied().unwrap_or(0),
            num_replicas,
            "shard {shard} replica count"
        );
    }

    // load spread: per-server master and replica counts differ by at most 1
    let master_spread: Vec<usize> = roles.iter().map(|role| role.masters.len()).collect();
    let replica_spread: Vec<usize> = roles.iter().map(|role| role.replicas.len()).collect();
    for counts in [master_spread, replica_spread] {
        let max = counts.iter().copied().max().unwrap_or(0);
        let min = counts.iter().copied().min().unwrap_or(0);
        assert!(max - min <= 1, "unbalanced counts: {counts:?}");
    }
}

#[tokio::test(start_paused = true)]
async fn test_master_only_placements_balance() {
    for (num_shards, servers) in [(4, 1), (4, 2), (5, 4), (16, 3)] {
        let (roles, _cluster) = converge(num_shards, 0, servers).await;
        check_invariants(&roles, num_shards, 0);
    }
}

#[tokio::test(start_paused = true)]
async fn test_replicated_placements_balance() {
    for (num_shards, num_replicas, servers) in [(4, 1, 3), (3, 2, 3), (8, 2, 5), (16, 2, 4)] {
        let (roles, _cluster) = converge(num_shards, num_replicas, servers).await;
        check_invariants(&roles, num_shards, num_replicas);
    }
}

// === Roler convergence ===

struct Balancer {
    address: String,
    engine: Arc<MemoryEngine>,
    shutdown: broadcast::Sender<()>,
}

fn spawn_roler(
    addresser: &Arc<Addresser<MemoryDiscovery>>,
    address: &str,
) -> Balancer {
    let engine = Arc::new(MemoryEngine::new());
    let (shutdown, shutdown_rx) = broadcast::channel(1);
    let roler = Roler::new(
        addresser.clone(),
        engine.clone(),
        address,
        Duration::from_millis(200),
    );
    tokio::spawn(async move {
        let _ = roler.run(shutdown_rx).await;
    });
    Balancer {
        address: address.to_string(),
        engine,
        shutdown,
    }
}

#[tokio::test(start_paused = true)]
async fn test_rolers_claim_and_balance_the_space() {
    let discovery = Arc::new(MemoryDiscovery::new());
    let addresser = Arc::new(Addresser::new(
        discovery.clone(),
        Sharder::new(4, 0).unwrap(),
        NAMESPACE,
        HOLD_TTL,
    ));

    let first = spawn_roler(&addresser, "addr-1");
    let second = spawn_roler(&addresser, "addr-2");

    {
        let addresser = addresser.clone();
        let (first, second) = (
            (first.address.clone(), first.engine.clone()),
            (second.address.clone(), second.engine.clone()),
        );
        eventually("all shards claimed, two each", move || {
            let addresser = addresser.clone();
            let (first, second) = (first.clone(), second.clone());
            async move {
                let claims = addresser.get_shard_to_master().await.unwrap();
                let count =
                    |address: &str| claims.values().filter(|claim| **claim == address).count();
                claims.len() == 4
                    && count(&first.0) == 2
                    && count(&second.0) == 2
                    && first.1.mounted().len() == 2
                    && second.1.mounted().len() == 2
            }
        })
        .await;
    }

    // killing one roler releases its claims and the survivor takes over
    first.shutdown.send(()).unwrap();
    {
        let addresser = addresser.clone();
        let second_address = second.address.clone();
        let second_engine = second.engine.clone();
        eventually("survivor claims the whole space", move || {
            let addresser = addresser.clone();
            let second_address = second_address.clone();
            let second_engine = second_engine.clone();
            async move {
                let claims = addresser.get_shard_to_master().await.unwrap();
                claims.len() == 4
                    && claims.values().all(|claim| *claim == second_address)
                    && second_engine.mounted().len() == 4
            }
        })
        .await;
    }
    drop(second);
}
