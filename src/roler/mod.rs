//! Decentralised master-only balancing
//!
//! The roler is the simple alternative to the versioned assigner: every
//! server runs one, no election needed. On each tick a server claims open
//! shards when it is not already above the cluster minimum, and steals from
//! the most loaded server when that actually improves the balance. Claims
//! are pessimistic holds on the discovery store's claim tree; the store is
//! the arbiter when two servers go for the same shard.
//!
//! A deployment runs either the roler or the assigner, not both.

use rand::seq::IteratorRandom;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::addresser::Addresser;
use crate::common::{Error, Result};
use crate::discovery::Discovery;
use crate::engine::ShardEngine;

pub struct Roler<D, E> {
    addresser: Arc<Addresser<D>>,
    engine: Arc<E>,
    local_address: String,
    tick: Duration,
}

/// What one tick decided to do.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Balance {
    /// Someone else is below us; let them claim.
    Yield,
    /// Claim an unmastered shard.
    Claim(u64),
    /// Take a shard from the most loaded server.
    Steal { shard: u64, from: String },
}

impl<D: Discovery, E: ShardEngine> Roler<D, E> {
    pub fn new(
        addresser: Arc<Addresser<D>>,
        engine: Arc<E>,
        local_address: impl Into<String>,
        tick: Duration,
    ) -> Self {
        Self {
            addresser,
            engine,
            local_address: local_address.into(),
            tick,
        }
    }

    /// Balance until cancelled. Held claims are released on the way out so
    /// other servers can pick the shards up.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        info!(address = %self.local_address, "roler starting");
        let (holds_tx, _) = broadcast::channel::<()>(1);
        let mut holds: JoinSet<()> = JoinSet::new();
        let mut ticker = tokio::time::interval(self.tick);
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!(address = %self.local_address, "roler cancelled");
                    let _ = holds_tx.send(());
                    while holds.join_next().await.is_some() {}
                    return Err(Error::Cancelled);
                }
                _ = ticker.tick() => {}
            }
            self.balance_once(&mut holds, &holds_tx).await?;
            while let Some(finished) = holds.try_join_next() {
                if let Err(err) = finished {
                    warn!(error = %err, "hold task panicked");
                }
            }
        }
    }

    async fn balance_once(
        &self,
        holds: &mut JoinSet<()>,
        holds_tx: &broadcast::Sender<()>,
    ) -> Result<()> {
        let shard_to_master = self.addresser.get_shard_to_master().await?;
        let num_shards = self.addresser.sharder().num_shards();
        let action = decide(
            &self.local_address,
            num_shards,
            &shard_to_master,
            &mut rand::thread_rng(),
        );
        match action {
            Balance::Yield => Ok(()),
            Balance::Claim(shard) => self.claim(holds, holds_tx, shard, None).await,
            Balance::Steal { shard, from } => self.claim(holds, holds_tx, shard, Some(from)).await,
        }
    }

    /// Become master locally, then hold the claim in the background; when
    /// the hold ends for any reason the shard is cleared again.
    async fn claim(
        &self,
        holds: &mut JoinSet<()>,
        holds_tx: &broadcast::Sender<()>,
        shard: u64,
        stolen_from: Option<String>,
    ) -> Result<()> {
        debug!(shard, stolen_from = ?stolen_from, "claiming master role");
        self.engine
            .master(shard)
            .await
            .map_err(|e| Error::shard_op(shard, e))?;
        let addresser = self.addresser.clone();
        let engine = self.engine.clone();
        let address = self.local_address.clone();
        let shutdown = holds_tx.subscribe();
        holds.spawn(async move {
            let held = addresser
                .hold_master_address(shard, &address, stolen_from.as_deref(), shutdown)
                .await;
            match held {
                Ok(()) => debug!(shard, "master hold ended"),
                Err(err) if err.is_cancelled() => debug!(shard, "master hold cancelled"),
                Err(err) => warn!(shard, error = %err, "master hold failed"),
            }
            if let Err(err) = engine.clear(shard).await {
                warn!(shard, error = %err, "failed to clear shard");
            }
        });
        Ok(())
    }
}

/// Pick this tick's action from the current claim map.
fn decide(
    local: &str,
    num_shards: u64,
    shard_to_master: &HashMap<u64, String>,
    rng: &mut impl Rng,
) -> Balance {
    let counts = master_counts(shard_to_master);
    let local_count = counts.get(local).copied().unwrap_or(0);
    let min = counts.values().copied().min().unwrap_or(usize::MAX);
    if local_count > min {
        return Balance::Yield;
    }
    if let Some(shard) = (0..num_shards).find(|shard| !shard_to_master.contains_key(shard)) {
        return Balance::Claim(shard);
    }
    let Some((max_address, max)) = counts
        .iter()
        .max_by_key(|(_, count)| **count)
        .map(|(address, count)| (address.clone(), *count))
    else {
        return Balance::Yield;
    };
    if local_count + 1 > max - 1 {
        // stealing would just move the imbalance here
        return Balance::Yield;
    }
    // Pick the stolen shard at random so concurrent stealers spread out
    // instead of all fighting over the same one.
    match shard_to_master
        .iter()
        .filter(|(_, address)| **address == max_address)
        .map(|(&shard, _)| shard)
        .choose(rng)
    {
        Some(shard) => Balance::Steal {
            shard,
            from: max_address,
        },
        None => Balance::Yield,
    }
}

fn master_counts(shard_to_master: &HashMap<u64, String>) -> HashMap<String, usize> {
    let mut counts = HashMap::new();
    for address in shard_to_master.values() {
        *counts.entry(address.clone()).or_insert(0) += 1;
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn claims(entries: &[(u64, &str)]) -> HashMap<u64, String> {
        entries
            .iter()
            .map(|(shard, address)| (*shard, address.to_string()))
            .collect()
    }

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    #[test]
    fn test_decide_claims_first_open_shard() {
        let action = decide("me", 4, &claims(&[(0, "other")]), &mut rng());
        assert_eq!(action, Balance::Claim(1));

        let action = decide("me", 2, &HashMap::new(), &mut rng());
        assert_eq!(action, Balance::Claim(0));
    }

    #[test]
    fn test_decide_yields_when_above_minimum() {
        let map = claims(&[(0, "me"), (1, "me"), (2, "other")]);
        assert_eq!(decide("me", 3, &map, &mut rng()), Balance::Yield);
    }

    #[test]
    fn test_decide_steals_from_the_most_loaded() {
        let map = claims(&[(0, "a"), (1, "a"), (2, "a"), (3, "a")]);
        match decide("b", 4, &map, &mut rng()) {
            Balance::Steal { shard, from } => {
                assert_eq!(from, "a");
                assert!(shard < 4);
            }
            other => panic!("expected steal, got {other:?}"),
        }
    }

    #[test]
    fn test_decide_never_steals_into_a_new_imbalance() {
        // taking a's only spare shard would just move the max here
        let map = claims(&[(0, "a")]);
        assert_eq!(decide("b", 1, &map, &mut rng()), Balance::Yield);

        let map = claims(&[(0, "a"), (1, "a")]);
        match decide("b", 2, &map, &mut rng()) {
            Balance::Steal { from, .. } => assert_eq!(from, "a"),
            other => panic!("expected steal, got {other:?}"),
        }
    }

    #[test]
    fn test_decide_balanced_cluster_rests() {
        let map = claims(&[(0, "a"), (1, "b")]);
        assert_eq!(decide("a", 2, &map, &mut rng()), Balance::Yield);
        assert_eq!(decide("b", 2, &map, &mut rng()), Balance::Yield);
    }
}
