//! In-memory discovery store
//!
//! A single-process stand-in for the real discovery store: a mutexed key
//! tree with TTL deadlines and per-prefix watch channels. Backs the
//! integration tests and `shardd local` mode.
//!
//! Leases are enforced by a background sweeper that removes expired entries
//! and notifies affected watchers, so a dead server's state vanishes within
//! a sweep interval of its deadline.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

use super::{key_in_prefix, Discovery, Snapshot};
use crate::common::Result;

/// Sweep cadence for expired leases
const SWEEP_INTERVAL: Duration = Duration::from_millis(100);

struct Entry {
    value: String,
    deadline: Option<Instant>,
}

struct Watcher {
    prefix: String,
    tx: watch::Sender<Snapshot>,
}

#[derive(Default)]
struct Inner {
    entries: BTreeMap<String, Entry>,
    watchers: Vec<Watcher>,
}

#[derive(Clone)]
pub struct MemoryDiscovery {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryDiscovery {
    /// Create a store and spawn its lease sweeper. Must be called from
    /// within a tokio runtime.
    pub fn new() -> Self {
        let inner = Arc::new(Mutex::new(Inner::default()));
        let weak: Weak<Mutex<Inner>> = Arc::downgrade(&inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                sweep(&inner);
            }
        });
        Self { inner }
    }
}

impl Default for MemoryDiscovery {
    fn default() -> Self {
        Self::new()
    }
}

/// Drop expired entries and notify watchers whose subtree changed.
fn sweep(inner: &Mutex<Inner>) {
    let mut inner = inner.lock().unwrap();
    let now = Instant::now();
    let expired: Vec<String> = inner
        .entries
        .iter()
        .filter(|(_, entry)| matches!(entry.deadline, Some(deadline) if deadline <= now))
        .map(|(key, _)| key.clone())
        .collect();
    if expired.is_empty() {
        return;
    }
    for key in &expired {
        inner.entries.remove(key);
    }
    notify(&mut inner, |prefix| {
        expired.iter().any(|key| key_in_prefix(key, prefix))
    });
}

/// Push fresh snapshots to every watcher whose prefix `touched` selects,
/// pruning watchers nobody listens to anymore.
fn notify(inner: &mut Inner, touched: impl Fn(&str) -> bool) {
    inner.watchers.retain(|watcher| !watcher.tx.is_closed());
    let snapshots: Vec<(usize, Snapshot)> = inner
        .watchers
        .iter()
        .enumerate()
        .filter(|(_, watcher)| touched(&watcher.prefix))
        .map(|(i, watcher)| (i, snapshot_of(&inner.entries, &watcher.prefix)))
        .collect();
    for (i, snapshot) in snapshots {
        inner.watchers[i].tx.send_replace(snapshot);
    }
}

fn snapshot_of(entries: &BTreeMap<String, Entry>, prefix: &str) -> Snapshot {
    entries
        .iter()
        .filter(|(key, _)| key_in_prefix(key, prefix))
        .map(|(key, entry)| (key.clone(), entry.value.clone()))
        .collect()
}

fn deadline_for(ttl: Option<Duration>) -> Option<Instant> {
    ttl.map(|ttl| Instant::now() + ttl)
}

#[async_trait]
impl Discovery for MemoryDiscovery {
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                deadline: deadline_for(ttl),
            },
        );
        notify(&mut inner, |prefix| key_in_prefix(key, prefix));
        Ok(())
    }

    async fn create(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        if inner.entries.contains_key(key) {
            return Ok(false);
        }
        inner.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                deadline: deadline_for(ttl),
            },
        );
        notify(&mut inner, |prefix| key_in_prefix(key, prefix));
        Ok(true)
    }

    async fn check_and_set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
        expected: &str,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        match inner.entries.get(key) {
            Some(entry) if entry.value == expected => {}
            _ => return Ok(false),
        }
        inner.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                deadline: deadline_for(ttl),
            },
        );
        notify(&mut inner, |prefix| key_in_prefix(key, prefix));
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.entries.get(key).map(|entry| entry.value.clone()))
    }

    async fn get_all(&self, prefix: &str) -> Result<Snapshot> {
        let inner = self.inner.lock().unwrap();
        Ok(snapshot_of(&inner.entries, prefix))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.entries.remove(key).is_some() {
            notify(&mut inner, |prefix| key_in_prefix(key, prefix));
        }
        Ok(())
    }

    async fn watch_all(&self, prefix: &str) -> Result<watch::Receiver<Snapshot>> {
        let mut inner = self.inner.lock().unwrap();
        let snapshot = snapshot_of(&inner.entries, prefix);
        let (tx, mut rx) = watch::channel(snapshot);
        // the initial snapshot counts as a change
        rx.mark_changed();
        inner.watchers.push(Watcher {
            prefix: prefix.to_string(),
            tx,
        });
        Ok(rx)
    }
}
