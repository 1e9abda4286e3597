//! Persisted coordination schemas
//!
//! Everything the coordinator stores is JSON and self-describing: each value
//! carries the assignment version it belongs to. Sets and maps use ordered
//! collections so encodings are stable across processes.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::common::{Error, Result};

/// A server that has never accepted any assignment announces this version.
pub const NEVER_ASSIGNED: i64 = -1;

/// Heartbeat record a server leases into the state tree. Lease expiry is the
/// cluster's membership detector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerState {
    pub id: String,
    pub address: String,
    /// Highest assignment version applied locally; -1 until the first one.
    #[serde(default = "never_assigned")]
    pub version: i64,
    /// Shards currently mounted locally
    #[serde(default)]
    pub shards: BTreeSet<u64>,
}

fn never_assigned() -> i64 {
    NEVER_ASSIGNED
}

impl ServerState {
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            version: NEVER_ASSIGNED,
            shards: BTreeSet::new(),
        }
    }
}

/// One server's duties under one assignment version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerRole {
    pub id: String,
    pub version: i64,
    #[serde(default)]
    pub masters: BTreeSet<u64>,
    #[serde(default)]
    pub replicas: BTreeSet<u64>,
}

impl ServerRole {
    pub fn new(id: impl Into<String>, version: i64) -> Self {
        Self {
            id: id.into(),
            version,
            masters: BTreeSet::new(),
            replicas: BTreeSet::new(),
        }
    }

    /// Every shard this role obliges the server to mount
    pub fn shards(&self) -> impl Iterator<Item = u64> + '_ {
        self.masters.iter().chain(self.replicas.iter()).copied()
    }

    pub fn has_shard(&self, shard: u64) -> bool {
        self.masters.contains(&shard) || self.replicas.contains(&shard)
    }
}

/// Where a shard is served under one version.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardAddresses {
    #[serde(default)]
    pub master: String,
    #[serde(default)]
    pub replicas: BTreeSet<String>,
}

/// Full routing table for one version. Immutable once written; cacheable
/// forever.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Addresses {
    pub version: i64,
    #[serde(default)]
    pub addresses: BTreeMap<u64, ShardAddresses>,
}

/// Encode a schema value for storage.
pub(crate) fn encode<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| Error::Internal(format!("encode failed: {}", e)))
}

/// Decode a stored value, keeping the key for error context.
pub(crate) fn decode<T: serde::de::DeserializeOwned>(key: &str, value: &str) -> Result<T> {
    serde_json::from_str(value).map_err(|e| Error::decode(key, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_state_round_trip() {
        let mut state = ServerState::new("server-1", "127.0.0.1:7000");
        state.version = 4;
        state.shards = BTreeSet::from([0, 3, 7]);

        let encoded = encode(&state).unwrap();
        let decoded: ServerState = decode("k", &encoded).unwrap();
        assert_eq!(decoded, state);
    }

    #[test]
    fn test_server_state_field_defaulting() {
        let decoded: ServerState =
            decode("k", r#"{"id":"a","address":"127.0.0.1:7000"}"#).unwrap();
        assert_eq!(decoded.version, NEVER_ASSIGNED);
        assert!(decoded.shards.is_empty());
    }

    #[test]
    fn test_server_role_round_trip() {
        let mut role = ServerRole::new("server-1", 2);
        role.masters = BTreeSet::from([1, 2]);
        role.replicas = BTreeSet::from([0, 3]);

        let encoded = encode(&role).unwrap();
        let decoded: ServerRole = decode("k", &encoded).unwrap();
        assert_eq!(decoded, role);
        assert_eq!(decoded.shards().collect::<BTreeSet<_>>(), BTreeSet::from([0, 1, 2, 3]));
        assert!(decoded.has_shard(3));
        assert!(!decoded.has_shard(9));
    }

    #[test]
    fn test_addresses_round_trip() {
        let mut addresses = Addresses {
            version: 1,
            addresses: BTreeMap::new(),
        };
        addresses.addresses.insert(
            0,
            ShardAddresses {
                master: "127.0.0.1:7000".to_string(),
                replicas: BTreeSet::from(["127.0.0.1:7001".to_string()]),
            },
        );

        let encoded = encode(&addresses).unwrap();
        let decoded: Addresses = decode("k", &encoded).unwrap();
        assert_eq!(decoded, addresses);
    }

    #[test]
    fn test_decode_error_names_key() {
        let err = decode::<ServerState>("ns/pfs/server/state/a", "{").unwrap_err();
        match err {
            Error::Decode { key, .. } => assert_eq!(key, "ns/pfs/server/state/a"),
            other => panic!("expected decode error, got {other}"),
        }
    }
}
