//! # minishard
//!
//! A distributed shard-role coordinator for content-addressed filesystem
//! clusters:
//! - Versioned role assignments with smooth handoff across reconfigurations
//! - Liveness over a TTL key-value store (leases, watch-driven control loops)
//! - Churn-minimising placement under strict load and uniqueness constraints
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │              Discovery store                │
//! │  state/{id}   role/{id}/{v}   roles/{v}     │
//! └─────┬──────────────┬────────────────┬───────┘
//!       │ watch        │ watch          │ get
//! ┌─────▼──────┐  ┌────▼───────┐  ┌─────▼──────┐
//! │  Assigner  │  │ Registrar  │  │  Resolver  │
//! │ (elected)  │  │ (each node)│  │ (readers)  │
//! └────────────┘  └────┬───────┘  └────────────┘
//!                      │ mount/unmount
//!                 ┌────▼───────┐
//!                 │ShardEngine │
//!                 └────────────┘
//! ```
//!
//! Every server runs a registrar: it leases a heartbeat into the state tree
//! and converges its local shard engine on whatever roles the assigner
//! publishes for it. The one elected assigner turns each membership change
//! into a new immutable assignment version; resolvers route requests by
//! `(shard, version)`. Old and new versions coexist until every server has
//! caught up, so reads and writes keep succeeding across reconfigurations.

pub mod addresser;
pub mod common;
pub mod discovery;
pub mod engine;
pub mod roler;
pub mod sharder;

// Re-export commonly used types
pub use addresser::{Addresser, Addresses, ServerRole, ServerState, ShardAddresses};
pub use common::{BalanceMode, ClusterConfig, Config, Error, Result};
pub use discovery::{Discovery, MemoryDiscovery, Snapshot};
pub use engine::{MemoryEngine, ShardEngine};
pub use roler::Roler;
pub use sharder::Sharder;

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
