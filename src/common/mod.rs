//! Common utilities and types shared across minishard

pub mod config;
pub mod error;
pub mod utils;

pub use config::{BalanceMode, ClusterConfig, Config};
pub use error::{Error, Result};
pub use utils::parse_duration;
