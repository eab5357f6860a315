//! Background jobs that reconcile metadata with the volumes

pub mod rebalance;
pub mod rebuild;

pub use rebalance::{rebalance_cluster, rebalance_key, Migration, RebalanceReport};
pub use rebuild::{merge_discovery, rebuild_cluster, RebuildReport};
