//! The master: placement, metadata, locking and replica orchestration
//!
//! - Placement: HRW over the configured volumes, optional subvolume shards
//! - Metadata: one record per key in RocksDB
//! - Writes, reads and deletes fan out to plain HTTP volume servers
//! - Mutations of a key are serialized by a fail-fast key lock

pub mod dispatch;
pub mod http;
pub mod lock;
pub mod metadata;
pub mod placement;
pub mod record;
pub mod replication;
pub mod server;
pub mod volume_client;

pub use dispatch::{dispatch, ListPage, Op, Reply};
pub use metadata::{KvStore, MemoryStore, MetadataStore, RocksStore};
pub use record::{KeyState, Record};
pub use server::{CoordState, Coordinator};
pub use volume_client::{HttpVolumeClient, MemoryVolumes, VolumeClient};
