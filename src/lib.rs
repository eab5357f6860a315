//! # mkv
//!
//! The master of a small distributed object store:
//! - HRW placement of every key onto N volume servers (optional subvolumes)
//! - RocksDB index of key -> replica list, content MD5 and deletion state
//! - Fail-fast per-key locks, placeholder-first writes, two-phase deletes
//! - Rebalance and rebuild jobs that reconcile the index with the volumes
//!
//! The master never touches object bytes on reads: clients are redirected to
//! a volume server.
//!
//! ## Architecture

#![allow(clippy::result_large_err)]
//!
//! ```text
//!            ┌──────────────────────────────┐
//!   client ──►        mkv master            │
//!            │  index (RocksDB) + key locks │
//!            └───────┬──────────────────────┘
//!          302 / PUT │ DELETE / HEAD probes
//!   ┌────────────────┼──────────────────┐
//!   │                │                  │
//! ┌─▼──────────┐ ┌───▼────────┐ ┌───────▼────┐
//! │ volume 1   │ │ volume 2   │ │ volume 3   │
//! │ nginx/DAV  │ │ nginx/DAV  │ │ nginx/DAV  │
//! └────────────┘ └────────────┘ └────────────┘
//! ```
//!
//! ## Usage
//!
//! ```bash
//! mkv --volumes localhost:3001,localhost:3002 --db ./indexdb server
//!
//! curl -L -X PUT -d bigswag localhost:3000/wehave
//! curl -L localhost:3000/wehave
//! curl -X UNLINK localhost:3000/wehave
//! curl -X DELETE localhost:3000/wehave
//! curl "localhost:3000/we?list"
//!
//! # after changing --volumes
//! mkv --volumes ... rebalance
//! # after losing the index
//! mkv --volumes ... rebuild
//! ```

pub mod common;
pub mod coordinator;
pub mod ops;

// Re-export commonly used types
pub use common::{Error, MasterConfig, Result};
pub use coordinator::{CoordState, Coordinator};
pub use ops::{RebalanceReport, RebuildReport};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
