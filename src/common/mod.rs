//! Common utilities and types shared across mkv

pub mod config;
pub mod error;
pub mod hash;
pub mod tracing_middleware;
pub mod utils;

pub use config::MasterConfig;
pub use error::{Error, Result};
pub use hash::{content_hash, key_to_path, needs_rebalance, path_name_to_key, route};
pub use tracing_middleware::{request_tracing_middleware, REQUEST_ID_HEADER};
pub use utils::{decode_key, display_key, encode_key, parse_duration};
