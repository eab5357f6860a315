//! Configuration for the mkv master
//!
//! One immutable [`MasterConfig`] is built at startup (defaults, optional TOML
//! file, `MKV_*` environment, then CLI flags) and shared by reference.

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming an explicit config file
pub const CONFIG_ENV: &str = "MKV_CONFIG";

/// Master configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterConfig {
    /// Bind address for the HTTP API
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,

    /// RocksDB path for metadata
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Volume servers, `host:port`
    #[serde(default)]
    pub volumes: Vec<String>,

    /// Replication factor
    #[serde(default = "default_replicas")]
    pub replicas: usize,

    /// Subvolumes (disks) per volume server
    #[serde(default = "default_subvolumes")]
    pub subvolumes: u32,

    /// Refuse DELETE of an active key until it has been unlinked
    #[serde(default)]
    pub protect: bool,

    /// Server to redirect to for missing keys
    #[serde(default)]
    pub fallback: Option<String>,

    /// Compute an MD5 of every written body
    #[serde(default = "default_true")]
    pub md5sum: bool,

    /// Existence probe timeout for reads
    #[serde(default = "default_voltimeout_ms")]
    pub voltimeout_ms: u64,

    /// Worker pool size for rebalance
    #[serde(default = "default_rebalance_workers")]
    pub rebalance_workers: usize,

    /// Worker pool size for rebuild
    #[serde(default = "default_rebuild_workers")]
    pub rebuild_workers: usize,

    /// Bounded work queue depth for background jobs
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,

    /// Ceiling on keys collected by a listing
    #[serde(default = "default_max_list_keys")]
    pub max_list_keys: usize,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 3000))
}
fn default_db_path() -> PathBuf {
    PathBuf::from("./indexdb")
}
fn default_replicas() -> usize {
    3
}
fn default_subvolumes() -> u32 {
    10
}
fn default_true() -> bool {
    true
}
fn default_voltimeout_ms() -> u64 {
    1000
}
fn default_rebalance_workers() -> usize {
    16
}
fn default_rebuild_workers() -> usize {
    128
}
fn default_queue_depth() -> usize {
    20_000
}
fn default_max_list_keys() -> usize {
    1_000_000
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            db_path: default_db_path(),
            volumes: Vec::new(),
            replicas: default_replicas(),
            subvolumes: default_subvolumes(),
            protect: false,
            fallback: None,
            md5sum: default_true(),
            voltimeout_ms: default_voltimeout_ms(),
            rebalance_workers: default_rebalance_workers(),
            rebuild_workers: default_rebuild_workers(),
            queue_depth: default_queue_depth(),
            max_list_keys: default_max_list_keys(),
            log_level: default_log_level(),
        }
    }
}

impl MasterConfig {
    /// Load configuration from an explicit file, `$MKV_CONFIG`, or `./mkv.toml`,
    /// then overlay `MKV_*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        let file = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var(CONFIG_ENV).ok().map(PathBuf::from));
        match file {
            Some(file) => {
                builder = builder.add_source(config::File::from(file.as_path()));
            }
            None => {
                builder = builder.add_source(config::File::with_name("mkv").required(false));
            }
        }

        builder = builder.add_source(
            config::Environment::with_prefix("MKV")
                .list_separator(",")
                .with_list_parse_key("volumes")
                .try_parsing(true),
        );

        let config: MasterConfig = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Startup-time checks; the only errors that stop the process.
    pub fn validate(&self) -> Result<()> {
        if self.volumes.is_empty() {
            return Err(Error::InvalidConfig("no volumes configured".into()));
        }
        if self.replicas == 0 {
            return Err(Error::InvalidConfig("replicas must be at least 1".into()));
        }
        if self.subvolumes == 0 {
            return Err(Error::InvalidConfig(
                "subvolumes must be at least 1".into(),
            ));
        }
        if self.volumes.len() < self.replicas {
            return Err(Error::InvalidConfig(format!(
                "need at least as many volumes as replicas ({} < {})",
                self.volumes.len(),
                self.replicas
            )));
        }
        if self.rebalance_workers == 0 || self.rebuild_workers == 0 || self.queue_depth == 0 {
            return Err(Error::InvalidConfig(
                "worker pools and queue depth must be non-zero".into(),
            ));
        }
        if self.max_list_keys == 0 {
            return Err(Error::InvalidConfig(
                "max_list_keys must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.voltimeout_ms)
    }
}
