//! Master binary

use clap::{Parser, Subcommand};
use mkv::common::{parse_duration, MasterConfig};
use mkv::Coordinator;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "mkv")]
#[command(about = "mkv master: metadata and placement for a distributed object store")]
#[command(version)]
struct Cli {
    /// TOML config file (defaults to $MKV_CONFIG, then ./mkv.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Port for the HTTP API
    #[arg(long, global = true)]
    port: Option<u16>,

    /// Path to the metadata database
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Volume servers (comma-separated host:port)
    #[arg(long, global = true, value_delimiter = ',')]
    volumes: Vec<String>,

    /// Replication factor
    #[arg(long, global = true)]
    replicas: Option<usize>,

    /// Subvolumes per volume server
    #[arg(long, global = true)]
    subvolumes: Option<u32>,

    /// Redirect missing keys to this server
    #[arg(long, global = true)]
    fallback: Option<String>,

    /// Require UNLINK before DELETE of an active key
    #[arg(long, global = true)]
    protect: bool,

    /// Compute MD5 of every written body
    #[arg(long, global = true)]
    md5sum: Option<bool>,

    /// Volume probe timeout for reads (e.g. 1s, 500ms)
    #[arg(long, global = true)]
    voltimeout: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the HTTP API
    Server,
    /// Rebuild the metadata database from the volumes
    Rebuild,
    /// Move every key onto its current placement
    Rebalance,
}

impl Cli {
    /// CLI flags override the file and the environment.
    fn apply(&self, config: &mut MasterConfig) -> anyhow::Result<()> {
        if let Some(port) = self.port {
            config.bind_addr.set_port(port);
        }
        if let Some(db) = &self.db {
            config.db_path = db.clone();
        }
        if !self.volumes.is_empty() {
            config.volumes = self.volumes.clone();
        }
        if let Some(replicas) = self.replicas {
            config.replicas = replicas;
        }
        if let Some(subvolumes) = self.subvolumes {
            config.subvolumes = subvolumes;
        }
        if let Some(fallback) = &self.fallback {
            config.fallback = Some(fallback.clone()).filter(|f| !f.is_empty());
        }
        if self.protect {
            config.protect = true;
        }
        if let Some(md5sum) = self.md5sum {
            config.md5sum = md5sum;
        }
        if let Some(voltimeout) = &self.voltimeout {
            config.voltimeout_ms = parse_duration(voltimeout)?.as_millis() as u64;
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = MasterConfig::load(cli.config.as_deref())?;
    cli.apply(&mut config)?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let coord = Coordinator::new(config)?;

    match cli.command {
        Commands::Server => coord.serve().await?,
        Commands::Rebuild => {
            let report = coord.rebuild().await?;
            println!(
                "rebuild: {} directories listed, {} failed, {} entries merged, {} failed",
                report.directories_listed,
                report.directories_failed,
                report.entries_merged,
                report.entries_failed
            );
        }
        Commands::Rebalance => {
            let report = coord.rebalance().await?;
            println!(
                "rebalance: {} keys checked, {} rebalanced, {} failed, {} missing",
                report.keys_checked,
                report.keys_rebalanced,
                report.keys_failed,
                report.keys_missing
            );
        }
    }

    Ok(())
}
