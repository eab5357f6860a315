//! Rebalance: move objects onto the volumes the current placement selects
//!
//! The cluster job does not take key locks. Every step re-checks the volumes
//! and every remote operation is idempotent, so running it again after a crash
//! or alongside live traffic converges.

use crate::common::{display_key, key_to_path, needs_rebalance, Error, Result};
use crate::coordinator::metadata::{cursor_after, SCAN_PAGE};
use crate::coordinator::record::Record;
use crate::coordinator::server::CoordState;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RebalanceReport {
    pub keys_checked: usize,
    pub keys_rebalanced: usize,
    pub keys_failed: usize,
    /// Keys with no reachable copy on any stored replica
    pub keys_missing: usize,
}

impl RebalanceReport {
    fn merge(&mut self, other: RebalanceReport) {
        self.keys_checked += other.keys_checked;
        self.keys_rebalanced += other.keys_rebalanced;
        self.keys_failed += other.keys_failed;
        self.keys_missing += other.keys_missing;
    }
}

/// What [`rebalance_key`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Migration {
    /// Copies and record already match the placement
    Balanced,
    Moved,
    /// None of the stored replicas holds the object
    Missing,
}

/// Migrate one key from its `stored` replicas to `target`.
///
/// Probes the stored replicas, reads the body once from a confirmed holder,
/// writes it to every target that lacks it, points the record at `target`
/// and finally deletes the copies left outside the target.
pub async fn rebalance_key(
    state: &CoordState,
    key: &[u8],
    stored: &[String],
    target: &[String],
) -> Result<Migration> {
    let path = key_to_path(key);
    let timeout = state.config.probe_timeout();

    let mut holders = Vec::new();
    for volume in stored {
        if state.volumes.exists(volume, &path, timeout).await {
            holders.push(volume.clone());
        }
    }
    if holders.is_empty() {
        tracing::warn!("rebalance: no copy of {} on {:?}", display_key(key), stored);
        return Ok(Migration::Missing);
    }
    if !needs_rebalance(&holders, target) && !needs_rebalance(stored, target) {
        return Ok(Migration::Balanced);
    }

    let missing: Vec<&String> = target.iter().filter(|v| !holders.contains(v)).collect();
    if !missing.is_empty() {
        let body = read_any(state, key, &holders, &path).await?;
        for volume in missing {
            state.volumes.put(volume, &path, body.clone()).await?;
        }
    }

    // a concurrent delete wins: never resurrect a key that is no longer active
    let current = state.metadata.get_record(key)?;
    if !current.is_active() {
        tracing::debug!("rebalance: {} changed state, leaving record", display_key(key));
        return Ok(Migration::Moved);
    }
    state
        .metadata
        .put_record(key, &Record::active(target.to_vec(), current.hash))?;

    let mut stale = Vec::new();
    for volume in holders.iter().filter(|v| !target.contains(v)) {
        if let Err(e) = state.volumes.delete(volume, &path).await {
            tracing::warn!("rebalance: delete of {} on {} failed: {}", display_key(key), volume, e);
            stale.push(volume.clone());
        }
    }
    if !stale.is_empty() {
        return Err(Error::volume(
            &stale.join(","),
            format!("stale copies of {} left behind", display_key(key)),
        ));
    }

    tracing::debug!("rebalance: {} {:?} -> {:?}", display_key(key), stored, target);
    Ok(Migration::Moved)
}

async fn read_any(state: &CoordState, key: &[u8], holders: &[String], path: &str) -> Result<Bytes> {
    for volume in holders {
        match state.volumes.get(volume, path).await {
            Ok(body) => return Ok(body),
            Err(e) => tracing::warn!("rebalance: read of {} from {} failed: {}", display_key(key), volume, e),
        }
    }
    Err(Error::RebalanceFailed(format!(
        "no readable copy of {}",
        display_key(key)
    )))
}

struct RebalanceJob {
    key: Vec<u8>,
    replicas: Vec<String>,
}

/// Rebalance every active key with a pool of `rebalance_workers` workers.
pub async fn rebalance_cluster(state: &CoordState) -> Result<RebalanceReport> {
    let workers = state.config.rebalance_workers.max(1);
    tracing::info!("Starting rebalance with {} workers", workers);

    let (tx, rx) = mpsc::channel::<RebalanceJob>(state.config.queue_depth.max(1));
    let rx = Arc::new(Mutex::new(rx));

    let mut pool = JoinSet::new();
    for _ in 0..workers {
        let state = state.clone();
        let rx = rx.clone();
        pool.spawn(async move {
            let mut report = RebalanceReport::default();
            loop {
                let job = rx.lock().await.recv().await;
                let Some(job) = job else { break };
                let target = state.placement.select_volumes(&job.key);
                report.keys_checked += 1;
                match rebalance_key(&state, &job.key, &job.replicas, &target).await {
                    Ok(Migration::Balanced) => {}
                    Ok(Migration::Moved) => report.keys_rebalanced += 1,
                    Ok(Migration::Missing) => report.keys_missing += 1,
                    Err(e) => {
                        tracing::warn!("rebalance of {} failed: {}", display_key(&job.key), e);
                        report.keys_failed += 1;
                    }
                }
            }
            report
        });
    }

    let scanned = feed(state, &tx).await;
    drop(tx);

    let mut report = RebalanceReport::default();
    while let Some(joined) = pool.join_next().await {
        match joined {
            Ok(partial) => report.merge(partial),
            Err(e) => tracing::error!("rebalance worker panicked: {}", e),
        }
    }
    scanned?;

    tracing::info!(
        "Rebalance done: {} checked, {} moved, {} failed, {} missing",
        report.keys_checked,
        report.keys_rebalanced,
        report.keys_failed,
        report.keys_missing
    );
    Ok(report)
}

/// Queue every active record. Soft-deleted keys are left to delete/rebuild.
async fn feed(state: &CoordState, tx: &mpsc::Sender<RebalanceJob>) -> Result<()> {
    let mut cursor: Option<Vec<u8>> = None;
    loop {
        let page = state
            .metadata
            .scan_records(b"", cursor.as_deref(), SCAN_PAGE)?;
        let Some((last, _)) = page.last() else {
            return Ok(());
        };
        cursor = Some(cursor_after(last));

        for (key, record) in page {
            if !record.is_active() {
                continue;
            }
            let job = RebalanceJob {
                key,
                replicas: record.replicas,
            };
            if tx.send(job).await.is_err() {
                return Err(Error::Internal("rebalance workers exited early".into()));
            }
        }
    }
}
