//! Rebuild the metadata store from what the volumes actually hold
//!
//! Disaster recovery: the index is wiped and every `/{aa}/{bb}/` directory of
//! every volume (or subvolume) is crawled. Each discovered copy is merged into
//! its key's record under the key lock.

use crate::common::{display_key, path_name_to_key, Error, Result};
use crate::coordinator::record::Record;
use crate::coordinator::server::CoordState;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;

/// Attempts to take a contended key lock before giving up on an entry
const MERGE_ATTEMPTS: usize = 100;
const MERGE_BACKOFF: Duration = Duration::from_millis(10);

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RebuildReport {
    /// Leaf directories crawled
    pub directories_listed: usize,
    pub directories_failed: usize,
    pub entries_merged: usize,
    pub entries_failed: usize,
}

impl RebuildReport {
    fn merge(&mut self, other: RebuildReport) {
        self.directories_listed += other.directories_listed;
        self.directories_failed += other.directories_failed;
        self.entries_merged += other.entries_merged;
        self.entries_failed += other.entries_failed;
    }
}

/// One leaf directory to crawl
struct RebuildJob {
    volume: String,
    dir: String,
}

fn is_subvolume_dir(name: &str) -> bool {
    name.len() == 4 && name.starts_with("sv")
}

fn is_fanout_dir(name: &str) -> bool {
    name.len() == 2 && hex::decode(name).is_ok()
}

/// Record `volume` as a holder of `key`.
///
/// Keeps the merged list in placement rank order with unknown volumes last,
/// so the result does not depend on discovery order.
pub async fn merge_discovery(state: &CoordState, key: &[u8], volume: &str) -> Result<()> {
    for _ in 0..MERGE_ATTEMPTS {
        if let Some(_guard) = state.locks.acquire(key) {
            let record = state.metadata.get_record(key)?;
            let mut holders = record.replicas;
            if !holders.iter().any(|v| v == volume) {
                holders.push(volume.to_string());
            }
            let ranked = state.placement.rank(key, &holders);
            return state
                .metadata
                .put_record(key, &Record::active(ranked, record.hash));
        }
        tokio::time::sleep(MERGE_BACKOFF).await;
    }
    Err(Error::Conflict(format!(
        "{} stayed locked during rebuild",
        display_key(key)
    )))
}

/// Wipe the metadata store and rebuild it with `rebuild_workers` workers.
pub async fn rebuild_cluster(state: &CoordState) -> Result<RebuildReport> {
    let cleared = state.metadata.clear()?;
    let workers = state.config.rebuild_workers.max(1);
    tracing::info!(
        "Starting rebuild: cleared {} records, {} workers",
        cleared,
        workers
    );

    let (tx, rx) = mpsc::channel::<RebuildJob>(state.config.queue_depth.max(1));
    let rx = Arc::new(Mutex::new(rx));

    let mut pool = JoinSet::new();
    for _ in 0..workers {
        let state = state.clone();
        let rx = rx.clone();
        pool.spawn(async move {
            let mut report = RebuildReport::default();
            loop {
                let job = rx.lock().await.recv().await;
                let Some(job) = job else { break };
                crawl_leaf(&state, &job, &mut report).await;
            }
            report
        });
    }

    let mut report = RebuildReport::default();
    for volume in state.placement.volumes() {
        for root in volume_roots(state, volume).await {
            crawl_root(state, &root, &tx, &mut report).await;
        }
    }
    drop(tx);

    while let Some(joined) = pool.join_next().await {
        match joined {
            Ok(partial) => report.merge(partial),
            Err(e) => tracing::error!("rebuild worker panicked: {}", e),
        }
    }

    tracing::info!(
        "Rebuild done: {} directories ({} failed), {} entries merged, {} failed",
        report.directories_listed,
        report.directories_failed,
        report.entries_merged,
        report.entries_failed
    );
    Ok(report)
}

/// The subvolume directories of `volume`, or the volume itself if it has none.
async fn volume_roots(state: &CoordState, volume: &str) -> Vec<String> {
    let entries = match state.volumes.list(volume, "/").await {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!("rebuild: cannot list {}: {}", volume, e);
            return vec![volume.to_string()];
        }
    };
    let subvolumes: Vec<String> = entries
        .iter()
        .filter(|e| e.is_dir() && is_subvolume_dir(&e.name))
        .map(|e| format!("{}/{}", volume, e.name))
        .collect();
    if subvolumes.is_empty() {
        vec![volume.to_string()]
    } else {
        subvolumes
    }
}

/// Walk the two fan-out levels of `root` and queue each leaf directory.
async fn crawl_root(
    state: &CoordState,
    root: &str,
    tx: &mpsc::Sender<RebuildJob>,
    report: &mut RebuildReport,
) {
    let Some(first) = list_fanout(state, root, "/", report).await else {
        return;
    };
    for a in first {
        let Some(second) = list_fanout(state, root, &format!("/{}/", a), report).await else {
            continue;
        };
        for b in second {
            let job = RebuildJob {
                volume: root.to_string(),
                dir: format!("/{}/{}/", a, b),
            };
            if tx.send(job).await.is_err() {
                tracing::error!("rebuild workers exited early");
                return;
            }
        }
    }
}

async fn list_fanout(
    state: &CoordState,
    volume: &str,
    dir: &str,
    report: &mut RebuildReport,
) -> Option<Vec<String>> {
    match state.volumes.list(volume, dir).await {
        Ok(entries) => Some(
            entries
                .into_iter()
                .filter(|e| e.is_dir() && is_fanout_dir(&e.name))
                .map(|e| e.name)
                .collect(),
        ),
        Err(e) => {
            tracing::warn!("rebuild: cannot list {}{}: {}", volume, dir, e);
            report.directories_failed += 1;
            None
        }
    }
}

async fn crawl_leaf(state: &CoordState, job: &RebuildJob, report: &mut RebuildReport) {
    let entries = match state.volumes.list(&job.volume, &job.dir).await {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!("rebuild: cannot list {}{}: {}", job.volume, job.dir, e);
            report.directories_failed += 1;
            return;
        }
    };
    report.directories_listed += 1;

    for entry in entries.into_iter().filter(|e| !e.is_dir()) {
        let merged = match path_name_to_key(&entry.name) {
            Ok(key) => merge_discovery(state, &key, &job.volume).await,
            Err(e) => Err(e),
        };
        match merged {
            Ok(()) => report.entries_merged += 1,
            Err(e) => {
                tracing::warn!(
                    "rebuild: skipping {}{}{}: {}",
                    job.volume,
                    job.dir,
                    entry.name,
                    e
                );
                report.entries_failed += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{key_to_path, MasterConfig};
    use crate::coordinator::metadata::MetadataStore;
    use crate::coordinator::record::KeyState;
    use crate::coordinator::volume_client::MemoryVolumes;

    fn state(subvolumes: u32) -> (CoordState, Arc<MemoryVolumes>) {
        let config = MasterConfig {
            volumes: vec!["v1".into(), "v2".into(), "v3".into()],
            replicas: 2,
            subvolumes,
            rebuild_workers: 8,
            ..Default::default()
        };
        let store = Arc::new(MemoryVolumes::new());
        let state = CoordState::new(config, MetadataStore::in_memory(), store.clone());
        (state, store)
    }

    #[test]
    fn test_directory_name_filters() {
        assert!(is_subvolume_dir("sv0A"));
        assert!(!is_subvolume_dir("sv1"));
        assert!(!is_subvolume_dir("ab12"));
        assert!(is_fanout_dir("5d"));
        assert!(!is_fanout_dir("zz"));
        assert!(!is_fanout_dir("5d4"));
    }

    #[tokio::test]
    async fn test_merge_ranks_holders() {
        let (state, _) = state(1);
        let target = state.placement.select_volumes(b"/k");
        merge_discovery(&state, b"/k", "stray").await.unwrap();
        merge_discovery(&state, b"/k", &target[1]).await.unwrap();
        merge_discovery(&state, b"/k", &target[0]).await.unwrap();
        merge_discovery(&state, b"/k", &target[0]).await.unwrap();

        let record = state.metadata.get_record(b"/k").unwrap();
        assert_eq!(record.state, KeyState::Active);
        assert_eq!(
            record.replicas,
            vec![target[0].clone(), target[1].clone(), "stray".to_string()]
        );
    }

    #[tokio::test]
    async fn test_merge_gives_up_on_held_lock() {
        let (state, _) = state(1);
        let _held = state.locks.acquire(b"/k").unwrap();
        let merged = tokio::time::timeout(
            Duration::from_secs(10),
            merge_discovery(&state, b"/k", "v1"),
        )
        .await
        .unwrap();
        assert!(matches!(merged, Err(Error::Conflict(_))));
    }

    #[tokio::test]
    async fn test_rebuild_from_volumes() {
        let (state, store) = state(1);
        let keys: Vec<Vec<u8>> = (0..20).map(|i| format!("/obj/{}", i).into_bytes()).collect();
        for key in &keys {
            for volume in state.placement.select_volumes(key) {
                store.insert(&volume, &key_to_path(key), "x");
            }
        }
        // junk the crawler must ignore
        store.insert("v1", "/zz/00/aGVsbG8=", "x");
        store.insert("v1", "/lost+found/file", "x");
        state
            .metadata
            .put_record(b"/stale", &Record::active(vec!["v1".into()], ""))
            .unwrap();

        let report = rebuild_cluster(&state).await.unwrap();
        assert_eq!(report.entries_merged, 40);
        assert_eq!(report.entries_failed, 0);

        for key in &keys {
            let record = state.metadata.get_record(key).unwrap();
            assert!(record.is_active());
            assert_eq!(record.replicas, state.placement.select_volumes(key));
        }
        assert_eq!(
            state.metadata.get_record(b"/stale").unwrap().state,
            KeyState::HardDeleted
        );
    }

    #[tokio::test]
    async fn test_rebuild_discovers_subvolumes() {
        let (state, store) = state(4);
        for volume in state.placement.select_volumes(b"/hello") {
            store.insert(&volume, &key_to_path(b"/hello"), "world");
        }

        rebuild_cluster(&state).await.unwrap();
        let record = state.metadata.get_record(b"/hello").unwrap();
        assert_eq!(record.replicas, state.placement.select_volumes(b"/hello"));
        assert!(record.replicas.iter().all(|v| v.contains("/sv")));
    }

    #[tokio::test]
    async fn test_rebuild_counts_bad_names() {
        let (state, store) = state(1);
        store.insert("v2", "/ab/cd/not*base64", "x");
        let report = rebuild_cluster(&state).await.unwrap();
        assert_eq!(report.entries_merged, 0);
        assert_eq!(report.entries_failed, 1);
        assert_eq!(report.directories_listed, 1);
    }
}
