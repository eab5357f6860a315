//! Replicated write, read and delete protocols
//!
//! Callers of [`write_to_replicas`] and [`delete_key`] must hold the key lock.
//! [`locate`] is lock-free.

use crate::common::{
    content_hash, display_key, encode_key, key_to_path, needs_rebalance, Error, Result,
};
use crate::coordinator::record::{KeyState, Record};
use crate::coordinator::server::CoordState;
use crate::coordinator::volume_client::volume_url;
use bytes::Bytes;
use rand::seq::SliceRandom;

/// Where a readable key can be fetched from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Located {
    /// Absolute URL to redirect the client to
    pub location: String,
    /// Content MD5, empty when unknown
    pub hash: String,
    /// Replica details; `None` when served by the fallback
    pub replica: Option<ReplicaInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaInfo {
    /// Stored replica list
    pub volumes: Vec<String>,
    /// Whether the stored list matches the current placement
    pub balanced: bool,
}

/// Write `body` to every target replica and commit the record.
///
/// A placeholder (soft-deleted, no hash) is persisted first so a crash leaves
/// visible state. The first failing replica aborts the write; replicas that
/// were already written are left for rebalance/rebuild.
pub async fn write_to_replicas(state: &CoordState, key: &[u8], body: Bytes) -> Result<Record> {
    let targets = state.placement.select_volumes(key);
    state
        .metadata
        .put_record(key, &Record::placeholder(targets.clone()))?;

    let path = key_to_path(key);
    for (i, volume) in targets.iter().enumerate() {
        // Bytes clones share the buffer read once from the request
        if let Err(e) = state.volumes.put(volume, &path, body.clone()).await {
            tracing::warn!(
                "replica {} write failed for {} on {}: {}",
                i,
                display_key(key),
                volume,
                e
            );
            return Err(e);
        }
    }

    let hash = if state.config.md5sum {
        content_hash(&body)
    } else {
        String::new()
    };

    // durability point: until this lands the key reads as deleted
    let record = Record::active(targets, hash);
    state.metadata.put_record(key, &record)?;
    Ok(record)
}

/// Resolve a key to a live replica (or the fallback server).
pub async fn locate(state: &CoordState, key: &[u8]) -> Result<Located> {
    let record = state.metadata.get_record(key)?;

    if !record.is_active() {
        return match &state.config.fallback {
            Some(fallback) => Ok(Located {
                location: format!("http://{}{}", fallback, encode_key(key)),
                hash: record.hash,
                replica: None,
            }),
            None => Err(Error::NotFound(display_key(key))),
        };
    }

    let balanced = !needs_rebalance(&record.replicas, &state.placement.select_volumes(key));
    if !balanced {
        tracing::warn!(
            "{} on wrong volumes {:?}, needs rebalance",
            display_key(key),
            record.replicas
        );
    }

    let mut order: Vec<usize> = (0..record.replicas.len()).collect();
    order.shuffle(&mut rand::thread_rng());

    let path = key_to_path(key);
    let timeout = state.config.probe_timeout();
    for i in order {
        let volume = &record.replicas[i];
        if state.volumes.exists(volume, &path, timeout).await {
            return Ok(Located {
                location: volume_url(volume, &path),
                hash: record.hash.clone(),
                replica: Some(ReplicaInfo {
                    volumes: record.replicas.clone(),
                    balanced,
                }),
            });
        }
    }

    tracing::warn!(
        "{} has no reachable replica among {:?}",
        display_key(key),
        record.replicas
    );
    Err(Error::NotFound(display_key(key)))
}

/// Delete (`unlink == false`) or unlink a key.
///
/// Phase 1 always marks the record soft-deleted. A full delete then removes
/// every replica and, only if all of them succeed, the record itself.
pub async fn delete_key(state: &CoordState, key: &[u8], unlink: bool) -> Result<()> {
    let record = state.metadata.get_record(key)?;
    match record.state {
        KeyState::HardDeleted => return Err(Error::NotFound(display_key(key))),
        KeyState::SoftDeleted if unlink => return Err(Error::NotFound(display_key(key))),
        KeyState::Active if !unlink && state.config.protect => {
            return Err(Error::Forbidden(format!(
                "{} is active, unlink it before deleting",
                display_key(key)
            )))
        }
        _ => {}
    }

    state.metadata.put_record(key, &record.soft_deleted())?;
    if unlink {
        return Ok(());
    }

    let path = key_to_path(key);
    let mut failed = Vec::new();
    for volume in &record.replicas {
        if let Err(e) = state.volumes.delete(volume, &path).await {
            tracing::warn!("delete of {} on {} failed: {}", display_key(key), volume, e);
            failed.push(volume.clone());
        }
    }
    if !failed.is_empty() {
        // the soft-delete marker stays; retry the delete or rebuild
        return Err(Error::volume(
            &failed.join(","),
            format!("delete of {} left orphan copies", display_key(key)),
        ));
    }

    state.metadata.delete_record(key)
}
