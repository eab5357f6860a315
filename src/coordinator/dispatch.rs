//! Request dispatch
//!
//! Maps each master operation onto the lock manager, metadata store and
//! replication protocols. Transport-agnostic: the HTTP layer only translates
//! requests into [`Op`]s and [`Reply`]/[`Error`] back into responses.

use crate::common::{display_key, Error, Result};
use crate::coordinator::lock::KeyGuard;
use crate::coordinator::metadata::cursor_after;
use crate::coordinator::record::KeyState;
use crate::coordinator::replication::{delete_key, locate, write_to_replicas, Located};
use crate::coordinator::server::CoordState;
use crate::ops::{rebalance_key, Migration};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

const LIST_PAGE: usize = 1000;

#[derive(Debug, Clone)]
pub enum Op {
    Get,
    Head,
    Put(Bytes),
    Delete,
    Unlink,
    Rebalance,
}

impl Op {
    pub fn name(&self) -> &'static str {
        match self {
            Op::Get => "GET",
            Op::Head => "HEAD",
            Op::Put(_) => "PUT",
            Op::Delete => "DELETE",
            Op::Unlink => "UNLINK",
            Op::Rebalance => "REBALANCE",
        }
    }
}

#[derive(Debug)]
pub enum Reply {
    /// Redirect to a replica or the fallback
    Found(Located),
    Created,
    /// Delete, unlink and rebalance success
    Done,
}

/// Run one keyed operation.
///
/// Reads are lock-free. Every mutation first takes the key lock and fails
/// with [`Error::Conflict`] if another request holds it.
pub async fn dispatch(state: &CoordState, key: &[u8], op: Op) -> Result<Reply> {
    match op {
        Op::Get | Op::Head => locate(state, key).await.map(Reply::Found),
        Op::Put(body) => {
            let _guard = lock(state, key)?;
            put(state, key, body).await
        }
        Op::Delete => {
            let _guard = lock(state, key)?;
            delete_key(state, key, false).await.map(|_| Reply::Done)
        }
        Op::Unlink => {
            let _guard = lock(state, key)?;
            delete_key(state, key, true).await.map(|_| Reply::Done)
        }
        Op::Rebalance => {
            let _guard = lock(state, key)?;
            rebalance(state, key).await
        }
    }
}

fn lock<'a>(state: &'a CoordState, key: &[u8]) -> Result<KeyGuard<'a>> {
    state.locks.acquire(key).ok_or_else(|| {
        Error::Conflict(format!("{} is busy, retry later", display_key(key)))
    })
}

async fn put(state: &CoordState, key: &[u8], body: Bytes) -> Result<Reply> {
    if body.is_empty() {
        return Err(Error::LengthRequired(display_key(key)));
    }

    // This check and the placeholder write inside write_to_replicas are two
    // separate store calls; only the key lock makes them safe.
    if state.metadata.get_record(key)?.is_active() {
        return Err(Error::Conflict(format!(
            "{} already exists, delete it first",
            display_key(key)
        )));
    }

    write_to_replicas(state, key, body).await?;
    Ok(Reply::Created)
}

async fn rebalance(state: &CoordState, key: &[u8]) -> Result<Reply> {
    let record = state.metadata.get_record(key)?;
    if !record.is_active() {
        return Err(Error::NotFound(display_key(key)));
    }
    let target = state.placement.select_volumes(key);
    match rebalance_key(state, key, &record.replicas, &target).await? {
        Migration::Missing => Err(Error::RebalanceFailed(format!(
            "no replica of {} is reachable",
            display_key(key)
        ))),
        Migration::Balanced | Migration::Moved => Ok(Reply::Done),
    }
}

/// Which records a listing returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListFilter {
    /// `?list`: active keys
    Active,
    /// `?unlinked`: soft-deleted keys
    Unlinked,
}

impl ListFilter {
    /// The operation is the first `&`-separated query segment.
    pub fn from_query(query: &str) -> Result<Self> {
        match query.split('&').next().unwrap_or_default() {
            "list" => Ok(ListFilter::Active),
            "unlinked" => Ok(ListFilter::Unlinked),
            other => Err(Error::Forbidden(format!("unknown query operation {:?}", other))),
        }
    }

    fn accepts(self, state: KeyState) -> bool {
        match self {
            ListFilter::Active => state == KeyState::Active,
            ListFilter::Unlinked => state == KeyState::SoftDeleted,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListParams {
    pub start: Option<String>,
    pub limit: Option<String>,
}

impl ListParams {
    /// Absent, zero or negative means unlimited (reported as `0`)
    pub fn limit(&self) -> Result<usize> {
        match self.limit.as_deref() {
            None | Some("") => Ok(0),
            Some(raw) => raw
                .parse::<i64>()
                .map(|n| usize::try_from(n).unwrap_or(0))
                .map_err(|_| Error::BadRequest(format!("invalid limit {:?}", raw))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListPage {
    /// Key to pass as `start` for the next page, empty at the end
    pub next: String,
    pub keys: Vec<String>,
}

/// Range listing of keys under `prefix`.
///
/// Fails with [`Error::PayloadTooLarge`] once more than `max_list_keys`
/// matching keys would be returned; a `limit` at or below it never trips.
pub fn list(
    state: &CoordState,
    prefix: &[u8],
    filter: ListFilter,
    params: &ListParams,
) -> Result<ListPage> {
    let limit = params.limit()?;
    let max = state.config.max_list_keys;
    let mut cursor: Option<Vec<u8>> = params.start.as_ref().map(|s| s.as_bytes().to_vec());
    let mut keys = Vec::new();

    loop {
        let page = state
            .metadata
            .scan_records(prefix, cursor.as_deref(), LIST_PAGE)?;
        let exhausted = page.len() < LIST_PAGE;

        for (key, record) in &page {
            if !filter.accepts(record.state) {
                continue;
            }
            if limit > 0 && keys.len() == limit {
                return Ok(ListPage {
                    next: display_key(key),
                    keys,
                });
            }
            if keys.len() >= max {
                return Err(Error::PayloadTooLarge(max));
            }
            keys.push(display_key(key));
        }

        match page.last() {
            Some((last, _)) if !exhausted => cursor = Some(cursor_after(last)),
            _ => {
                return Ok(ListPage {
                    next: String::new(),
                    keys,
                })
            }
        }
    }
}
