//! Metadata store
//!
//! [`KvStore`] is the raw ordered byte map (RocksDB in production, a
//! `BTreeMap` for tests and embedding). [`MetadataStore`] layers the record
//! codec on top. The store gives no compound atomicity: every
//! read-modify-write of a key must run under that key's lock.

use crate::common::Result;
use crate::coordinator::record::Record;
use rocksdb::{Direction, IteratorMode, Options, DB};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

/// Page size for full scans
pub const SCAN_PAGE: usize = 1000;

/// Ordered key-value backend for metadata
pub trait KvStore: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;
    fn delete(&self, key: &[u8]) -> Result<()>;

    /// Up to `limit` entries whose key starts with `prefix`, in key order,
    /// beginning at `max(prefix, start)`.
    fn scan(
        &self,
        prefix: &[u8],
        start: Option<&[u8]>,
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;
}

fn seek_point<'a>(prefix: &'a [u8], start: Option<&'a [u8]>) -> &'a [u8] {
    match start {
        Some(start) if start > prefix => start,
        _ => prefix,
    }
}

/// RocksDB store
pub struct RocksStore {
    db: DB,
}

impl RocksStore {
    /// Open or create the metadata database
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, path)?;
        Ok(Self { db })
    }
}

impl KvStore for RocksStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.db.get(key)?)
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.db.put(key, value)?;
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.db.delete(key)?;
        Ok(())
    }

    fn scan(
        &self,
        prefix: &[u8],
        start: Option<&[u8]>,
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let from = seek_point(prefix, start);
        let iter = self.db.iterator(IteratorMode::From(from, Direction::Forward));

        let mut entries = Vec::new();
        for item in iter {
            if entries.len() >= limit {
                break;
            }
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            entries.push((key.to_vec(), value.to_vec()));
        }
        Ok(entries)
    }
}

/// In-memory store
#[derive(Default)]
pub struct MemoryStore {
    map: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let map = self.map.read().unwrap_or_else(|e| e.into_inner());
        Ok(map.get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut map = self.map.write().unwrap_or_else(|e| e.into_inner());
        map.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        let mut map = self.map.write().unwrap_or_else(|e| e.into_inner());
        map.remove(key);
        Ok(())
    }

    fn scan(
        &self,
        prefix: &[u8],
        start: Option<&[u8]>,
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let from = seek_point(prefix, start).to_vec();
        let map = self.map.read().unwrap_or_else(|e| e.into_inner());
        Ok(map
            .range(from..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .take(limit)
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }
}

/// Record-level view over a [`KvStore`]
#[derive(Clone)]
pub struct MetadataStore {
    kv: Arc<dyn KvStore>,
}

impl MetadataStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(Arc::new(RocksStore::open(path)?)))
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    /// Record for `key`; a missing key reads as hard-deleted.
    pub fn get_record(&self, key: &[u8]) -> Result<Record> {
        match self.kv.get(key)? {
            Some(bytes) => Record::decode(&bytes),
            None => Ok(Record::hard_deleted()),
        }
    }

    pub fn put_record(&self, key: &[u8], record: &Record) -> Result<()> {
        let value = record.encode()?;
        self.kv.put(key, &value)
    }

    /// Hard delete: remove the key entirely.
    pub fn delete_record(&self, key: &[u8]) -> Result<()> {
        self.kv.delete(key)
    }

    /// One page of decoded records, see [`KvStore::scan`].
    pub fn scan_records(
        &self,
        prefix: &[u8],
        start: Option<&[u8]>,
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Record)>> {
        self.kv
            .scan(prefix, start, limit)?
            .into_iter()
            .map(|(key, value)| Ok((key, Record::decode(&value)?)))
            .collect()
    }

    /// Remove every key. Only rebuild does this.
    pub fn clear(&self) -> Result<usize> {
        let mut removed = 0;
        let mut cursor: Option<Vec<u8>> = None;
        loop {
            // resume after the last deleted key, never over tombstones
            let page = self.kv.scan(b"", cursor.as_deref(), SCAN_PAGE)?;
            let Some((last, _)) = page.last() else {
                return Ok(removed);
            };
            cursor = Some(cursor_after(last));
            for (key, _) in page {
                self.kv.delete(&key)?;
                removed += 1;
            }
        }
    }
}

/// Cursor that resumes a scan right after `last`.
pub fn cursor_after(last: &[u8]) -> Vec<u8> {
    let mut next = last.to_vec();
    next.push(0);
    next
}
