//! Client side of the volume server protocol
//!
//! Volume servers are plain HTTP file servers (nginx with WebDAV and JSON
//! autoindex in the reference deployment). Paths are the ones produced by
//! [`key_to_path`](crate::common::key_to_path).

use crate::common::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Mutex;
use std::time::Duration;

/// One entry of a directory listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub mtime: String,
}

impl DirEntry {
    pub fn is_dir(&self) -> bool {
        self.kind == "directory"
    }
}

/// URL of `path` on `volume`
pub fn volume_url(volume: &str, path: &str) -> String {
    format!("http://{}{}", volume, path)
}

#[async_trait]
pub trait VolumeClient: Send + Sync {
    /// Read a whole object
    async fn get(&self, volume: &str, path: &str) -> Result<Bytes>;

    /// Existence probe. Anything but a 200 within `timeout` is "absent".
    async fn exists(&self, volume: &str, path: &str, timeout: Duration) -> bool;

    /// Write an object with a declared length
    async fn put(&self, volume: &str, path: &str, body: Bytes) -> Result<()>;

    /// Delete an object; an object that is already gone counts as deleted
    async fn delete(&self, volume: &str, path: &str) -> Result<()>;

    /// List a directory-style path such as `/` or `/5d/41/`
    async fn list(&self, volume: &str, dir: &str) -> Result<Vec<DirEntry>>;
}

/// reqwest-backed client
pub struct HttpVolumeClient {
    client: reqwest::Client,
}

impl HttpVolumeClient {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(100)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl VolumeClient for HttpVolumeClient {
    async fn get(&self, volume: &str, path: &str) -> Result<Bytes> {
        let resp = self.client.get(volume_url(volume, path)).send().await?;
        if resp.status() != StatusCode::OK {
            return Err(Error::volume(volume, format!("get {}: status {}", path, resp.status())));
        }
        Ok(resp.bytes().await?)
    }

    async fn exists(&self, volume: &str, path: &str, timeout: Duration) -> bool {
        match self
            .client
            .head(volume_url(volume, path))
            .timeout(timeout)
            .send()
            .await
        {
            Ok(resp) => resp.status() == StatusCode::OK,
            Err(e) => {
                tracing::debug!("probe {}{} failed: {}", volume, path, e);
                false
            }
        }
    }

    async fn put(&self, volume: &str, path: &str, body: Bytes) -> Result<()> {
        let resp = self
            .client
            .put(volume_url(volume, path))
            .body(body)
            .send()
            .await?;
        match resp.status() {
            StatusCode::CREATED | StatusCode::NO_CONTENT => Ok(()),
            status => Err(Error::volume(volume, format!("put {}: status {}", path, status))),
        }
    }

    async fn delete(&self, volume: &str, path: &str) -> Result<()> {
        let resp = self.client.delete(volume_url(volume, path)).send().await?;
        match resp.status() {
            StatusCode::NO_CONTENT | StatusCode::NOT_FOUND => Ok(()),
            status => Err(Error::volume(volume, format!("delete {}: status {}", path, status))),
        }
    }

    async fn list(&self, volume: &str, dir: &str) -> Result<Vec<DirEntry>> {
        let resp = self.client.get(volume_url(volume, dir)).send().await?;
        if resp.status() != StatusCode::OK {
            return Err(Error::volume(volume, format!("list {}: status {}", dir, resp.status())));
        }
        Ok(resp.json().await?)
    }
}

/// In-memory volume servers.
///
/// Objects are keyed by `"{volume}{path}"`, so `host:1/sv03` + `/5d/41/x`
/// lands under host `host:1`, exactly as on a real server. Hosts can be taken
/// offline and a per-call latency can be injected.
#[derive(Default)]
pub struct MemoryVolumes {
    objects: Mutex<BTreeMap<String, Bytes>>,
    offline: Mutex<HashSet<String>>,
    latency: Mutex<Duration>,
}

impl MemoryVolumes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_offline(&self, host: &str, offline: bool) {
        let mut hosts = self.offline.lock().unwrap_or_else(|e| e.into_inner());
        if offline {
            hosts.insert(host.to_string());
        } else {
            hosts.remove(host);
        }
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap_or_else(|e| e.into_inner()) = latency;
    }

    /// Place an object directly, bypassing the coordinator
    pub fn insert(&self, volume: &str, path: &str, body: impl Into<Bytes>) {
        let mut objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
        objects.insert(format!("{}{}", volume, path), body.into());
    }

    pub fn contains(&self, volume: &str, path: &str) -> bool {
        let objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
        objects.contains_key(&format!("{}{}", volume, path))
    }

    /// Number of stored objects across every volume
    pub fn object_count(&self) -> usize {
        self.objects.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    async fn reach(&self, volume: &str) -> Result<()> {
        let latency = *self.latency.lock().unwrap_or_else(|e| e.into_inner());
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let host = volume.split('/').next().unwrap_or(volume);
        let offline = self.offline.lock().unwrap_or_else(|e| e.into_inner());
        if offline.contains(host) {
            return Err(Error::volume(volume, "connection refused"));
        }
        Ok(())
    }
}

#[async_trait]
impl VolumeClient for MemoryVolumes {
    async fn get(&self, volume: &str, path: &str) -> Result<Bytes> {
        self.reach(volume).await?;
        let objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
        objects
            .get(&format!("{}{}", volume, path))
            .cloned()
            .ok_or_else(|| Error::volume(volume, format!("get {}: status 404", path)))
    }

    async fn exists(&self, volume: &str, path: &str, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, self.reach(volume)).await {
            Ok(Ok(())) => self.contains(volume, path),
            _ => false,
        }
    }

    async fn put(&self, volume: &str, path: &str, body: Bytes) -> Result<()> {
        self.reach(volume).await?;
        self.insert(volume, path, body);
        Ok(())
    }

    async fn delete(&self, volume: &str, path: &str) -> Result<()> {
        self.reach(volume).await?;
        let mut objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
        objects.remove(&format!("{}{}", volume, path));
        Ok(())
    }

    async fn list(&self, volume: &str, dir: &str) -> Result<Vec<DirEntry>> {
        self.reach(volume).await?;
        let mut prefix = format!("{}{}", volume, dir);
        if !prefix.ends_with('/') {
            prefix.push('/');
        }

        let objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
        let mut dirs = BTreeSet::new();
        let mut files = BTreeSet::new();
        for location in objects.keys() {
            let Some(rest) = location.strip_prefix(&prefix) else {
                continue;
            };
            match rest.split_once('/') {
                Some((child, _)) => dirs.insert(child.to_string()),
                None => files.insert(rest.to_string()),
            };
        }

        let entry = |name: String, kind: &str| DirEntry {
            name,
            kind: kind.to_string(),
            mtime: String::new(),
        };
        Ok(dirs
            .into_iter()
            .map(|name| entry(name, "directory"))
            .chain(files.into_iter().map(|name| entry(name, "file")))
            .collect())
    }
}
