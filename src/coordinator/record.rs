//! Per-key metadata record and its persisted encoding
//!
//! The value stored for each key is plain text so the index stays greppable:
//!
//! ```text
//! [DELETED][HASH<32 hex>]volume1,volume2,...
//! ```
//!
//! This layout is the on-disk format of existing stores and must not change.

use crate::common::{Error, Result};

const DELETED_TAG: &str = "DELETED";
const HASH_TAG: &str = "HASH";
const HASH_LEN: usize = 32;

/// Deletion state of a key.
///
/// `HardDeleted` is never stored: it is what a missing key looks like.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    Active,
    SoftDeleted,
    HardDeleted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Volumes believed to hold the object, in placement rank
    pub replicas: Vec<String>,
    pub state: KeyState,
    /// MD5 of the whole body, empty when unknown
    pub hash: String,
}

impl Record {
    pub fn active(replicas: Vec<String>, hash: impl Into<String>) -> Self {
        Self {
            replicas,
            state: KeyState::Active,
            hash: hash.into(),
        }
    }

    /// Placeholder written before any replica is touched.
    pub fn placeholder(replicas: Vec<String>) -> Self {
        Self {
            replicas,
            state: KeyState::SoftDeleted,
            hash: String::new(),
        }
    }

    /// What a key absent from the store resolves to.
    pub fn hard_deleted() -> Self {
        Self {
            replicas: Vec::new(),
            state: KeyState::HardDeleted,
            hash: String::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == KeyState::Active
    }

    /// Same record, marked soft-deleted.
    pub fn soft_deleted(&self) -> Self {
        Self {
            state: KeyState::SoftDeleted,
            ..self.clone()
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = String::new();
        match self.state {
            KeyState::HardDeleted => {
                return Err(Error::Internal(
                    "a hard-deleted record cannot be persisted".into(),
                ))
            }
            KeyState::SoftDeleted => out.push_str(DELETED_TAG),
            KeyState::Active => {}
        }
        if self.hash.len() == HASH_LEN {
            out.push_str(HASH_TAG);
            out.push_str(&self.hash);
        }
        out.push_str(&self.replicas.join(","));
        Ok(out.into_bytes())
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut rest = std::str::from_utf8(data)
            .map_err(|e| Error::MetadataCorrupted(format!("record is not UTF-8: {}", e)))?;

        let mut state = KeyState::Active;
        if let Some(stripped) = rest.strip_prefix(DELETED_TAG) {
            state = KeyState::SoftDeleted;
            rest = stripped;
        }

        let mut hash = String::new();
        if let Some(stripped) = rest.strip_prefix(HASH_TAG) {
            let (digest, tail) = stripped
                .split_at_checked(HASH_LEN)
                .ok_or_else(|| Error::MetadataCorrupted("truncated hash tag".into()))?;
            hash = digest.to_string();
            rest = tail;
        }

        let replicas = if rest.is_empty() {
            Vec::new()
        } else {
            rest.split(',').map(str::to_string).collect()
        };

        Ok(Self {
            replicas,
            state,
            hash,
        })
    }
}
