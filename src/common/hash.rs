//! Hashing utilities for mkv
//!
//! - MD5 for the on-volume path layout and for content checksums
//! - HRW (Highest Random Weight) for replica placement
//!
//! Both the path layout and the placement are persisted implicitly (objects on
//! disk, replica lists in metadata), so every function here must stay stable
//! across releases.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

/// Compute the path of a key on any volume server.
///
/// `/aa/bb/<base64(key)>` where `aa` and `bb` are the first two bytes of
/// MD5(key). Two levels of 256 keep every directory bounded, and the base64
/// leaf keeps the path invertible.
pub fn key_to_path(key: &[u8]) -> String {
    let digest = md5::compute(key);
    format!(
        "/{:02x}/{:02x}/{}",
        digest.0[0],
        digest.0[1],
        STANDARD.encode(key)
    )
}

/// Invert the leaf name produced by [`key_to_path`].
pub fn path_name_to_key(name: &str) -> crate::Result<Vec<u8>> {
    STANDARD
        .decode(name)
        .map_err(|e| crate::Error::MetadataCorrupted(format!("bad leaf name {}: {}", name, e)))
}

/// HRW (Highest Random Weight) placement.
///
/// Every volume scores `MD5(key ++ volume)`; volumes are ordered by score,
/// highest first, ties keeping input order. The first `count` win, index 0
/// being the primary. With more than one subvolume, the last four bytes of the
/// winning score pick a shard, appended as `/svXX`.
pub fn route(key: &[u8], volumes: &[String], count: usize, subvolumes: u32) -> Vec<String> {
    let mut scored: Vec<([u8; 16], &String)> = volumes
        .iter()
        .map(|volume| {
            let mut ctx = md5::Context::new();
            ctx.consume(key);
            ctx.consume(volume.as_bytes());
            (ctx.compute().0, volume)
        })
        .collect();

    // sort_by is stable, so equal scores keep input order
    scored.sort_by(|a, b| b.0.cmp(&a.0));

    scored
        .into_iter()
        .take(count)
        .map(|(score, volume)| {
            if subvolumes <= 1 {
                volume.clone()
            } else {
                let sv = u32::from_be_bytes([score[12], score[13], score[14], score[15]]);
                format!("{}/sv{:02X}", volume, sv % subvolumes)
            }
        })
        .collect()
}

/// True iff `current` differs from `target` in length or at any position.
///
/// Order matters: rank 0 is the primary.
pub fn needs_rebalance(current: &[String], target: &[String]) -> bool {
    current != target
}

/// Lower-case hex MD5 of a full object body
pub fn content_hash(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}
