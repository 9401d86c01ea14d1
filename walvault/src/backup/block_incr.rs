//! Block-level incremental storage.
//!
//! When enabled, a changed file is not re-stored whole: the file is cut into
//! fixed-size blocks, each block hashed, and only blocks whose hash differs
//! from the referenced backup's map are stored, concatenated in block order.
//! Restore overlays those blocks onto the base file from the reference.

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::errors::{Error, Result};

/// Default block size; a compromise between map size and delta granularity.
pub const BLOCK_SIZE_DEFAULT: usize = 128 * 1024;

/// Per-file block map recorded in the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockIncrMap {
    pub block_size: usize,
    /// SHA-1 of every block of the current file, block order.
    pub hashes: Vec<String>,
    /// Indexes of the blocks stored in this backup's object, ascending.
    /// Empty means the file content is identical to the reference.
    pub changed: Vec<u32>,
}

impl BlockIncrMap {
    /// Total size the map describes must match the file entry.
    pub fn block_count(len: u64, block_size: usize) -> usize {
        len.div_ceil(block_size as u64) as usize
    }
}

fn block_hash(block: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(block);
    hex::encode(hasher.finalize())
}

/// Hash every block of `content`.
pub fn block_hashes(content: &[u8], block_size: usize) -> Vec<String> {
    content.chunks(block_size).map(block_hash).collect()
}

/// Compute the delta of `content` against a prior map. Returns the manifest
/// map and the bytes to store (changed blocks concatenated). Blocks beyond
/// the prior file's end always count as changed.
pub fn block_delta(
    content: &[u8],
    prior: &BlockIncrMap,
    block_size: usize,
) -> (BlockIncrMap, Vec<u8>) {
    let hashes = block_hashes(content, block_size);
    let mut changed = Vec::new();
    let mut payload = Vec::new();

    for (index, (block, hash)) in content.chunks(block_size).zip(hashes.iter()).enumerate() {
        let unchanged =
            block_size == prior.block_size && prior.hashes.get(index) == Some(hash);
        if !unchanged {
            changed.push(index as u32);
            payload.extend_from_slice(block);
        }
    }

    (
        BlockIncrMap {
            block_size,
            hashes,
            changed,
        },
        payload,
    )
}

/// Rebuild file content from the referenced base and this backup's delta
/// payload.
pub fn block_restore(
    base: &[u8],
    map: &BlockIncrMap,
    delta_payload: &[u8],
    file_size: u64,
) -> Result<Vec<u8>> {
    let mut content = vec![0u8; file_size as usize];
    let copy_len = base.len().min(content.len());
    content[..copy_len].copy_from_slice(&base[..copy_len]);

    let mut payload_off = 0usize;
    for &index in &map.changed {
        let start = index as usize * map.block_size;
        if start >= content.len() {
            return Err(Error::Format(format!(
                "block {index} is beyond the restored file size {file_size}"
            )));
        }
        let end = (start + map.block_size).min(content.len());
        let len = end - start;
        let block = delta_payload
            .get(payload_off..payload_off + len)
            .ok_or_else(|| {
                Error::Format(format!(
                    "block delta payload is short at block {index} (offset {payload_off})"
                ))
            })?;
        content[start..end].copy_from_slice(block);
        payload_off += len;
    }

    if payload_off != delta_payload.len() {
        return Err(Error::Format(format!(
            "block delta payload has {} trailing byte(s)",
            delta_payload.len() - payload_off
        )));
    }

    // The map's hashes describe the complete current content; verify what
    // we rebuilt matches.
    let rebuilt = block_hashes(&content, map.block_size);
    if rebuilt != map.hashes {
        return Err(Error::Format(
            "restored content does not match the block map hashes".into(),
        ));
    }

    Ok(content)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BS: usize = 16;

    fn full_map(content: &[u8]) -> BlockIncrMap {
        let hashes = block_hashes(content, BS);
        BlockIncrMap {
            block_size: BS,
            changed: (0..hashes.len() as u32).collect(),
            hashes,
        }
    }

    #[test]
    fn unchanged_file_stores_nothing() {
        let content = b"0123456789abcdef0123456789abcdef";
        let prior = full_map(content);
        let (map, payload) = block_delta(content, &prior, BS);
        assert!(map.changed.is_empty());
        assert!(payload.is_empty());
    }

    #[test]
    fn only_changed_blocks_are_stored() {
        let base: Vec<u8> = (0..BS as u8 * 4).collect();
        let prior = full_map(&base);

        let mut current = base.clone();
        current[BS + 3] ^= 0xFF; // dirty block 1 only

        let (map, payload) = block_delta(&current, &prior, BS);
        assert_eq!(map.changed, vec![1]);
        assert_eq!(payload.len(), BS);
        assert_eq!(&payload[..], &current[BS..2 * BS]);

        let restored = block_restore(&base, &map, &payload, current.len() as u64).unwrap();
        assert_eq!(restored, current);
    }

    #[test]
    fn growth_marks_new_blocks_changed() {
        let base: Vec<u8> = (0..BS as u8).collect();
        let prior = full_map(&base);

        let mut current = base.clone();
        current.extend((0..BS as u8).map(|b| b ^ 0x55));

        let (map, payload) = block_delta(&current, &prior, BS);
        assert_eq!(map.changed, vec![1]);

        let restored = block_restore(&base, &map, &payload, current.len() as u64).unwrap();
        assert_eq!(restored, current);
    }

    #[test]
    fn shrink_restores_truncated() {
        let base: Vec<u8> = (0..BS as u8 * 3).collect();
        let prior = full_map(&base);

        let current = base[..BS * 2].to_vec();
        let (map, payload) = block_delta(&current, &prior, BS);
        assert!(map.changed.is_empty());
        let restored = block_restore(&base, &map, &payload, current.len() as u64).unwrap();
        assert_eq!(restored, current);
    }

    #[test]
    fn corrupt_payload_is_detected() {
        let base: Vec<u8> = (0..BS as u8 * 2).collect();
        let prior = full_map(&base);

        let mut current = base.clone();
        current[0] ^= 0x01;
        let (map, mut payload) = block_delta(&current, &prior, BS);
        payload[1] ^= 0xFF;

        assert!(block_restore(&base, &map, &payload, current.len() as u64).is_err());
    }
}
