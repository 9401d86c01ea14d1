//! Bundling of small backup files into bounded-size repository objects.
//!
//! Uploading millions of tiny catalog files one request at a time dominates
//! backup wall time on object stores. A bundle concatenates already-filtered
//! file payloads; the manifest records `(bundle_id, offset, size)` per file
//! and reads come back as ranged requests against the bundle object.

use serde::{Deserialize, Serialize};

/// Position of one file's payload inside a bundle object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleRef {
    pub bundle_id: u64,
    pub offset: u64,
    pub size: u64,
}

/// Limits for the bundle writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleLimits {
    /// Target size of one bundle object; the running bundle is cut when it
    /// grows past this.
    pub bundle_size: u64,
    /// Files larger than this are stored standalone.
    pub bundle_limit: u64,
}

impl Default for BundleLimits {
    fn default() -> Self {
        BundleLimits {
            bundle_size: 20 * 1024 * 1024,
            bundle_limit: 2 * 1024 * 1024,
        }
    }
}

/// Accumulates filtered file payloads into the current bundle.
pub struct BundleWriter {
    limits: BundleLimits,
    bundle_id: u64,
    buf: Vec<u8>,
}

impl BundleWriter {
    pub fn new(limits: BundleLimits) -> Self {
        BundleWriter {
            limits,
            bundle_id: 1,
            buf: Vec::new(),
        }
    }

    /// Whether a file of `size` filtered bytes belongs in a bundle at all.
    pub fn accepts(&self, size: u64) -> bool {
        size <= self.limits.bundle_limit
    }

    /// Append one file's payload, returning where it landed.
    pub fn add(&mut self, payload: &[u8]) -> BundleRef {
        debug_assert!(self.accepts(payload.len() as u64));
        let reference = BundleRef {
            bundle_id: self.bundle_id,
            offset: self.buf.len() as u64,
            size: payload.len() as u64,
        };
        self.buf.extend_from_slice(payload);
        reference
    }

    /// The bundle to upload now, if the running one is full. Returns
    /// `(bundle_id, bytes)` and starts the next bundle.
    pub fn cut_if_full(&mut self) -> Option<(u64, Vec<u8>)> {
        if (self.buf.len() as u64) < self.limits.bundle_size {
            return None;
        }
        self.cut()
    }

    /// Cut the running bundle unconditionally, e.g. at end of backup.
    pub fn cut(&mut self) -> Option<(u64, Vec<u8>)> {
        if self.buf.is_empty() {
            return None;
        }
        let id = self.bundle_id;
        self.bundle_id += 1;
        Some((id, std::mem::take(&mut self.buf)))
    }
}
