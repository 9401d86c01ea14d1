//! Streaming page verification for relation files.
//!
//! Runs over the raw bytes during copy. Zero (new) pages pass, pages written
//! after the backup started pass (WAL replay will rewrite them), anything
//! else must carry a correct checksum. Findings are diagnostic: they land in
//! the manifest for operator review, the backup itself succeeds.

use pg_wal::page::{page_checksum, PageHeader};
use serde::{Deserialize, Serialize};
use utils::lsn::Lsn;

use crate::errors::{Error, Result};

/// One page that failed verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidPage {
    pub block_no: u32,
    pub lsn: Lsn,
}

/// Verdict for one relation file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageCheckResult {
    /// No checksum mismatches.
    pub valid: bool,
    /// File size is a whole number of pages.
    pub align: bool,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub invalid_pages: Vec<InvalidPage>,
}

/// Incremental verifier fed with the copy stream's buffers.
pub struct PageVerifier {
    page_size: usize,
    backup_start_lsn: Lsn,
    block_no: u32,
    invalid: Vec<InvalidPage>,
    /// Set once a short trailing buffer arrived; any further input is a bug
    /// in the caller's chunking.
    saw_remainder: bool,
    remainder_len: usize,
}

impl PageVerifier {
    pub fn new(page_size: usize, backup_start_lsn: Lsn) -> Self {
        PageVerifier {
            page_size,
            backup_start_lsn,
            block_no: 0,
            invalid: Vec::new(),
            saw_remainder: false,
            remainder_len: 0,
        }
    }

    /// Feed the next buffer. Buffers must be multiples of the page size; a
    /// shorter buffer is accepted only as the trailing remainder of the
    /// file, and only once.
    pub fn update(&mut self, buf: &[u8]) -> Result<()> {
        if self.saw_remainder {
            return Err(Error::Assert(format!(
                "page buffer of {} byte(s) after a misaligned trailing buffer",
                buf.len()
            )));
        }

        let mut offset = 0;
        while offset < buf.len() {
            let remaining = buf.len() - offset;
            if remaining < self.page_size {
                self.saw_remainder = true;
                self.remainder_len = remaining;
                return Ok(());
            }

            let page = &buf[offset..offset + self.page_size];
            self.verify_page(page)?;
            self.block_no += 1;
            offset += self.page_size;
        }
        Ok(())
    }

    fn verify_page(&mut self, page: &[u8]) -> Result<()> {
        let header = PageHeader::parse(page).map_err(|e| Error::Format(format!("{e:#}")))?;

        // A page never initialized carries no checksum.
        if header.is_new() {
            return Ok(());
        }
        // A page written during the backup will be replayed from WAL, its
        // on-disk state is allowed to be torn.
        if header.lsn > self.backup_start_lsn {
            return Ok(());
        }

        let expected = page_checksum(page, self.block_no);
        if header.checksum != expected {
            self.invalid.push(InvalidPage {
                block_no: self.block_no,
                lsn: header.lsn,
            });
        }
        Ok(())
    }

    pub fn finish(self) -> PageCheckResult {
        PageCheckResult {
            valid: self.invalid.is_empty(),
            align: !self.saw_remainder || self.remainder_len == 0,
            invalid_pages: self.invalid,
        }
    }
}

/// Whether a cluster-relative path is a relation file that page checks
/// apply to.
pub fn is_relation_file(cluster_path: &str) -> bool {
    static RELATION_RE: once_cell::sync::Lazy<regex::Regex> = once_cell::sync::Lazy::new(|| {
        regex::Regex::new(r"^(base|global|pg_tblspc/[0-9]+/[^/]+)(/[0-9]+)*/[0-9]+(_(fsm|vm))?(\.[0-9]+)?$")
            .expect("relation path regex is valid")
    });
    RELATION_RE.is_match(cluster_path)
}
