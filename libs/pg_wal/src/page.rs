//! Data page header layout and checksum.
//!
//! Only the handful of header fields the backup engine reads are modeled.
//! The checksum is a function of the page contents (with the stored checksum
//! zeroed) and the block number, reduced to u16 with an offset of one so
//! that zero never appears as a valid checksum.

use byteorder::{ByteOrder, LittleEndian};
use utils::lsn::Lsn;

/// Bytes of the page header walvault reads (`pd_lsn` .. `pd_upper`).
pub const PAGE_HEADER_MIN: usize = 16;

const FNV_PRIME: u32 = 16777619;
const FNV_BASIS: u32 = 0x811C9DC5;

/// Parsed page header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageHeader {
    /// LSN of the last WAL record touching this page.
    pub lsn: Lsn,
    pub checksum: u16,
    pub flags: u16,
    pub lower: u16,
    /// Offset to the end of free space; zero on a page never initialized.
    pub upper: u16,
}

impl PageHeader {
    pub fn parse(page: &[u8]) -> anyhow::Result<PageHeader> {
        anyhow::ensure!(
            page.len() >= PAGE_HEADER_MIN,
            "page buffer of {} byte(s) is smaller than the page header",
            page.len()
        );
        Ok(PageHeader {
            lsn: Lsn::from_parts(
                LittleEndian::read_u32(&page[0..4]),
                LittleEndian::read_u32(&page[4..8]),
            ),
            checksum: LittleEndian::read_u16(&page[8..10]),
            flags: LittleEndian::read_u16(&page[10..12]),
            lower: LittleEndian::read_u16(&page[12..14]),
            upper: LittleEndian::read_u16(&page[14..16]),
        })
    }

    /// A new page has never been initialized and carries no checksum.
    pub fn is_new(&self) -> bool {
        self.upper == 0
    }
}

/// Checksum of a page's content mixed with its block number.
///
/// The stored `pd_checksum` field is excluded from the computation, so the
/// result can be compared against it directly.
pub fn page_checksum(page: &[u8], blkno: u32) -> u16 {
    let mut hash = FNV_BASIS;

    for (i, chunk) in page.chunks(4).enumerate() {
        let word = match chunk.len() {
            4 => {
                if i == 2 {
                    // word 2 holds pd_checksum in its low half; hash it as zero
                    LittleEndian::read_u32(chunk) & 0xFFFF_0000
                } else {
                    LittleEndian::read_u32(chunk)
                }
            }
            _ => {
                let mut padded = [0u8; 4];
                padded[..chunk.len()].copy_from_slice(chunk);
                LittleEndian::read_u32(&padded)
            }
        };

        let tmp = hash ^ word;
        hash = tmp.wrapping_mul(FNV_PRIME) ^ (tmp >> 17);
    }

    // Mix in the block number to detect transposed pages, then reduce to
    // u16 with an offset of one to avoid checksums of zero.
    ((hash ^ blkno) % 65535 + 1) as u16
}

/// Write the correct checksum into a page buffer. Test fixtures only; the
/// engine never mutates cluster pages.
pub fn page_checksum_set(page: &mut [u8], blkno: u32) {
    let checksum = page_checksum(page, blkno);
    LittleEndian::write_u16(&mut page[8..10], checksum);
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;

    fn random_page(upper: u16) -> Vec<u8> {
        let mut page = vec![0u8; 8192];
        rand::thread_rng().fill_bytes(&mut page);
        LittleEndian::write_u16(&mut page[14..16], upper);
        page
    }

    #[test]
    fn header_fields_parse() {
        let mut page = vec![0u8; 8192];
        LittleEndian::write_u32(&mut page[0..4], 0x1);
        LittleEndian::write_u32(&mut page[4..8], 0x2000);
        LittleEndian::write_u16(&mut page[8..10], 0xBEEF);
        LittleEndian::write_u16(&mut page[14..16], 128);

        let header = PageHeader::parse(&page).unwrap();
        assert_eq!(header.lsn, Lsn(0x1_0000_2000));
        assert_eq!(header.checksum, 0xBEEF);
        assert!(!header.is_new());

        LittleEndian::write_u16(&mut page[14..16], 0);
        assert!(PageHeader::parse(&page).unwrap().is_new());
    }

    #[test]
    fn checksum_covers_content_and_block_number() {
        let mut page = random_page(128);
        page_checksum_set(&mut page, 7);
        let stored = PageHeader::parse(&page).unwrap().checksum;
        assert_eq!(page_checksum(&page, 7), stored);

        // same bytes at a different block number must not verify
        assert_ne!(page_checksum(&page, 8), stored);

        // flipping a content byte must not verify
        page[100] ^= 0xFF;
        assert_ne!(page_checksum(&page, 7), stored);
    }

    #[test]
    fn checksum_ignores_stored_checksum_field() {
        let mut page = random_page(128);
        let a = page_checksum(&page, 3);
        LittleEndian::write_u16(&mut page[8..10], 0x1234);
        assert_eq!(page_checksum(&page, 3), a);
    }

    #[test]
    fn checksum_is_never_zero() {
        for blkno in 0..64 {
            let page = random_page(64);
            assert_ne!(page_checksum(&page, blkno), 0);
        }
    }
}
