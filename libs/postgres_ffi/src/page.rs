//! The `PageHeaderData` layout and the page checksum algorithm, transcribed
//! from `src/include/storage/{bufpage,checksum_impl}.h`. Every data file the
//! engine reads is a sequence of these.

use byteorder::{ByteOrder, LittleEndian};
use utils::lsn::Lsn;

use crate::pg_constants::BLCKSZ;

/// `sizeof(PageHeaderData)` on a MAXALIGN=8 server build.
pub const PAGE_HEADER_SIZE: usize = 24;

/// Parsed view of the 24-byte header at the start of every page. We don't
/// need most of these fields for backup purposes, but `pd_lsn` and
/// `pd_checksum` are load-bearing for the incremental filter and for
/// verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageHeader {
    pub lsn: Lsn,
    pub checksum: u16,
    pub flags: u16,
    pub lower: u16,
    pub upper: u16,
    pub special: u16,
    pub pagesize_version: u16,
}

impl PageHeader {
    pub fn parse(page: &[u8]) -> PageHeader {
        debug_assert!(page.len() >= PAGE_HEADER_SIZE);
        let xlogid = LittleEndian::read_u32(&page[0..4]);
        let xrecoff = LittleEndian::read_u32(&page[4..8]);
        PageHeader {
            lsn: Lsn(((xlogid as u64) << 32) | xrecoff as u64),
            checksum: LittleEndian::read_u16(&page[8..10]),
            flags: LittleEndian::read_u16(&page[10..12]),
            lower: LittleEndian::read_u16(&page[12..14]),
            upper: LittleEndian::read_u16(&page[14..16]),
            special: LittleEndian::read_u16(&page[16..18]),
            pagesize_version: LittleEndian::read_u16(&page[18..20]),
        }
    }
}

/// True when every byte of the page is zero: a legitimate "never written"
/// block, distinct from a corrupt or torn read.
pub fn is_zero_page(page: &[u8]) -> bool {
    page.iter().all(|&b| b == 0)
}

const N_SUMS: usize = 32;
const FNV_PRIME: u32 = 16777619;

const CHECKSUM_BASE_OFFSETS: [u32; N_SUMS] = [
    0x5B1F36E9, 0xB8525960, 0x02AB50AA, 0x1DE66D2A, 0x79FF467A, 0x9BB9F8A3, 0x217E7CD2, 0x83E13D2C,
    0xF8D4474F, 0xE39EB970, 0x42C6AE16, 0x993216FA, 0x7B093B5D, 0x98DAFF3C, 0xF718902A, 0x0B1C9CDB,
    0xE58F764B, 0x187636BC, 0x5D7B3BB1, 0xE73DE7DE, 0x92BECB2F, 0x76DB8E4E, 0xFF51384B, 0xD7F21C40,
    0xCC14E7BE, 0xA95C3CD2, 0xCAD85E0E, 0x74154DF3, 0x2AF672C1, 0xF2BB8A72, 0x2D5E4169, 0x86CD4A88,
];

#[inline]
fn checksum_comp(checksum: u32, value: u32) -> u32 {
    let tmp = checksum ^ value;
    tmp.wrapping_mul(FNV_PRIME) ^ (tmp >> 17)
}

fn checksum_block(page: &[u8]) -> u32 {
    debug_assert_eq!(page.len(), BLCKSZ as usize);
    let mut sums = CHECKSUM_BASE_OFFSETS;

    // BLCKSZ / (sizeof(u32) * N_SUMS) outer rounds over the whole page.
    let words_per_round = N_SUMS;
    let rounds = (BLCKSZ as usize) / (4 * words_per_round);
    for i in 0..rounds {
        for (j, sum) in sums.iter_mut().enumerate() {
            let off = (i * words_per_round + j) * 4;
            let value = LittleEndian::read_u32(&page[off..off + 4]);
            *sum = checksum_comp(*sum, value);
        }
    }

    // Two rounds of zero-mixing, matching the server's algorithm exactly.
    for _ in 0..2 {
        for sum in sums.iter_mut() {
            *sum = checksum_comp(*sum, 0);
        }
    }

    sums.iter().fold(0u32, |acc, s| acc ^ s)
}

/// Computes the checksum the server would store in `pd_checksum` for `page`
/// at block number `blkno`. `page` must be exactly `BLCKSZ` bytes; its
/// existing `pd_checksum` field is ignored (zeroed for the computation, as
/// the server does).
pub fn checksum_page(page: &[u8], blkno: u32) -> u16 {
    let mut scratch = [0u8; BLCKSZ as usize];
    scratch.copy_from_slice(page);
    scratch[8..10].copy_from_slice(&0u16.to_le_bytes());

    let mut checksum = checksum_block(&scratch);
    checksum ^= blkno;
    ((checksum % 65535) + 1) as u16
}

/// Verifies a non-zero page's stored checksum against the recomputed one.
pub fn verify_checksum(page: &[u8], blkno: u32) -> bool {
    let header = PageHeader::parse(page);
    header.checksum == checksum_page(page, blkno)
}
