//! WAL segment naming, transcribed from `access/xlog_internal.h`. The engine
//! needs this twice: to independently verify the archive waiter is polling
//! for the right `.done` marker, and to tell a `<tli>.history` file apart
//! from a real segment during retention.

use utils::lsn::Lsn;

const SEGMENTS_PER_XLOG_ID_BASE: u64 = 0x1_0000_0000;

fn segments_per_xlog_id(seg_sz: u64) -> u64 {
    SEGMENTS_PER_XLOG_ID_BASE / seg_sz
}

/// The absolute segment number (0-based across all timelines combined, as
/// the server counts them) containing `lsn`.
pub fn segment_number(lsn: Lsn, seg_sz: u64) -> u64 {
    lsn.as_u64() / seg_sz
}

/// Renders the 24-hex-digit WAL segment file name containing `lsn` on
/// timeline `tli`, e.g. `000000010000001600000003`.
pub fn xlog_file_name(tli: u32, lsn: Lsn, seg_sz: u64) -> String {
    let seg_no = segment_number(lsn, seg_sz);
    let per_id = segments_per_xlog_id(seg_sz);
    format!(
        "{:08X}{:08X}{:08X}",
        tli,
        seg_no / per_id,
        seg_no % per_id
    )
}

/// A WAL segment file name is 24 hex digits. History files, `.partial`
/// segments and `.backup` label files all fail this check.
pub fn is_wal_segment_filename(name: &str) -> bool {
    name.len() == 24 && name.bytes().all(|b| b.is_ascii_hexdigit())
}

/// `<8-hex-digit-timeline>.history`.
pub fn is_history_filename(name: &str) -> bool {
    match name.strip_suffix(".history") {
        Some(tli) => tli.len() == 8 && tli.bytes().all(|b| b.is_ascii_hexdigit()),
        None => false,
    }
}

/// Parses the timeline id out of a segment or history file name's leading 8
/// hex digits.
pub fn timeline_from_filename(name: &str) -> Option<u32> {
    if name.len() < 8 {
        return None;
    }
    u32::from_str_radix(&name[0..8], 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEG: u64 = 16 * 1024 * 1024;

    #[test]
    fn filename_matches_known_value() {
        // LSN 16/B374D848 on timeline 1, default 16MiB segments.
        let lsn = Lsn(0x16_0000_0000 | 0xB374_D848);
        let name = xlog_file_name(1, lsn, SEG);
        assert_eq!(name.len(), 24);
        assert!(is_wal_segment_filename(&name));
        assert_eq!(timeline_from_filename(&name), Some(1));
    }

    #[test]
    fn history_files_are_recognized_and_excluded_from_segment_check() {
        assert!(is_history_filename("00000002.history"));
        assert!(!is_wal_segment_filename("00000002.history"));
        assert!(!is_history_filename("000000010000001600000003"));
    }

    #[test]
    fn segment_number_rolls_over_xlog_id() {
        let per_id = segments_per_xlog_id(SEG);
        let lsn = Lsn(per_id * SEG); // first segment of xlog id 1
        let name = xlog_file_name(3, lsn, SEG);
        assert_eq!(&name[0..8], "00000003");
        assert_eq!(&name[8..16], "00000001");
        assert_eq!(&name[16..24], "00000000");
    }
}
