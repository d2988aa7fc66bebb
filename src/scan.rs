//! Splitting of long JTAG shifts into firmware-sized scan fragments.
//!
//! A single scan command carries at most [`MAX_SCAN_BYTES`] TDI/TDO bytes.
//! Longer shifts are decomposed into a chain of fragments: the shift is
//! interrupted by an excursion into the matching PAUSE state after each full
//! fragment and resumed from there by the next one, so the target register
//! sees one uninterrupted shift.

use crate::protocol::MAX_SCAN_BYTES;
use crate::tap::TmsPath;

/// The four TMS excursions bracketing a (possibly split) scan.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ScanExcursions {
    /// Path from the pre-scan TAP state into the SHIFT state.
    pub first: TmsPath,
    /// Path from the SHIFT state to the scan's declared end state.
    pub last: TmsPath,
    /// Path SHIFT -> PAUSE used after interior fragments.
    pub pause: TmsPath,
    /// Path PAUSE -> SHIFT used before resumed fragments.
    pub resume: TmsPath,
}

/// One firmware-sized portion of a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ScanFragment {
    /// Byte offset of this fragment within the scan's TDI/TDO buffers.
    pub byte_offset: usize,
    /// Number of TDI/TDO bytes covered by this fragment.
    pub size_bytes: usize,
    /// Number of bits shifted by this fragment.
    pub size_bits: usize,
    /// TMS transitions before shifting.
    pub tms_start: TmsPath,
    /// TMS transitions after shifting.
    pub tms_end: TmsPath,
    /// Whether this is the last fragment. The final fragment carries the
    /// postprocessing duty and, for capturing scans, the TDO buffer
    /// ownership.
    pub is_final: bool,
}

/// Decomposes a scan of `total_bits` into fragments of at most
/// [`MAX_SCAN_BYTES`] bytes each.
pub(crate) fn split_scan(total_bits: usize, excursions: &ScanExcursions) -> Vec<ScanFragment> {
    let total_bytes = total_bits.div_ceil(8);
    let mut fragments = Vec::with_capacity(total_bytes.div_ceil(MAX_SCAN_BYTES));

    let mut offset = 0;
    let mut remaining = total_bytes;
    while remaining > 0 {
        let tms_start = if offset == 0 {
            excursions.first
        } else {
            excursions.resume
        };

        if remaining > MAX_SCAN_BYTES {
            fragments.push(ScanFragment {
                byte_offset: offset,
                size_bytes: MAX_SCAN_BYTES,
                size_bits: MAX_SCAN_BYTES * 8,
                tms_start,
                tms_end: excursions.pause,
                is_final: false,
            });
            offset += MAX_SCAN_BYTES;
            remaining -= MAX_SCAN_BYTES;
        } else {
            fragments.push(ScanFragment {
                byte_offset: offset,
                size_bytes: remaining,
                size_bits: total_bits - offset * 8,
                tms_start,
                tms_end: excursions.last,
                is_final: true,
            });
            remaining = 0;
        }
    }

    fragments
}

#[cfg(test)]
mod tests {
    use super::*;

    fn excursions() -> ScanExcursions {
        ScanExcursions {
            first: TmsPath { count: 3, sequence: 0x01 },
            last: TmsPath { count: 3, sequence: 0x03 },
            pause: TmsPath { count: 2, sequence: 0x01 },
            resume: TmsPath { count: 2, sequence: 0x01 },
        }
    }

    #[test]
    fn short_scans_are_a_single_fragment() {
        let fragments = split_scan(8, &excursions());
        assert_eq!(
            fragments,
            vec![ScanFragment {
                byte_offset: 0,
                size_bytes: 1,
                size_bits: 8,
                tms_start: excursions().first,
                tms_end: excursions().last,
                is_final: true,
            }]
        );
    }

    #[test]
    fn a_500_bit_scan_splits_into_58_and_5_bytes() {
        let fragments = split_scan(500, &excursions());
        assert_eq!(fragments.len(), 2);

        assert_eq!(fragments[0].size_bytes, 58);
        assert_eq!(fragments[0].size_bits, 464);
        assert_eq!(fragments[0].tms_start, excursions().first);
        assert_eq!(fragments[0].tms_end, excursions().pause);
        assert!(!fragments[0].is_final);

        assert_eq!(fragments[1].byte_offset, 58);
        assert_eq!(fragments[1].size_bytes, 5);
        assert_eq!(fragments[1].size_bits, 36);
        assert_eq!(fragments[1].tms_start, excursions().resume);
        assert_eq!(fragments[1].tms_end, excursions().last);
        assert!(fragments[1].is_final);
    }

    #[test]
    fn exact_multiples_of_the_ceiling_end_on_a_full_fragment() {
        let fragments = split_scan(58 * 8 * 2, &excursions());
        assert_eq!(fragments.len(), 2);
        assert_eq!(fragments[1].size_bytes, 58);
        assert_eq!(fragments[1].size_bits, 464);
        assert!(fragments[1].is_final);
        assert_eq!(fragments[1].tms_end, excursions().last);
    }

    #[test]
    fn fragments_tile_the_buffers_without_overlap() {
        for bits in [1, 7, 8, 463, 464, 465, 500, 928, 1000, 4096, 5000] {
            let fragments = split_scan(bits, &excursions());
            let mut next_byte = 0;
            let mut bit_sum = 0;
            for (i, fragment) in fragments.iter().enumerate() {
                assert_eq!(fragment.byte_offset, next_byte, "scan of {bits} bits");
                assert!(fragment.size_bytes <= MAX_SCAN_BYTES);
                assert_eq!(fragment.is_final, i == fragments.len() - 1);
                next_byte += fragment.size_bytes;
                bit_sum += fragment.size_bits;
            }
            assert_eq!(next_byte, bits.div_ceil(8));
            assert_eq!(bit_sum, bits);
            assert_eq!(
                fragments.iter().filter(|f| f.is_final).count(),
                1,
                "scan of {bits} bits"
            );
        }
    }
}
