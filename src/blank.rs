//! Tells erased pages apart from corrupted ones after the controller reports an uncorrectable
//! error.
//!
//! Erased pages carry no valid ECC, so the controller flags them as uncorrectable. A page is
//! still taken as erased while it holds fewer zero bits than the ECC strength.

use log::warn;

/// Number of zero bits in each byte value
static ZERO_BITS: [u8; 256] = zero_bits_table();

const fn zero_bits_table() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        table[i] = 8 - (i as u8).count_ones() as u8;
        i += 1;
    }
    table
}

#[derive(Debug, Copy, Clone)]
pub struct BlankPageClassifier {
    strength: u32,
}

impl BlankPageClassifier {
    pub fn new(ecc_strength: u32) -> Self {
        Self { strength: ecc_strength }
    }

    /// Is one plane's page (data, then spare) close enough to all-ones to be erased?
    ///
    /// Stops counting as soon as the strength is reached.
    pub fn is_blank(&self, data: &[u8], spare: &[u8]) -> bool {
        let mut zeros = 0u32;
        for &byte in data.iter().chain(spare) {
            zeros += ZERO_BITS[byte as usize] as u32;
            if zeros >= self.strength {
                return false;
            }
        }
        true
    }

    /// Check every plane of a raw transfer buffer (per plane: `page_size` data bytes, then
    /// `oob_size` spare). If all are blank, overwrite the buffer with 0xFF and return true.
    pub fn classify(&self, raw: &mut [u8], page_size: usize, oob_size: usize) -> bool {
        let blank = raw
            .chunks(page_size + oob_size)
            .all(|plane| {
                let (data, spare) = plane.split_at(page_size.min(plane.len()));
                self.is_blank(data, spare)
            });

        if blank {
            warn!("uncorrectable page looks erased, returning it as blank");
            raw.fill(0xFF);
        }
        blank
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn erased_with_flips(len: usize, flips: &[usize]) -> Vec<u8> {
        let mut page = vec![0xFF; len];
        for &bit in flips {
            page[bit / 8] &= !(1 << (bit % 8));
        }
        page
    }

    #[test]
    fn test_table() {
        assert_eq!(ZERO_BITS[0xFF], 0);
        assert_eq!(ZERO_BITS[0x00], 8);
        assert_eq!(ZERO_BITS[0xA5], 4);
        assert_eq!(ZERO_BITS[0x7F], 1);
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let classifier = BlankPageClassifier::new(4);

        let mut raw = erased_with_flips(2048 + 64, &[3, 900, 2048 * 8 + 5]);
        assert!(classifier.classify(&mut raw, 2048, 64));
        assert!(raw.iter().all(|&b| b == 0xFF));

        let mut raw = erased_with_flips(2048 + 64, &[3, 900, 901, 2048 * 8 + 5]);
        let before = raw.clone();
        assert!(!classifier.classify(&mut raw, 2048, 64));
        assert_eq!(raw, before);
    }

    #[test]
    fn test_spare_counts_too() {
        let classifier = BlankPageClassifier::new(2);
        assert!(!classifier.is_blank(&[0xFF; 16], &[0xFC]));
        assert!(classifier.is_blank(&[0xFF; 16], &[0xFE]));
    }

    #[test]
    fn test_planes_counted_separately() {
        let classifier = BlankPageClassifier::new(4);
        let plane = 512 + 16;

        // Three flips in each plane: six in total, but each plane alone is under the strength
        let mut raw = erased_with_flips(2 * plane, &[1, 2, 3, plane * 8 + 1, plane * 8 + 2, plane * 8 + 3]);
        assert!(classifier.classify(&mut raw, 512, 16));

        let mut raw = erased_with_flips(2 * plane, &[plane * 8, plane * 8 + 9, plane * 8 + 17, plane * 8 + 30]);
        assert!(!classifier.classify(&mut raw, 512, 16));
    }

    #[test]
    fn test_written_page_is_not_blank() {
        let classifier = BlankPageClassifier::new(48);
        assert!(!classifier.is_blank(&[0x00; 8], &[]));
    }
}
