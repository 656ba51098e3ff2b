//! Table-driven CRC-16 (reflected polynomial 0xA001, initial value 0).
//!
//! The fold is resumable: [`resume`] continues from any previous result, so
//! a header and a payload can be hashed separately.

/// Reflected generator polynomial.
pub const POLYNOMIAL: u16 = 0xA001;

/// Lookup table for [`POLYNOMIAL`], built at compile time.
pub static TABLE: [u16; 256] = build_table(POLYNOMIAL);

/// Build the 256-entry lookup table for a reflected polynomial.
pub const fn build_table(poly: u16) -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u16;
        let mut bit = 0;
        while bit < 8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ poly;
            } else {
                crc >>= 1;
            }
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// CRC of `bytes` starting from zero.
pub fn compute(bytes: &[u8]) -> u16 {
    resume(0, bytes)
}

/// Continue a CRC from `seed` over `bytes`.
pub fn resume(seed: u16, bytes: &[u8]) -> u16 {
    bytes.iter().fold(seed, |crc, &byte| {
        (crc >> 8) ^ TABLE[((crc ^ u16::from(byte)) & 0x00FF) as usize]
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_check_value() {
        // CRC-16/ARC check value.
        assert_eq!(compute(b"123456789"), 0xBB3D);
    }

    #[test]
    fn empty_input_is_seed() {
        assert_eq!(compute(&[]), 0);
        assert_eq!(resume(0x1234, &[]), 0x1234);
    }

    #[test]
    fn table_edges() {
        assert_eq!(TABLE[0], 0x0000);
        assert_eq!(TABLE[1], 0xC0C1);
        assert_eq!(TABLE[255], 0x4040);
    }

    #[test]
    fn resume_matches_single_pass() {
        let data: Vec<u8> = (0..=255u8).cycle().take(1500).collect();
        for split in [0usize, 1, 2, 22, 24, 700, 1499, 1500] {
            let (head, tail) = data.split_at(split);
            assert_eq!(resume(compute(head), tail), compute(&data), "split at {split}");
        }
    }

    #[test]
    fn byte_at_a_time_matches_bulk() {
        let data = b"dock point 17 reporting";
        let folded = data.iter().fold(0u16, |crc, b| resume(crc, &[*b]));
        assert_eq!(folded, compute(data));
    }
}
