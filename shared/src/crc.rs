/*!
CRC-16/CCITT as used on both the sensor link and the network.

Reflected polynomial 0x8408, initial value 0xFFFF, no final XOR. An empty
input leaves the initial value untouched, so `crc16_ccitt(&[]) == 0xFFFF`.
*/

/// Reflected CCITT polynomial
pub const POLY: u16 = 0x8408;

/// Register value before any byte is shifted in
pub const INIT: u16 = 0xFFFF;

const TABLE: [u16; 256] = build_table();

const fn build_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u16;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 { (crc >> 1) ^ POLY } else { crc >> 1 };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// Incremental CRC accumulator for data that arrives in pieces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Crc16 {
    value: u16,
}

impl Crc16 {
    pub const fn new() -> Self {
        Self { value: INIT }
    }

    /// Shift `data` into the register
    pub fn update(&mut self, data: &[u8]) {
        let mut crc = self.value;
        for &byte in data {
            crc = (crc >> 8) ^ TABLE[((crc ^ byte as u16) & 0xFF) as usize];
        }
        self.value = crc;
    }

    pub fn finish(self) -> u16 {
        self.value
    }
}

impl Default for Crc16 {
    fn default() -> Self {
        Self::new()
    }
}

/// One-shot CRC over a contiguous buffer
pub fn crc16_ccitt(data: &[u8]) -> u16 {
    let mut crc = Crc16::new();
    crc.update(data);
    crc.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Straight bit-serial form, kept as the reference the table must match
    fn crc16_bitwise(data: &[u8]) -> u16 {
        let mut crc = INIT;
        for &byte in data {
            crc ^= byte as u16;
            for _ in 0..8 {
                crc = if crc & 1 != 0 { (crc >> 1) ^ POLY } else { crc >> 1 };
            }
        }
        crc
    }

    #[test]
    fn test_empty_input_is_init() {
        assert_eq!(crc16_ccitt(&[]), 0xFFFF);
    }

    #[test]
    fn test_check_vector() {
        assert_eq!(crc16_ccitt(b"123456789"), 0x6F91);
    }

    #[test]
    fn test_table_matches_bitwise() {
        let data: Vec<u8> = (0..=255u8).chain((0..64).map(|i| i * 3)).collect();
        assert_eq!(crc16_ccitt(&data), crc16_bitwise(&data));
        assert_eq!(crc16_ccitt(&[0x00]), crc16_bitwise(&[0x00]));
    }

    #[test]
    fn test_incremental_matches_one_shot() {
        let data = b"the quick brown fox jumps over the lazy dog";
        let mut crc = Crc16::new();
        crc.update(&data[..7]);
        crc.update(&data[7..30]);
        crc.update(&data[30..]);
        assert_eq!(crc.finish(), crc16_ccitt(data));
    }

    #[test]
    fn test_single_bit_flip_detected() {
        let mut data = vec![0x5Au8; 2048];
        let good = crc16_ccitt(&data);
        data[1000] ^= 0x01;
        assert_ne!(crc16_ccitt(&data), good);
    }
}
