//! CRC16-CCITT (polynomial 0x1021, MSB first) as used for frame trailers.

use crate::consts::CRC_PRESET;

/// Folds one byte into a running CRC16-CCITT value.
pub(crate) fn crc_ccitt_update(crc: u16, data: &u8) -> u16 {
    let mut x = hi8(crc) ^ *data as u16;
    x ^= x >> 4;
    (crc << 8) ^ (x << 12) ^ (x << 5) ^ x
}

/// Computes the CRC16 of `bytes` starting from [`CRC_PRESET`].
pub fn crc16(bytes: &[u8]) -> u16 {
    bytes.iter().fold(CRC_PRESET, crc_ccitt_update)
}

/// Parses a CRC trailer written as hex digits (either case).
///
/// Returns `None` when the text is empty, too long or not hexadecimal.
pub(crate) fn parse_crc(text: &[u8]) -> Option<u16> {
    if text.is_empty() || text.len() > 4 {
        return None;
    }
    text.iter().try_fold(0u16, |acc, &c| {
        let digit = (c as char).to_digit(16)?;
        Some((acc << 4) | digit as u16)
    })
}

pub(crate) fn hi8(x: u16) -> u16 {
    x >> 8
}
