//! CRC-16/CCITT-FALSE over envelope bytes.
//!
//! Polynomial 0x1021, initial value 0xFFFF, no input or output reflection and
//! no final xor. The pump appends the result little-endian.

const POLY: u16 = 0x1021;
const INIT: u16 = 0xFFFF;

/// CRC of the whole slice.
pub fn crc16(data: &[u8]) -> u16 {
    data.iter().fold(INIT, |crc, &byte| update(crc, byte))
}

/// CRC of `len` bytes starting at `offset`, clamped to the slice bounds.
pub fn crc16_range(data: &[u8], offset: usize, len: usize) -> u16 {
    let start = offset.min(data.len());
    let end = start.saturating_add(len).min(data.len());
    crc16(&data[start..end])
}

/// Little-endian wire encoding of a CRC value.
pub fn crc16_le_bytes(crc: u16) -> [u8; 2] {
    crc.to_le_bytes()
}

fn update(crc: u16, byte: u8) -> u16 {
    let mut crc = crc ^ ((byte as u16) << 8);
    for _ in 0..8 {
        crc = if crc & 0x8000 != 0 { (crc << 1) ^ POLY } else { crc << 1 };
    }
    crc
}
