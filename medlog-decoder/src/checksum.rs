//! Checksum algorithms used by the device protocols
//!
//! - CRC16 (CCITT polynomial 0x1021, initial remainder 0xFFFF) protects each
//!   database record.
//! - CRC32 (polynomial 0x04C11DB7, initial 0xFFFFFFFF, no reflection, no final
//!   xor) protects transport frames and inflated compressed blocks. The meter
//!   computes it over little-endian 32-bit words, so input is zero-padded to a
//!   multiple of four bytes and each word is fed most significant byte first.
//! - The text protocol uses a plain 32-bit sum of the message bytes.

const CRC16_POLY: u16 = 0x1021;
const CRC16_INITIAL: u16 = 0xFFFF;

const CRC32_POLY: u32 = 0x04C1_1DB7;
const CRC32_INITIAL: u32 = 0xFFFF_FFFF;

const fn build_crc16_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u16) << 8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ CRC16_POLY
            } else {
                crc << 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

const fn build_crc32_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u32) << 24;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x8000_0000 != 0 {
                (crc << 1) ^ CRC32_POLY
            } else {
                crc << 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

static CRC16_TABLE: [u16; 256] = build_crc16_table();
static CRC32_TABLE: [u32; 256] = build_crc32_table();

/// CRC16 of a record's header and fields (checksum field excluded by the caller)
pub fn crc16(bytes: &[u8]) -> u16 {
    bytes.iter().fold(CRC16_INITIAL, |crc, &byte| {
        CRC16_TABLE[((crc >> 8) ^ byte as u16) as usize & 0xFF] ^ (crc << 8)
    })
}

/// Word-oriented CRC32 of a frame payload or inflated block
pub fn crc32(bytes: &[u8]) -> u32 {
    let mut crc = CRC32_INITIAL;
    for chunk in bytes.chunks(4) {
        let mut word = [0u8; 4];
        word[..chunk.len()].copy_from_slice(chunk);
        // little-endian word, most significant byte first
        for &byte in word.iter().rev() {
            crc = (crc << 8) ^ CRC32_TABLE[((crc >> 24) as u8 ^ byte) as usize];
        }
    }
    crc
}

/// Additive checksum used by the text protocol (`CKSM:` line)
pub fn text_checksum(bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .fold(0u32, |sum, &byte| sum.wrapping_add(byte as u32))
}
