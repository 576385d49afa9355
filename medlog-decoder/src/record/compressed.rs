//! Compressed database blocks
//!
//! A compressed sub-record's data is a table id followed by typed blocks:
//!
//! ```text
//! TYPE u8   LENGTH u24 LE (in 32-bit words)   [WORDS]
//! ```
//!
//! Type 0 copies `LENGTH * 4` raw bytes, type 1 expands to that many zero bytes
//! and carries no data. The inflated buffer ends with a little-endian CRC32 over
//! everything before it. A block that fails to inflate or verify is discarded
//! as a whole, and so is one that would inflate past [`MAX_INFLATED_LEN`].

use crate::checksum::crc32;
use crate::types::{ChecksumScope, DecoderError, Result};
use byteorder::{ByteOrder, LittleEndian};

const BLOCK_RAW: u8 = 0;
const BLOCK_ZERO: u8 = 1;
const BLOCK_HEADER_LEN: usize = 4;
const MAX_BLOCK_WORDS: usize = 0x00FF_FFFF;

/// Largest inflated size accepted for one compressed sub-record
pub const MAX_INFLATED_LEN: usize = 1 << 20;

/// A verified, inflated block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InflatedBlock {
    pub table_id: u8,
    /// Inflated bytes with the trailing checksum removed
    pub body: Vec<u8>,
}

/// Inflate a compressed block and verify its checksum
pub fn inflate(data: &[u8]) -> Result<InflatedBlock> {
    let (&table_id, mut rest) = data
        .split_first()
        .ok_or_else(|| DecoderError::Decode("empty compressed block".to_string()))?;

    let mut inflated = Vec::new();
    while !rest.is_empty() {
        if rest.len() < BLOCK_HEADER_LEN {
            return Err(DecoderError::Decode(format!(
                "truncated compressed block header ({} bytes left)",
                rest.len()
            )));
        }
        let block_type = rest[0];
        let length = LittleEndian::read_u24(&rest[1..4]) as usize * 4;
        rest = &rest[BLOCK_HEADER_LEN..];
        if inflated.len() + length > MAX_INFLATED_LEN {
            return Err(DecoderError::Decode(format!(
                "compressed block inflates past {} bytes",
                MAX_INFLATED_LEN
            )));
        }

        match block_type {
            BLOCK_RAW => {
                if rest.len() < length {
                    return Err(DecoderError::Decode(format!(
                        "raw block declares {} bytes but {} remain",
                        length,
                        rest.len()
                    )));
                }
                inflated.extend_from_slice(&rest[..length]);
                rest = &rest[length..];
            }
            BLOCK_ZERO => inflated.resize(inflated.len() + length, 0),
            other => {
                return Err(DecoderError::Decode(format!(
                    "unknown compression block type {}",
                    other
                )))
            }
        }
    }

    if inflated.len() < 4 {
        return Err(DecoderError::Decode(
            "inflated block too short for its checksum".to_string(),
        ));
    }

    let split = inflated.len() - 4;
    let expected = LittleEndian::read_u32(&inflated[split..]);
    inflated.truncate(split);
    let computed = crc32(&inflated);
    if computed != expected {
        return Err(DecoderError::Checksum {
            scope: ChecksumScope::CompressedBlock,
            expected,
            computed,
        });
    }

    Ok(InflatedBlock {
        table_id,
        body: inflated,
    })
}

/// Build a compressed block from a record stream
///
/// The body is zero-padded to whole words, its checksum appended, and runs of
/// all-zero words become zero blocks.
pub fn compress(table_id: u8, body: &[u8]) -> Vec<u8> {
    let mut words = body.to_vec();
    words.resize(body.len().div_ceil(4) * 4, 0);
    let checksum = crc32(&words);
    let mut tail = [0u8; 4];
    LittleEndian::write_u32(&mut tail, checksum);
    words.extend_from_slice(&tail);

    let mut out = vec![table_id];
    let mut run: Vec<&[u8]> = Vec::new();
    let mut run_is_zero = false;

    for word in words.chunks_exact(4) {
        let is_zero = word.iter().all(|&b| b == 0);
        if !run.is_empty() && is_zero != run_is_zero {
            write_blocks(&mut out, &run, run_is_zero);
            run.clear();
        }
        run_is_zero = is_zero;
        run.push(word);
    }
    write_blocks(&mut out, &run, run_is_zero);
    out
}

fn write_blocks(out: &mut Vec<u8>, run: &[&[u8]], zero: bool) {
    for chunk in run.chunks(MAX_BLOCK_WORDS) {
        out.push(if zero { BLOCK_ZERO } else { BLOCK_RAW });
        let mut length = [0u8; 3];
        LittleEndian::write_u24(&mut length, chunk.len() as u32);
        out.extend_from_slice(&length);
        if !zero {
            for word in chunk {
                out.extend_from_slice(word);
            }
        }
    }
}
