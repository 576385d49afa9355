//! Application-level sub-record stream
//!
//! Response payloads are a stream of sub-records:
//!
//! ```text
//! LENGTH (0-3 bytes)   OP_CODE   DATA
//! 1xxxxxxx ...         0xxxxxxx  LENGTH bytes
//! ```
//!
//! Each length byte has its high bit set and contributes 7 bits, least
//! significant group first, so a length can use at most 21 bits. A byte with
//! the high bit clear is the op code. A sub-record can span many frames and one
//! frame can carry many sub-records.

use crate::types::{DecoderError, Result};

/// Maximum number of length-prefix bytes
pub const MAX_LENGTH_BYTES: usize = 3;

/// Largest encodable data length
pub const MAX_PACKET_DATA: usize = (1 << (7 * MAX_LENGTH_BYTES)) - 1;

const LENGTH_FLAG: u8 = 0x80;

/// One complete sub-record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AapPacket {
    pub op_code: u8,
    pub data: Vec<u8>,
}

impl AapPacket {
    pub fn new(op_code: u8, data: Vec<u8>) -> Result<Self> {
        if op_code & LENGTH_FLAG != 0 {
            return Err(DecoderError::Decode(format!(
                "op code 0x{:02X} has its high bit set",
                op_code
            )));
        }
        if data.len() > MAX_PACKET_DATA {
            return Err(DecoderError::Decode(format!(
                "sub-record data of {} bytes exceeds {} bytes",
                data.len(),
                MAX_PACKET_DATA
            )));
        }
        Ok(Self { op_code, data })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.data.len() + MAX_LENGTH_BYTES + 1);
        let mut length = self.data.len();
        while length > 0 {
            bytes.push(LENGTH_FLAG | (length & 0x7F) as u8);
            length >>= 7;
        }
        bytes.push(self.op_code);
        bytes.extend_from_slice(&self.data);
        bytes
    }
}

/// Incremental parser that defers partial sub-records
#[derive(Debug, Default)]
pub struct AapStreamParser {
    pending: Vec<u8>,
    skip_zero_padding: bool,
}

impl AapStreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parser for inflated blocks, where a zero byte at a sub-record start is padding
    pub fn padded() -> Self {
        Self {
            pending: Vec::new(),
            skip_zero_padding: true,
        }
    }

    /// Append bytes from the next frame
    pub fn push(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    /// Bytes held back waiting for the rest of a sub-record
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn reset(&mut self) {
        self.pending.clear();
    }

    /// Take the next complete sub-record, if one is buffered
    ///
    /// A fourth length byte is a structural error: the pending buffer is
    /// dropped, because nothing after it can be trusted to start a sub-record.
    pub fn next_packet(&mut self) -> Result<Option<AapPacket>> {
        if self.skip_zero_padding {
            let padding = self.pending.iter().take_while(|&&b| b == 0).count();
            self.pending.drain(..padding);
        }

        let mut length = 0usize;
        let mut prefix = 0usize;
        loop {
            let Some(&byte) = self.pending.get(prefix) else {
                return Ok(None);
            };
            if byte & LENGTH_FLAG == 0 {
                break;
            }
            if prefix == MAX_LENGTH_BYTES {
                self.pending.clear();
                return Err(DecoderError::Decode(
                    "sub-record length prefix longer than 3 bytes".to_string(),
                ));
            }
            length |= ((byte & 0x7F) as usize) << (7 * prefix);
            prefix += 1;
        }

        let op_code = self.pending[prefix];
        let end = prefix + 1 + length;
        if self.pending.len() < end {
            log::trace!(
                "Deferring sub-record 0x{:02X}: {} of {} bytes buffered",
                op_code,
                self.pending.len() - prefix - 1,
                length
            );
            return Ok(None);
        }

        let data = self.pending[prefix + 1..end].to_vec();
        self.pending.drain(..end);
        Ok(Some(AapPacket { op_code, data }))
    }

    /// Drain every complete sub-record
    pub fn drain_packets(&mut self) -> Result<Vec<AapPacket>> {
        let mut packets = Vec::new();
        while let Some(packet) = self.next_packet()? {
            packets.push(packet);
        }
        Ok(packets)
    }
}
