//! Transport frame layout
//!
//! ```text
//! SEQ_RX  SEQ_TX  CRC32 (LE)  PAYLOAD
//! u8      u8      u32         <= 56 bytes
//! ```
//!
//! `seq_rx` is the next sequence the sender expects to receive, `seq_tx` the
//! sequence of this frame. The checksum covers the payload only.

use crate::checksum::crc32;
use crate::transport::hid::MAX_REPORT_DATA;
use crate::types::{ChecksumScope, DecoderError, Result};
use byteorder::{ByteOrder, LittleEndian};

/// Header length in bytes
pub const FRAME_HEADER_LEN: usize = 6;

/// Largest payload one frame can carry inside a HID report
pub const MAX_FRAME_PAYLOAD: usize = MAX_REPORT_DATA - FRAME_HEADER_LEN;

/// One validated transport frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub sequence_rx: u8,
    pub sequence_tx: u8,
    pub checksum: u32,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Build a frame, computing its checksum
    pub fn new(sequence_rx: u8, sequence_tx: u8, payload: Vec<u8>) -> Self {
        let checksum = crc32(&payload);
        Self {
            sequence_rx,
            sequence_tx,
            checksum,
            payload,
        }
    }

    /// Payload-less frame used as an acknowledgement
    pub fn ack(sequence_rx: u8, sequence_tx: u8) -> Self {
        Self::new(sequence_rx, sequence_tx, Vec::new())
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; FRAME_HEADER_LEN + self.payload.len()];
        bytes[0] = self.sequence_rx;
        bytes[1] = self.sequence_tx;
        LittleEndian::write_u32(&mut bytes[2..6], self.checksum);
        bytes[FRAME_HEADER_LEN..].copy_from_slice(&self.payload);
        bytes
    }

    /// Parse a frame and verify its checksum
    ///
    /// A frame that fails verification is returned as a `Checksum` error and
    /// must never reach the record decoder.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < FRAME_HEADER_LEN {
            return Err(DecoderError::Decode(format!(
                "frame of {} bytes is shorter than its header",
                bytes.len()
            )));
        }

        let expected = LittleEndian::read_u32(&bytes[2..6]);
        let payload = bytes[FRAME_HEADER_LEN..].to_vec();
        let computed = crc32(&payload);
        if computed != expected {
            return Err(DecoderError::Checksum {
                scope: ChecksumScope::Frame,
                expected,
                computed,
            });
        }

        Ok(Self {
            sequence_rx: bytes[0],
            sequence_tx: bytes[1],
            checksum: expected,
            payload,
        })
    }
}
