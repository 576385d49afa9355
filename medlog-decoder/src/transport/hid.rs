//! Fixed-size HID report wrapping
//!
//! Every transfer to or from the meter is one 64-byte report:
//!
//! ```text
//! COMMAND  LENGTH  DATA                       PADDING
//! u8       u8      LENGTH bytes (<= 62)       zero or garbage
//! ```
//!
//! Bytes after `2 + LENGTH` may contain leftovers from earlier transfers and are
//! always ignored.

use crate::types::{DecoderError, Result};

/// Size of one HID report in bytes
pub const HID_REPORT_SIZE: usize = 64;

/// Largest data length a single report can carry
pub const MAX_REPORT_DATA: usize = HID_REPORT_SIZE - 2;

/// Command and response codes
pub mod command {
    /// Handshake sequence issued before any other command
    pub const INIT: [u8; 4] = [0x04, 0x05, 0x15, 0x01];
    /// Line-oriented text request and response
    pub const TEXT: u8 = 0x60;
    /// Framed binary request
    pub const BINARY_REQUEST: u8 = 0x0A;
    /// Framed binary response
    pub const BINARY_RESPONSE: u8 = 0x0B;
    /// Acknowledgement only, carries an empty frame
    pub const ACK: u8 = 0x0C;
}

/// One decoded HID report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HidReport {
    pub command: u8,
    pub data: Vec<u8>,
}

impl HidReport {
    /// Create a report, rejecting data that does not fit
    pub fn new(command: u8, data: Vec<u8>) -> Result<Self> {
        if data.len() > MAX_REPORT_DATA {
            return Err(DecoderError::Protocol(format!(
                "report data of {} bytes exceeds {} bytes",
                data.len(),
                MAX_REPORT_DATA
            )));
        }
        Ok(Self { command, data })
    }

    /// Serialize into a zero-padded 64-byte report
    pub fn encode(&self) -> [u8; HID_REPORT_SIZE] {
        let mut raw = [0u8; HID_REPORT_SIZE];
        raw[0] = self.command;
        raw[1] = self.data.len() as u8;
        raw[2..2 + self.data.len()].copy_from_slice(&self.data);
        raw
    }

    /// Parse a raw report, keeping only the declared data bytes
    pub fn parse(raw: &[u8]) -> Result<Self> {
        if raw.len() < 2 {
            return Err(DecoderError::Protocol(format!(
                "report of {} bytes is too short",
                raw.len()
            )));
        }

        let length = raw[1] as usize;
        if length > MAX_REPORT_DATA || 2 + length > raw.len() {
            return Err(DecoderError::Protocol(format!(
                "report declares {} data bytes but carries {}",
                length,
                raw.len() - 2
            )));
        }

        Ok(Self {
            command: raw[0],
            data: raw[2..2 + length].to_vec(),
        })
    }

    /// Split a long payload over as many reports as needed
    pub fn split(command: u8, payload: &[u8]) -> Vec<HidReport> {
        if payload.is_empty() {
            return vec![HidReport {
                command,
                data: Vec::new(),
            }];
        }
        payload
            .chunks(MAX_REPORT_DATA)
            .map(|chunk| HidReport {
                command,
                data: chunk.to_vec(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_pads_to_report_size() {
        let report = HidReport::new(command::TEXT, b"$sn?\r\n".to_vec()).unwrap();
        let raw = report.encode();
        assert_eq!(raw.len(), HID_REPORT_SIZE);
        assert_eq!(raw[0], 0x60);
        assert_eq!(raw[1], 6);
        assert_eq!(&raw[2..8], b"$sn?\r\n");
        assert!(raw[8..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_parse_ignores_garbage_after_length() {
        let mut raw = [0xAAu8; HID_REPORT_SIZE];
        raw[0] = command::BINARY_RESPONSE;
        raw[1] = 3;
        raw[2..5].copy_from_slice(&[1, 2, 3]);
        let report = HidReport::parse(&raw).unwrap();
        assert_eq!(report.command, command::BINARY_RESPONSE);
        assert_eq!(report.data, vec![1, 2, 3]);
    }

    #[test]
    fn test_oversized_data_rejected() {
        assert!(HidReport::new(command::TEXT, vec![0; 63]).is_err());

        let mut raw = [0u8; HID_REPORT_SIZE];
        raw[1] = 63;
        assert!(HidReport::parse(&raw).is_err());
    }

    #[test]
    fn test_split_long_payload() {
        let reports = HidReport::split(command::TEXT, &[7u8; 130]);
        assert_eq!(reports.len(), 3);
        assert_eq!(reports[0].data.len(), 62);
        assert_eq!(reports[2].data.len(), 6);
        assert_eq!(HidReport::split(0x04, &[]).len(), 1);
    }
}
