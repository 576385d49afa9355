//! Core types for the medlog decoder library
//!
//! This module defines the fundamental types shared by the transport, record and
//! timeline layers: the timestamp aliases, the error taxonomy and the crate-wide
//! `Result` alias.

use chrono::{DateTime, NaiveDateTime, Utc};
use std::fmt;

/// UTC instant used for every event time
pub type Timestamp = DateTime<Utc>;

/// Device-local wall-clock time (no zone attached)
pub type DeviceTime = NaiveDateTime;

/// Result type for decoder operations
pub type Result<T> = std::result::Result<T, DecoderError>;

/// Format used when a device time is rendered as a string
pub const DEVICE_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Render a device-local time the way uploaded events carry it
pub fn format_device_time(time: &DeviceTime) -> String {
    time.format(DEVICE_TIME_FORMAT).to_string()
}

/// Serde adapter writing device times as `DEVICE_TIME_FORMAT` strings
pub mod device_time_serde {
    use super::{DeviceTime, DEVICE_TIME_FORMAT};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(time: &DeviceTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&time.format(DEVICE_TIME_FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DeviceTime, D::Error> {
        let text = String::deserialize(deserializer)?;
        DeviceTime::parse_from_str(&text, DEVICE_TIME_FORMAT).map_err(serde::de::Error::custom)
    }
}

/// Which checksum failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumScope {
    /// CRC32 over a transport frame payload
    Frame,
    /// CRC16 over a single database record
    Record,
    /// CRC32 over an inflated compressed block
    CompressedBlock,
    /// Additive checksum of a text-protocol response
    Text,
}

impl fmt::Display for ChecksumScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChecksumScope::Frame => write!(f, "frame"),
            ChecksumScope::Record => write!(f, "record"),
            ChecksumScope::CompressedBlock => write!(f, "compressed block"),
            ChecksumScope::Text => write!(f, "text response"),
        }
    }
}

/// Errors that can occur while talking to a device or reconstructing its timeline
#[derive(Debug, thiserror::Error)]
pub enum DecoderError {
    #[error("{scope} checksum mismatch: expected 0x{expected:08X}, computed 0x{computed:08X}")]
    Checksum {
        scope: ChecksumScope,
        expected: u32,
        computed: u32,
    },

    #[error("Unexpected frame sequence: expected {expected}, received {received}")]
    Sequence { expected: u8, received: u8 },

    #[error("No response within {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },

    #[error("Malformed sub-record framing: {0}")]
    Decode(String),

    #[error("Events out of order: last accepted {previous}, offending {offending}")]
    OrderingViolation {
        previous: Timestamp,
        offending: Timestamp,
    },

    #[error("Device has no data to upload")]
    NoRecords,

    #[error("Missing required context: {0}")]
    MissingContext(String),

    #[error("Device protocol error: {0}")]
    Protocol(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DecoderError {
    /// True for errors that a retry of the same exchange may clear
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DecoderError::Timeout { .. }
                | DecoderError::Checksum { .. }
                | DecoderError::Sequence { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_device_time_format() {
        let time = NaiveDate::from_ymd_opt(2016, 3, 14)
            .unwrap()
            .and_hms_opt(1, 59, 26)
            .unwrap();
        assert_eq!(format_device_time(&time), "2016-03-14T01:59:26");
    }

    #[test]
    fn test_device_time_serde() {
        #[derive(serde::Serialize, serde::Deserialize)]
        struct Wrapper {
            #[serde(with = "device_time_serde")]
            at: DeviceTime,
        }

        let parsed: Wrapper = serde_json::from_str(r#"{"at":"2016-03-14T01:59:26"}"#).unwrap();
        assert_eq!(format_device_time(&parsed.at), "2016-03-14T01:59:26");
        assert_eq!(
            serde_json::to_string(&parsed).unwrap(),
            r#"{"at":"2016-03-14T01:59:26"}"#
        );
        assert!(serde_json::from_str::<Wrapper>(r#"{"at":"yesterday"}"#).is_err());
    }

    #[test]
    fn test_error_classification() {
        assert!(DecoderError::Timeout { timeout_ms: 5000 }.is_retryable());
        assert!(DecoderError::Sequence {
            expected: 3,
            received: 5
        }
        .is_retryable());
        assert!(!DecoderError::NoRecords.is_retryable());
        assert!(!DecoderError::MissingContext("settings".into()).is_retryable());
    }

    #[test]
    fn test_checksum_error_display() {
        let err = DecoderError::Checksum {
            scope: ChecksumScope::Frame,
            expected: 0xDEADBEEF,
            computed: 0x1,
        };
        assert_eq!(
            err.to_string(),
            "frame checksum mismatch: expected 0xDEADBEEF, computed 0x00000001"
        );
    }
}
