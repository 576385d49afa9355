//! Decoder configuration types
//!
//! This module defines the knobs shared by the transport, record and timeline
//! layers. Everything has a default matching the behaviour devices expect, so
//! `DecoderConfig::new()` is a working configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for a device session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DecoderConfig {
    /// How long to wait for a response frame, in milliseconds
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,

    /// How many times a timed-out exchange is reissued before giving up
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Interval of the acknowledgement timer during binary responses
    #[serde(default = "default_ack_interval")]
    pub ack_interval_ms: u64,

    /// Events dated in this year or earlier are dropped as power-on defaults
    #[serde(default = "default_year_threshold")]
    pub year_threshold: i32,

    /// Record-index distance within which date and time changes are merged
    #[serde(default = "default_time_change_window")]
    pub time_change_merge_window: u32,

    /// Repeated CGM values closer than this are treated as backfill duplicates
    #[serde(default = "default_cbg_dedupe")]
    pub cbg_dedupe_window_ms: i64,

    /// Manual fingerstick duplicating a linked one within this window is dropped
    #[serde(default = "default_smbg_dedupe")]
    pub smbg_dedupe_window_ms: i64,

    /// Basal segments longer than this are truncated as flat-rate
    #[serde(default = "default_flat_rate_limit")]
    pub flat_rate_limit_ms: i64,

    /// Offset of device-local time from UTC, in minutes
    #[serde(default)]
    pub timezone_offset_minutes: i32,
}

fn default_read_timeout() -> u64 {
    5000
}

fn default_max_retries() -> u32 {
    6
}

fn default_ack_interval() -> u64 {
    250
}

fn default_year_threshold() -> i32 {
    2012
}

fn default_time_change_window() -> u32 {
    2
}

fn default_cbg_dedupe() -> i64 {
    2 * 60 * 1000
}

fn default_smbg_dedupe() -> i64 {
    15 * 60 * 1000
}

fn default_flat_rate_limit() -> i64 {
    5 * 24 * 60 * 60 * 1000
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            read_timeout_ms: default_read_timeout(),
            max_retries: default_max_retries(),
            ack_interval_ms: default_ack_interval(),
            year_threshold: default_year_threshold(),
            time_change_merge_window: default_time_change_window(),
            cbg_dedupe_window_ms: default_cbg_dedupe(),
            smbg_dedupe_window_ms: default_smbg_dedupe(),
            flat_rate_limit_ms: default_flat_rate_limit(),
            timezone_offset_minutes: 0,
        }
    }
}

impl DecoderConfig {
    /// Create a new configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method: set the response timeout
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Builder method: set the retry budget for timed-out exchanges
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Builder method: set the acknowledgement timer interval
    pub fn with_ack_interval(mut self, interval: Duration) -> Self {
        self.ack_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Builder method: set the unreliable-year threshold
    pub fn with_year_threshold(mut self, year: i32) -> Self {
        self.year_threshold = year;
        self
    }

    /// Builder method: set the time-change merge window
    pub fn with_time_change_merge_window(mut self, window: u32) -> Self {
        self.time_change_merge_window = window;
        self
    }

    /// Builder method: set the device timezone offset
    pub fn with_timezone_offset(mut self, minutes: i32) -> Self {
        self.timezone_offset_minutes = minutes;
        self
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn ack_interval(&self) -> Duration {
        Duration::from_millis(self.ack_interval_ms)
    }

    /// Check values that would make a session meaningless
    pub fn validate(&self) -> crate::Result<()> {
        if self.read_timeout_ms == 0 {
            return Err(crate::DecoderError::Config(
                "read_timeout_ms must be positive".to_string(),
            ));
        }
        if self.ack_interval_ms == 0 {
            return Err(crate::DecoderError::Config(
                "ack_interval_ms must be positive".to_string(),
            ));
        }
        if self.timezone_offset_minutes.abs() > 14 * 60 {
            return Err(crate::DecoderError::Config(format!(
                "timezone offset {} minutes is out of range",
                self.timezone_offset_minutes
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decoder_config_builder() {
        let config = DecoderConfig::new()
            .with_read_timeout(Duration::from_secs(2))
            .with_max_retries(3)
            .with_ack_interval(Duration::from_millis(100))
            .with_year_threshold(2010)
            .with_timezone_offset(-300);

        assert_eq!(config.read_timeout_ms, 2000);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.ack_interval(), Duration::from_millis(100));
        assert_eq!(config.year_threshold, 2010);
        assert_eq!(config.timezone_offset_minutes, -300);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_defaults_from_empty_document() {
        let config: DecoderConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, DecoderConfig::default());
        assert_eq!(config.year_threshold, 2012);
        assert_eq!(config.time_change_merge_window, 2);
    }

    #[test]
    fn test_validate_rejects_bad_offset() {
        let config = DecoderConfig::new().with_timezone_offset(15 * 60);
        assert!(config.validate().is_err());
    }
}
