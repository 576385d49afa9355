//! Per-family behaviour of the timeline reconstructor
//!
//! The reconstruction rules are shared; what differs between pump families is
//! captured by [`DeviceFamily`].

use crate::config::DecoderConfig;
use crate::timeline::schedule::{BasalSchedule, PumpSettings};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Device family hooks used by the reconstructor
pub trait DeviceFamily {
    /// Prefix for family-specific annotation codes
    fn source(&self) -> &'static str;

    /// Schedule governing a segment
    ///
    /// `schedule_name` is the name recorded on the segment, if any.
    fn schedule<'a>(
        &self,
        settings: &'a PumpSettings,
        schedule_name: Option<&str>,
    ) -> Option<&'a BasalSchedule> {
        schedule_name
            .and_then(|name| settings.schedule(name))
            .or_else(|| settings.active())
    }

    /// Window within which an identical CGM value is a backfilled repeat
    fn cbg_dedupe_window_ms(&self, config: &DecoderConfig) -> Option<i64>;

    /// Whether this alarm explains a pump suspension
    fn is_suspend_cause(&self, alarm_type: &str) -> bool;
}

/// Tandem insulin pumps
#[derive(Debug, Clone, Copy, Default)]
pub struct Tandem;

impl DeviceFamily for Tandem {
    fn source(&self) -> &'static str {
        "tandem"
    }

    fn cbg_dedupe_window_ms(&self, config: &DecoderConfig) -> Option<i64> {
        Some(config.cbg_dedupe_window_ms)
    }

    fn is_suspend_cause(&self, alarm_type: &str) -> bool {
        matches!(alarm_type, "occlusion" | "auto_off" | "no_insulin" | "no_power")
    }
}

/// Medtronic insulin pumps
#[derive(Debug, Clone, Copy, Default)]
pub struct Medtronic;

impl DeviceFamily for Medtronic {
    fn source(&self) -> &'static str {
        "medtronic"
    }

    // Sensor values are read from pages without backfill repeats
    fn cbg_dedupe_window_ms(&self, _config: &DecoderConfig) -> Option<i64> {
        None
    }

    fn is_suspend_cause(&self, alarm_type: &str) -> bool {
        matches!(alarm_type, "no_delivery" | "auto_off" | "no_insulin" | "no_power")
    }
}

/// Blood glucose and flash glucose meters
///
/// Meters log no basal or bolus data, so only the reading rules apply.
#[derive(Debug, Clone, Copy, Default)]
pub struct Meter;

impl DeviceFamily for Meter {
    fn source(&self) -> &'static str {
        "meter"
    }

    fn cbg_dedupe_window_ms(&self, _config: &DecoderConfig) -> Option<i64> {
        None
    }

    fn is_suspend_cause(&self, _alarm_type: &str) -> bool {
        false
    }
}

/// Family selector for configuration files and the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FamilyKind {
    Tandem,
    Medtronic,
}

impl FromStr for FamilyKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "tandem" => Ok(FamilyKind::Tandem),
            "medtronic" => Ok(FamilyKind::Medtronic),
            other => Err(format!("unknown device family '{}'", other)),
        }
    }
}

impl std::fmt::Display for FamilyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FamilyKind::Tandem => write!(f, "tandem"),
            FamilyKind::Medtronic => write!(f, "medtronic"),
        }
    }
}
