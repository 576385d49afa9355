//! Basal delivery segments
//!
//! A segment is one contiguous stretch of basal delivery. Temporary and
//! suspended segments carry the profile they override as a `suppressed` tree.

use crate::timeline::annotations::Annotations;
use crate::types::{device_time_serde, DeviceTime, Timestamp};
use chrono::Duration;
use serde::{Deserialize, Serialize};

/// Deepest suppressed nesting kept on a segment
pub const MAX_SUPPRESSED_DEPTH: usize = 4;

/// How basal insulin was being delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryType {
    Scheduled,
    Temp,
    Suspend,
}

/// Delivery profile overridden by a temporary or suspended segment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuppressedProfile {
    pub delivery_type: DeliveryType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_name: Option<String>,
    #[serde(default, skip_serializing_if = "Annotations::is_empty")]
    pub annotations: Annotations,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suppressed: Option<Box<SuppressedProfile>>,

    /// When the suppressed delivery started
    #[serde(skip)]
    pub started_at: Option<Timestamp>,
    /// Duration the suppressed delivery was programmed with, from `started_at`
    #[serde(skip)]
    pub programmed_duration: Option<i64>,
}

impl SuppressedProfile {
    /// Scheduled delivery at `rate`
    pub fn scheduled(rate: f64, schedule_name: Option<String>) -> Self {
        Self {
            delivery_type: DeliveryType::Scheduled,
            rate: Some(rate),
            percent: None,
            schedule_name,
            annotations: Annotations::new(),
            suppressed: None,
            started_at: None,
            programmed_duration: None,
        }
    }

    /// True when a programmed duration ran out at or before `at`
    pub fn expired_by(&self, at: Timestamp) -> bool {
        match (self.started_at, self.programmed_duration) {
            (Some(start), Some(programmed)) => start + Duration::milliseconds(programmed) <= at,
            _ => false,
        }
    }

    /// Programmed time left at `at`, if the duration is known
    pub fn remaining_at(&self, at: Timestamp) -> Option<i64> {
        let start = self.started_at?;
        self.programmed_duration
            .map(|programmed| programmed - (at - start).num_milliseconds())
    }

    /// Level that delivers again once everything above it is lifted at `at`
    ///
    /// Suspends are skipped, and so are temps whose programmed duration ran
    /// out by then.
    pub fn resumable_at(self, at: Timestamp) -> Option<SuppressedProfile> {
        let lifted = match self.delivery_type {
            DeliveryType::Scheduled => false,
            DeliveryType::Temp => self.expired_by(at),
            DeliveryType::Suspend => true,
        };
        if !lifted {
            return Some(self);
        }
        log::debug!("{:?} profile no longer in effect at {}", self.delivery_type, at);
        self.suppressed.and_then(|inner| inner.resumable_at(at))
    }

    /// Number of levels in this tree, counting this one
    pub fn depth(&self) -> usize {
        1 + self.suppressed.as_ref().map_or(0, |inner| inner.depth())
    }

    /// Cut the tree down to at most `max_depth` levels
    pub fn truncated(mut self, max_depth: usize) -> Self {
        if max_depth <= 1 {
            if self.suppressed.take().is_some() {
                log::warn!("Dropping suppressed profile nested deeper than {} levels", MAX_SUPPRESSED_DEPTH);
            }
        } else if let Some(inner) = self.suppressed.take() {
            self.suppressed = Some(Box::new(inner.truncated(max_depth - 1)));
        }
        self
    }

    /// First scheduled level in the tree
    pub fn base_scheduled(&self) -> Option<&SuppressedProfile> {
        match self.delivery_type {
            DeliveryType::Scheduled => Some(self),
            _ => self.suppressed.as_deref().and_then(|inner| inner.base_scheduled()),
        }
    }

    /// Copy of the tree with its scheduled level replaced
    ///
    /// Percent-based levels above the replacement get their rate recomputed.
    pub fn rebased(&self, scheduled: &SuppressedProfile) -> SuppressedProfile {
        if self.delivery_type == DeliveryType::Scheduled {
            return scheduled.clone();
        }

        let mut profile = self.clone();
        if let Some(inner) = self.suppressed.as_deref() {
            let inner = inner.rebased(scheduled);
            if let (Some(percent), Some(base)) = (profile.percent, inner.rate) {
                profile.rate = Some(base * percent);
            }
            profile.suppressed = Some(Box::new(inner));
        }
        profile
    }
}

/// One stretch of basal delivery
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    #[serde(rename = "time")]
    pub start_time: Timestamp,
    #[serde(with = "device_time_serde")]
    pub device_time: DeviceTime,
    pub delivery_type: DeliveryType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percent: Option<f64>,
    /// Actual duration in milliseconds, unknown while the segment is open
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<i64>,
    /// Programmed duration when the segment was cut short
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_duration: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suppressed: Option<SuppressedProfile>,
    #[serde(skip_serializing_if = "Annotations::is_empty")]
    pub annotations: Annotations,

    #[serde(skip)]
    pub index: u64,
    /// Duration the device was programmed with, if any
    #[serde(skip)]
    pub programmed_duration: Option<i64>,
}

impl Segment {
    pub fn new(start_time: Timestamp, device_time: DeviceTime, delivery_type: DeliveryType) -> Self {
        Self {
            start_time,
            device_time,
            delivery_type,
            rate: None,
            percent: None,
            duration: None,
            expected_duration: None,
            schedule_name: None,
            suppressed: None,
            annotations: Annotations::new(),
            index: 0,
            programmed_duration: None,
        }
    }

    pub fn end_time(&self) -> Option<Timestamp> {
        self.duration
            .map(|duration| self.start_time + Duration::milliseconds(duration))
    }

    /// Profile a segment started on top of this one would suppress
    pub fn profile(&self) -> SuppressedProfile {
        SuppressedProfile {
            delivery_type: self.delivery_type,
            rate: self.rate,
            percent: self.percent,
            schedule_name: self.schedule_name.clone(),
            annotations: Annotations::new(),
            suppressed: self.suppressed.clone().map(Box::new),
            started_at: Some(self.start_time),
            programmed_duration: self.programmed_duration,
        }
        .truncated(MAX_SUPPRESSED_DEPTH)
    }

    /// Copy of this segment starting `offset_ms` later
    ///
    /// The copy has no duration and no annotations; its programmed duration
    /// is what remains of this one's.
    pub fn split_off(&self, offset_ms: i64) -> Segment {
        let offset = Duration::milliseconds(offset_ms);
        Segment {
            start_time: self.start_time + offset,
            device_time: self.device_time + offset,
            duration: None,
            expected_duration: None,
            programmed_duration: self.programmed_duration.map(|programmed| programmed - offset_ms),
            annotations: Annotations::new(),
            ..self.clone()
        }
    }
}
