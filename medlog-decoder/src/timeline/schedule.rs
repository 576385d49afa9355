//! Basal schedules and pump settings

use crate::types::DeviceTime;
use chrono::Timelike;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const MS_PER_DAY: i64 = 24 * 60 * 60 * 1000;

/// Milliseconds since local midnight
pub fn ms_in_day(time: &DeviceTime) -> i64 {
    time.num_seconds_from_midnight() as i64 * 1000 + (time.nanosecond() / 1_000_000) as i64
}

/// One rate change in a daily schedule
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    /// Milliseconds since local midnight
    pub start: i64,
    /// Units per hour
    pub rate: f64,
}

/// Daily basal schedule, entries ordered by start
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<ScheduleEntry>", into = "Vec<ScheduleEntry>")]
pub struct BasalSchedule {
    entries: Vec<ScheduleEntry>,
}

impl From<Vec<ScheduleEntry>> for BasalSchedule {
    fn from(entries: Vec<ScheduleEntry>) -> Self {
        Self::new(entries)
    }
}

impl From<BasalSchedule> for Vec<ScheduleEntry> {
    fn from(schedule: BasalSchedule) -> Self {
        schedule.entries
    }
}

impl BasalSchedule {
    pub fn new(mut entries: Vec<ScheduleEntry>) -> Self {
        entries.sort_by_key(|entry| entry.start);
        Self { entries }
    }

    pub fn entries(&self) -> &[ScheduleEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entry in effect at `ms` since midnight, with its position
    pub fn entry_at(&self, ms: i64) -> Option<(usize, &ScheduleEntry)> {
        self.entries
            .iter()
            .enumerate()
            .rev()
            .find(|(_, entry)| entry.start <= ms)
    }

    pub fn rate_at(&self, ms: i64) -> Option<f64> {
        self.entry_at(ms).map(|(_, entry)| entry.rate)
    }

    /// Start of the entry following position `i`, or midnight
    pub fn next_start(&self, i: usize) -> i64 {
        self.entries.get(i + 1).map_or(MS_PER_DAY, |entry| entry.start)
    }

    /// Entry starts falling strictly inside an interval
    ///
    /// Returns `(offset from interval start, entry)` pairs in time order,
    /// following the schedule across midnight.
    pub fn boundaries_within(&self, start_ms: i64, duration_ms: i64) -> Vec<(i64, ScheduleEntry)> {
        let mut boundaries = Vec::new();
        if duration_ms <= 0 {
            return boundaries;
        }

        let last_day = (start_ms + duration_ms) / MS_PER_DAY;
        for day in 0..=last_day {
            for entry in &self.entries {
                let offset = day * MS_PER_DAY + entry.start - start_ms;
                if offset > 0 && offset < duration_ms {
                    boundaries.push((offset, *entry));
                }
            }
        }
        boundaries
    }
}

/// Carb and glucose units the pump was configured with
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SettingsUnits {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub carb: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bg: Option<String>,
}

/// Pump configuration at one point in time
///
/// Optional fields left empty by a settings record are filled from the
/// previous settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PumpSettings {
    pub active_schedule: String,
    #[serde(default)]
    pub basal_schedules: BTreeMap<String, BasalSchedule>,
    #[serde(default)]
    pub units: SettingsUnits,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bolus_amount_maximum: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bolus_extended_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub basal_rate_maximum: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temporary_basal_type: Option<String>,
}

impl PumpSettings {
    pub fn new(active_schedule: impl Into<String>) -> Self {
        Self {
            active_schedule: active_schedule.into(),
            ..Self::default()
        }
    }

    pub fn with_schedule(mut self, name: impl Into<String>, schedule: BasalSchedule) -> Self {
        self.basal_schedules.insert(name.into(), schedule);
        self
    }

    pub fn schedule(&self, name: &str) -> Option<&BasalSchedule> {
        self.basal_schedules.get(name)
    }

    pub fn active(&self) -> Option<&BasalSchedule> {
        self.schedule(&self.active_schedule)
    }

    /// Carbs entered in exchanges rather than grams
    pub fn uses_exchanges(&self) -> bool {
        self.units.carb.as_deref() == Some("exchanges")
    }

    /// Take point-in-time fields this record did not carry from `previous`
    pub fn fill_forward(&mut self, previous: &PumpSettings) {
        if self.bolus_amount_maximum.is_none() {
            self.bolus_amount_maximum = previous.bolus_amount_maximum;
        }
        if self.bolus_extended_enabled.is_none() {
            self.bolus_extended_enabled = previous.bolus_extended_enabled;
        }
        if self.basal_rate_maximum.is_none() {
            self.basal_rate_maximum = previous.basal_rate_maximum;
        }
        if self.temporary_basal_type.is_none() {
            self.temporary_basal_type = previous.temporary_basal_type.clone();
        }
        if self.units.carb.is_none() {
            self.units.carb = previous.units.carb.clone();
        }
        if self.units.bg.is_none() {
            self.units.bg = previous.units.bg.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    const HOUR: i64 = 60 * 60 * 1000;

    fn schedule() -> BasalSchedule {
        BasalSchedule::new(vec![
            ScheduleEntry { start: 6 * HOUR, rate: 1.0 },
            ScheduleEntry { start: 0, rate: 0.8 },
            ScheduleEntry { start: 22 * HOUR, rate: 0.6 },
        ])
    }

    #[test]
    fn test_entry_lookup() {
        let schedule = schedule();
        assert_eq!(schedule.rate_at(0), Some(0.8));
        assert_eq!(schedule.rate_at(6 * HOUR - 1), Some(0.8));
        assert_eq!(schedule.rate_at(6 * HOUR), Some(1.0));
        assert_eq!(schedule.rate_at(23 * HOUR), Some(0.6));
        assert_eq!(schedule.next_start(1), 22 * HOUR);
        assert_eq!(schedule.next_start(2), MS_PER_DAY);
    }

    #[test]
    fn test_boundaries_are_strictly_inside() {
        let schedule = schedule();
        // 05:00 for one hour: the 06:00 start is the interval end
        assert!(schedule.boundaries_within(5 * HOUR, HOUR).is_empty());

        let boundaries = schedule.boundaries_within(5 * HOUR, 2 * HOUR);
        assert_eq!(boundaries.len(), 1);
        assert_eq!(boundaries[0].0, HOUR);
        assert_eq!(boundaries[0].1.rate, 1.0);
    }

    #[test]
    fn test_boundaries_cross_midnight() {
        let boundaries = schedule().boundaries_within(21 * HOUR, 10 * HOUR);
        let offsets: Vec<i64> = boundaries.iter().map(|(offset, _)| *offset).collect();
        assert_eq!(offsets, vec![HOUR, 3 * HOUR, 9 * HOUR]);
    }

    #[test]
    fn test_ms_in_day() {
        let time = NaiveDate::from_ymd_opt(2016, 3, 14)
            .unwrap()
            .and_hms_milli_opt(2, 30, 0, 250)
            .unwrap();
        assert_eq!(ms_in_day(&time), 2 * HOUR + 30 * 60 * 1000 + 250);
    }

    #[test]
    fn test_fill_forward_keeps_new_values() {
        let mut previous = PumpSettings::new("standard");
        previous.bolus_amount_maximum = Some(10.0);
        previous.basal_rate_maximum = Some(3.0);
        previous.units.carb = Some("exchanges".into());

        let mut current = PumpSettings::new("weekend");
        current.basal_rate_maximum = Some(2.0);
        current.fill_forward(&previous);

        assert_eq!(current.bolus_amount_maximum, Some(10.0));
        assert_eq!(current.basal_rate_maximum, Some(2.0));
        assert!(current.uses_exchanges());
        assert_eq!(current.active_schedule, "weekend");
    }

    #[test]
    fn test_schedule_deserializes_sorted() {
        let schedule: BasalSchedule =
            serde_json::from_str(r#"[{"start":3600000,"rate":1.0},{"start":0,"rate":0.5}]"#)
                .unwrap();
        assert_eq!(schedule.entries()[0].start, 0);
    }
}
