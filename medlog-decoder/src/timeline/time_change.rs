//! Merging of split clock changes
//!
//! Devices often log a date change and a time change as two records when the
//! user sets the clock. Adjacent records that share either the date or the
//! time-of-day are treated as one change. This is a heuristic: two unrelated
//! changes logged back to back within the window are merged too.

use crate::types::{device_time_serde, DeviceTime};
use serde::{Deserialize, Serialize};

/// One clock change read from a device log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockChange {
    /// Record index in the device log
    pub index: u64,
    #[serde(with = "device_time_serde")]
    pub from: DeviceTime,
    #[serde(with = "device_time_serde")]
    pub to: DeviceTime,
}

fn continues(first: &ClockChange, second: &ClockChange) -> bool {
    first.to.date() == second.from.date() || first.to.time() == second.from.time()
}

/// Combine date and time changes logged within `window` records of each other
///
/// Input order does not matter; output is ordered by record index. Each
/// change is merged at most once.
pub fn merge_time_changes(changes: &[ClockChange], window: u32) -> Vec<ClockChange> {
    let mut sorted = changes.to_vec();
    sorted.sort_by_key(|change| change.index);

    let mut merged = Vec::with_capacity(sorted.len());
    let mut i = 0;
    while i < sorted.len() {
        let first = &sorted[i];
        match sorted.get(i + 1) {
            Some(second)
                if second.index - first.index <= window as u64 && continues(first, second) =>
            {
                log::debug!(
                    "Merging clock changes at records {} and {}",
                    first.index,
                    second.index
                );
                merged.push(ClockChange {
                    index: first.index,
                    from: first.from,
                    to: second.to,
                });
                i += 2;
            }
            _ => {
                merged.push(first.clone());
                i += 1;
            }
        }
    }
    merged
}
