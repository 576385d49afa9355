//! Record-number wraparound resolution
//!
//! Records carry only the low 16 bits of their number. The full value is the
//! largest number not above the table's next counter that matches those bits.

use std::collections::HashMap;

/// Resolve a transmitted 16-bit record number against a table's next counter
///
/// Returns `None` when no non-negative value matches, which only happens for
/// records claiming to be newer than a counter below 65536.
pub fn resolve_record_number(transmitted: u16, next_counter: u32) -> Option<u32> {
    let distance = next_counter.wrapping_sub(transmitted as u32) & 0xFFFF;
    next_counter.checked_sub(distance)
}

/// Next-counter values per database table
///
/// Every table starts from the session's counter; wrap-marker records replace
/// the value for their own table only.
#[derive(Debug, Clone, Default)]
pub struct RecordCounters {
    default_next: u32,
    per_table: HashMap<u8, u32>,
}

impl RecordCounters {
    pub fn new(next_counter: u32) -> Self {
        Self {
            default_next: next_counter,
            per_table: HashMap::new(),
        }
    }

    /// Replace the session counter used by tables without a wrap marker
    pub fn set_default(&mut self, next_counter: u32) {
        self.default_next = next_counter;
    }

    pub fn next_counter(&self, table: u8) -> u32 {
        self.per_table
            .get(&table)
            .copied()
            .unwrap_or(self.default_next)
    }

    /// Apply a wrap-marker record for one table
    pub fn apply_wrap_marker(&mut self, table: u8, next_counter: u32) {
        log::debug!(
            "Table {} next counter {} -> {}",
            table,
            self.next_counter(table),
            next_counter
        );
        self.per_table.insert(table, next_counter);
    }

    pub fn resolve(&self, table: u8, transmitted: u16) -> Option<u32> {
        resolve_record_number(transmitted, self.next_counter(table))
    }
}
