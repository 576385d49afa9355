//! Text summary of processed inputs

use medlog_decoder::{FinalEvent, SessionOutcome};
use std::collections::BTreeMap;
use std::fmt::Write;
use std::path::PathBuf;

/// Result of processing one input file
#[derive(Debug)]
pub struct InputReport {
    pub path: PathBuf,
    pub result: Result<SessionOutcome, String>,
}

/// Number of events per type, in type-name order
pub fn count_by_type(events: &[FinalEvent]) -> BTreeMap<&'static str, usize> {
    let mut counts = BTreeMap::new();
    for event in events {
        *counts.entry(event.type_name()).or_insert(0) += 1;
    }
    counts
}

/// Render the summary printed after a run
pub fn render_summary(reports: &[InputReport]) -> String {
    let mut out = String::new();
    let failed = reports.iter().filter(|report| report.result.is_err()).count();

    let _ = writeln!(out, "Processed {} input(s), {} failed", reports.len(), failed);
    for report in reports {
        let _ = writeln!(out);
        let _ = writeln!(out, "{}", report.path.display());
        match &report.result {
            Ok(outcome) => {
                let _ = writeln!(out, "  device:    {}", outcome.metadata.device_id);
                let _ = writeln!(out, "  upload id: {}", outcome.metadata.upload_id);
                if let (Some(first), Some(last)) = (outcome.events.first(), outcome.events.last()) {
                    let _ = writeln!(out, "  span:      {} .. {}", first.time(), last.time());
                }
                for (type_name, count) in count_by_type(&outcome.events) {
                    let _ = writeln!(out, "  {:<13}{}", type_name, count);
                }

                let stats = &outcome.stats;
                let discarded = stats.checksum_discards
                    + stats.compressed_discards
                    + stats.quality_discards
                    + stats.unresolved_discards;
                if discarded > 0 {
                    let _ = writeln!(out, "  discarded records: {}", discarded);
                }
            }
            Err(message) => {
                let _ = writeln!(out, "  FAILED: {}", message);
            }
        }
    }
    out
}
