//! Annotations attached to reconstructed events
//!
//! Codes without a source prefix are shared by every device family. Codes
//! from [`sourced`] are prefixed with the family's source name, e.g.
//! `tandem/basal/flat-rate`.

use serde::{Deserialize, Serialize};

/// Duration could not be determined from the data
pub const UNKNOWN_DURATION: &str = "basal/unknown-duration";

/// Duration of the last scheduled basal was taken from the schedule
pub const FINAL_BASAL_FROM_SCHEDULE: &str = "final-basal/fabricated-from-schedule";

/// Suspend that was never followed by a resume
pub const INCOMPLETE_TUPLE: &str = "status/incomplete-tuple";

/// Family-prefixed annotation codes
pub mod sourced {
    pub const FABRICATED_FROM_SCHEDULE: &str = "basal/fabricated-from-schedule";
    pub const FABRICATED_FROM_SUPPRESSED: &str = "basal/fabricated-from-suppressed";
    pub const FLAT_RATE: &str = "basal/flat-rate";
    pub const OFF_SCHEDULE_RATE: &str = "basal/off-schedule-rate";
}

/// Prefix a family-specific code with its source name
pub fn sourced(source: &str, code: &str) -> String {
    format!("{}/{}", source, code)
}

/// A single annotation code
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotation {
    pub code: String,
}

/// Ordered set of annotation codes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Annotations(Vec<Annotation>);

impl Annotations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a code unless it is already present
    pub fn push(&mut self, code: impl Into<String>) {
        let code = code.into();
        if !self.contains(&code) {
            self.0.push(Annotation { code });
        }
    }

    /// Remove a code, returning whether it was present
    pub fn remove(&mut self, code: &str) -> bool {
        let before = self.0.len();
        self.0.retain(|annotation| annotation.code != code);
        self.0.len() != before
    }

    /// Add every code of `other`
    pub fn extend(&mut self, other: Annotations) {
        for annotation in other.0 {
            self.push(annotation.code);
        }
    }

    pub fn contains(&self, code: &str) -> bool {
        self.0.iter().any(|annotation| annotation.code == code)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn codes(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|annotation| annotation.code.as_str())
    }
}
