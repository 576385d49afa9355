//! Medical Device Log Decoder Library
//!
//! A reusable library that turns raw byte streams from glucose meters and
//! insulin pumps into a normalized, chronologically consistent event log.
//!
//! # Architecture
//!
//! The library is split along the data flow:
//! - `transport`: frames commands over HID reports, sequences and acknowledges
//!   them, verifies frame checksums and retries timed-out exchanges
//! - `record`: splits response payloads into sub-records, inflates compressed
//!   blocks, validates per-record checksums and resolves wrapped record numbers
//! - `timeline`: the reconstruction engine that turns draft events into
//!   non-overlapping basal segments, merged boluses and filtered readings
//! - `session`: wires the three together for a meter download and defines the
//!   builder and uploader seams
//!
//! The library does NOT:
//! - Enumerate or open USB devices
//! - Build drafts for pump record families (external builders feed drafts in)
//! - Talk to the upload service
//!
//! # Example Usage
//!
//! ```no_run
//! use medlog_decoder::{DecoderConfig, Medtronic, Reconstructor, DraftEvent};
//!
//! let config = DecoderConfig::new();
//! let mut engine = Reconstructor::new(Medtronic, config);
//!
//! let drafts: Vec<DraftEvent> = Vec::new();
//! for draft in drafts {
//!     engine.submit(draft).unwrap();
//! }
//!
//! for event in engine.finalize().unwrap() {
//!     println!("{}", serde_json::to_string(&event).unwrap());
//! }
//! ```

// Public modules
pub mod checksum;
pub mod config;
pub mod record;
pub mod session;
pub mod timeline;
pub mod transport;
pub mod types;

// Re-export main types for convenience
pub use config::DecoderConfig;
pub use record::{DecodeStats, Record, RecordDecoder, RecordFields, RecordType, TableId};
pub use session::{
    reconstruct_drafts, run_session, DraftEventBuilder, GlucoseMeterBuilder, MeterSession,
    SessionMetadata, SessionOutcome, Uploader,
};
pub use timeline::{
    merge_time_changes, BasalSchedule, DeliveryType, DeviceFamily, DraftEvent, DraftKind,
    FamilyKind, FinalEvent, Medtronic, Meter, PumpSettings, Reconstructor, ScheduleEntry, Segment,
    SuppressedProfile, Tandem,
};
pub use transport::{Frame, ResponseShape, Transport, TransportFramer};
pub use types::{ChecksumScope, DecoderError, DeviceTime, Result, Timestamp};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
