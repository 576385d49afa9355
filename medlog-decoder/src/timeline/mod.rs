//! Timeline reconstruction
//!
//! Turns draft events from a device-specific builder into the final event
//! timeline:
//! - `event`: draft and final event types
//! - `segment`: basal segments and their suppressed profiles
//! - `schedule`: basal schedules and pump settings
//! - `family`: per-family hooks (`Tandem`, `Medtronic`, `Meter`)
//! - `reconstructor`: the stateful engine
//! - `time_change`: merging of split date/time changes

pub mod annotations;
pub mod event;
pub mod family;
pub mod reconstructor;
pub mod schedule;
pub mod segment;
pub mod time_change;

pub use annotations::{Annotation, Annotations};
pub use event::{
    BasalDraft, BolusDraft, BolusEvent, BolusSubType, DeviceEvent, DeviceEventDetail, DraftEvent,
    DraftKind, FinalEvent, GlucoseDraft, PumpStatus, ReadingEvent, SettingsEvent, SmbgSubType,
    StatusReason, TimeChangeDraft, WizardDraft, WizardEvent,
};
pub use family::{DeviceFamily, FamilyKind, Medtronic, Meter, Tandem};
pub use reconstructor::Reconstructor;
pub use schedule::{BasalSchedule, PumpSettings, ScheduleEntry};
pub use segment::{DeliveryType, Segment, SuppressedProfile, MAX_SUPPRESSED_DEPTH};
pub use time_change::{merge_time_changes, ClockChange};
