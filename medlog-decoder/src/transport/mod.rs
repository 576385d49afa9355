//! Device transport layer
//!
//! Moves commands and responses over fixed-size HID reports:
//! - `hid`: report wrapping and command codes
//! - `frame`: sequenced, checksummed binary frames
//! - `ack`: shared sequence state and the periodic acknowledgement timer
//! - `text`: validation of line-oriented text responses
//! - `framer`: the blocking send/receive state machine
//! - `replay`: capture playback and scripted peers

pub mod ack;
pub mod frame;
pub mod framer;
pub mod hid;
pub mod replay;
pub mod text;

pub use ack::{AckTimer, SequenceState};
pub use frame::{Frame, MAX_FRAME_PAYLOAD};
pub use framer::{ResponseShape, TransportFramer};
pub use hid::{command, HidReport, HID_REPORT_SIZE};
pub use replay::{ReplayTransport, ScriptedTransport};

use crate::types::Result;
use std::time::Duration;

/// Raw report-level access to a device
///
/// Methods take `&self` so one transport can be shared by the receive loop and
/// the acknowledgement timer.
pub trait Transport: Send + Sync {
    /// Write one 64-byte report
    fn write_report(&self, report: &[u8; HID_REPORT_SIZE]) -> Result<()>;

    /// Read one report, or `None` when nothing arrived within `timeout`
    fn read_report(&self, timeout: Duration) -> Result<Option<[u8; HID_REPORT_SIZE]>>;
}
