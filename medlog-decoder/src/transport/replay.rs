//! In-process transports
//!
//! `ReplayTransport` plays back a capture file of inbound reports, which is how
//! recorded device sessions are re-decoded without hardware. `ScriptedTransport`
//! answers each written report through a closure and records everything
//! written, standing in for a live device.

use crate::transport::hid::{HidReport, HID_REPORT_SIZE};
use crate::transport::Transport;
use crate::types::{DecoderError, Result};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

type Report = [u8; HID_REPORT_SIZE];

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Plays back captured inbound reports in order
///
/// Writes are counted but otherwise ignored. Once the capture is exhausted
/// every read times out.
pub struct ReplayTransport {
    inbound: Mutex<VecDeque<Report>>,
    writes: Mutex<usize>,
}

impl ReplayTransport {
    /// Load a capture made of back-to-back 64-byte reports
    pub fn open(path: &Path) -> Result<Self> {
        log::info!("Loading capture: {:?}", path);
        let bytes = std::fs::read(path)?;
        Self::from_bytes(&bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() % HID_REPORT_SIZE != 0 {
            return Err(DecoderError::Protocol(format!(
                "capture length {} is not a multiple of {}",
                bytes.len(),
                HID_REPORT_SIZE
            )));
        }

        let inbound: VecDeque<Report> = bytes
            .chunks_exact(HID_REPORT_SIZE)
            .map(|chunk| {
                let mut report = [0u8; HID_REPORT_SIZE];
                report.copy_from_slice(chunk);
                report
            })
            .collect();
        log::debug!("Capture holds {} reports", inbound.len());

        Ok(Self {
            inbound: Mutex::new(inbound),
            writes: Mutex::new(0),
        })
    }

    /// Number of reports the session wrote
    pub fn writes(&self) -> usize {
        *lock(&self.writes)
    }

    /// Reports not yet consumed
    pub fn remaining(&self) -> usize {
        lock(&self.inbound).len()
    }
}

impl Transport for ReplayTransport {
    fn write_report(&self, report: &Report) -> Result<()> {
        log::trace!("Replay write: command 0x{:02X}", report[0]);
        *lock(&self.writes) += 1;
        Ok(())
    }

    fn read_report(&self, _timeout: Duration) -> Result<Option<Report>> {
        Ok(lock(&self.inbound).pop_front())
    }
}

type Responder = Box<dyn FnMut(&HidReport) -> Vec<Report> + Send>;

/// Transport whose peer is a closure
///
/// Each written report is parsed and handed to the responder; whatever it
/// returns is queued as inbound reports. An empty queue times out immediately.
pub struct ScriptedTransport {
    responder: Mutex<Responder>,
    inbound: Mutex<VecDeque<Report>>,
    written: Mutex<Vec<Report>>,
}

impl ScriptedTransport {
    pub fn new<F>(responder: F) -> Self
    where
        F: FnMut(&HidReport) -> Vec<Report> + Send + 'static,
    {
        Self {
            responder: Mutex::new(Box::new(responder)),
            inbound: Mutex::new(VecDeque::new()),
            written: Mutex::new(Vec::new()),
        }
    }

    /// A peer that never answers
    pub fn silent() -> Self {
        Self::new(|_| Vec::new())
    }

    /// Queue an inbound report directly
    pub fn push_inbound(&self, report: Report) {
        lock(&self.inbound).push_back(report);
    }

    /// Everything written so far, in order
    pub fn written(&self) -> Vec<Report> {
        lock(&self.written).clone()
    }
}

impl Transport for ScriptedTransport {
    fn write_report(&self, report: &Report) -> Result<()> {
        lock(&self.written).push(*report);
        let parsed = HidReport::parse(report)?;
        let replies = {
            let mut responder = lock(&self.responder);
            (*responder)(&parsed)
        };
        lock(&self.inbound).extend(replies);
        Ok(())
    }

    fn read_report(&self, _timeout: Duration) -> Result<Option<Report>> {
        Ok(lock(&self.inbound).pop_front())
    }
}
