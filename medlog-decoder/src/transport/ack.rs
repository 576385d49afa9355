//! Sequence tracking and the periodic acknowledgement timer
//!
//! `SequenceState` is shared between the receive loop and the `AckTimer`
//! thread. Ownership of each field is fixed:
//! - `sequence_rx` and `sequence_tx` are written only by the receive loop
//! - `last_ack_sent` is written only by the timer while it runs
//!
//! The timer never touches the sequence counters, so a late tick can at worst
//! send a redundant acknowledgement.
//!
//! The timer thread runs until its shutdown flag is set. A wake channel cuts
//! the wait between ticks short so stopping does not take a full interval.

use crate::transport::frame::Frame;
use crate::transport::hid::{command, HidReport};
use crate::transport::Transport;
use crate::types::Result;
use crossbeam_channel::{RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Protocol sequence counters for one session
#[derive(Debug, Default)]
pub struct SequenceState {
    sequence_rx: AtomicU8,
    sequence_tx: AtomicU8,
    last_ack_sent: AtomicU8,
}

impl SequenceState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next inbound sequence we expect
    pub fn sequence_rx(&self) -> u8 {
        self.sequence_rx.load(Ordering::Acquire)
    }

    /// Sequence the next outbound frame will carry
    pub fn sequence_tx(&self) -> u8 {
        self.sequence_tx.load(Ordering::Acquire)
    }

    pub fn last_ack_sent(&self) -> u8 {
        self.last_ack_sent.load(Ordering::Acquire)
    }

    /// Accept an in-sequence inbound frame
    pub(crate) fn advance_rx(&self) -> u8 {
        self.sequence_rx.fetch_add(1, Ordering::AcqRel).wrapping_add(1)
    }

    /// Claim the sequence for an outbound frame
    pub(crate) fn next_tx(&self) -> u8 {
        self.sequence_tx.fetch_add(1, Ordering::AcqRel)
    }

    pub(crate) fn record_ack(&self, sequence: u8) {
        self.last_ack_sent.store(sequence, Ordering::Release);
    }

    /// Start a fresh session. Only valid while no timer is running.
    pub(crate) fn reset(&self) {
        self.sequence_rx.store(0, Ordering::Release);
        self.sequence_tx.store(0, Ordering::Release);
        self.last_ack_sent.store(0, Ordering::Release);
    }

    /// Whether inbound progress has not been acknowledged yet
    pub fn ack_pending(&self) -> bool {
        self.sequence_rx() != self.last_ack_sent()
    }
}

/// Write an acknowledgement naming the current expected sequence
///
/// ACK frames reuse the current `sequence_tx` without advancing it.
pub fn send_ack<T: Transport + ?Sized>(transport: &T, state: &SequenceState) -> Result<u8> {
    let sequence_rx = state.sequence_rx();
    let frame = Frame::ack(sequence_rx, state.sequence_tx());
    let report = HidReport::new(command::ACK, frame.encode())?;
    transport.write_report(&report.encode())?;
    Ok(sequence_rx)
}

/// One timer tick: acknowledge if the receive loop has advanced
///
/// Returns whether an acknowledgement was written.
pub fn tick<T: Transport + ?Sized>(transport: &T, state: &SequenceState) -> Result<bool> {
    if !state.ack_pending() {
        return Ok(false);
    }
    let acked = send_ack(transport, state)?;
    state.record_ack(acked);
    log::trace!("Periodic ACK for sequence {}", acked);
    Ok(true)
}

/// Background thread re-sending acknowledgements during a binary response
///
/// The timer stops when dropped.
pub struct AckTimer {
    shutdown_flag: Arc<AtomicBool>,
    wake: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl AckTimer {
    pub fn start<T>(transport: Arc<T>, state: Arc<SequenceState>, interval: Duration) -> Self
    where
        T: Transport + 'static,
    {
        let shutdown_flag = Arc::new(AtomicBool::new(false));
        let (wake, woken) = crossbeam_channel::bounded::<()>(1);

        let flag = Arc::clone(&shutdown_flag);
        let handle = std::thread::spawn(move || loop {
            let timed_out = matches!(woken.recv_timeout(interval), Err(RecvTimeoutError::Timeout));
            if flag.load(Ordering::Acquire) {
                break;
            }
            if !timed_out {
                // owner went away without setting the flag
                break;
            }
            if let Err(e) = tick(transport.as_ref(), &state) {
                log::warn!("ACK timer failed to write: {}", e);
            }
        });

        Self {
            shutdown_flag,
            wake: Some(wake),
            handle: Some(handle),
        }
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.shutdown_flag.store(true, Ordering::Release);
        if let Some(wake) = self.wake.take() {
            let _ = wake.try_send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::warn!("ACK timer thread panicked");
            }
        }
    }
}

impl Drop for AckTimer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
