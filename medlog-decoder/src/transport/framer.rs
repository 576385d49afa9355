//! Blocking command/response state machine
//!
//! `TransportFramer` issues one command at a time and blocks until the response
//! is complete or a read times out. Inbound frames are accepted strictly in
//! sequence: a frame with a bad checksum or an unexpected sequence number is
//! dropped and an acknowledgement naming the last good sequence asks the peer
//! to retransmit from there.

use crate::config::DecoderConfig;
use crate::record::aap::{AapPacket, AapStreamParser};
use crate::transport::ack::{self, AckTimer, SequenceState};
use crate::transport::frame::{Frame, MAX_FRAME_PAYLOAD};
use crate::transport::hid::{command, HidReport};
use crate::transport::text;
use crate::transport::Transport;
use crate::types::{DecoderError, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How the end of a binary response is recognised
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseShape {
    /// A fixed number of sub-records is expected
    SubRecords(usize),
    /// The response ends with a sub-record of this op code and data length
    Terminal { op_code: u8, length: usize },
}

impl ResponseShape {
    pub fn is_complete(&self, packets: &[AapPacket]) -> bool {
        match *self {
            ResponseShape::SubRecords(count) => packets.len() >= count,
            ResponseShape::Terminal { op_code, length } => packets
                .last()
                .is_some_and(|last| last.op_code == op_code && last.data.len() == length),
        }
    }
}

/// Framed, sequenced access to one device
pub struct TransportFramer<T: Transport + 'static> {
    transport: Arc<T>,
    state: Arc<SequenceState>,
    config: DecoderConfig,
}

impl<T: Transport + 'static> TransportFramer<T> {
    pub fn new(transport: Arc<T>, config: DecoderConfig) -> Self {
        Self {
            transport,
            state: Arc::new(SequenceState::new()),
            config,
        }
    }

    pub fn state(&self) -> &SequenceState {
        &self.state
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    /// Run the INIT handshake and start a fresh sequence
    ///
    /// Each init command is answered by one report whose content carries no
    /// information we use.
    pub fn initialize(&self) -> Result<()> {
        log::debug!("Initializing device communication");
        self.state.reset();
        for &code in command::INIT.iter() {
            let report = HidReport::new(code, Vec::new())?;
            self.transport.write_report(&report.encode())?;
            let reply = self.read_report_within(self.config.read_timeout())?;
            log::trace!("INIT 0x{:02X} answered with 0x{:02X}", code, reply.command);
        }
        Ok(())
    }

    /// Build, wrap and write one frame
    pub fn send(&self, command: u8, payload: &[u8]) -> Result<Frame> {
        if payload.len() > MAX_FRAME_PAYLOAD {
            return Err(DecoderError::Protocol(format!(
                "frame payload of {} bytes exceeds {} bytes",
                payload.len(),
                MAX_FRAME_PAYLOAD
            )));
        }

        let frame = Frame::new(self.state.sequence_rx(), self.state.next_tx(), payload.to_vec());
        let report = HidReport::new(command, frame.encode())?;
        self.transport.write_report(&report.encode())?;
        log::trace!(
            "Sent frame tx={} rx={} ({} bytes)",
            frame.sequence_tx,
            frame.sequence_rx,
            frame.payload.len()
        );
        Ok(frame)
    }

    /// Block until the next in-sequence frame arrives
    pub fn receive(&self, timeout: Duration) -> Result<Frame> {
        let deadline = Instant::now() + timeout;
        loop {
            let report = self.read_report_until(deadline, timeout)?;
            match report.command {
                command::BINARY_RESPONSE => {}
                command::ACK => {
                    log::trace!("Peer acknowledgement received");
                    continue;
                }
                other => {
                    log::debug!("Ignoring report 0x{:02X} while awaiting a frame", other);
                    continue;
                }
            }

            let frame = match Frame::parse(&report.data) {
                Ok(frame) => frame,
                Err(e @ (DecoderError::Checksum { .. } | DecoderError::Decode(_))) => {
                    log::warn!("Discarding frame: {}", e);
                    self.request_resend()?;
                    continue;
                }
                Err(e) => return Err(e),
            };

            let expected = self.state.sequence_rx();
            if frame.sequence_tx != expected {
                let e = DecoderError::Sequence {
                    expected,
                    received: frame.sequence_tx,
                };
                log::warn!("Discarding frame: {}", e);
                self.request_resend()?;
                continue;
            }

            self.state.advance_rx();
            return Ok(frame);
        }
    }

    /// Send a text command and collect its response message
    pub fn request_text(&self, request: &str) -> Result<String> {
        log::debug!("Text request: {}", request);
        let line = format!("{}\r\n", request);
        for report in HidReport::split(command::TEXT, line.as_bytes()) {
            self.transport.write_report(&report.encode())?;
        }

        let mut accumulated = String::new();
        loop {
            let report = self.read_report_within(self.config.read_timeout())?;
            if report.command != command::TEXT {
                return Err(DecoderError::Protocol(format!(
                    "unexpected report 0x{:02X} in text response",
                    report.command
                )));
            }
            accumulated.push_str(&String::from_utf8_lossy(&report.data));
            if text::has_status(&accumulated) {
                break;
            }
        }

        text::parse_text_response(&accumulated)
    }

    /// Send a binary request and collect sub-records until `shape` is met
    ///
    /// The acknowledgement timer runs for the duration of the response.
    pub fn request_binary(
        &self,
        op_code: u8,
        data: &[u8],
        shape: ResponseShape,
    ) -> Result<Vec<AapPacket>> {
        let request = AapPacket::new(op_code, data.to_vec())?.encode();
        for chunk in request.chunks(MAX_FRAME_PAYLOAD) {
            self.send(command::BINARY_REQUEST, chunk)?;
        }

        let timer = AckTimer::start(
            Arc::clone(&self.transport),
            Arc::clone(&self.state),
            self.config.ack_interval(),
        );
        let response = self.collect_response(shape);
        timer.stop();

        if response.is_ok() {
            // final acknowledgement so the peer does not wait for the next tick
            ack::tick(self.transport.as_ref(), &self.state)?;
        }
        response
    }

    /// Retry an exchange that failed with a retryable error, up to `max_retries` times
    ///
    /// See [`DecoderError::is_retryable`].
    pub fn with_retries<R, F>(&self, mut exchange: F) -> Result<R>
    where
        F: FnMut(&Self) -> Result<R>,
    {
        let mut attempt = 0;
        loop {
            match exchange(self) {
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    attempt += 1;
                    log::warn!("{}, retrying ({}/{})", e, attempt, self.config.max_retries);
                }
                result => return result,
            }
        }
    }

    fn collect_response(&self, shape: ResponseShape) -> Result<Vec<AapPacket>> {
        let mut parser = AapStreamParser::new();
        let mut packets = Vec::new();

        while !shape.is_complete(&packets) {
            let frame = self.receive(self.config.read_timeout())?;
            parser.push(&frame.payload);
            loop {
                match parser.next_packet() {
                    Ok(Some(packet)) => packets.push(packet),
                    Ok(None) => break,
                    Err(e) => log::warn!("Malformed response stream: {}", e),
                }
            }
        }

        log::debug!("Binary response complete: {} sub-records", packets.len());
        Ok(packets)
    }

    /// Ask the peer to retransmit from the last good sequence
    fn request_resend(&self) -> Result<()> {
        let sequence = ack::send_ack(self.transport.as_ref(), &self.state)?;
        log::debug!("Requested retransmission from sequence {}", sequence);
        Ok(())
    }

    fn read_report_within(&self, timeout: Duration) -> Result<HidReport> {
        self.read_report_until(Instant::now() + timeout, timeout)
    }

    fn read_report_until(&self, deadline: Instant, timeout: Duration) -> Result<HidReport> {
        let timed_out = || DecoderError::Timeout {
            timeout_ms: timeout.as_millis() as u64,
        };
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(timed_out());
            }
            let raw = self.transport.read_report(remaining)?.ok_or_else(timed_out)?;
            match HidReport::parse(&raw) {
                Ok(report) => return Ok(report),
                Err(e) => log::warn!("Ignoring malformed report: {}", e),
            }
        }
    }
}
