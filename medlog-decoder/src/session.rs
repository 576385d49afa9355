//! Device session pipeline
//!
//! This module wires the layers together: a `MeterSession` talks to a meter
//! over a [`Transport`], decodes its database, hands each record to a
//! [`DraftEventBuilder`] and runs the drafts through the reconstructor. The
//! result is a single [`SessionOutcome`] that an [`Uploader`] can send on.

use crate::checksum::crc32;
use crate::config::DecoderConfig;
use crate::record::decoder::{op_code, CFG_TABLE_FACTORY};
use crate::record::{DecodeStats, Record, RecordDecoder, RecordFields, RecordType, ResultKind};
use crate::timeline::event::{DraftEvent, DraftKind, FinalEvent};
use crate::timeline::family::{DeviceFamily, Meter};
use crate::timeline::reconstructor::Reconstructor;
use crate::timeline::time_change::{merge_time_changes, ClockChange};
use crate::transport::text;
use crate::transport::{ResponseShape, Transport, TransportFramer};
use crate::types::{DecoderError, Result};
use serde::Serialize;
use std::sync::Arc;

/// Ketone results are stored as mg/dL-equivalent integers
const KETONE_VALUE_FACTOR: f64 = 18.0;

/// What a builder needs to date and scale records
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildContext {
    /// Unix seconds corresponding to reader time zero
    pub time_conversion: i64,
    /// Offset of device-local time from UTC, in minutes
    pub timezone_offset_minutes: i32,
}

/// Turns decoded records into draft events
pub trait DraftEventBuilder {
    /// Drafts for one record; may be empty
    fn build(&mut self, record: &Record, context: &BuildContext) -> Vec<DraftEvent>;

    /// Drafts that can only be produced once every record has been seen
    fn finish(&mut self, _context: &BuildContext) -> Vec<DraftEvent> {
        Vec::new()
    }
}

/// Draft builder for flash glucose meter databases
///
/// Historical records become CGM readings, measurement records fingerstick
/// glucose or blood ketone readings, and time-change records clock changes.
#[derive(Debug, Clone)]
pub struct GlucoseMeterBuilder {
    merge_window: u32,
    clock_changes: Vec<ClockChange>,
}

impl GlucoseMeterBuilder {
    pub fn new(config: &DecoderConfig) -> Self {
        Self {
            merge_window: config.time_change_merge_window,
            clock_changes: Vec::new(),
        }
    }
}

impl DraftEventBuilder for GlucoseMeterBuilder {
    fn build(&mut self, record: &Record, context: &BuildContext) -> Vec<DraftEvent> {
        let Some(device_time) = record.device_time(context.time_conversion) else {
            log::debug!("Record {} has no representable time", record.record_number);
            return Vec::new();
        };
        let index = record.record_number as u64;

        let kind = match record.fields {
            RecordFields::Historical { glucose, .. } => DraftKind::cbg(glucose as f64, "mg/dL"),
            RecordFields::Measurement { result, value, .. } => match result {
                // Glucose is always stored in mg/dL whatever the display unit
                ResultKind::Glucose => DraftKind::smbg(value as f64, "mg/dL", None),
                ResultKind::Ketone => DraftKind::ketone(value as f64 / KETONE_VALUE_FACTOR),
                ResultKind::Other(kind) => {
                    log::debug!("Record {} has unknown result kind {}", index, kind);
                    return Vec::new();
                }
            },
            RecordFields::TimeChange { .. } => {
                if let Some(from) = record.previous_device_time(context.time_conversion) {
                    self.clock_changes.push(ClockChange {
                        index,
                        from,
                        to: device_time,
                    });
                }
                return Vec::new();
            }
            _ => return Vec::new(),
        };

        vec![DraftEvent::at_local(device_time, context.timezone_offset_minutes, kind).with_index(index)]
    }

    fn finish(&mut self, context: &BuildContext) -> Vec<DraftEvent> {
        let changes = std::mem::take(&mut self.clock_changes);
        merge_time_changes(&changes, self.merge_window)
            .into_iter()
            .map(|change| {
                DraftEvent::at_local(
                    change.to,
                    context.timezone_offset_minutes,
                    DraftKind::time_change(change.from, change.to),
                )
                .with_index(change.index)
            })
            .collect()
    }
}

/// Identifies one upload of one device's data
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionMetadata {
    pub device_id: String,
    pub family: String,
    /// Stable for identical data, so repeated uploads can be deduplicated
    pub upload_id: String,
}

impl SessionMetadata {
    /// Derive the upload id from the device id and the serialized events
    pub fn for_events(
        device_id: impl Into<String>,
        family: impl Into<String>,
        events: &[FinalEvent],
    ) -> Result<Self> {
        let device_id = device_id.into();
        let digest = crc32(&serde_json::to_vec(events)?);
        Ok(Self {
            upload_id: format!("{}-{:08x}", device_id, digest),
            device_id,
            family: family.into(),
        })
    }
}

/// Sends a finished timeline to its destination
///
/// Implementations must tolerate the same upload id being sent twice.
pub trait Uploader {
    fn upload(&mut self, events: &[FinalEvent], metadata: &SessionMetadata) -> anyhow::Result<()>;
}

/// Terminal result of a successful session
#[derive(Debug, Clone, Serialize)]
pub struct SessionOutcome {
    pub metadata: SessionMetadata,
    pub events: Vec<FinalEvent>,
    pub stats: DecodeStats,
}

impl SessionOutcome {
    pub fn upload(&self, uploader: &mut dyn Uploader) -> anyhow::Result<()> {
        log::info!(
            "Uploading {} events as {}",
            self.events.len(),
            self.metadata.upload_id
        );
        uploader.upload(&self.events, &self.metadata)
    }
}

/// Meter identity read over the text protocol
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MeterIdentity {
    pub serial_number: String,
    pub firmware_version: String,
    /// Next database record number
    pub db_record_number: u32,
}

/// A full download from one meter
pub struct MeterSession<T: Transport + 'static> {
    framer: TransportFramer<T>,
    config: DecoderConfig,
}

impl<T: Transport + 'static> MeterSession<T> {
    pub fn new(transport: Arc<T>, config: DecoderConfig) -> Self {
        Self {
            framer: TransportFramer::new(transport, config.clone()),
            config,
        }
    }

    pub fn framer(&self) -> &TransportFramer<T> {
        &self.framer
    }

    /// Serial number, firmware version and record counter
    pub fn read_identity(&self) -> Result<MeterIdentity> {
        let serial_number = self
            .framer
            .with_retries(|framer| framer.request_text("$sn?"))
            .map(|message| text::single_line(&message))?;
        let firmware_version = self
            .framer
            .with_retries(|framer| framer.request_text("$swver?"))
            .map(|message| text::single_line(&message))?;
        let db_record_number = self
            .framer
            .with_retries(|framer| framer.request_text("$dbrnum?"))
            .and_then(|message| text::parse_db_record_number(&message))?;

        log::info!(
            "Meter {} firmware {} ({} records)",
            serial_number,
            firmware_version,
            db_record_number
        );
        Ok(MeterIdentity {
            serial_number,
            firmware_version,
            db_record_number,
        })
    }

    /// Request clock, factory config and database, and decode them
    ///
    /// The database listing ends with an empty database sub-record.
    pub fn download(&self, decoder: &mut RecordDecoder, next_counter: u32) -> Result<Vec<Record>> {
        let mut packets = self.framer.with_retries(|framer| {
            framer.request_binary(op_code::GET_DATE_TIME, &[], ResponseShape::SubRecords(1))
        })?;
        packets.extend(self.framer.with_retries(|framer| {
            framer.request_binary(
                op_code::GET_CFG_DATA,
                &[CFG_TABLE_FACTORY],
                ResponseShape::SubRecords(1),
            )
        })?);
        packets.extend(self.framer.with_retries(|framer| {
            framer.request_binary(
                op_code::GET_DATABASE,
                &[],
                ResponseShape::Terminal {
                    op_code: op_code::GET_DATABASE,
                    length: 0,
                },
            )
        })?);

        decoder.decode_packets(packets, next_counter)
    }

    /// Run the whole session: handshake, download, build, reconstruct
    pub fn run<B: DraftEventBuilder>(&self, builder: &mut B) -> Result<SessionOutcome> {
        self.framer.initialize()?;
        let identity = self.read_identity()?;

        let mut decoder = RecordDecoder::new(identity.db_record_number);
        let records = self.download(&mut decoder, identity.db_record_number)?;
        let stats = decoder.stats();
        log::info!("Decoded {} records ({:?})", records.len(), stats);

        let factory = decoder.factory_config().ok_or_else(|| {
            DecoderError::MissingContext("meter did not report its factory configuration".into())
        })?;
        let context = BuildContext {
            time_conversion: factory.time_conversion as i64,
            timezone_offset_minutes: self.config.timezone_offset_minutes,
        };

        let drafts = build_drafts(builder, &records, decoder.oldest_result_record(), &context);
        let events = reconstruct_drafts(Meter, &self.config, drafts)?;
        if events.is_empty() {
            return Err(DecoderError::NoRecords);
        }

        let metadata = SessionMetadata::for_events(identity.serial_number, Meter.source(), &events)?;
        Ok(SessionOutcome {
            metadata,
            events,
            stats,
        })
    }
}

/// Run a meter session over `transport`
pub fn run_session<T, B>(transport: Arc<T>, config: DecoderConfig, builder: &mut B) -> Result<SessionOutcome>
where
    T: Transport + 'static,
    B: DraftEventBuilder,
{
    MeterSession::new(transport, config).run(builder)
}

/// Build drafts for every usable record, in time order
///
/// Records older than the oldest glucose result cannot be dated reliably
/// (the time changes preceding them are gone) and are skipped.
pub fn build_drafts<B: DraftEventBuilder + ?Sized>(
    builder: &mut B,
    records: &[Record],
    oldest_result_record: Option<u32>,
    context: &BuildContext,
) -> Vec<DraftEvent> {
    let mut drafts = Vec::new();
    for record in records {
        if oldest_result_record.map_or(false, |oldest| record.record_number < oldest) {
            log::trace!("Skipping record {} older than the result table", record.record_number);
            continue;
        }
        if record.header.record_type == RecordType::WrapMarker {
            continue;
        }
        drafts.extend(builder.build(record, context));
    }
    drafts.extend(builder.finish(context));

    drafts.sort_by_key(|draft| (draft.time, draft.index));
    log::debug!("Built {} drafts from {} records", drafts.len(), records.len());
    drafts
}

/// Run drafts through a fresh reconstructor in the order given
pub fn reconstruct_drafts<F: DeviceFamily>(
    family: F,
    config: &DecoderConfig,
    drafts: Vec<DraftEvent>,
) -> Result<Vec<FinalEvent>> {
    let mut engine = Reconstructor::new(family, config.clone());
    for draft in drafts {
        engine.submit(draft)?;
    }
    engine.finalize()
}
