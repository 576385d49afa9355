//! Record decoder
//!
//! Turns binary response payloads into verified records. Sub-records are
//! handled in a fixed op-code order so that the device clock and factory
//! configuration are known before any database record is interpreted.

use crate::record::aap::{AapPacket, AapStreamParser};
use crate::record::compressed;
use crate::record::counter::RecordCounters;
use crate::record::layout::{Record, RecordFields, RecordType, TableId};
use crate::types::{DecoderError, DeviceTime, Result};
use byteorder::{ByteOrder, LittleEndian};
use chrono::NaiveDate;
use serde::Serialize;

/// Sub-record op codes
pub mod op_code {
    pub const ERROR: u8 = 0x01;
    pub const GET_DB_SCHEMA: u8 = 0x30;
    pub const GET_DATABASE: u8 = 0x31;
    pub const COMPRESSED_DATABASE: u8 = 0x35;
    pub const GET_DATE_TIME: u8 = 0x41;
    pub const GET_CFG_SCHEMA: u8 = 0x50;
    pub const GET_CFG_DATA: u8 = 0x51;
}

/// Config table holding the meter's factory settings
pub const CFG_TABLE_FACTORY: u8 = 0x00;

const DATE_TIME_LEN: usize = 8;
const CFG_UNIT_OF_MEASURE_OFFSET: usize = 133;
const CFG_TIME_CONVERSION_OFFSET: usize = 156;

/// Glucose display unit configured at the factory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum UnitOfMeasure {
    #[serde(rename = "mmol/L")]
    MmolL,
    #[serde(rename = "mg/dL")]
    MgDl,
}

/// Factory configuration needed to date records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FactoryConfig {
    pub unit_of_measure: UnitOfMeasure,
    /// Unix seconds corresponding to reader time zero
    pub time_conversion: i32,
}

/// Counters describing what a decode pass kept and dropped
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DecodeStats {
    pub records: usize,
    pub checksum_discards: usize,
    pub compressed_discards: usize,
    pub quality_discards: usize,
    pub unresolved_discards: usize,
    pub structural_errors: usize,
    pub device_errors: usize,
    pub deferred_bytes: usize,
}

/// Stateful decoder for one read session
#[derive(Debug, Default)]
pub struct RecordDecoder {
    parser: AapStreamParser,
    counters: RecordCounters,
    factory: Option<FactoryConfig>,
    device_clock: Option<DeviceTime>,
    oldest_result_record: Option<u32>,
    stats: DecodeStats,
}

fn processing_rank(op: u8) -> u8 {
    match op {
        op_code::ERROR => 0,
        op_code::GET_DATE_TIME => 1,
        op_code::GET_CFG_DATA => 2,
        op_code::COMPRESSED_DATABASE => 3,
        op_code::GET_DATABASE => 4,
        _ => 5,
    }
}

impl RecordDecoder {
    pub fn new(next_counter: u32) -> Self {
        Self {
            counters: RecordCounters::new(next_counter),
            ..Self::default()
        }
    }

    pub fn stats(&self) -> DecodeStats {
        DecodeStats {
            deferred_bytes: self.parser.pending_len(),
            ..self.stats
        }
    }

    pub fn factory_config(&self) -> Option<FactoryConfig> {
        self.factory
    }

    /// Device clock reported by the date/time sub-record, if valid
    pub fn device_clock(&self) -> Option<DeviceTime> {
        self.device_clock
    }

    /// Lowest record number seen in the glucose result table
    pub fn oldest_result_record(&self) -> Option<u32> {
        self.oldest_result_record
    }

    /// Decode the next chunk of a response payload
    ///
    /// Trailing partial sub-records stay buffered until the next call. Record
    /// and block level failures are counted and skipped, never returned.
    pub fn decode(&mut self, payload: &[u8], next_counter: u32) -> Result<Vec<Record>> {
        self.parser.push(payload);

        let mut packets = Vec::new();
        loop {
            match self.parser.next_packet() {
                Ok(Some(packet)) => packets.push(packet),
                Ok(None) => break,
                Err(e) => {
                    log::warn!("Dropping buffered response bytes: {}", e);
                    self.stats.structural_errors += 1;
                }
            }
        }

        self.decode_packets(packets, next_counter)
    }

    /// Decode already separated sub-records
    pub fn decode_packets(
        &mut self,
        mut packets: Vec<AapPacket>,
        next_counter: u32,
    ) -> Result<Vec<Record>> {
        self.counters.set_default(next_counter);
        packets.sort_by_key(|packet| processing_rank(packet.op_code));

        let mut records = Vec::new();
        for packet in &packets {
            match packet.op_code {
                op_code::ERROR => self.handle_error(packet),
                op_code::GET_DATE_TIME => self.handle_date_time(packet),
                op_code::GET_CFG_DATA => self.handle_config_data(packet),
                op_code::COMPRESSED_DATABASE => {
                    self.handle_compressed(packet, &mut records);
                }
                op_code::GET_DATABASE => {
                    if let Some(record) = self.handle_database(&packet.data) {
                        records.push(record);
                    }
                }
                op_code::GET_DB_SCHEMA | op_code::GET_CFG_SCHEMA => {
                    log::trace!("Ignoring schema sub-record 0x{:02X}", packet.op_code);
                }
                other => log::debug!("No handler for op code 0x{:02X}", other),
            }
        }

        log::debug!(
            "Decoded {} records from {} sub-records",
            records.len(),
            packets.len()
        );
        Ok(records)
    }

    fn handle_error(&mut self, packet: &AapPacket) {
        self.stats.device_errors += 1;
        match packet.data.as_slice() {
            [op, code, ..] => log::warn!("Device error 0x{:02X} for op code 0x{:02X}", code, op),
            _ => log::warn!("Device error sub-record of {} bytes", packet.data.len()),
        }
    }

    fn handle_date_time(&mut self, packet: &AapPacket) {
        let data = &packet.data;
        if data.len() != DATE_TIME_LEN {
            log::warn!(
                "Date/time sub-record has {} bytes instead of {}",
                data.len(),
                DATE_TIME_LEN
            );
            return;
        }
        if data[7] != 1 {
            log::warn!("Device clock not marked valid ({})", data[7]);
            return;
        }

        let year = LittleEndian::read_u16(&data[5..7]) as i32;
        self.device_clock = NaiveDate::from_ymd_opt(year, data[4] as u32, data[3] as u32)
            .and_then(|date| date.and_hms_opt(data[2] as u32, data[1] as u32, data[0] as u32));
        match self.device_clock {
            Some(clock) => log::info!("Device clock: {}", clock),
            None => log::warn!("Device clock fields out of range: {:?}", data),
        }
    }

    fn handle_config_data(&mut self, packet: &AapPacket) {
        let Some((&table, fields)) = packet.data.split_first() else {
            return;
        };
        if table != CFG_TABLE_FACTORY {
            log::trace!("Ignoring config table {}", table);
            return;
        }
        if fields.len() < CFG_TIME_CONVERSION_OFFSET + 4 {
            log::warn!("Factory config of {} bytes is truncated", fields.len());
            return;
        }

        let unit_of_measure = if fields[CFG_UNIT_OF_MEASURE_OFFSET] == 0 {
            UnitOfMeasure::MmolL
        } else {
            UnitOfMeasure::MgDl
        };
        let time_conversion = LittleEndian::read_i32(
            &fields[CFG_TIME_CONVERSION_OFFSET..CFG_TIME_CONVERSION_OFFSET + 4],
        );
        log::info!(
            "Factory config: {:?}, time conversion {}",
            unit_of_measure,
            time_conversion
        );
        self.factory = Some(FactoryConfig {
            unit_of_measure,
            time_conversion,
        });
    }

    fn handle_compressed(&mut self, packet: &AapPacket, records: &mut Vec<Record>) {
        let block = match compressed::inflate(&packet.data) {
            Ok(block) => block,
            Err(e) => {
                log::warn!("Discarding compressed block: {}", e);
                self.stats.compressed_discards += 1;
                return;
            }
        };

        let mut parser = AapStreamParser::padded();
        parser.push(&block.body);
        let inner = match parser.drain_packets() {
            Ok(inner) => inner,
            Err(e) => {
                log::warn!("Discarding compressed block for table {}: {}", block.table_id, e);
                self.stats.compressed_discards += 1;
                return;
            }
        };
        if parser.pending_len() > 0 {
            log::debug!(
                "{} trailing bytes in inflated block ignored",
                parser.pending_len()
            );
        }

        for packet in inner {
            if packet.op_code != op_code::GET_DATABASE {
                log::debug!(
                    "Unexpected op code 0x{:02X} inside compressed block",
                    packet.op_code
                );
                continue;
            }
            if let Some(record) = self.handle_database(&packet.data) {
                records.push(record);
            }
        }
    }

    /// Parse, verify and resolve one database record
    fn handle_database(&mut self, data: &[u8]) -> Option<Record> {
        if data.is_empty() {
            return None;
        }

        let mut record = match Record::parse(data) {
            Ok(record) => record,
            Err(DecoderError::Checksum { .. }) => {
                log::debug!("Record failed its checksum, skipping");
                self.stats.checksum_discards += 1;
                return None;
            }
            Err(e) => {
                log::debug!("Skipping malformed record: {}", e);
                self.stats.structural_errors += 1;
                return None;
            }
        };

        let table = record.table.as_u8();
        if let RecordFields::WrapMarker { next_counter } = record.fields {
            self.counters.apply_wrap_marker(table, next_counter);
            return None;
        }

        let Some(number) = self.counters.resolve(table, record.header.record_number) else {
            log::debug!(
                "Record {} in table {} cannot be resolved below counter {}",
                record.header.record_number,
                table,
                self.counters.next_counter(table)
            );
            self.stats.unresolved_discards += 1;
            return None;
        };
        record.record_number = number;

        if record.table == TableId::GlucoseResult {
            self.oldest_result_record = Some(
                self.oldest_result_record
                    .map_or(number, |oldest| oldest.min(number)),
            );
        }

        if record.has_quality_error() {
            log::trace!("Record {} flagged by device, skipping", number);
            self.stats.quality_discards += 1;
            return None;
        }

        if matches!(record.header.record_type, RecordType::Other(_)) {
            log::trace!(
                "Record {} has unknown type 0x{:02X}",
                number,
                record.header.record_type.as_u8()
            );
        }

        self.stats.records += 1;
        Some(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::layout::{RecordHeader, ResultKind};

    fn make_record(
        table: TableId,
        number: u16,
        record_type: RecordType,
        fields: RecordFields,
    ) -> Record {
        Record {
            table,
            record_number: number as u32,
            header: RecordHeader {
                record_number: number,
                record_type,
                time_valid: true,
                reader_time: 1000,
                user_time_offset: 0,
            },
            fields,
            checksum: 0,
        }
    }

    fn glucose(number: u16, value: u16) -> Record {
        make_record(
            TableId::GlucoseResult,
            number,
            RecordType::GlucoseKetoneServing,
            RecordFields::Measurement {
                result: ResultKind::Glucose,
                value,
                quality_flags: 0,
            },
        )
    }

    fn database_packet(record: &Record) -> Vec<u8> {
        AapPacket::new(op_code::GET_DATABASE, record.encode())
            .unwrap()
            .encode()
    }

    #[test]
    fn test_decode_records_split_across_payloads() {
        let mut stream = database_packet(&glucose(10, 100));
        stream.extend(database_packet(&glucose(11, 110)));

        let mut decoder = RecordDecoder::new(20);
        // each sub-record is 29 bytes, so the first chunk ends inside the second
        let first = decoder.decode(&stream[..35], 20).unwrap();
        assert_eq!(first.len(), 1);
        assert!(decoder.stats().deferred_bytes > 0);

        let second = decoder.decode(&stream[35..], 20).unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].record_number, 11);
        assert_eq!(decoder.stats().deferred_bytes, 0);
        assert_eq!(decoder.stats().records, 2);
        assert_eq!(decoder.oldest_result_record(), Some(10));
    }

    #[test]
    fn test_bad_record_crc_counted() {
        let mut bytes = glucose(1, 100).encode();
        bytes[3] ^= 0x40;
        let packet = AapPacket::new(op_code::GET_DATABASE, bytes).unwrap();

        let mut decoder = RecordDecoder::new(5);
        let records = decoder.decode_packets(vec![packet], 5).unwrap();
        assert!(records.is_empty());
        assert_eq!(decoder.stats().checksum_discards, 1);
    }

    #[test]
    fn test_compressed_block_inflated() {
        let mut body = database_packet(&glucose(3, 90));
        body.extend(database_packet(&glucose(4, 95)));
        let packet =
            AapPacket::new(op_code::COMPRESSED_DATABASE, compressed::compress(0, &body)).unwrap();

        let mut decoder = RecordDecoder::new(10);
        let records = decoder.decode_packets(vec![packet], 10).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].record_number, 4);
    }

    #[test]
    fn test_compressed_block_with_bad_crc_yields_nothing() {
        let body = database_packet(&glucose(3, 90));
        let mut data = compressed::compress(0, &body);
        let last = data.len() - 1;
        data[last] ^= 0x5A;
        let packet = AapPacket::new(op_code::COMPRESSED_DATABASE, data).unwrap();

        let mut decoder = RecordDecoder::new(10);
        let records = decoder.decode_packets(vec![packet], 10).unwrap();
        assert!(records.is_empty());
        assert_eq!(decoder.stats().compressed_discards, 1);
    }

    #[test]
    fn test_wrap_marker_applies_before_later_records() {
        let marker = make_record(
            TableId::GlucoseResult,
            0,
            RecordType::WrapMarker,
            RecordFields::WrapMarker {
                next_counter: 131_072,
            },
        );
        let packets = vec![
            AapPacket::new(op_code::GET_DATABASE, marker.encode()).unwrap(),
            AapPacket::new(op_code::GET_DATABASE, glucose(65_000, 100).encode()).unwrap(),
        ];

        let mut decoder = RecordDecoder::new(70_000);
        let records = decoder.decode_packets(packets, 70_000).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].record_number, 65_536 + 65_000);
    }

    #[test]
    fn test_quality_flagged_record_dropped() {
        let mut record = glucose(2, 100);
        record.fields = RecordFields::Measurement {
            result: ResultKind::Glucose,
            value: 100,
            quality_flags: 4,
        };
        let mut decoder = RecordDecoder::new(10);
        let records = decoder
            .decode_packets(
                vec![AapPacket::new(op_code::GET_DATABASE, record.encode()).unwrap()],
                10,
            )
            .unwrap();
        assert!(records.is_empty());
        assert_eq!(decoder.stats().quality_discards, 1);
    }

    #[test]
    fn test_date_time_and_config_handled_first() {
        let mut config = vec![CFG_TABLE_FACTORY];
        config.resize(1 + 160, 0);
        config[1 + CFG_UNIT_OF_MEASURE_OFFSET] = 1;
        LittleEndian::write_i32(
            &mut config[1 + CFG_TIME_CONVERSION_OFFSET..1 + CFG_TIME_CONVERSION_OFFSET + 4],
            1_400_000_000,
        );
        let clock = vec![30, 15, 9, 14, 3, 0xE0, 0x07, 1];

        let packets = vec![
            AapPacket::new(op_code::GET_DATABASE, glucose(1, 80).encode()).unwrap(),
            AapPacket::new(op_code::GET_CFG_DATA, config).unwrap(),
            AapPacket::new(op_code::GET_DATE_TIME, clock).unwrap(),
        ];

        let mut decoder = RecordDecoder::new(10);
        let records = decoder.decode_packets(packets, 10).unwrap();
        assert_eq!(records.len(), 1);

        let factory = decoder.factory_config().unwrap();
        assert_eq!(factory.unit_of_measure, UnitOfMeasure::MgDl);
        assert_eq!(factory.time_conversion, 1_400_000_000);
        assert_eq!(
            decoder.device_clock(),
            NaiveDate::from_ymd_opt(2016, 3, 14)
                .unwrap()
                .and_hms_opt(9, 15, 30)
        );
    }

    #[test]
    fn test_malformed_prefix_counted_not_returned() {
        let mut decoder = RecordDecoder::new(10);
        let records = decoder.decode(&[0x81, 0x81, 0x81, 0x81, 0x31], 10).unwrap();
        assert!(records.is_empty());
        assert_eq!(decoder.stats().structural_errors, 1);
        assert_eq!(decoder.stats().deferred_bytes, 0);
    }
}
