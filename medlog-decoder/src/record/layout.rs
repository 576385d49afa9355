//! Database record layouts
//!
//! A database sub-record carries one record of one table:
//!
//! ```text
//! TABLE u8 | NUMBER u16  TYPE u8  FLAGS u8  READER_TIME u32  OFFSET i32 | FIELDS | CRC16 u16
//!          |<------------------- checksummed ---------------------------------->|
//! ```
//!
//! All integers are little-endian. The record number is the low 16 bits of the
//! table's running counter and is resolved by the decoder.

use crate::checksum::crc16;
use crate::types::{ChecksumScope, DecoderError, DeviceTime, Result};
use byteorder::{LittleEndian, ReadBytesExt};
use chrono::DateTime;
use serde::Serialize;
use std::io::Cursor;

/// Header length after the table id
pub const RECORD_HEADER_LEN: usize = 12;

const TIME_VALID_FLAG: u8 = 0x80;

/// Database table a record belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TableId {
    GlucoseResult,
    RapidActingInsulin,
    HistoricalData,
    Event,
    Other(u8),
}

impl TableId {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => TableId::GlucoseResult,
            1 => TableId::RapidActingInsulin,
            2 => TableId::HistoricalData,
            3 => TableId::Event,
            other => TableId::Other(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            TableId::GlucoseResult => 0,
            TableId::RapidActingInsulin => 1,
            TableId::HistoricalData => 2,
            TableId::Event => 3,
            TableId::Other(other) => other,
        }
    }
}

/// Record type codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RecordType {
    /// Periodic sensor glucose (CGM) reading
    HistoricalData,
    /// Fingerstick glucose or ketone test with a serving note
    GlucoseKetoneServing,
    /// Fingerstick glucose or ketone test with a meal note
    GlucoseKetoneMeal,
    /// Fingerstick glucose or ketone test with a carbohydrate note
    GlucoseKetoneCarbs,
    /// User changed the meter clock
    TimeChange,
    /// Marks the table's counter passing a 65536 boundary
    WrapMarker,
    Other(u8),
}

impl RecordType {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x02 => RecordType::HistoricalData,
            0x10 => RecordType::GlucoseKetoneServing,
            0x11 => RecordType::GlucoseKetoneMeal,
            0x12 => RecordType::GlucoseKetoneCarbs,
            0x20 => RecordType::TimeChange,
            0x7E => RecordType::WrapMarker,
            other => RecordType::Other(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            RecordType::HistoricalData => 0x02,
            RecordType::GlucoseKetoneServing => 0x10,
            RecordType::GlucoseKetoneMeal => 0x11,
            RecordType::GlucoseKetoneCarbs => 0x12,
            RecordType::TimeChange => 0x20,
            RecordType::WrapMarker => 0x7E,
            RecordType::Other(other) => other,
        }
    }

    pub fn is_measurement(self) -> bool {
        matches!(
            self,
            RecordType::GlucoseKetoneServing
                | RecordType::GlucoseKetoneMeal
                | RecordType::GlucoseKetoneCarbs
        )
    }

    /// Length of the type-specific fields, excluding the checksum
    fn fields_len(self) -> Option<usize> {
        match self {
            RecordType::HistoricalData => Some(6),
            t if t.is_measurement() => Some(12),
            RecordType::TimeChange => Some(12),
            RecordType::WrapMarker => Some(4),
            _ => None,
        }
    }
}

/// What a measurement record measured
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ResultKind {
    Glucose,
    Ketone,
    Other(u8),
}

/// Common record header
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordHeader {
    /// Record number as transmitted (low 16 bits)
    pub record_number: u16,
    pub record_type: RecordType,
    pub time_valid: bool,
    /// Seconds on the reader's monotonic clock
    pub reader_time: u32,
    /// User-set offset from the reader clock, in seconds
    pub user_time_offset: i32,
}

/// Type-specific record fields
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum RecordFields {
    Historical {
        /// Glucose in mg/dL
        glucose: u16,
        first: bool,
        time_change: bool,
        food: bool,
        rapid_acting_insulin: bool,
        life_counter: u16,
        quality_flags: u16,
    },
    Measurement {
        result: ResultKind,
        value: u16,
        quality_flags: u16,
    },
    TimeChange {
        old_reader_time: u32,
        old_user_time_offset: i32,
        valid: bool,
    },
    WrapMarker {
        next_counter: u32,
    },
    Raw {
        bytes: Vec<u8>,
    },
}

/// One verified database record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Record {
    pub table: TableId,
    /// Full-width record number
    pub record_number: u32,
    pub header: RecordHeader,
    pub fields: RecordFields,
    pub checksum: u16,
}

/// Seconds since the Unix epoch to device-local wall-clock
fn device_time_from_seconds(seconds: i64) -> Option<DeviceTime> {
    DateTime::from_timestamp(seconds, 0).map(|t| t.naive_utc())
}

impl Record {
    /// Parse a database sub-record and verify its CRC16
    ///
    /// The record number is left unresolved (`record_number` holds the
    /// transmitted 16-bit value) until the decoder resolves it.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 1 + RECORD_HEADER_LEN + 2 {
            return Err(DecoderError::Decode(format!(
                "database record of {} bytes is too short",
                data.len()
            )));
        }

        let table = TableId::from_u8(data[0]);
        let body = &data[1..data.len() - 2];
        let expected = u16::from_le_bytes([data[data.len() - 2], data[data.len() - 1]]);
        let computed = crc16(body);
        if computed != expected {
            return Err(DecoderError::Checksum {
                scope: ChecksumScope::Record,
                expected: expected as u32,
                computed: computed as u32,
            });
        }

        let mut cursor = Cursor::new(body);
        let record_number = cursor.read_u16::<LittleEndian>()?;
        let record_type = RecordType::from_u8(cursor.read_u8()?);
        let flags = cursor.read_u8()?;
        let reader_time = cursor.read_u32::<LittleEndian>()?;
        let user_time_offset = cursor.read_i32::<LittleEndian>()?;

        let fields = &body[RECORD_HEADER_LEN..];
        if let Some(expected_len) = record_type.fields_len() {
            if fields.len() < expected_len {
                return Err(DecoderError::Decode(format!(
                    "{:?} record has {} field bytes, expected {}",
                    record_type,
                    fields.len(),
                    expected_len
                )));
            }
        }

        Ok(Self {
            table,
            record_number: record_number as u32,
            header: RecordHeader {
                record_number,
                record_type,
                time_valid: flags & TIME_VALID_FLAG != 0,
                reader_time,
                user_time_offset,
            },
            fields: parse_fields(record_type, fields)?,
            checksum: expected,
        })
    }

    /// Wall-clock time on the device when the record was written
    ///
    /// `time_conversion` is the meter's factory epoch in seconds.
    pub fn device_time(&self, time_conversion: i64) -> Option<DeviceTime> {
        device_time_from_seconds(
            time_conversion + self.header.reader_time as i64 + self.header.user_time_offset as i64,
        )
    }

    /// For time-change records, the wall-clock time before the change
    pub fn previous_device_time(&self, time_conversion: i64) -> Option<DeviceTime> {
        match self.fields {
            RecordFields::TimeChange {
                old_reader_time,
                old_user_time_offset,
                ..
            } => device_time_from_seconds(
                time_conversion + old_reader_time as i64 + old_user_time_offset as i64,
            ),
            _ => None,
        }
    }

    /// Whether the device flagged the measurement as unusable
    pub fn has_quality_error(&self) -> bool {
        match self.fields {
            RecordFields::Historical { quality_flags, .. }
            | RecordFields::Measurement { quality_flags, .. } => quality_flags != 0,
            RecordFields::TimeChange { valid, .. } => !valid,
            _ => false,
        }
    }

    /// Serialize back to the sub-record layout, recomputing the checksum
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(RECORD_HEADER_LEN + 12);
        body.extend_from_slice(&self.header.record_number.to_le_bytes());
        body.push(self.header.record_type.as_u8());
        body.push(if self.header.time_valid { TIME_VALID_FLAG } else { 0 });
        body.extend_from_slice(&self.header.reader_time.to_le_bytes());
        body.extend_from_slice(&self.header.user_time_offset.to_le_bytes());
        encode_fields(&self.fields, &mut body);

        let mut data = Vec::with_capacity(body.len() + 3);
        data.push(self.table.as_u8());
        data.extend_from_slice(&body);
        data.extend_from_slice(&crc16(&body).to_le_bytes());
        data
    }
}

fn parse_fields(record_type: RecordType, fields: &[u8]) -> Result<RecordFields> {
    let mut cursor = Cursor::new(fields);
    let parsed = match record_type {
        RecordType::HistoricalData => {
            let raw = cursor.read_u16::<LittleEndian>()?;
            RecordFields::Historical {
                glucose: raw & 0x03FF,
                first: raw & 0x1000 != 0,
                time_change: raw & 0x2000 != 0,
                food: raw & 0x4000 != 0,
                rapid_acting_insulin: raw & 0x8000 != 0,
                life_counter: cursor.read_u16::<LittleEndian>()?,
                quality_flags: cursor.read_u16::<LittleEndian>()?,
            }
        }
        t if t.is_measurement() => {
            let raw = cursor.read_u16::<LittleEndian>()?;
            cursor.set_position(10);
            let quality_flags = cursor.read_u16::<LittleEndian>()?;
            let result = match (raw >> 14) & 0x3 {
                0 => ResultKind::Glucose,
                1 => ResultKind::Ketone,
                other => ResultKind::Other(other as u8),
            };
            RecordFields::Measurement {
                result,
                value: raw & 0x03FF,
                quality_flags,
            }
        }
        RecordType::TimeChange => {
            let old_reader_time = cursor.read_u32::<LittleEndian>()?;
            let old_user_time_offset = cursor.read_i32::<LittleEndian>()?;
            let valid = cursor.read_u16::<LittleEndian>()? != 0;
            RecordFields::TimeChange {
                old_reader_time,
                old_user_time_offset,
                valid,
            }
        }
        RecordType::WrapMarker => RecordFields::WrapMarker {
            next_counter: cursor.read_u32::<LittleEndian>()?,
        },
        _ => RecordFields::Raw {
            bytes: fields.to_vec(),
        },
    };
    Ok(parsed)
}

fn encode_fields(fields: &RecordFields, out: &mut Vec<u8>) {
    match fields {
        RecordFields::Historical {
            glucose,
            first,
            time_change,
            food,
            rapid_acting_insulin,
            life_counter,
            quality_flags,
        } => {
            let mut raw = glucose & 0x03FF;
            for (set, bit) in [
                (first, 0x1000),
                (time_change, 0x2000),
                (food, 0x4000),
                (rapid_acting_insulin, 0x8000),
            ] {
                if *set {
                    raw |= bit;
                }
            }
            out.extend_from_slice(&raw.to_le_bytes());
            out.extend_from_slice(&life_counter.to_le_bytes());
            out.extend_from_slice(&quality_flags.to_le_bytes());
        }
        RecordFields::Measurement {
            result,
            value,
            quality_flags,
        } => {
            let kind: u16 = match result {
                ResultKind::Glucose => 0,
                ResultKind::Ketone => 1,
                ResultKind::Other(other) => (*other as u16) & 0x3,
            };
            out.extend_from_slice(&((kind << 14) | (value & 0x03FF)).to_le_bytes());
            out.extend_from_slice(&[0u8; 8]);
            out.extend_from_slice(&quality_flags.to_le_bytes());
        }
        RecordFields::TimeChange {
            old_reader_time,
            old_user_time_offset,
            valid,
        } => {
            out.extend_from_slice(&old_reader_time.to_le_bytes());
            out.extend_from_slice(&old_user_time_offset.to_le_bytes());
            out.extend_from_slice(&(*valid as u16).to_le_bytes());
            out.extend_from_slice(&[0u8; 2]);
        }
        RecordFields::WrapMarker { next_counter } => {
            out.extend_from_slice(&next_counter.to_le_bytes());
        }
        RecordFields::Raw { bytes } => out.extend_from_slice(bytes),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn historical(number: u16, glucose: u16) -> Record {
        Record {
            table: TableId::HistoricalData,
            record_number: number as u32,
            header: RecordHeader {
                record_number: number,
                record_type: RecordType::HistoricalData,
                time_valid: true,
                reader_time: 3600,
                user_time_offset: -60,
            },
            fields: RecordFields::Historical {
                glucose,
                first: false,
                time_change: true,
                food: false,
                rapid_acting_insulin: false,
                life_counter: 42,
                quality_flags: 0,
            },
            checksum: 0,
        }
    }

    #[test]
    fn test_parse_historical_record() {
        let bytes = historical(513, 120).encode();
        assert_eq!(bytes.len(), 1 + RECORD_HEADER_LEN + 6 + 2);

        let record = Record::parse(&bytes).unwrap();
        assert_eq!(record.table, TableId::HistoricalData);
        assert_eq!(record.header.record_number, 513);
        assert!(record.header.time_valid);
        match record.fields {
            RecordFields::Historical {
                glucose,
                time_change,
                life_counter,
                ..
            } => {
                assert_eq!(glucose, 120);
                assert!(time_change);
                assert_eq!(life_counter, 42);
            }
            other => panic!("unexpected fields {:?}", other),
        }
    }

    #[test]
    fn test_glucose_flags_masked() {
        let mut bytes = historical(1, 0).encode();
        // glucose field sits right after the table id and header
        bytes[13] = 0xFF;
        bytes[14] = 0xF3;
        let len = bytes.len();
        let crc = crc16(&bytes[1..len - 2]).to_le_bytes();
        bytes[len - 2..].copy_from_slice(&crc);

        let record = Record::parse(&bytes).unwrap();
        match record.fields {
            RecordFields::Historical {
                glucose,
                first,
                food,
                rapid_acting_insulin,
                ..
            } => {
                assert_eq!(glucose, 0x03FF);
                assert!(first && food && rapid_acting_insulin);
            }
            other => panic!("unexpected fields {:?}", other),
        }
    }

    #[test]
    fn test_bad_crc_rejected() {
        let mut bytes = historical(1, 100).encode();
        bytes[5] ^= 0x01;
        assert!(matches!(
            Record::parse(&bytes),
            Err(DecoderError::Checksum {
                scope: ChecksumScope::Record,
                ..
            })
        ));
    }

    #[test]
    fn test_short_fields_rejected() {
        let mut record = historical(1, 100);
        record.header.record_type = RecordType::TimeChange;
        // historical fields are too short for a time change
        assert!(matches!(
            Record::parse(&record.encode()),
            Err(DecoderError::Decode(_))
        ));
    }

    #[test]
    fn test_device_time() {
        let record = historical(1, 100);
        let epoch = NaiveDate::from_ymd_opt(2017, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
            .and_utc()
            .timestamp();
        let expected = NaiveDate::from_ymd_opt(2017, 1, 1)
            .unwrap()
            .and_hms_opt(0, 59, 0)
            .unwrap();
        assert_eq!(record.device_time(epoch), Some(expected));
    }

    #[test]
    fn test_measurement_ketone() {
        let record = Record {
            table: TableId::GlucoseResult,
            record_number: 7,
            header: RecordHeader {
                record_number: 7,
                record_type: RecordType::GlucoseKetoneMeal,
                time_valid: true,
                reader_time: 0,
                user_time_offset: 0,
            },
            fields: RecordFields::Measurement {
                result: ResultKind::Ketone,
                value: 36,
                quality_flags: 0,
            },
            checksum: 0,
        };
        let parsed = Record::parse(&record.encode()).unwrap();
        assert_eq!(parsed.fields, record.fields);
        assert!(!parsed.has_quality_error());
    }

    #[test]
    fn test_type_codes() {
        for code in [0x02u8, 0x10, 0x11, 0x12, 0x20, 0x7E, 0x55] {
            assert_eq!(RecordType::from_u8(code).as_u8(), code);
        }
        assert_eq!(TableId::from_u8(9), TableId::Other(9));
    }
}
