//! Binary record decoding
//!
//! Everything between a verified frame payload and a typed record: the
//! sub-record stream, compressed block inflation, record layouts with their
//! CRC16 and record-number wraparound.

pub mod aap;
pub mod compressed;
pub mod counter;
pub mod decoder;
pub mod layout;

pub use aap::{AapPacket, AapStreamParser};
pub use counter::{resolve_record_number, RecordCounters};
pub use decoder::{op_code, DecodeStats, FactoryConfig, RecordDecoder, UnitOfMeasure};
pub use layout::{Record, RecordFields, RecordHeader, RecordType, ResultKind, TableId};
