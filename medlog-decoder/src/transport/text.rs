//! Text protocol responses
//!
//! A text response spans any number of reports and has the shape
//!
//! ```text
//! MESSAGE...\r\nCKSM:XXXXXXXX\r\nCMD OK\r\n
//! ```
//!
//! where `XXXXXXXX` is the upper-case hex sum of the message bytes (including
//! the message's own trailing line separator). A `CMD Fail!` status or a bad
//! checksum rejects the whole response.

use crate::checksum::text_checksum;
use crate::types::{ChecksumScope, DecoderError, Result};

const LINE_SEP: &str = "\r\n";
const STATUS_OK: &str = "CMD OK\r\n";
const STATUS_FAIL: &str = "CMD Fail!\r\n";
const CHECKSUM_PREFIX: &str = "CKSM:";
const DB_RECORD_NUMBER_PREFIX: &str = "DB Record Number = ";

/// Whether the accumulated text contains a status line
pub fn has_status(accumulated: &str) -> bool {
    accumulated.contains(STATUS_OK) || accumulated.contains(STATUS_FAIL)
}

fn parse_hex_checksum(hex: &str) -> Option<u32> {
    if hex.len() != 8
        || !hex
            .chars()
            .all(|c| c.is_ascii_digit() || ('A'..='F').contains(&c))
    {
        return None;
    }
    u32::from_str_radix(hex, 16).ok()
}

/// Validate a complete text response and return its message part
pub fn parse_text_response(response: &str) -> Result<String> {
    let (body, ok) = if let Some(body) = response.strip_suffix(STATUS_OK) {
        (body, true)
    } else if let Some(body) = response.strip_suffix(STATUS_FAIL) {
        (body, false)
    } else {
        return Err(DecoderError::Protocol(
            "text response has no status line".to_string(),
        ));
    };

    let checksum_at = body.rfind(CHECKSUM_PREFIX).ok_or_else(|| {
        DecoderError::Protocol("text response has no checksum line".to_string())
    })?;
    let message = &body[..checksum_at];
    let checksum_line = body[checksum_at + CHECKSUM_PREFIX.len()..]
        .strip_suffix(LINE_SEP)
        .unwrap_or_default();
    let expected = parse_hex_checksum(checksum_line).ok_or_else(|| {
        DecoderError::Protocol(format!("malformed text checksum '{}'", checksum_line))
    })?;

    if !ok {
        return Err(DecoderError::Protocol(format!(
            "device answered 'CMD Fail!' to request ({})",
            message.trim_end()
        )));
    }

    let computed = text_checksum(message.as_bytes());
    if computed != expected {
        return Err(DecoderError::Checksum {
            scope: ChecksumScope::Text,
            expected,
            computed,
        });
    }

    Ok(message.to_string())
}

/// Strip the trailing line separator of a single-line message
pub fn single_line(message: &str) -> String {
    message.strip_suffix(LINE_SEP).unwrap_or(message).to_string()
}

/// Parse the answer to `$dbrnum?`
pub fn parse_db_record_number(message: &str) -> Result<u32> {
    message
        .strip_prefix(DB_RECORD_NUMBER_PREFIX)
        .and_then(|rest| rest.strip_suffix(LINE_SEP))
        .filter(|digits| !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()))
        .and_then(|digits| digits.parse().ok())
        .ok_or_else(|| {
            DecoderError::Protocol(format!(
                "invalid database record number response '{}'",
                message.trim_end()
            ))
        })
}

/// Parse a database record listing
///
/// Listings end with a `COUNT,CKSM` line: the decimal number of record lines
/// and the hex sum of all record bytes. Both are verified.
pub fn parse_record_lines(message: &str) -> Result<Vec<String>> {
    let trimmed = message.strip_suffix(LINE_SEP).ok_or_else(|| {
        DecoderError::Protocol("database records are not line terminated".to_string())
    })?;
    let split_at = trimmed.rfind(LINE_SEP).map(|i| i + LINE_SEP.len()).unwrap_or(0);
    let (records, trailer) = trimmed.split_at(split_at);

    let (count, checksum) = trailer.split_once(',').ok_or_else(|| {
        DecoderError::Protocol(format!("invalid database record trailer '{}'", trailer))
    })?;
    let count: usize = count.parse().map_err(|_| {
        DecoderError::Protocol(format!("invalid database record count '{}'", count))
    })?;
    let expected = parse_hex_checksum(checksum).ok_or_else(|| {
        DecoderError::Protocol(format!("invalid database record checksum '{}'", checksum))
    })?;

    let computed = text_checksum(records.as_bytes());
    if computed != expected {
        return Err(DecoderError::Checksum {
            scope: ChecksumScope::Text,
            expected,
            computed,
        });
    }

    let lines: Vec<String> = records
        .strip_suffix(LINE_SEP)
        .unwrap_or(records)
        .split(LINE_SEP)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect();

    if lines.len() != count {
        return Err(DecoderError::Protocol(format!(
            "invalid database record count: {} != {}",
            count,
            lines.len()
        )));
    }

    Ok(lines)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_responses() {
        assert_eq!(
            parse_text_response("DB Record Number = 226988\r\nCKSM:00000765\r\nCMD OK\r\n").unwrap(),
            "DB Record Number = 226988\r\n"
        );
        assert_eq!(
            parse_text_response("2.1.2\r\nCKSM:00000108\r\nCMD OK\r\n").unwrap(),
            "2.1.2\r\n"
        );
    }

    #[test]
    fn test_failed_status() {
        let err = parse_text_response("DB Record Number = 226988\r\nCKSM:00000765\r\nCMD Fail!\r\n")
            .unwrap_err();
        assert!(matches!(err, DecoderError::Protocol(_)));
    }

    #[test]
    fn test_wrong_checksum() {
        let err = parse_text_response("2.1.2\r\nCKSM:00000111\r\nCMD OK\r\n").unwrap_err();
        assert!(matches!(
            err,
            DecoderError::Checksum {
                scope: ChecksumScope::Text,
                ..
            }
        ));
    }

    #[test]
    fn test_short_checksum_field() {
        assert!(parse_text_response("2.1.2\r\nCKSM:108\r\nCMD OK\r\n").is_err());
    }

    #[test]
    fn test_status_detection() {
        assert!(!has_status("2.1.2\r\nCKSM:0000"));
        assert!(has_status("2.1.2\r\nCKSM:00000108\r\nCMD OK\r\n"));
        assert!(has_status("CMD Fail!\r\n"));
    }

    #[test]
    fn test_db_record_number() {
        assert_eq!(
            parse_db_record_number("DB Record Number = 226988\r\n").unwrap(),
            226988
        );
        assert!(parse_db_record_number("DB Record Number = \r\n").is_err());
        assert!(parse_db_record_number("226988\r\n").is_err());
    }

    #[test]
    fn test_record_lines() {
        let records = "1,2,3\r\n4,5,6\r\n";
        let message = format!("{}2,{:08X}\r\n", records, text_checksum(records.as_bytes()));
        let lines = parse_record_lines(&message).unwrap();
        assert_eq!(lines, vec!["1,2,3".to_string(), "4,5,6".to_string()]);
    }

    #[test]
    fn test_record_lines_count_mismatch() {
        let records = "1,2,3\r\n";
        let message = format!("{}2,{:08X}\r\n", records, text_checksum(records.as_bytes()));
        assert!(parse_record_lines(&message).is_err());
    }

    #[test]
    fn test_single_line() {
        assert_eq!(single_line("JCMV123-T0001\r\n"), "JCMV123-T0001");
    }
}
