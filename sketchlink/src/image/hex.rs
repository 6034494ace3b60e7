//! Intel HEX program images.
//!
//! Compilers for the target emit sketches as Intel HEX text. Each record
//! line looks like:
//!
//! ```text
//! :10 0000 00 0C94C7010C94EF010C94EF010C94EF01 D8
//!  |   |   |  |                                |
//!  |   |   |  data (length bytes)              checksum
//!  |   |   record type (00 = data, 01 = end of file, ...)
//!  |   load address (16-bit, big-endian)
//!  length
//! ```
//!
//! Only data records are loaded. Records must follow each other without
//! gaps, which is what avr-gcc produces for a sketch. Extended linear
//! address records (type 04) are rejected since the program space of the
//! supported targets is 16-bit.

use crate::error::{Error, Result};
use log::{debug, warn};
use std::fs;
use std::path::Path;

/// Upper bound on the size of a program image.
pub const MAX_PROGRAM_SIZE: usize = 0x20000;

/// Data record.
const RECORD_DATA: u8 = 0x00;
/// Extended linear address record.
const RECORD_EXTENDED_LINEAR_ADDRESS: u8 = 0x04;

/// Length, address (2) and type bytes in front of the data.
const RECORD_PREFIX_LEN: usize = 4;

/// Options controlling hex parsing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HexOptions {
    /// Fail on record checksum mismatches instead of logging a warning.
    pub strict_checksum: bool,
}

impl HexOptions {
    /// Options that reject records with a bad checksum.
    pub fn strict() -> Self {
        Self {
            strict_checksum: true,
        }
    }
}

/// Dense program image.
///
/// Every byte in `[0, len)` is defined. Bytes not covered by a record are
/// zero.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgramImage {
    data: Vec<u8>,
}

impl ProgramImage {
    /// Create an image from raw bytes.
    pub fn from_bytes(data: Vec<u8>) -> Result<Self> {
        if data.len() > MAX_PROGRAM_SIZE {
            return Err(Error::ProgramTooLarge {
                size: data.len(),
                max: MAX_PROGRAM_SIZE,
            });
        }
        Ok(Self { data })
    }

    /// Parse an Intel HEX file.
    pub fn from_hex_file<P: AsRef<Path>>(path: P, options: HexOptions) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        debug!("Parsing hex file {}", path.display());
        Self::from_hex_str(&text, options)
    }

    /// Parse Intel HEX text.
    pub fn from_hex_str(text: &str, options: HexOptions) -> Result<Self> {
        let mut program = Vec::new();
        let mut cursor: Option<usize> = None;

        for (index, raw) in text.lines().enumerate() {
            let line = index + 1;
            let raw = raw.trim();
            if raw.is_empty() {
                continue;
            }

            let record = Record::parse(raw, line)?;
            record.verify_checksum(line, options)?;

            match record.record_type() {
                RECORD_DATA => {},
                RECORD_EXTENDED_LINEAR_ADDRESS => {
                    return Err(Error::UnsupportedRecordType {
                        line,
                        record_type: RECORD_EXTENDED_LINEAR_ADDRESS,
                    });
                },
                other => {
                    debug!("Skipping record type {other:#04x} on line {line}");
                    continue;
                },
            }

            let address = usize::from(record.address());
            let start = match cursor {
                Some(expected) if expected != address => {
                    return Err(Error::AddressGap {
                        line,
                        expected,
                        actual: address,
                    });
                },
                _ => address,
            };

            let data = record.data();
            let end = start + data.len();
            if end > MAX_PROGRAM_SIZE {
                return Err(Error::ProgramTooLarge {
                    size: end,
                    max: MAX_PROGRAM_SIZE,
                });
            }

            // Bytes below the first record stay zero
            program.resize(start, 0);
            program.extend_from_slice(data);
            cursor = Some(end);
        }

        debug!("Program image is {} bytes", program.len());
        Ok(Self { data: program })
    }

    /// Number of bytes in the image.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if the image holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Image contents.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

impl AsRef<[u8]> for ProgramImage {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

/// One decoded record: length, address, type, data and checksum bytes.
struct Record {
    bytes: Vec<u8>,
}

impl Record {
    fn parse(raw: &str, line: usize) -> Result<Self> {
        let malformed = |reason: String| Error::MalformedRecord { line, reason };

        let body = raw
            .strip_prefix(':')
            .ok_or_else(|| malformed("missing ':' start code".into()))?;

        if body.len() % 2 != 0 {
            return Err(malformed(format!("odd number of hex digits ({})", body.len())));
        }

        let bytes = (0..body.len())
            .step_by(2)
            .map(|i| {
                body.get(i..i + 2)
                    .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                    .ok_or_else(|| malformed(format!("invalid hex digits at column {}", i + 2)))
            })
            .collect::<Result<Vec<u8>>>()?;

        if bytes.len() < RECORD_PREFIX_LEN + 1 {
            return Err(malformed(format!("record too short ({} bytes)", bytes.len())));
        }

        let declared = usize::from(bytes[0]);
        let found = bytes.len() - RECORD_PREFIX_LEN - 1;
        if declared != found {
            return Err(malformed(format!(
                "declares {declared} data bytes, found {found}"
            )));
        }

        Ok(Self { bytes })
    }

    fn address(&self) -> u16 {
        u16::from_be_bytes([self.bytes[1], self.bytes[2]])
    }

    fn record_type(&self) -> u8 {
        self.bytes[3]
    }

    fn data(&self) -> &[u8] {
        &self.bytes[RECORD_PREFIX_LEN..self.bytes.len() - 1]
    }

    fn stored_checksum(&self) -> u8 {
        self.bytes[self.bytes.len() - 1]
    }

    /// Two's complement of the sum of every byte before the checksum.
    fn computed_checksum(&self) -> u8 {
        let sum = self.bytes[..self.bytes.len() - 1]
            .iter()
            .fold(0u8, |acc, &b| acc.wrapping_add(b));
        0u8.wrapping_sub(sum)
    }

    fn verify_checksum(&self, line: usize, options: HexOptions) -> Result<()> {
        let expected = self.stored_checksum();
        let actual = self.computed_checksum();
        if expected == actual {
            return Ok(());
        }
        if options.strict_checksum {
            return Err(Error::ChecksumMismatch {
                line,
                expected,
                actual,
            });
        }
        warn!("Checksum mismatch on line {line}: record has {expected:#04x}, computed {actual:#04x}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLINK_FIRST_LINE: &str = ":100000000C94C7010C94EF010C94EF010C94EF01D8";
    const EOF_RECORD: &str = ":00000001FF";

    #[test]
    fn test_parse_single_data_record() {
        let text = format!("{BLINK_FIRST_LINE}\n{EOF_RECORD}\n");
        let image = ProgramImage::from_hex_str(&text, HexOptions::default()).unwrap();
        assert_eq!(
            image.as_bytes(),
            &[
                0x0C, 0x94, 0xC7, 0x01, 0x0C, 0x94, 0xEF, 0x01, 0x0C, 0x94, 0xEF, 0x01, 0x0C,
                0x94, 0xEF, 0x01
            ]
        );
    }

    #[test]
    fn test_parse_consecutive_records_and_crlf() {
        let text = ":0400000001020304F2\r\n:020004000506EF\r\n:00000001FF\r\n";
        let image = ProgramImage::from_hex_str(text, HexOptions::strict()).unwrap();
        assert_eq!(image.as_bytes(), &[1, 2, 3, 4, 5, 6]);
        assert_eq!(image.len(), 6);
    }

    #[test]
    fn test_parse_skips_blank_lines_and_other_records() {
        // Type 03 (start segment address) is skipped
        let text = "\n:0400000300000000F9\n\n:0100000055AA\n:00000001FF\n";
        let image = ProgramImage::from_hex_str(text, HexOptions::strict()).unwrap();
        assert_eq!(image.as_bytes(), &[0x55]);
    }

    #[test]
    fn test_first_record_at_nonzero_address_zero_fills() {
        let text = ":020004000A0BE5\n";
        let image = ProgramImage::from_hex_str(text, HexOptions::strict()).unwrap();
        assert_eq!(image.as_bytes(), &[0, 0, 0, 0, 0x0A, 0x0B]);
    }

    #[test]
    fn test_address_gap() {
        let text = ":0400000001020304F2\n:020008000506EB\n";
        let err = ProgramImage::from_hex_str(text, HexOptions::default()).unwrap_err();
        assert!(matches!(
            err,
            Error::AddressGap {
                line: 2,
                expected: 4,
                actual: 8
            }
        ));
    }

    #[test]
    fn test_overlapping_record_is_a_gap() {
        let text = ":0400000001020304F2\n:020002000506F1\n";
        let err = ProgramImage::from_hex_str(text, HexOptions::default()).unwrap_err();
        assert!(matches!(err, Error::AddressGap { line: 2, .. }));
    }

    #[test]
    fn test_extended_linear_address_rejected() {
        let text = ":020000040000FA\n";
        let err = ProgramImage::from_hex_str(text, HexOptions::default()).unwrap_err();
        assert!(matches!(
            err,
            Error::UnsupportedRecordType {
                line: 1,
                record_type: 0x04
            }
        ));
    }

    #[test]
    fn test_short_data_line_is_malformed() {
        // Declares 16 bytes, carries 15
        let text = ":100000000C94C7010C94EF010C94EF010C94EFD8\n";
        let err = ProgramImage::from_hex_str(text, HexOptions::default()).unwrap_err();
        assert!(matches!(err, Error::MalformedRecord { line: 1, .. }));
    }

    #[test]
    fn test_long_data_line_is_malformed() {
        let text = ":0100000055AAAA\n";
        let err = ProgramImage::from_hex_str(text, HexOptions::default()).unwrap_err();
        assert!(matches!(err, Error::MalformedRecord { line: 1, .. }));
    }

    #[test]
    fn test_missing_start_code_is_malformed() {
        let err = ProgramImage::from_hex_str("0100000055AA\n", HexOptions::default()).unwrap_err();
        assert!(matches!(err, Error::MalformedRecord { line: 1, .. }));
    }

    #[test]
    fn test_invalid_hex_digits_are_malformed() {
        let err = ProgramImage::from_hex_str(":01000000ZZAA\n", HexOptions::default()).unwrap_err();
        assert!(matches!(err, Error::MalformedRecord { line: 1, .. }));
    }

    #[test]
    fn test_checksum_lenient_by_default() {
        let text = ":0100000055AB\n";
        let image = ProgramImage::from_hex_str(text, HexOptions::default()).unwrap();
        assert_eq!(image.as_bytes(), &[0x55]);
    }

    #[test]
    fn test_checksum_strict_mode() {
        let text = ":0100000055AB\n";
        let err = ProgramImage::from_hex_str(text, HexOptions::strict()).unwrap_err();
        assert!(matches!(
            err,
            Error::ChecksumMismatch {
                line: 1,
                expected: 0xAB,
                actual: 0xAA
            }
        ));
    }

    #[test]
    fn test_image_at_top_of_address_space() {
        let text = format!(":10FFF000{}01\n", "00".repeat(16));
        let image = ProgramImage::from_hex_str(&text, HexOptions::strict()).unwrap();
        assert_eq!(image.len(), 0x10000);
    }

    #[test]
    fn test_from_bytes_too_large() {
        let err = ProgramImage::from_bytes(vec![0; MAX_PROGRAM_SIZE + 1]).unwrap_err();
        assert!(matches!(
            err,
            Error::ProgramTooLarge {
                max: MAX_PROGRAM_SIZE,
                ..
            }
        ));
    }

    #[test]
    fn test_empty_input() {
        let image = ProgramImage::from_hex_str(":00000001FF\n", HexOptions::strict()).unwrap();
        assert!(image.is_empty());
    }

    #[test]
    fn test_from_hex_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blink.hex");
        fs::write(&path, format!("{BLINK_FIRST_LINE}\n{EOF_RECORD}\n")).unwrap();

        let image = ProgramImage::from_hex_file(&path, HexOptions::strict()).unwrap();
        assert_eq!(image.len(), 16);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = ProgramImage::from_hex_file("/nonexistent/sketch.hex", HexOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }
}
