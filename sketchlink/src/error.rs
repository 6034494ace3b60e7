//! Error types for sketchlink.

use crate::protocol::reply::ReplyCode;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type for sketchlink operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for sketchlink operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (sketch file, socket).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A hex record is not well formed.
    #[error("Malformed hex record on line {line}: {reason}")]
    MalformedRecord {
        /// 1-based line number in the hex file.
        line: usize,
        /// What is wrong with the record.
        reason: String,
    },

    /// A data record does not continue where the previous one ended.
    #[error("Address gap on line {line}: expected {expected:#06x}, got {actual:#06x}")]
    AddressGap {
        /// 1-based line number in the hex file.
        line: usize,
        /// Current write cursor.
        expected: usize,
        /// Address declared by the record.
        actual: usize,
    },

    /// Record type that cannot be represented in a 16-bit program space.
    #[error("Unsupported hex record type {record_type:#04x} on line {line}")]
    UnsupportedRecordType {
        /// 1-based line number in the hex file.
        line: usize,
        /// The record type byte.
        record_type: u8,
    },

    /// Record checksum mismatch (strict parsing only).
    #[error("Checksum mismatch on line {line}: expected {expected:#04x}, got {actual:#04x}")]
    ChecksumMismatch {
        /// 1-based line number in the hex file.
        line: usize,
        /// Checksum stored in the record.
        expected: u8,
        /// Checksum computed from the record bytes.
        actual: u8,
    },

    /// Program does not fit the target or the wire format.
    #[error("Program too large: {size} bytes exceeds the maximum of {max} bytes")]
    ProgramTooLarge {
        /// Size that was requested.
        size: usize,
        /// Upper bound that applies.
        max: usize,
    },

    /// Page size outside the supported range.
    #[error("Invalid page size {0}")]
    InvalidPageSize(usize),

    /// The hex file contained no program data.
    #[error("Program is empty")]
    EmptyProgram,

    /// Transport could not be opened.
    #[error("Failed to open {transport}: {reason}")]
    TransportOpen {
        /// Transport name.
        transport: String,
        /// Underlying cause.
        reason: String,
    },

    /// Transport failed while in use (write, close, or lost link).
    #[error("Transport error: {0}")]
    Transport(String),

    /// No matching reply arrived within the ack timeout.
    #[error("No ACK for packet {id} after {}ms", timeout.as_millis())]
    NoAck {
        /// Correlation id that was awaited.
        id: u16,
        /// How long we waited.
        timeout: Duration,
    },

    /// The device asked for the packet to be sent again.
    #[error("Device requested a resend")]
    DeviceRetry,

    /// The device lost synchronisation; the upload must be restarted.
    #[error("Device requires the upload to start over ({0})")]
    DeviceResyncRequired(ReplyCode),

    /// The device reported a failure it cannot recover from.
    #[error("Device error: {0}")]
    Device(ReplyCode),

    /// A packet could not be delivered within the retry budget.
    #[error("Upload failed after {attempts} attempts: {last_cause}")]
    UploadFailed {
        /// Number of times the packet was sent.
        attempts: u32,
        /// Error of the final attempt.
        last_cause: Box<Error>,
    },

    /// Upload aborted on request.
    #[error("Upload cancelled")]
    Cancelled,

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether resending the same packet may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NoAck { .. } | Self::DeviceRetry)
    }

    /// Whether the error came from parsing or validating the sketch.
    pub fn is_parse_error(&self) -> bool {
        matches!(
            self,
            Self::MalformedRecord { .. }
                | Self::AddressGap { .. }
                | Self::UnsupportedRecordType { .. }
                | Self::ChecksumMismatch { .. }
                | Self::ProgramTooLarge { .. }
                | Self::InvalidPageSize(_)
                | Self::EmptyProgram
        )
    }
}
