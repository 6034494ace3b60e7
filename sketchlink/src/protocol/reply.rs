//! Device reply decoding.
//!
//! Bridges answer every packet with one reply. Radio and socket bridges
//! send a binary frame `[0xEF, 0xAC, code, idHi, idLo]`; the serial bridge
//! prints text lines such as `OK,64` or `ERROR,4`. Both are normalised to
//! [`ReplyCode`] so the upload engine never looks at raw bytes.

use crate::protocol::packet::{MAGIC_BYTE1, MAGIC_BYTE2};
use log::{debug, trace};
use std::fmt;

/// Length of a binary reply frame without line terminator.
pub const REPLY_FRAME_LEN: usize = 5;

/// Normalised device reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplyCode {
    /// Packet accepted. Carries the echoed correlation id.
    Ok(u16),
    /// Device lost track of the upload and wants it restarted.
    StartOver,
    /// Device gave up waiting for the next packet.
    Timeout,
    /// Device asks for the same packet again.
    Retry,
    /// Writing to flash failed.
    FlashError,
    /// Generic EEPROM failure.
    EepromError,
    /// Writing a page to EEPROM failed.
    EepromWriteError,
    /// Reading a page back from EEPROM failed.
    EepromReadError,
    /// No bootloader answered on the target.
    NoBootloader,
    /// Page verification after write failed.
    VerifyPageError,
    /// Page address was not the one the device expected.
    AddressSkipError,
    /// Code this tool does not know about.
    Unknown(u8),
}

impl ReplyCode {
    /// Map a numeric device code to a reply. `id` is only kept for `Ok`.
    pub fn from_code(code: u8, id: u16) -> Self {
        match code {
            1 => Self::Ok(id),
            2 => Self::StartOver,
            3 => Self::Timeout,
            4 => Self::FlashError,
            5 => Self::EepromError,
            6 => Self::EepromWriteError,
            7 => Self::EepromReadError,
            8 => Self::NoBootloader,
            9 => Self::VerifyPageError,
            0x0A => Self::AddressSkipError,
            other => Self::Unknown(other),
        }
    }

    /// Numeric device code, if the reply has one on the wire.
    ///
    /// `Retry` only exists as a serial-bridge text reply.
    pub fn code(self) -> Option<u8> {
        match self {
            Self::Ok(_) => Some(1),
            Self::StartOver => Some(2),
            Self::Timeout => Some(3),
            Self::FlashError => Some(4),
            Self::EepromError => Some(5),
            Self::EepromWriteError => Some(6),
            Self::EepromReadError => Some(7),
            Self::NoBootloader => Some(8),
            Self::VerifyPageError => Some(9),
            Self::AddressSkipError => Some(0x0A),
            Self::Retry => None,
            Self::Unknown(code) => Some(code),
        }
    }

    /// Check if this is a positive acknowledgement.
    pub fn is_ok(self) -> bool {
        matches!(self, Self::Ok(_))
    }
}

impl fmt::Display for ReplyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok(id) => write!(f, "OK (id {id})"),
            Self::StartOver => write!(f, "start over"),
            Self::Timeout => write!(f, "device timeout"),
            Self::Retry => write!(f, "retry"),
            Self::FlashError => write!(f, "flash error"),
            Self::EepromError => write!(f, "EEPROM error"),
            Self::EepromWriteError => write!(f, "EEPROM write error"),
            Self::EepromReadError => write!(f, "EEPROM read error"),
            Self::NoBootloader => write!(f, "no bootloader"),
            Self::VerifyPageError => write!(f, "page verify error"),
            Self::AddressSkipError => write!(f, "address skip error"),
            Self::Unknown(code) => write!(f, "unknown code {code:#04x}"),
        }
    }
}

/// Decode one binary reply frame.
///
/// Returns `None` when `data` is too short or does not start with the magic
/// bytes. Trailing bytes (such as a line terminator) are ignored.
pub fn decode_frame(data: &[u8]) -> Option<ReplyCode> {
    match data {
        [MAGIC_BYTE1, MAGIC_BYTE2, code, hi, lo, ..] => {
            Some(ReplyCode::from_code(*code, u16::from_be_bytes([*hi, *lo])))
        },
        _ => None,
    }
}

/// Decode one serial-bridge text line.
///
/// Returns `None` for lines that are not replies (device debug output).
pub fn decode_line(line: &str) -> Option<ReplyCode> {
    let line = line.trim();

    if let Some(id) = line.strip_prefix("OK,") {
        return id.trim().parse::<u16>().ok().map(ReplyCode::Ok);
    }
    if line.starts_with("RETRY") {
        return Some(ReplyCode::Retry);
    }
    // An error line never acknowledges a packet; codes without a known
    // failure meaning require a fresh upload
    if let Some(code) = line.strip_prefix("ERROR,") {
        return Some(match code.trim().parse::<u8>().map(|c| ReplyCode::from_code(c, 0)) {
            Ok(ReplyCode::Ok(_) | ReplyCode::Unknown(_)) | Err(_) => ReplyCode::StartOver,
            Ok(code) => code,
        });
    }
    if line.starts_with("ERROR") {
        return Some(ReplyCode::StartOver);
    }
    None
}

/// Streaming decoder turning raw transport bytes into replies.
///
/// Listener threads feed whatever a read returned; partial replies are
/// kept until the rest arrives.
pub trait ReplyDecoder: Send {
    /// Consume `data` and return every reply completed by it.
    fn feed(&mut self, data: &[u8]) -> Vec<ReplyCode>;
}

/// Decoder for newline-terminated text replies (serial bridge).
#[derive(Debug, Default)]
pub struct LineReplyDecoder {
    buffer: Vec<u8>,
}

impl LineReplyDecoder {
    /// Longest line kept while waiting for a terminator.
    const MAX_LINE: usize = 1024;

    /// Create an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }
}

impl ReplyDecoder for LineReplyDecoder {
    fn feed(&mut self, data: &[u8]) -> Vec<ReplyCode> {
        self.buffer.extend_from_slice(data);

        let mut replies = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match decode_line(line) {
                Some(reply) => replies.push(reply),
                None => debug!("device: {line}"),
            }
        }

        if self.buffer.len() > Self::MAX_LINE {
            debug!(
                "Dropping {} bytes of unterminated device output",
                self.buffer.len()
            );
            self.buffer.clear();
        }

        replies
    }
}

/// Decoder for binary reply frames (radio and socket bridges).
///
/// Bytes before the magic prefix are discarded. Line terminators after a
/// frame are skipped.
#[derive(Debug, Default)]
pub struct FrameReplyDecoder {
    buffer: Vec<u8>,
}

impl FrameReplyDecoder {
    /// Create an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }
}

impl ReplyDecoder for FrameReplyDecoder {
    fn feed(&mut self, data: &[u8]) -> Vec<ReplyCode> {
        self.buffer.extend_from_slice(data);

        let mut replies = Vec::new();
        loop {
            let Some(start) = self
                .buffer
                .windows(2)
                .position(|w| w == [MAGIC_BYTE1, MAGIC_BYTE2])
            else {
                // Keep a trailing first magic byte, its partner may follow
                let keep = usize::from(self.buffer.last() == Some(&MAGIC_BYTE1));
                let junk = self.buffer.len() - keep;
                if junk > 0 {
                    trace!("Discarding {junk} bytes without reply magic");
                    self.buffer.drain(..junk);
                }
                break;
            };

            if start > 0 {
                trace!("Discarding {start} bytes before reply magic");
                self.buffer.drain(..start);
            }
            if self.buffer.len() < REPLY_FRAME_LEN {
                break;
            }

            let frame: Vec<u8> = self.buffer.drain(..REPLY_FRAME_LEN).collect();
            if let Some(reply) = decode_frame(&frame) {
                replies.push(reply);
            }

            let terminators = self
                .buffer
                .iter()
                .take_while(|&&b| b == b'\r' || b == b'\n')
                .count();
            self.buffer.drain(..terminators);
        }

        replies
    }
}
