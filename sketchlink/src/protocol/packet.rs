//! Upload packet framing.
//!
//! Every packet starts with the two magic bytes, a control byte selecting
//! the packet type and a length byte holding the total packet length, so
//! links without native framing can find packet boundaries.
//!
//! ```text
//! Start request (11 bytes):
//! +------+------+------+-----+--------+---------+-------+---------+---------+
//! | 0xEF | 0xAC | 0x10 | len | size   | pages   | bytes | timeout | version |
//! +------+------+------+-----+--------+---------+-------+---------+---------+
//! |  1   |  1   |  1   |  1  | 2 (BE) | 2 (BE)  | 1     | 1 (s)   | 1       |
//! +------+------+------+-----+--------+---------+-------+---------+---------+
//!
//! Write data (6 + N bytes):
//! +------+------+------+-------+--------------+--------------+
//! | 0xEF | 0xAC | 0x20 | N + 6 | word address | data (N)     |
//! +------+------+------+-------+--------------+--------------+
//! |  1   |  1   |  1   | 1     | 2 (BE)       | N            |
//! +------+------+------+-------+--------------+--------------+
//!
//! Flash start (6 bytes):
//! +------+------+------+---+--------+
//! | 0xEF | 0xAC | 0x40 | 6 | size   |
//! +------+------+------+---+--------+
//! ```
//!
//! All header integers are big-endian. The little-endian word address
//! found in [`Page::framed_payload`](crate::image::sketch::Page::framed_payload)
//! is a separate, bootloader-facing encoding and is never used here.

use byteorder::{BigEndian, WriteBytesExt};

/// First magic byte of every packet and binary reply.
pub const MAGIC_BYTE1: u8 = 0xEF;

/// Second magic byte of every packet and binary reply.
pub const MAGIC_BYTE2: u8 = 0xAC;

/// Length of the header shared by write-data and flash-start packets.
pub const HEADER_LEN: usize = 6;

/// Total length of a start packet.
pub const START_PACKET_LEN: usize = 11;

/// Largest data payload a single write packet can carry.
pub const MAX_PAGE_DATA: usize = u8::MAX as usize - HEADER_LEN;

/// Protocol version announced in the start packet.
pub const PROTOCOL_VERSION: u8 = 1;

/// Packet control byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Control {
    /// Announce a new upload.
    StartRequest = 0x10,
    /// Write one page of program data.
    WriteData = 0x20,
    /// Commit the received program to flash.
    FlashStart = 0x40,
    /// Reserved for querying the device protocol version.
    VersionQuery = 0x80,
}

impl Control {
    /// Parse a control byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x10 => Some(Self::StartRequest),
            0x20 => Some(Self::WriteData),
            0x40 => Some(Self::FlashStart),
            0x80 => Some(Self::VersionQuery),
            _ => None,
        }
    }
}

/// Build the start-request packet.
#[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
pub fn start_packet(
    total_size: u16,
    page_count: u16,
    bytes_per_page: u8,
    device_timeout_secs: u8,
    protocol_version: u8,
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(START_PACKET_LEN);
    buf.extend_from_slice(&[MAGIC_BYTE1, MAGIC_BYTE2, Control::StartRequest as u8]);
    // Safe cast: constant 11
    #[allow(clippy::cast_possible_truncation)]
    buf.push(START_PACKET_LEN as u8);
    buf.write_u16::<BigEndian>(total_size)
        .unwrap();
    buf.write_u16::<BigEndian>(page_count)
        .unwrap();
    buf.push(bytes_per_page);
    buf.push(device_timeout_secs);
    buf.push(protocol_version);
    buf
}

/// Build a write-data packet for one page.
///
/// # Panics
///
/// Panics if `data` is longer than [`MAX_PAGE_DATA`] bytes, since the
/// length byte could not describe the packet. [`Sketch`](crate::Sketch)
/// never builds such pages.
pub fn page_write_packet(word_address: u16, data: &[u8]) -> Vec<u8> {
    assert!(
        data.len() <= MAX_PAGE_DATA,
        "page of {} bytes exceeds {MAX_PAGE_DATA}",
        data.len()
    );
    let mut buf = header(Control::WriteData, data.len(), word_address);
    buf.extend_from_slice(data);
    buf
}

/// Build the flash-start packet.
pub fn flash_start_packet(total_size: u16) -> Vec<u8> {
    header(Control::FlashStart, 0, total_size)
}

#[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
#[allow(clippy::cast_possible_truncation)]
fn header(control: Control, data_len: usize, address_or_size: u16) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN + data_len);
    buf.extend_from_slice(&[MAGIC_BYTE1, MAGIC_BYTE2, control as u8]);
    // Safe cast: data_len <= MAX_PAGE_DATA
    buf.push((data_len + HEADER_LEN) as u8);
    buf.write_u16::<BigEndian>(address_or_size)
        .unwrap();
    buf
}

/// Render bytes as comma-separated hex for logs.
pub fn to_hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(",")
}
