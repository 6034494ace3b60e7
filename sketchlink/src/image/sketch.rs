//! Sketches: a program image split into address-tagged pages.

use crate::error::{Error, Result};
use crate::image::hex::{HexOptions, ProgramImage};
use crate::protocol::crc::crc16_xmodem;
use crate::protocol::packet::MAX_PAGE_DATA;
use log::{debug, warn};
use std::path::Path;

/// One page of program data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    /// Position in the page sequence, starting at 0.
    pub ordinal: usize,
    /// Offset of the first byte in the program image.
    pub byte_address: usize,
    /// `byte_address / 2`. The bootloader addresses memory in words.
    pub word_address: u16,
    /// Little-endian word address followed by the page data.
    pub framed_payload: Vec<u8>,
}

impl Page {
    /// Raw page bytes.
    pub fn data(&self) -> &[u8] {
        &self.framed_payload[2..]
    }

    /// Number of data bytes.
    pub fn len(&self) -> usize {
        self.framed_payload.len() - 2
    }

    /// Check if the page holds no data.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Split `image` into pages of `page_size` bytes.
///
/// Every page but the last is exactly `page_size` long. Odd page sizes are
/// accepted here but misalign word addresses on word-addressed targets.
pub fn paginate(image: &ProgramImage, page_size: usize) -> Result<Vec<Page>> {
    if page_size == 0 {
        return Err(Error::InvalidPageSize(page_size));
    }

    image
        .as_bytes()
        .chunks(page_size)
        .enumerate()
        .map(|(ordinal, chunk)| {
            let byte_address = ordinal * page_size;
            let word_address =
                u16::try_from(byte_address / 2).map_err(|_| Error::ProgramTooLarge {
                    size: image.len(),
                    max: usize::from(u16::MAX) * 2,
                })?;

            let mut framed_payload = Vec::with_capacity(chunk.len() + 2);
            framed_payload.extend_from_slice(&word_address.to_le_bytes());
            framed_payload.extend_from_slice(chunk);

            Ok(Page {
                ordinal,
                byte_address,
                word_address,
                framed_payload,
            })
        })
        .collect()
}

/// A program image ready to upload.
///
/// Sizes are checked against the wire format when the sketch is built, so
/// every value fits its packet field.
#[derive(Debug, Clone)]
pub struct Sketch {
    image: ProgramImage,
    pages: Vec<Page>,
    total_size: u16,
    bytes_per_page: u8,
}

impl Sketch {
    /// Paginate an image.
    pub fn new(image: ProgramImage, page_size: usize) -> Result<Self> {
        let bytes_per_page = u8::try_from(page_size)
            .ok()
            .filter(|&size| size > 0 && usize::from(size) <= MAX_PAGE_DATA)
            .ok_or(Error::InvalidPageSize(page_size))?;

        if image.is_empty() {
            return Err(Error::EmptyProgram);
        }

        let total_size = u16::try_from(image.len()).map_err(|_| Error::ProgramTooLarge {
            size: image.len(),
            max: usize::from(u16::MAX),
        })?;

        if page_size % 2 != 0 {
            warn!("Page size {page_size} is odd, word addresses will not line up with pages");
        }

        let pages = paginate(&image, page_size)?;
        debug!(
            "Sketch is {total_size} bytes in {} pages of {page_size} bytes",
            pages.len()
        );

        Ok(Self {
            image,
            pages,
            total_size,
            bytes_per_page,
        })
    }

    /// Parse a hex file and paginate it.
    pub fn from_hex_file<P: AsRef<Path>>(
        path: P,
        page_size: usize,
        options: HexOptions,
    ) -> Result<Self> {
        Self::new(ProgramImage::from_hex_file(path, options)?, page_size)
    }

    /// Program size in bytes.
    pub fn total_size(&self) -> u16 {
        self.total_size
    }

    /// Maximum data bytes per page.
    pub fn bytes_per_page(&self) -> u8 {
        self.bytes_per_page
    }

    /// Pages in upload order.
    pub fn pages(&self) -> &[Page] {
        &self.pages
    }

    /// Number of pages.
    pub fn page_count(&self) -> u16 {
        // Safe cast: at most total_size pages
        #[allow(clippy::cast_possible_truncation)]
        let count = self.pages.len() as u16;
        count
    }

    /// The underlying program image.
    pub fn image(&self) -> &ProgramImage {
        &self.image
    }

    /// CRC16-XMODEM of the program image.
    pub fn crc16(&self) -> u16 {
        crc16_xmodem(self.image.as_bytes())
    }

    /// Summary for display.
    pub fn info(&self) -> SketchInfo {
        SketchInfo {
            size: self.total_size,
            pages: self.page_count(),
            bytes_per_page: self.bytes_per_page,
            last_page_len: self.pages.last().map_or(0, Page::len),
            crc16: self.crc16(),
        }
    }
}

/// Sketch summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct SketchInfo {
    /// Program size in bytes.
    pub size: u16,
    /// Number of pages.
    pub pages: u16,
    /// Maximum data bytes per page.
    pub bytes_per_page: u8,
    /// Data bytes in the final page.
    pub last_page_len: usize,
    /// CRC16-XMODEM of the program image.
    pub crc16: u16,
}
