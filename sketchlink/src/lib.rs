//! # sketchlink
//!
//! A library for uploading Arduino sketches to remote devices.
//!
//! The remote device runs a small bootloader-side library behind a radio,
//! serial or Wi-Fi bridge. This crate provides the host side:
//!
//! - Intel HEX parsing into a dense program image
//! - Pagination into address-tagged pages
//! - Packet framing for the start, page write and flash start packets
//! - An upload engine with per-packet acknowledgement, timeouts, bounded
//!   retries and cooperative cancellation
//! - Serial and TCP transports with streaming reply decoders
//!
//! ## Features
//!
//! - `native` (default): serial-bridge transport via the `serialport` crate
//! - `serde`: Serialization support for report types
//!
//! ## Example
//!
//! ```rust,no_run
//! use sketchlink::{HexOptions, SerialConfig, SerialTransport, Sketch, UploadConfig, Uploader};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Parse the sketch into 26-byte pages
//!     let sketch = Sketch::from_hex_file("Blink.cpp.hex", 26, HexOptions::default())?;
//!
//!     let transport = SerialTransport::new(SerialConfig::new("/dev/ttyUSB0", 19200));
//!     let mut uploader = Uploader::new(transport, UploadConfig::default());
//!
//!     let report = uploader.upload(&sketch, |done, total| {
//!         println!("Page {done}/{total}");
//!     })?;
//!     println!("Done in {:?} with {} retries", report.elapsed, report.retries);
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod image;
pub mod protocol;
pub mod transport;
pub mod upload;

// Re-exports for convenience
#[cfg(feature = "native")]
pub use transport::{SerialConfig, SerialTransport};
pub use {
    error::{Error, Result},
    image::{HexOptions, MAX_PROGRAM_SIZE, Page, ProgramImage, Sketch, SketchInfo, paginate},
    protocol::{Control, ReplyCode, ReplyDecoder},
    transport::{DEFAULT_PAGE_SIZE, TcpConfig, TcpTransport, Transport},
    upload::{CancelToken, Phase, ReplySink, UploadConfig, UploadReport, Uploader},
};
