//! Upload engine.
//!
//! Drives the three-phase upload over any [`Transport`]:
//!
//! ```text
//! Idle -> Opening -> AwaitingStartAck -> SendingPages -> AwaitingFlashAck -> Done
//!            |              |                  |                 |
//!            +--------------+------------------+-----------------+----> Failed
//! ```
//!
//! Exactly one packet is outstanding at a time: the bridge has a
//! one-packet receive buffer, so the next packet is only sent after the
//! current one is acknowledged. Each packet is acknowledged with a
//! correlation id: the program size for the start and flash packets, the
//! word address for page packets.
//!
//! ## Example
//!
//! ```rust,no_run
//! use sketchlink::{HexOptions, Sketch, TcpConfig, TcpTransport, UploadConfig, Uploader};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let sketch = Sketch::from_hex_file("Blink.cpp.hex", 26, HexOptions::default())?;
//!     let transport = TcpTransport::new(TcpConfig::new("192.168.1.115", 1111));
//!
//!     let mut uploader = Uploader::new(transport, UploadConfig::default());
//!     let report = uploader.upload(&sketch, |done, total| {
//!         println!("Sent page {done} of {total}");
//!     })?;
//!     println!("Uploaded {} bytes in {:?}", report.size, report.elapsed);
//!     Ok(())
//! }
//! ```

pub mod queue;

use crate::error::{Error, Result};
use crate::image::sketch::Sketch;
use crate::protocol::packet::{
    PROTOCOL_VERSION, flash_start_packet, page_write_packet, start_packet, to_hex,
};
use crate::protocol::reply::ReplyCode;
use crate::transport::Transport;
use log::{debug, info, trace, warn};
use std::time::{Duration, Instant};

pub use queue::{CancelToken, ReplyQueue, ReplySink, Wait};

/// Upload engine settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadConfig {
    /// How long to wait for the reply to one packet.
    pub ack_timeout: Duration,
    /// Seconds of silence after which the device abandons the upload.
    /// 0 disables the device-side timeout.
    pub device_timeout_secs: u8,
    /// Total send attempts per packet, including the first.
    pub max_retries: u32,
    /// Pause between attempts.
    pub retry_delay: Duration,
    /// Version byte announced in the start packet.
    pub protocol_version: u8,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_millis(5000),
            device_timeout_secs: 60,
            max_retries: 10,
            retry_delay: Duration::from_millis(250),
            protocol_version: PROTOCOL_VERSION,
        }
    }
}

impl UploadConfig {
    /// Set the ack timeout.
    #[must_use]
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    /// Set the device-side timeout in seconds.
    #[must_use]
    pub fn with_device_timeout_secs(mut self, secs: u8) -> Self {
        self.device_timeout_secs = secs;
        self
    }

    /// Set the number of attempts per packet.
    #[must_use]
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set the pause between attempts.
    #[must_use]
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Check the settings before any I/O.
    pub fn validate(&self) -> Result<()> {
        if self.max_retries == 0 {
            return Err(Error::Config("retries must be at least 1".into()));
        }
        if self.ack_timeout.is_zero() {
            return Err(Error::Config("ack timeout must be greater than zero".into()));
        }
        Ok(())
    }
}

/// Where an upload currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Nothing started yet.
    Idle,
    /// Opening the transport.
    Opening,
    /// Start packet sent, waiting for its ack.
    AwaitingStartAck,
    /// Writing pages.
    SendingPages,
    /// Flash packet sent, waiting for its ack.
    AwaitingFlashAck,
    /// Upload completed.
    Done,
    /// Upload aborted.
    Failed,
}

/// Summary of a completed upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct UploadReport {
    /// Program size in bytes.
    pub size: u16,
    /// Number of page packets.
    pub pages: u16,
    /// Time from the start packet to the flash ack.
    #[cfg_attr(feature = "serde", serde(serialize_with = "serialize_millis"))]
    pub elapsed: Duration,
    /// Packets sent more than once.
    pub retries: u32,
}

#[cfg(feature = "serde")]
fn serialize_millis<S: serde::Serializer>(
    value: &Duration,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_u128(value.as_millis())
}

/// Uploads sketches over one transport.
pub struct Uploader<T: Transport> {
    transport: T,
    config: UploadConfig,
    queue: ReplyQueue,
    phase: Phase,
}

impl<T: Transport> Uploader<T> {
    /// Create an uploader.
    pub fn new(transport: T, config: UploadConfig) -> Self {
        Self {
            transport,
            config,
            queue: ReplyQueue::new(),
            phase: Phase::Idle,
        }
    }

    /// Handle that aborts the upload from another thread.
    ///
    /// Cancellation is sticky: once fired, later uploads on this uploader
    /// are cancelled too.
    pub fn cancel_token(&self) -> CancelToken {
        self.queue.cancel_token()
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Engine settings.
    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    /// The transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Upload `sketch`, calling `progress(pages_done, pages_total)` after
    /// every acknowledged page.
    ///
    /// The transport is closed before returning, whatever the outcome.
    pub fn upload<F>(&mut self, sketch: &Sketch, mut progress: F) -> Result<UploadReport>
    where
        F: FnMut(usize, usize),
    {
        self.config.validate()?;

        let stale = self.queue.drain();
        if stale > 0 {
            debug!("Discarded {stale} queued replies from a previous upload");
        }

        self.phase = Phase::Opening;
        let result = match self.open() {
            Ok(()) => self.run(sketch, &mut progress),
            Err(e) => Err(e),
        };

        let closed = self.transport.close();
        match (&result, closed) {
            (_, Ok(())) => {},
            (Ok(_), Err(e)) => warn!("Failed to close {}: {e}", self.transport.name()),
            (Err(_), Err(e)) => debug!("Failed to close {}: {e}", self.transport.name()),
        }

        self.phase = if result.is_ok() {
            Phase::Done
        } else {
            Phase::Failed
        };
        result
    }

    fn open(&mut self) -> Result<()> {
        debug!("Opening {}", self.transport.name());
        self.transport
            .open(self.queue.sink())
            .map_err(|e| match e {
                Error::TransportOpen { .. } => e,
                other => Error::TransportOpen {
                    transport: self.transport.name().to_string(),
                    reason: other.to_string(),
                },
            })
    }

    fn run<F>(&mut self, sketch: &Sketch, progress: &mut F) -> Result<UploadReport>
    where
        F: FnMut(usize, usize),
    {
        let started = Instant::now();
        let size = sketch.total_size();
        let total = sketch.pages().len();
        let mut retries = 0;

        let start = start_packet(
            size,
            sketch.page_count(),
            sketch.bytes_per_page(),
            self.config.device_timeout_secs,
            self.config.protocol_version,
        );
        info!(
            "Sending sketch to {}: {size} bytes, crc16 {:#06x}, {total} pages of {} bytes",
            self.transport.name(),
            sketch.crc16(),
            sketch.bytes_per_page()
        );
        debug!("Start packet {}", to_hex(&start));

        self.phase = Phase::AwaitingStartAck;
        retries += self.send_with_retries("start packet", &start, size)?;

        self.phase = Phase::SendingPages;
        progress(0, total);
        for page in sketch.pages() {
            if self.queue.is_cancelled() {
                info!("Upload cancelled before page {} of {total}", page.ordinal + 1);
                return Err(Error::Cancelled);
            }

            let packet = page_write_packet(page.word_address, page.data());
            debug!(
                "Sending page {} of {total}, word address {}, {} bytes",
                page.ordinal + 1,
                page.word_address,
                packet.len()
            );
            let what = format!("page {} of {total}", page.ordinal + 1);
            retries += self.send_with_retries(&what, &packet, page.word_address)?;
            progress(page.ordinal + 1, total);
        }

        self.phase = Phase::AwaitingFlashAck;
        let flash = flash_start_packet(size);
        debug!("Flash start packet {}", to_hex(&flash));
        retries += self.send_with_retries("flash start", &flash, size)?;

        let elapsed = started.elapsed();
        info!(
            "Uploaded {size} bytes in {}ms with {retries} resent packets",
            elapsed.as_millis()
        );
        Ok(UploadReport {
            size,
            pages: sketch.page_count(),
            elapsed,
            retries,
        })
    }

    /// Send `packet` until it is acknowledged with `id`.
    ///
    /// Returns how many times the packet had to be resent.
    fn send_with_retries(&mut self, what: &str, packet: &[u8], id: u16) -> Result<u32> {
        let max = self.config.max_retries;
        let mut attempt = 0;
        loop {
            attempt += 1;
            trace!("Sending {what}, attempt {attempt}/{max}");
            self.transport.write_frame(packet)?;

            match self.wait_for_ack(id) {
                Ok(()) => return Ok(attempt - 1),
                Err(e) if e.is_retryable() => {
                    if attempt >= max {
                        warn!("Giving up on {what} after {attempt} attempts: {e}");
                        return Err(Error::UploadFailed {
                            attempts: attempt,
                            last_cause: Box::new(e),
                        });
                    }
                    warn!("Failed to deliver {what} (attempt {attempt}/{max}): {e}, retrying");
                    if self.queue.pause(self.config.retry_delay) {
                        return Err(Error::Cancelled);
                    }
                },
                Err(e) => return Err(e),
            }
        }
    }

    /// Wait for the ack carrying `id`, skipping stale acks.
    fn wait_for_ack(&self, id: u16) -> Result<()> {
        let deadline = Instant::now() + self.config.ack_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.queue.wait(remaining) {
                Wait::Reply(ReplyCode::Ok(got)) if got == id => {
                    trace!("ACK {id}");
                    return Ok(());
                },
                Wait::Reply(ReplyCode::Ok(got)) => {
                    warn!("Ignoring stale ACK {got} while waiting for {id}");
                },
                Wait::Reply(ReplyCode::Unknown(code)) => {
                    warn!("Ignoring unknown reply code {code:#04x}");
                },
                Wait::Reply(ReplyCode::Retry) => return Err(Error::DeviceRetry),
                Wait::Reply(code @ (ReplyCode::StartOver | ReplyCode::Timeout)) => {
                    return Err(Error::DeviceResyncRequired(code));
                },
                Wait::Reply(code) => return Err(Error::Device(code)),
                Wait::TimedOut => {
                    return Err(Error::NoAck {
                        id,
                        timeout: self.config.ack_timeout,
                    });
                },
                Wait::Cancelled => return Err(Error::Cancelled),
                Wait::Disconnected(reason) => {
                    return Err(Error::Transport(format!(
                        "{} disconnected: {reason}",
                        self.transport.name()
                    )));
                },
            }
        }
    }
}
