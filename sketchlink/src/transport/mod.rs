//! Transports carrying upload packets to a bridge device.
//!
//! A transport moves whole packets to the bridge and runs a listener that
//! decodes replies into the engine's [`ReplySink`]. The engine never sees
//! raw reply bytes.
//!
//! ```text
//! +-----------------+  write_frame   +-----------+   radio/wire   +--------+
//! |  Upload engine  | -------------> | Transport | -------------> | Bridge |
//! +-----------------+                +-----------+                +--------+
//!          ^                               |                          |
//!          |        ReplySink              v                          |
//!          +------------------------ listener thread <----------------+
//!                                    (ReplyDecoder)
//! ```
//!
//! - **Serial** (feature `native`): a USB-serial bridge that prints text
//!   replies, via the `serialport` crate
//! - **TCP**: a Wi-Fi bridge that answers with binary reply frames

#[cfg(feature = "native")]
pub mod serial;
pub mod tcp;

use crate::error::{Error, Result};
use crate::protocol::packet::to_hex;
use crate::protocol::reply::ReplyDecoder;
use crate::upload::queue::ReplySink;
use log::{debug, trace, warn};
use std::io::{ErrorKind, Read};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

/// Page size for bridges limited to 32-byte radio payloads.
pub const DEFAULT_PAGE_SIZE: usize = 26;

/// Packet transport to a bridge device.
///
/// `open` is called once per upload, before any `write_frame`; `close` is
/// called once afterwards whatever the outcome.
pub trait Transport: Send {
    /// Short name for messages, such as the port path or socket address.
    fn name(&self) -> &str;

    /// Connect and start delivering replies to `replies`.
    fn open(&mut self, replies: ReplySink) -> Result<()>;

    /// Send one complete packet.
    fn write_frame(&mut self, frame: &[u8]) -> Result<()>;

    /// Stop the listener and release the link.
    fn close(&mut self) -> Result<()>;

    /// Page size suited to this link.
    fn default_page_size(&self) -> usize {
        DEFAULT_PAGE_SIZE
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn open(&mut self, replies: ReplySink) -> Result<()> {
        (**self).open(replies)
    }

    fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        (**self).write_frame(frame)
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }

    fn default_page_size(&self) -> usize {
        (**self).default_page_size()
    }
}

/// Background thread reading replies off a link.
struct Listener {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Listener {
    /// Read chunk size.
    const READ_BUF: usize = 256;

    /// Start reading `reader` until stopped or the link drops.
    ///
    /// `reader` must time out periodically (or be shut down) so the stop
    /// flag is seen.
    fn spawn<R, D>(name: &str, mut reader: R, mut decoder: D, replies: ReplySink) -> Result<Self>
    where
        R: Read + Send + 'static,
        D: ReplyDecoder + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let stopped = Arc::clone(&stop);

        let handle = thread::Builder::new()
            .name(format!("{name} listener"))
            .spawn(move || {
                let mut buf = [0u8; Self::READ_BUF];
                while !stopped.load(Ordering::SeqCst) {
                    match reader.read(&mut buf) {
                        Ok(0) => {
                            if !stopped.load(Ordering::SeqCst) {
                                replies.disconnect("connection closed by peer");
                            }
                            break;
                        },
                        Ok(n) => {
                            trace!("<- {}", to_hex(&buf[..n]));
                            for reply in decoder.feed(&buf[..n]) {
                                if !replies.push(reply) {
                                    return;
                                }
                            }
                        },
                        Err(e)
                            if matches!(
                                e.kind(),
                                ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                            ) => {},
                        Err(e) => {
                            if !stopped.load(Ordering::SeqCst) {
                                replies.disconnect(e.to_string());
                            }
                            break;
                        },
                    }
                }
                debug!("Listener stopped");
            })
            .map_err(|e| Error::TransportOpen {
                transport: name.to_string(),
                reason: format!("cannot start listener: {e}"),
            })?;

        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Ask the thread to finish. The caller unblocks its read first.
    fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Wait for the thread to finish.
    fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Listener thread panicked");
            }
        }
    }
}

#[cfg(feature = "native")]
pub use serial::{SerialConfig, SerialTransport};
pub use tcp::{TcpConfig, TcpTransport};
