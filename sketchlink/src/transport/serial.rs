//! Serial transport for USB-serial bridges using the `serialport` crate.
//!
//! The bridge answers in text lines (`OK,<id>`, `RETRY`, `ERROR,<code>`)
//! interleaved with its own debug output.

use {
    crate::{
        error::{Error, Result},
        protocol::{packet::to_hex, reply::LineReplyDecoder},
        transport::{Listener, Transport},
        upload::queue::ReplySink,
    },
    log::{debug, info, trace},
    std::{io::Write, time::Duration},
};

/// Serial port configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/ttyUSB0", "COM3").
    pub port_name: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Read timeout; the listener checks for shutdown at this interval.
    pub timeout: Duration,
}

impl SerialConfig {
    /// Baud rate of the stock bridge sketch.
    pub const DEFAULT_BAUD: u32 = 19200;

    /// Create a new configuration with port name and baud rate.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            timeout: Duration::from_millis(100),
        }
    }

    /// Set the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Transport to a serial bridge.
pub struct SerialTransport {
    config: SerialConfig,
    port: Option<Box<dyn serialport::SerialPort>>,
    listener: Option<Listener>,
}

impl SerialTransport {
    /// Create a transport; the port is opened by [`Transport::open`].
    pub fn new(config: SerialConfig) -> Self {
        Self {
            config,
            port: None,
            listener: None,
        }
    }

    fn open_error(&self, reason: impl std::fmt::Display) -> Error {
        Error::TransportOpen {
            transport: self.config.port_name.clone(),
            reason: reason.to_string(),
        }
    }
}

impl Transport for SerialTransport {
    fn name(&self) -> &str {
        &self.config.port_name
    }

    fn open(&mut self, replies: ReplySink) -> Result<()> {
        let port = serialport::new(&self.config.port_name, self.config.baud_rate)
            .timeout(self.config.timeout)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .open()
            .map_err(|e| self.open_error(e))?;

        let reader = port
            .try_clone()
            .map_err(|e| self.open_error(e))?;
        let listener = Listener::spawn(
            &self.config.port_name,
            reader,
            LineReplyDecoder::new(),
            replies,
        )?;

        info!(
            "Opened {} at {} baud",
            self.config.port_name, self.config.baud_rate
        );
        self.port = Some(port);
        self.listener = Some(listener);
        Ok(())
    }

    fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        let port = self
            .port
            .as_mut()
            .ok_or_else(|| Error::Transport(format!("{} is not open", self.config.port_name)))?;

        trace!("-> {}", to_hex(frame));
        port.write_all(frame)
            .and_then(|()| port.flush())
            .map_err(|e| {
                Error::Transport(format!("write to {} failed: {e}", self.config.port_name))
            })
    }

    fn close(&mut self) -> Result<()> {
        // The listener wakes on its read timeout and sees the flag
        if let Some(mut listener) = self.listener.take() {
            listener.request_stop();
            listener.join();
        }
        // Take ownership of the port and let it drop (close)
        if self.port.take().is_some() {
            debug!("Closed {}", self.config.port_name);
        }
        Ok(())
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
