//! TCP transport for Wi-Fi bridges.
//!
//! The bridge forwards each packet to the target and answers with a 5-byte
//! binary reply frame followed by CR LF. Outgoing packets carry the same
//! CR LF suffix so the bridge can find packet ends in the byte stream.

use {
    crate::{
        error::{Error, Result},
        protocol::{packet::to_hex, reply::FrameReplyDecoder},
        transport::{Listener, Transport},
        upload::queue::ReplySink,
    },
    log::{debug, info, trace},
    std::{
        io::Write,
        net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs},
        time::Duration,
    },
};

/// Line terminator appended to every outgoing packet.
const FRAME_SUFFIX: &[u8] = b"\r\n";

/// TCP connection settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpConfig {
    /// Host name or IP address of the bridge.
    pub host: String,
    /// TCP port of the bridge.
    pub port: u16,
    /// How long to wait for the connection to be established.
    pub connect_timeout: Duration,
    /// Socket read timeout used by the listener between stop checks.
    pub read_timeout: Duration,
}

impl TcpConfig {
    /// Default connect timeout.
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    /// Default read timeout.
    pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(10);

    /// Create a configuration with default timeouts.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            connect_timeout: Self::DEFAULT_CONNECT_TIMEOUT,
            read_timeout: Self::DEFAULT_READ_TIMEOUT,
        }
    }

    /// Set the connect timeout.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the read timeout.
    #[must_use]
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }
}

/// Transport to a Wi-Fi bridge over TCP.
pub struct TcpTransport {
    config: TcpConfig,
    name: String,
    stream: Option<TcpStream>,
    listener: Option<Listener>,
}

impl TcpTransport {
    /// Create an unconnected transport.
    pub fn new(config: TcpConfig) -> Self {
        let name = format!("{}:{}", config.host, config.port);
        Self {
            config,
            name,
            stream: None,
            listener: None,
        }
    }

    fn open_error(&self, reason: impl std::fmt::Display) -> Error {
        Error::TransportOpen {
            transport: self.name.clone(),
            reason: reason.to_string(),
        }
    }

    fn connect(&self) -> Result<TcpStream> {
        let addrs: Vec<SocketAddr> = (self.config.host.as_str(), self.config.port)
            .to_socket_addrs()
            .map_err(|e| self.open_error(e))?
            .collect();

        let mut last_error = None;
        for addr in addrs {
            debug!("Connecting to {addr}");
            match TcpStream::connect_timeout(&addr, self.config.connect_timeout) {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    debug!("Connection to {addr} failed: {e}");
                    last_error = Some(e);
                },
            }
        }

        Err(match last_error {
            Some(e) => self.open_error(e),
            None => self.open_error("host did not resolve to any address"),
        })
    }
}

impl Transport for TcpTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&mut self, replies: ReplySink) -> Result<()> {
        let stream = self.connect()?;
        stream
            .set_read_timeout(Some(self.config.read_timeout))
            .map_err(|e| self.open_error(e))?;
        // Packets are small and latency bound
        stream
            .set_nodelay(true)
            .map_err(|e| self.open_error(e))?;

        let reader = stream
            .try_clone()
            .map_err(|e| self.open_error(e))?;
        let listener = Listener::spawn(&self.name, reader, FrameReplyDecoder::new(), replies)?;

        info!("Connected to {}", self.name);
        self.stream = Some(stream);
        self.listener = Some(listener);
        Ok(())
    }

    fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| Error::Transport(format!("{} is not connected", self.name)))?;

        let mut data = Vec::with_capacity(frame.len() + FRAME_SUFFIX.len());
        data.extend_from_slice(frame);
        data.extend_from_slice(FRAME_SUFFIX);

        trace!("-> {}", to_hex(&data));
        stream
            .write_all(&data)
            .and_then(|()| stream.flush())
            .map_err(|e| Error::Transport(format!("write to {} failed: {e}", self.name)))
    }

    fn close(&mut self) -> Result<()> {
        if let Some(listener) = &self.listener {
            listener.request_stop();
        }

        let mut result = Ok(());
        if let Some(stream) = self.stream.take() {
            // Wakes the listener out of its blocking read
            if let Err(e) = stream.shutdown(Shutdown::Both) {
                if e.kind() != std::io::ErrorKind::NotConnected {
                    result = Err(Error::Transport(format!("close of {} failed: {e}", self.name)));
                }
            }
        }

        if let Some(mut listener) = self.listener.take() {
            listener.join();
        }
        debug!("Closed {}", self.name);
        result
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::reply::ReplyCode;
    use crate::upload::queue::{ReplyQueue, Wait};
    use std::io::Read;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn test_config_builder() {
        let config = TcpConfig::new("192.168.1.115", 1111)
            .with_connect_timeout(Duration::from_secs(3))
            .with_read_timeout(Duration::from_millis(500));
        assert_eq!(config.host, "192.168.1.115");
        assert_eq!(config.port, 1111);
        assert_eq!(config.connect_timeout, Duration::from_secs(3));
        assert_eq!(config.read_timeout, Duration::from_millis(500));
        assert_eq!(
            TcpConfig::new("h", 1).connect_timeout,
            TcpConfig::DEFAULT_CONNECT_TIMEOUT
        );
    }

    #[test]
    fn test_name_is_host_and_port() {
        let transport = TcpTransport::new(TcpConfig::new("bridge.local", 1111));
        assert_eq!(transport.name(), "bridge.local:1111");
        assert_eq!(transport.default_page_size(), 26);
    }

    #[test]
    fn test_write_before_open_fails() {
        let mut transport = TcpTransport::new(TcpConfig::new("127.0.0.1", 1));
        assert!(matches!(
            transport.write_frame(&[0xEF, 0xAC]),
            Err(Error::Transport(_))
        ));
    }

    #[test]
    fn test_open_refused() {
        // Bind then drop to get a port nobody listens on
        let port = {
            let socket = TcpListener::bind("127.0.0.1:0").unwrap();
            socket.local_addr().unwrap().port()
        };
        let mut transport = TcpTransport::new(
            TcpConfig::new("127.0.0.1", port).with_connect_timeout(Duration::from_secs(2)),
        );
        let queue = ReplyQueue::new();
        assert!(matches!(
            transport.open(queue.sink()),
            Err(Error::TransportOpen { .. })
        ));
    }

    #[test]
    fn test_frames_and_replies_over_loopback() {
        let server = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = server.local_addr().unwrap().port();

        let device = thread::spawn(move || {
            let (mut socket, _) = server.accept().unwrap();
            let mut packet = [0u8; 8];
            socket.read_exact(&mut packet).unwrap();
            socket
                .write_all(&[0xEF, 0xAC, 0x01, 0x04, 0x4E, b'\r', b'\n'])
                .unwrap();
            // Hold the connection until the client hangs up
            let mut rest = Vec::new();
            let _ = socket.read_to_end(&mut rest);
            packet
        });

        let queue = ReplyQueue::new();
        let mut transport = TcpTransport::new(
            TcpConfig::new("127.0.0.1", port).with_read_timeout(Duration::from_millis(100)),
        );
        transport.open(queue.sink()).unwrap();
        transport
            .write_frame(&[0xEF, 0xAC, 0x40, 6, 0x04, 0x4E])
            .unwrap();

        assert_eq!(
            queue.wait(Duration::from_secs(5)),
            Wait::Reply(ReplyCode::Ok(1102))
        );

        transport.close().unwrap();
        let packet = device.join().unwrap();
        assert_eq!(packet, [0xEF, 0xAC, 0x40, 6, 0x04, 0x4E, b'\r', b'\n']);
    }

    #[test]
    fn test_peer_hangup_reports_disconnect() {
        let server = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = server.local_addr().unwrap().port();

        let device = thread::spawn(move || {
            let (socket, _) = server.accept().unwrap();
            drop(socket);
        });

        let queue = ReplyQueue::new();
        let mut transport = TcpTransport::new(TcpConfig::new("127.0.0.1", port));
        transport.open(queue.sink()).unwrap();
        device.join().unwrap();

        assert!(matches!(
            queue.wait(Duration::from_secs(5)),
            Wait::Disconnected(_)
        ));
        let _ = transport.close();
    }
}
