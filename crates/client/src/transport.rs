//! Socket factory for daemon connections.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;

use clamwire_core::{ClientConfig, Endpoint};
use tracing::{debug, trace};

/// A live byte stream to a daemon.
pub trait Connection: Read + Write + Send {
    /// Whether unread bytes are waiting, without blocking.
    ///
    /// # Errors
    ///
    /// Returns an error if the readiness probe itself fails.
    fn has_pending_input(&mut self) -> io::Result<bool>;

    /// Close both directions of the stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the OS refuses the shutdown.
    fn close(&mut self) -> io::Result<()>;
}

/// Opens new connections to an endpoint.
pub trait Connector: Send + Sync {
    /// # Errors
    ///
    /// Returns an error if the endpoint cannot be resolved or reached.
    fn connect(&self, endpoint: &Endpoint) -> io::Result<Box<dyn Connection>>;
}

impl Connection for TcpStream {
    fn has_pending_input(&mut self) -> io::Result<bool> {
        self.set_nonblocking(true)?;
        let mut probe = [0u8; 1];
        let pending = match self.peek(&mut probe) {
            Ok(n) => Ok(n > 0),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(e),
        };
        self.set_nonblocking(false)?;
        pending
    }

    fn close(&mut self) -> io::Result<()> {
        match self.shutdown(Shutdown::Both) {
            // Peer already hung up; nothing left to release.
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }
}

/// Plain TCP connector with connect and read/write timeouts.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
    read_timeout: Duration,
}

impl TcpConnector {
    #[must_use]
    pub const fn new(connect_timeout: Duration, read_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            read_timeout,
        }
    }

    #[must_use]
    pub const fn from_config(config: &ClientConfig) -> Self {
        Self::new(config.connect_timeout(), config.read_timeout())
    }
}

impl Connector for TcpConnector {
    fn connect(&self, endpoint: &Endpoint) -> io::Result<Box<dyn Connection>> {
        let mut last_err = None;
        for addr in (endpoint.host.as_str(), endpoint.port).to_socket_addrs()? {
            trace!(%addr, "connecting");
            match TcpStream::connect_timeout(&addr, self.connect_timeout) {
                Ok(stream) => {
                    stream.set_read_timeout(Some(self.read_timeout))?;
                    stream.set_write_timeout(Some(self.read_timeout))?;
                    stream.set_nodelay(true)?;
                    debug!(%endpoint, %addr, "connected");
                    return Ok(Box::new(stream));
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("{endpoint} resolved to no addresses"),
            )
        }))
    }
}
