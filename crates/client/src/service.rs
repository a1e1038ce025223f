//! Client bound to one daemon endpoint.

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use clamwire_core::{ClamdError, Endpoint, ScanResult, VersionInfo};
use tracing::debug;

use crate::command::CommandBuilder;
use crate::manager::SocketManager;
use crate::protocol::Operation;
use crate::response;
use crate::session::{Session, SessionSettings};
use crate::source::{BytesSource, PayloadSource, SeekSource, StreamSource};

/// Stateless commands run on single-use connections; scans go through a
/// session on a pooled connection.
#[derive(Debug)]
pub struct ClamdService {
    manager: Arc<SocketManager>,
    settings: SessionSettings,
}

impl ClamdService {
    #[must_use]
    pub fn new(manager: Arc<SocketManager>, settings: SessionSettings) -> Self {
        Self { manager, settings }
    }

    #[must_use]
    pub fn endpoint(&self) -> &Endpoint {
        self.manager.endpoint()
    }

    #[must_use]
    pub const fn manager(&self) -> &Arc<SocketManager> {
        &self.manager
    }

    #[must_use]
    pub const fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    fn single_use(&self, builder: CommandBuilder) -> Result<String, ClamdError> {
        let mut cmd = builder
            .chunk_size(self.settings.chunk_size)
            .charset(self.settings.charset)
            .build(0)?;
        let operation = cmd.operation();
        debug!(endpoint = %self.endpoint(), operation = operation.name(), "single-use command");

        let reply = self
            .manager
            .run_on_single_use_socket(|conn| cmd.execute(conn))?
            .ok_or(ClamdError::UnexpectedReply {
                operation: operation.name(),
                reply: String::new(),
            })?;
        Ok(self.settings.charset.decode(&reply))
    }

    /// # Errors
    ///
    /// Returns the connection failure or `UnexpectedReply` unless the daemon
    /// answers `PONG`.
    pub fn ping(&self) -> Result<(), ClamdError> {
        let reply = self.single_use(CommandBuilder::ping())?;
        response::expect_literal(Operation::Ping, &reply, "PONG")
    }

    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.ping().is_ok()
    }

    /// # Errors
    ///
    /// Returns the connection failure or an empty reply.
    pub fn version(&self) -> Result<VersionInfo, ClamdError> {
        response::parse_version(&self.single_use(CommandBuilder::version())?)
    }

    /// Version banner plus the command names the daemon accepts.
    ///
    /// # Errors
    ///
    /// Returns the connection failure or `UnexpectedReply` if the command
    /// list is missing.
    pub fn commands(&self) -> Result<(VersionInfo, Vec<String>), ClamdError> {
        response::parse_version_commands(&self.single_use(CommandBuilder::version_commands())?)
    }

    /// # Errors
    ///
    /// Returns the connection failure.
    pub fn stats(&self) -> Result<String, ClamdError> {
        Ok(self.single_use(CommandBuilder::stats())?.trim_end().to_string())
    }

    /// Ask the daemon to reload its signature databases.
    ///
    /// # Errors
    ///
    /// Returns the connection failure or `UnexpectedReply` unless the daemon
    /// answers `RELOADING`.
    pub fn reload(&self) -> Result<(), ClamdError> {
        let reply = self.single_use(CommandBuilder::reload())?;
        response::expect_literal(Operation::Reload, &reply, "RELOADING")
    }

    /// # Errors
    ///
    /// See [`Session::open`].
    pub fn open_session(&self) -> Result<Session, ClamdError> {
        Session::open(Arc::clone(&self.manager), self.settings.clone())
    }

    /// Scan one payload in its own session.
    ///
    /// # Errors
    ///
    /// See [`Session::open`] and [`Session::scan`].
    pub fn scan(&self, payload: impl PayloadSource + 'static) -> Result<ScanResult, ClamdError> {
        let session = self.open_session()?;
        let result = session.scan(payload);
        session.close();
        result
    }

    /// # Errors
    ///
    /// See [`scan`](Self::scan).
    pub fn scan_bytes(&self, data: impl Into<Vec<u8>>) -> Result<ScanResult, ClamdError> {
        self.scan(BytesSource::new(data))
    }

    /// Scan a one-pass reader. It cannot be resent, so a broken connection
    /// mid-stream fails with `ReplayNotSupported`.
    ///
    /// # Errors
    ///
    /// See [`scan`](Self::scan).
    pub fn scan_reader(
        &self,
        reader: impl Read + Send + 'static,
    ) -> Result<ScanResult, ClamdError> {
        self.scan(StreamSource::new(reader))
    }

    /// # Errors
    ///
    /// Returns `Io` if the file cannot be opened, otherwise see
    /// [`scan`](Self::scan).
    pub fn scan_file(&self, path: &Path) -> Result<ScanResult, ClamdError> {
        let file = File::open(path)?;
        self.scan(SeekSource::new(file))
    }
}
