//! `IDSESSION` sessions: several commands over one pooled connection, with
//! reconnect-and-resend on broken pipes and resets.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use clamwire_core::{Charset, ClamdError, ClientConfig, Endpoint, ScanResult, VersionInfo};
use tracing::{debug, instrument, warn};

use crate::command::{Command, CommandBuilder};
use crate::manager::SocketManager;
use crate::pool::Checkout;
use crate::protocol::Operation;
use crate::response;
use crate::socket::LazySocket;
use crate::source::{BytesSource, PayloadSource};

/// Per-session defaults, taken from the owning service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    pub chunk_size: usize,
    pub charset: Charset,
    pub max_retries: u32,
    /// Bound on waiting for a pooled connection; `None` waits forever.
    pub checkout_timeout: Option<Duration>,
}

impl SessionSettings {
    #[must_use]
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            chunk_size: config.chunk_size,
            charset: config.charset,
            max_retries: config.max_retries,
            checkout_timeout: config.command_timeout(),
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from_config(&ClientConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Initializing,
    Alive,
    Terminated,
}

struct Inner {
    socket: Option<Checkout<LazySocket>>,
    state: SessionState,
}

/// A daemon session. Commands are serialized; the connection always goes
/// back to the pool on [`close`](Self::close) or drop.
pub struct Session {
    manager: Arc<SocketManager>,
    settings: SessionSettings,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("endpoint", self.manager.endpoint())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Borrow a connection and start a session on it.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionUnavailable` if no connection can be borrowed,
    /// `SessionStartFailed` if the daemon dropped the connection, or the
    /// I/O failure of the start command.
    #[instrument(skip_all, fields(endpoint = %manager.endpoint()))]
    pub fn open(
        manager: Arc<SocketManager>,
        settings: SessionSettings,
    ) -> Result<Self, ClamdError> {
        let socket = manager.checkout(settings.checkout_timeout)?;
        let session = Self {
            manager,
            settings,
            inner: Mutex::new(Inner {
                socket: Some(socket),
                state: SessionState::Initializing,
            }),
        };

        {
            let mut inner = session.lock();
            match session.start(&inner) {
                Ok(()) => inner.state = SessionState::Alive,
                Err(e) => {
                    session.kill(&mut inner);
                    return Err(e);
                }
            }
        }
        debug!("session started");
        Ok(session)
    }

    #[must_use]
    pub fn endpoint(&self) -> &Endpoint {
        self.manager.endpoint()
    }

    #[must_use]
    pub const fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.state() == SessionState::Alive
    }

    /// Apply this session's chunk size and charset to `builder`.
    #[must_use]
    pub fn prepare(&self, builder: CommandBuilder) -> CommandBuilder {
        builder
            .chunk_size(self.settings.chunk_size)
            .charset(self.settings.charset)
    }

    /// Run `cmd` on the session connection, reconnecting and resending while
    /// its retry budget lasts.
    ///
    /// # Errors
    ///
    /// Returns `SessionRestart`/`SessionTerminated` on a dead session,
    /// `RetriesExhausted`, `ReplayNotSupported`, `CommandReadTimeout` or the
    /// I/O failure. Any of these except the first two ends the session.
    #[instrument(skip_all, fields(endpoint = %self.endpoint(), operation = cmd.operation().name()))]
    pub fn execute(&self, cmd: &mut Command) -> Result<Option<Vec<u8>>, ClamdError> {
        let mut inner = self.lock();
        self.execute_locked(&mut inner, cmd)
    }

    fn execute_locked(
        &self,
        inner: &mut Inner,
        cmd: &mut Command,
    ) -> Result<Option<Vec<u8>>, ClamdError> {
        if inner.state == SessionState::Terminated {
            return Err(if cmd.operation() == Operation::IdSession {
                ClamdError::SessionRestart
            } else {
                ClamdError::SessionTerminated {
                    operation: cmd.operation().name(),
                }
            });
        }

        let result = self.run(inner, cmd);
        if result.is_err() {
            self.kill(inner);
        }
        result
    }

    fn run(&self, inner: &mut Inner, cmd: &mut Command) -> Result<Option<Vec<u8>>, ClamdError> {
        loop {
            let socket = inner
                .socket
                .as_ref()
                .ok_or(ClamdError::IllegalState("session has no connection"))?;

            let err = match socket.with_connection(|conn| cmd.execute(conn)) {
                Ok(reply) => return Ok(reply),
                Err(e) => e,
            };
            if !err.is_recoverable() {
                return Err(err);
            }
            warn!(
                error = %err,
                remaining = cmd.remaining_attempts(),
                "connection failed during command"
            );

            if cmd.operation().streams_data() {
                // The daemon may have read enough, answered and hung up.
                match socket.with_connection(|conn| cmd.read_reply(conn)) {
                    Ok(reply) if !reply.is_empty() => return Ok(Some(reply)),
                    Ok(_) => debug!("no reply left on broken connection"),
                    Err(e) if e.kills_connection() => return Err(e),
                    Err(e) => debug!(error = %e, "reply salvage failed"),
                }
            }

            if cmd.operation() == Operation::End {
                return Ok(None);
            }

            if cmd.remaining_attempts() == 0 {
                return Err(ClamdError::RetriesExhausted {
                    operation: cmd.operation().name(),
                    attempts: cmd.attempts(),
                    source: Box::new(err),
                });
            }

            cmd.rewind()?;
            self.reconnect(inner)?;
        }
    }

    fn start(&self, inner: &Inner) -> Result<(), ClamdError> {
        let socket = inner
            .socket
            .as_ref()
            .ok_or(ClamdError::IllegalState("session has no connection"))?;
        let mut cmd = self.prepare(CommandBuilder::start_session()).build(0)?;
        socket.with_connection(|conn| cmd.execute(conn))?;
        if socket.is_closed() {
            return Err(ClamdError::SessionStartFailed {
                endpoint: self.endpoint().clone(),
            });
        }
        Ok(())
    }

    fn reconnect(&self, inner: &mut Inner) -> Result<(), ClamdError> {
        if let Some(old) = inner.socket.take() {
            if let Err(e) = old.close() {
                warn!(error = %e, "failed to close broken connection");
            }
            self.manager.release_closed(old)?;
        }
        inner.socket = Some(self.manager.checkout(self.settings.checkout_timeout)?);
        self.start(inner)?;
        debug!("session re-established");
        Ok(())
    }

    /// Close the connection without `END` and mark the session dead.
    fn kill(&self, inner: &mut Inner) {
        if let Some(socket) = &inner.socket {
            if let Err(e) = socket.close() {
                warn!(
                    endpoint = %self.endpoint(),
                    error = %e,
                    "failed to close session connection"
                );
            }
        }
        inner.state = SessionState::Terminated;
    }

    fn exchange(&self, builder: CommandBuilder) -> Result<String, ClamdError> {
        let mut cmd = self.prepare(builder).build(self.settings.max_retries)?;
        let operation = cmd.operation();
        let reply = self
            .execute(&mut cmd)?
            .ok_or(ClamdError::UnexpectedReply {
                operation: operation.name(),
                reply: String::new(),
            })?;
        Ok(self.settings.charset.decode(&reply))
    }

    /// # Errors
    ///
    /// Returns `UnexpectedReply` unless the daemon answers `PONG`.
    pub fn ping(&self) -> Result<(), ClamdError> {
        let reply = self.exchange(CommandBuilder::ping())?;
        response::expect_literal(Operation::Ping, &reply, "PONG")
    }

    /// # Errors
    ///
    /// Returns the command or decoding failure.
    pub fn version(&self) -> Result<VersionInfo, ClamdError> {
        response::parse_version(&self.exchange(CommandBuilder::version())?)
    }

    /// Daemon statistics text without the request number.
    ///
    /// # Errors
    ///
    /// Returns the command failure.
    pub fn stats(&self) -> Result<String, ClamdError> {
        let reply = self.exchange(CommandBuilder::stats())?;
        let (_, body) = response::split_request_id(&reply);
        Ok(body.trim_end().to_string())
    }

    /// Stream `payload` with `INSTREAM` and parse the verdict.
    ///
    /// # Errors
    ///
    /// Returns `SizeLimitExceeded` (which ends the session), `Scan`,
    /// `ResponseParse`, or any [`execute`](Self::execute) failure.
    #[instrument(skip_all, fields(endpoint = %self.endpoint()))]
    pub fn scan(&self, payload: impl PayloadSource + 'static) -> Result<ScanResult, ClamdError> {
        let mut cmd = self
            .prepare(CommandBuilder::stream_scan(payload))
            .build(self.settings.max_retries)?;

        let mut inner = self.lock();
        let reply = self
            .execute_locked(&mut inner, &mut cmd)?
            .ok_or(ClamdError::IllegalState("stream scan returned no reply"))?;
        let text = self.settings.charset.decode(&reply);

        match response::parse_scan_reply(Operation::InStream, &text) {
            Err(e) if e.kills_connection() => {
                warn!(error = %e, "daemon rejected payload, ending session");
                self.kill(&mut inner);
                Err(e)
            }
            other => other,
        }
    }

    /// # Errors
    ///
    /// See [`scan`](Self::scan).
    pub fn scan_bytes(&self, data: impl Into<Vec<u8>>) -> Result<ScanResult, ClamdError> {
        self.scan(BytesSource::new(data))
    }

    /// Send `END` (best-effort), close the connection and return it to the
    /// pool. Idempotent.
    #[instrument(skip_all, fields(endpoint = %self.endpoint()))]
    pub fn close(&self) {
        let mut inner = self.lock();
        let Some(socket) = inner.socket.take() else {
            inner.state = SessionState::Terminated;
            return;
        };

        if inner.state == SessionState::Alive {
            let ended = self
                .prepare(CommandBuilder::end_session())
                .build(0)
                .and_then(|mut cmd| socket.with_connection(|conn| cmd.execute(conn)));
            if let Err(e) = ended {
                warn!(error = %e, "session end failed");
            }
        }
        inner.state = SessionState::Terminated;

        // The daemon hangs up after END; the handle reconnects on next checkout.
        if let Err(e) = socket.close() {
            warn!(error = %e, "failed to close session connection");
        }
        if let Err(e) = self.manager.release_closed(socket) {
            warn!(error = %e, "failed to return session connection");
        }
        debug!("session closed");
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}
