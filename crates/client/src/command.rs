//! A single protocol command and its builder.

use std::fmt;
use std::io::{self, Write};

use clamwire_core::{Charset, ClamdError};
use tracing::{debug, trace, warn};

use crate::protocol::{self, Operation, Termination};
use crate::source::PayloadSource;
use crate::transport::Connection;

const DEFAULT_CHUNK_SIZE: usize = 2048;

/// One operation ready to be written to a daemon connection. Everything but
/// the attempt counter and the payload cursor is fixed at build time.
pub struct Command {
    operation: Operation,
    termination: Termination,
    charset: Charset,
    payload: Option<Box<dyn PayloadSource>>,
    chunk_size: usize,
    terminate_payload: bool,
    expects_response: bool,
    remaining_attempts: u32,
    attempts: u32,
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("operation", &self.operation)
            .field("termination", &self.termination)
            .field("has_payload", &self.payload.is_some())
            .field("chunk_size", &self.chunk_size)
            .field("remaining_attempts", &self.remaining_attempts)
            .finish_non_exhaustive()
    }
}

impl Command {
    #[must_use]
    pub const fn operation(&self) -> Operation {
        self.operation
    }

    #[must_use]
    pub const fn termination(&self) -> Termination {
        self.termination
    }

    #[must_use]
    pub const fn charset(&self) -> Charset {
        self.charset
    }

    #[must_use]
    pub const fn has_payload(&self) -> bool {
        self.payload.is_some()
    }

    /// Executions still allowed, counting the first one.
    #[must_use]
    pub const fn remaining_attempts(&self) -> u32 {
        self.remaining_attempts
    }

    /// Executions made so far.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Rewind the payload to its mark before a resend.
    ///
    /// # Errors
    ///
    /// Returns `ReplayNotSupported` if the payload cannot be rewound.
    pub fn rewind(&mut self) -> Result<(), ClamdError> {
        let Some(payload) = self.payload.as_mut() else {
            return Ok(());
        };
        if !payload.supports_replay() {
            return Err(ClamdError::ReplayNotSupported);
        }
        payload.reset().map_err(|e| match e.kind() {
            io::ErrorKind::Unsupported => ClamdError::ReplayNotSupported,
            _ => ClamdError::from(e),
        })
    }

    /// Write the command (and payload), flush, and read the raw reply.
    ///
    /// Returns `None` for commands without a reply when the daemon sent
    /// nothing. Each call uses up one attempt.
    ///
    /// # Errors
    ///
    /// Returns the classified I/O failure, or `CommandReadTimeout` if the
    /// daemon reported that it gave up waiting for the command.
    pub fn execute(&mut self, conn: &mut dyn Connection) -> Result<Option<Vec<u8>>, ClamdError> {
        self.remaining_attempts = self.remaining_attempts.saturating_sub(1);
        self.attempts += 1;
        debug!(
            operation = self.operation.name(),
            attempt = self.attempts,
            "sending command"
        );

        let header = protocol::encode_header(self.operation, self.termination, self.charset);
        conn.write_all(&header)?;
        if let Some(payload) = self.payload.as_mut() {
            let sent = protocol::write_payload(
                conn,
                payload.as_mut(),
                self.chunk_size,
                self.terminate_payload,
            )?;
            trace!(sent, "payload streamed");
        }
        conn.flush()?;

        if self.expects_response {
            return self.read_reply(conn).map(Some);
        }

        if conn.has_pending_input()? {
            // Daemon answered a command that has no reply; usually an early error.
            let reply = self.read_reply(conn)?;
            warn!(
                operation = self.operation.name(),
                reply = %self.charset.decode(&reply),
                "ignoring unsolicited reply"
            );
        }
        Ok(None)
    }

    /// Read one reply in this command's framing.
    ///
    /// # Errors
    ///
    /// Returns the classified I/O failure or `CommandReadTimeout`.
    pub fn read_reply(&self, conn: &mut dyn Connection) -> Result<Vec<u8>, ClamdError> {
        let reply = protocol::read_response(conn, self.termination)?;
        if protocol::is_read_timeout(&reply) {
            return Err(ClamdError::CommandReadTimeout);
        }
        Ok(reply)
    }
}

/// Fluent, validated factory for [`Command`].
pub struct CommandBuilder {
    operation: Operation,
    termination: Termination,
    charset: Charset,
    chunk_size: usize,
    payload: Option<Box<dyn PayloadSource>>,
    terminate_payload: Option<bool>,
    expects_response: Option<bool>,
}

impl CommandBuilder {
    #[must_use]
    pub fn new(operation: Operation) -> Self {
        Self {
            operation,
            termination: Termination::default(),
            charset: Charset::default(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            payload: None,
            terminate_payload: None,
            expects_response: None,
        }
    }

    #[must_use]
    pub fn ping() -> Self {
        Self::new(Operation::Ping)
    }

    #[must_use]
    pub fn version() -> Self {
        Self::new(Operation::Version)
    }

    #[must_use]
    pub fn version_commands() -> Self {
        Self::new(Operation::VersionCommands)
    }

    #[must_use]
    pub fn stats() -> Self {
        Self::new(Operation::Stats)
    }

    #[must_use]
    pub fn reload() -> Self {
        Self::new(Operation::Reload)
    }

    #[must_use]
    pub fn start_session() -> Self {
        Self::new(Operation::IdSession)
    }

    #[must_use]
    pub fn end_session() -> Self {
        Self::new(Operation::End)
    }

    /// `INSTREAM` with `payload`, closed by a zero-length frame.
    #[must_use]
    pub fn stream_scan(payload: impl PayloadSource + 'static) -> Self {
        Self::new(Operation::InStream)
            .payload(payload)
            .terminate_payload(true)
    }

    #[must_use]
    pub fn termination(mut self, termination: Termination) -> Self {
        self.termination = termination;
        self
    }

    #[must_use]
    pub fn charset(mut self, charset: Charset) -> Self {
        self.charset = charset;
        self
    }

    #[must_use]
    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    #[must_use]
    pub fn payload(mut self, payload: impl PayloadSource + 'static) -> Self {
        self.payload = Some(Box::new(payload));
        self
    }

    /// Whether the payload ends with a zero-length frame. Must be set
    /// whenever a payload is present.
    #[must_use]
    pub fn terminate_payload(mut self, terminate: bool) -> Self {
        self.terminate_payload = Some(terminate);
        self
    }

    /// Override whether a reply is read after sending.
    #[must_use]
    pub fn expect_response(mut self, expects: bool) -> Self {
        self.expects_response = Some(expects);
        self
    }

    /// Validate and freeze the command. `retries` is the number of resends
    /// allowed after a broken pipe or reset, on top of the first attempt.
    ///
    /// # Errors
    ///
    /// Returns `InvalidCommand` for an out-of-range chunk size, a payload on
    /// an operation that takes none (or the reverse), or a payload without
    /// an explicit terminator policy.
    pub fn build(self, retries: u32) -> Result<Command, ClamdError> {
        let name = self.operation.name();
        if self.chunk_size == 0 || u32::try_from(self.chunk_size).is_err() {
            return Err(ClamdError::InvalidCommand(format!(
                "{name}: chunk size {} out of range",
                self.chunk_size
            )));
        }

        let mut payload = self.payload;
        match (&payload, self.operation.streams_data()) {
            (None, true) => {
                return Err(ClamdError::InvalidCommand(format!(
                    "{name} requires a payload"
                )));
            }
            (Some(_), false) => {
                return Err(ClamdError::InvalidCommand(format!(
                    "{name} does not take a payload"
                )));
            }
            _ => {}
        }

        let terminate_payload = match (&payload, self.terminate_payload) {
            (Some(_), None) => {
                return Err(ClamdError::InvalidCommand(format!(
                    "{name}: payload requires an explicit zero-length terminator policy"
                )));
            }
            (_, terminate) => terminate.unwrap_or(false),
        };

        if let Some(source) = payload.as_mut() {
            source.mark()?;
        }

        Ok(Command {
            operation: self.operation,
            termination: self.termination,
            charset: self.charset,
            payload,
            chunk_size: self.chunk_size,
            terminate_payload,
            expects_response: self
                .expects_response
                .unwrap_or_else(|| self.operation.expects_response()),
            remaining_attempts: retries.saturating_add(1),
            attempts: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{BytesSource, StreamSource};
    use crate::test_util::{Script, ScriptedConnector};
    use crate::transport::Connector;
    use clamwire_core::Endpoint;

    fn connect(script: Script) -> (ScriptedConnector, Box<dyn Connection>) {
        let connector = ScriptedConnector::with_scripts(vec![script]);
        let conn = connector.connect(&Endpoint::new("clamd", 3310)).unwrap();
        (connector, conn)
    }

    #[test]
    fn defaults() {
        let cmd = CommandBuilder::ping().build(0).unwrap();
        assert_eq!(cmd.operation(), Operation::Ping);
        assert_eq!(cmd.termination(), Termination::Nul);
        assert_eq!(cmd.charset(), Charset::Utf8);
        assert_eq!(cmd.chunk_size, 2048);
        assert_eq!(cmd.remaining_attempts(), 1);
        assert!(!cmd.has_payload());
    }

    #[test]
    fn retry_budget_counts_first_attempt() {
        let cmd = CommandBuilder::version().build(3).unwrap();
        assert_eq!(cmd.remaining_attempts(), 4);
        let cmd = CommandBuilder::version().build(u32::MAX).unwrap();
        assert_eq!(cmd.remaining_attempts(), u32::MAX);
    }

    #[test]
    fn payload_without_terminator_policy_rejected() {
        let result = CommandBuilder::new(Operation::InStream)
            .payload(BytesSource::new(b"x".to_vec()))
            .build(0);
        assert!(matches!(
            result,
            Err(ClamdError::InvalidCommand(msg)) if msg.contains("terminator")
        ));
    }

    #[test]
    fn stream_without_payload_rejected() {
        let result = CommandBuilder::new(Operation::InStream).build(0);
        assert!(matches!(result, Err(ClamdError::InvalidCommand(_))));
    }

    #[test]
    fn payload_on_ping_rejected() {
        let result = CommandBuilder::ping()
            .payload(BytesSource::new(b"x".to_vec()))
            .terminate_payload(true)
            .build(0);
        assert!(matches!(result, Err(ClamdError::InvalidCommand(_))));
    }

    #[test]
    fn zero_chunk_rejected() {
        let result = CommandBuilder::stream_scan(BytesSource::new(b"x".to_vec()))
            .chunk_size(0)
            .build(0);
        assert!(matches!(result, Err(ClamdError::InvalidCommand(_))));
    }

    #[test]
    fn execute_writes_header_and_frames() {
        let (connector, mut conn) = connect(Script::clamd());
        let mut cmd = CommandBuilder::stream_scan(BytesSource::new(b"abcde".to_vec()))
            .chunk_size(4)
            .build(0)
            .unwrap();

        let reply = cmd.execute(conn.as_mut()).unwrap();
        assert_eq!(reply.as_deref(), Some(&b"stream: OK"[..]));
        assert_eq!(cmd.remaining_attempts(), 0);
        assert_eq!(cmd.attempts(), 1);

        let mut expected = b"zINSTREAM\0".to_vec();
        expected.extend_from_slice(&[0, 0, 0, 4, b'a', b'b', b'c', b'd']);
        expected.extend_from_slice(&[0, 0, 0, 1, b'e']);
        expected.extend_from_slice(&[0, 0, 0, 0]);
        assert_eq!(connector.connection(0).written(), expected);
    }

    #[test]
    fn newline_framing_reads_newline_reply() {
        let (_connector, mut conn) = connect(Script::clamd());
        let mut cmd = CommandBuilder::ping()
            .termination(Termination::Newline)
            .build(0)
            .unwrap();
        assert_eq!(cmd.execute(conn.as_mut()).unwrap().as_deref(), Some(&b"PONG"[..]));
    }

    #[test]
    fn no_reply_command_returns_none() {
        let (connector, mut conn) = connect(Script::clamd());
        let mut cmd = CommandBuilder::start_session().build(0).unwrap();
        assert_eq!(cmd.execute(conn.as_mut()).unwrap(), None);
        assert_eq!(connector.connection(0).written(), b"zIDSESSION\0");
    }

    #[test]
    fn early_timeout_notice_surfaces() {
        let script = Script::new().reply(b"zIDSESSION\0", b"COMMAND READ TIMED OUT\0");
        let (_connector, mut conn) = connect(script);
        let mut cmd = CommandBuilder::start_session().build(0).unwrap();
        assert!(matches!(
            cmd.execute(conn.as_mut()),
            Err(ClamdError::CommandReadTimeout)
        ));
    }

    #[test]
    fn broken_pipe_is_classified() {
        let script = Script::new().fail(b"zINSTREAM", io::ErrorKind::BrokenPipe);
        let (_connector, mut conn) = connect(script);
        let mut cmd = CommandBuilder::stream_scan(BytesSource::new(b"x".to_vec()))
            .build(1)
            .unwrap();
        let err = cmd.execute(conn.as_mut()).unwrap_err();
        assert!(matches!(err, ClamdError::BrokenPipe(_)));
        assert_eq!(cmd.remaining_attempts(), 1);
    }

    #[test]
    fn rewind_replays_payload() {
        let (connector, mut conn) = connect(Script::clamd());
        let mut cmd = CommandBuilder::stream_scan(BytesSource::new(b"ab".to_vec()))
            .build(1)
            .unwrap();
        cmd.execute(conn.as_mut()).unwrap();
        cmd.rewind().unwrap();
        cmd.execute(conn.as_mut()).unwrap();

        let once = [&b"zINSTREAM\0"[..], &[0, 0, 0, 2, b'a', b'b', 0, 0, 0, 0][..]].concat();
        assert_eq!(connector.connection(0).written(), [once.clone(), once].concat());
    }

    #[test]
    fn rewind_of_one_pass_source_fails() {
        let mut cmd = CommandBuilder::stream_scan(StreamSource::new(&b"ab"[..]))
            .build(1)
            .unwrap();
        assert!(matches!(cmd.rewind(), Err(ClamdError::ReplayNotSupported)));
    }

    #[test]
    fn rewind_without_payload_is_noop() {
        let mut cmd = CommandBuilder::ping().build(1).unwrap();
        assert!(cmd.rewind().is_ok());
    }
}
