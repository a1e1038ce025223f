//! Scripted in-memory connections for unit tests.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use clamwire_core::Endpoint;
use tracing_subscriber::fmt::MakeWriter;

use crate::transport::{Connection, Connector};

#[derive(Debug, Clone)]
enum Action {
    Reply(Vec<u8>),
    Fail(io::ErrorKind),
    ReplyThenBreak(Vec<u8>, io::ErrorKind),
}

/// How one fake daemon connection reacts to writes that start with a prefix.
#[derive(Debug, Clone, Default)]
pub struct Script {
    rules: Vec<(Vec<u8>, Action)>,
    fail_close: bool,
}

impl Script {
    pub fn new() -> Self {
        Self::default()
    }

    /// A cooperative daemon: answers ping, version, stats and clean scans.
    pub fn clamd() -> Self {
        Self::new()
            .reply(b"zPING\0", b"PONG\0")
            .reply(b"nPING\n", b"PONG\n")
            .reply(b"zVERSION\0", b"ClamAV 1.4.1/27400/Mon Oct  7 08:36:21 2024\0")
            .reply(b"zSTATS\0", b"POOLS: 1\n\nSTATE: VALID PRIMARY\nEND\0")
            .reply(b"zRELOAD\0", b"RELOADING\0")
            .reply(b"zINSTREAM\0", b"stream: OK\0")
    }

    pub fn reply(mut self, prefix: &[u8], reply: &[u8]) -> Self {
        self.rules.insert(0, (prefix.to_vec(), Action::Reply(reply.to_vec())));
        self
    }

    /// Fail the matching write and every write after it.
    pub fn fail(mut self, prefix: &[u8], kind: io::ErrorKind) -> Self {
        self.rules.insert(0, (prefix.to_vec(), Action::Fail(kind)));
        self
    }

    /// Accept the matching write and queue `reply`, then fail every later write.
    pub fn reply_then_break(mut self, prefix: &[u8], reply: &[u8], kind: io::ErrorKind) -> Self {
        self.rules.insert(
            0,
            (prefix.to_vec(), Action::ReplyThenBreak(reply.to_vec(), kind)),
        );
        self
    }

    pub fn fail_close(mut self) -> Self {
        self.fail_close = true;
        self
    }
}

/// Observer for one scripted connection.
#[derive(Debug, Clone, Default)]
pub struct ConnectionProbe {
    written: Arc<Mutex<Vec<u8>>>,
    closed: Arc<AtomicBool>,
}

impl ConnectionProbe {
    pub fn written(&self) -> Vec<u8> {
        self.written
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct ScriptedConnection {
    script: Script,
    probe: ConnectionProbe,
    readable: VecDeque<u8>,
    broken: Option<io::ErrorKind>,
}

impl Write for ScriptedConnection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.probe.is_closed() {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        if let Some(kind) = self.broken {
            return Err(kind.into());
        }

        let action = self
            .script
            .rules
            .iter()
            .find(|(prefix, _)| buf.starts_with(prefix))
            .map(|(_, action)| action.clone());
        match action {
            Some(Action::Fail(kind)) => {
                self.broken = Some(kind);
                return Err(kind.into());
            }
            Some(Action::Reply(reply)) => self.readable.extend(reply),
            Some(Action::ReplyThenBreak(reply, kind)) => {
                self.readable.extend(reply);
                self.broken = Some(kind);
            }
            None => {}
        }

        self.probe
            .written
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Read for ScriptedConnection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut n = 0;
        while n < buf.len() {
            let Some(byte) = self.readable.pop_front() else {
                break;
            };
            buf[n] = byte;
            n += 1;
        }
        Ok(n)
    }
}

impl Connection for ScriptedConnection {
    fn has_pending_input(&mut self) -> io::Result<bool> {
        Ok(!self.readable.is_empty())
    }

    fn close(&mut self) -> io::Result<()> {
        if self.script.fail_close {
            return Err(io::Error::other("close refused"));
        }
        self.probe.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Hands out scripted connections in order, then cooperative ones.
#[derive(Default)]
pub struct ScriptedConnector {
    scripts: Mutex<VecDeque<Script>>,
    probes: Mutex<Vec<ConnectionProbe>>,
    refuse: bool,
}

impl ScriptedConnector {
    pub fn with_scripts(scripts: Vec<Script>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            ..Self::default()
        }
    }

    pub fn refusing() -> Self {
        Self {
            refuse: true,
            ..Self::default()
        }
    }

    pub fn connects(&self) -> usize {
        self.probes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn connection(&self, index: usize) -> ConnectionProbe {
        self.probes.lock().unwrap_or_else(PoisonError::into_inner)[index].clone()
    }
}

impl Connector for ScriptedConnector {
    fn connect(&self, _endpoint: &Endpoint) -> io::Result<Box<dyn Connection>> {
        if self.refuse {
            return Err(io::ErrorKind::ConnectionRefused.into());
        }
        let script = self
            .scripts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or_else(Script::clamd);
        let probe = ConnectionProbe::default();
        self.probes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(probe.clone());
        Ok(Box::new(ScriptedConnection {
            script,
            probe,
            readable: VecDeque::new(),
            broken: None,
        }))
    }
}

/// Shared sink for log lines written during a test.
#[derive(Clone, Default)]
struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogBuffer {
    type Writer = Self;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Run `f` under a debug-level subscriber and return what it logged.
pub fn capture_logs(f: impl FnOnce()) -> String {
    let buffer = LogBuffer::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(buffer.clone())
        .with_max_level(tracing::Level::DEBUG)
        .with_ansi(false)
        .finish();
    tracing::subscriber::with_default(subscriber, f);
    let bytes = buffer.0.lock().unwrap_or_else(PoisonError::into_inner).clone();
    String::from_utf8_lossy(&bytes).into_owned()
}
