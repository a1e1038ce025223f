//! Wire protocol for clamd.
//!
//! Wire format:
//! - Command: `[1B 'z'|'n'][OPERATION][1B '\0'|'\n']`
//! - Payload: `[4B len_be][bytes...]` frames, closed by a `[0x00000000]` frame
//! - Reply: bytes up to the terminator matching the command prefix

use std::io::{self, Read, Write};

use bytes::{BufMut, BytesMut};
use clamwire_core::Charset;
use tracing::trace;

use crate::source::PayloadSource;

/// Marker clamd sends before dropping a client that was too slow to send a command.
pub const COMMAND_READ_TIMEOUT: &str = "COMMAND READ TIMED OUT";

const FRAME_HEADER_LEN: usize = 4;

/// Header framing. Replies are terminated the same way.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Termination {
    #[default]
    Nul,
    Newline,
}

impl Termination {
    #[must_use]
    pub const fn prefix(self) -> u8 {
        match self {
            Self::Nul => b'z',
            Self::Newline => b'n',
        }
    }

    #[must_use]
    pub const fn terminator(self) -> u8 {
        match self {
            Self::Nul => b'\0',
            Self::Newline => b'\n',
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Ping,
    Version,
    VersionCommands,
    Stats,
    Reload,
    IdSession,
    End,
    InStream,
}

impl Operation {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Ping => "PING",
            Self::Version => "VERSION",
            Self::VersionCommands => "VERSIONCOMMANDS",
            Self::Stats => "STATS",
            Self::Reload => "RELOAD",
            Self::IdSession => "IDSESSION",
            Self::End => "END",
            Self::InStream => "INSTREAM",
        }
    }

    /// Session bracket commands get no reply from the daemon.
    #[must_use]
    pub const fn expects_response(self) -> bool {
        !matches!(self, Self::IdSession | Self::End)
    }

    /// Operations that carry a chunked payload.
    #[must_use]
    pub const fn streams_data(self) -> bool {
        matches!(self, Self::InStream)
    }
}

/// Encode `<prefix><OPERATION><terminator>`.
#[must_use]
pub fn encode_header(operation: Operation, termination: Termination, charset: Charset) -> BytesMut {
    let name = charset.encode(operation.name());
    let mut buf = BytesMut::with_capacity(name.len() + 2);
    buf.put_u8(termination.prefix());
    buf.put_slice(&name);
    buf.put_u8(termination.terminator());
    buf
}

/// Write one length-prefixed frame. An empty chunk is the end-of-stream frame.
///
/// # Errors
///
/// Returns an error if the chunk does not fit a `u32` length or the write fails.
pub fn write_frame<W: Write + ?Sized>(w: &mut W, chunk: &[u8]) -> io::Result<()> {
    let len = u32::try_from(chunk.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame exceeds u32 length"))?;
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + chunk.len());
    buf.put_u32(len);
    buf.put_slice(chunk);
    w.write_all(&buf)
}

/// Stream `source` as frames of at most `chunk_size` bytes. Returns the
/// number of payload bytes sent.
///
/// # Errors
///
/// Returns an error if reading the source or writing a frame fails.
pub fn write_payload<W: Write + ?Sized>(
    w: &mut W,
    source: &mut dyn PayloadSource,
    chunk_size: usize,
    terminate: bool,
) -> io::Result<u64> {
    let mut chunk = vec![0u8; chunk_size];
    let mut sent = 0u64;
    loop {
        let n = match source.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        write_frame(w, &chunk[..n])?;
        sent += n as u64;
        trace!(frame_len = n, sent, "frame written");
    }
    if terminate {
        write_frame(w, &[])?;
    }
    Ok(sent)
}

/// Read reply bytes one at a time up to (excluding) the terminator, or to EOF.
///
/// # Errors
///
/// Returns an error if the read fails.
pub fn read_response<R: Read + ?Sized>(r: &mut R, termination: Termination) -> io::Result<Vec<u8>> {
    let terminator = termination.terminator();
    let mut reply = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        match r.read(&mut byte) {
            Ok(0) => break,
            Ok(_) if byte[0] == terminator => break,
            Ok(_) => reply.push(byte[0]),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(reply)
}

/// Whether a reply is clamd's command-read timeout notice.
#[must_use]
pub fn is_read_timeout(reply: &[u8]) -> bool {
    let marker = COMMAND_READ_TIMEOUT.as_bytes();
    reply.windows(marker.len()).any(|w| w == marker)
}
