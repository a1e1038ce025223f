//! Decoding of daemon replies.
//!
//! Scan replies follow `[<id>:] [stream:] (OK | <signature> FOUND | <message> ERROR)`.
//! The request number only appears inside a session.

use clamwire_core::{ClamdError, ScanResult, Verdict, VersionInfo};

use crate::protocol::Operation;

const MARKER: &str = "stream:";
const FOUND: &str = "FOUND";
const ERROR: &str = "ERROR";
const SIZE_LIMIT: &str = "size limit exceeded";
const COMMANDS_SEPARATOR: &str = "| COMMANDS:";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    RequestId,
    Whitespace,
    Marker,
    Verdict,
}

/// Character-driven scan reply decoder. States sit on a stack and each one
/// either consumes the current character or pops itself and hands it on.
#[derive(Debug)]
pub struct ResponseParser {
    operation: Operation,
    stack: Vec<State>,
    consumed: String,
    digits: String,
    marker: String,
    request_id: Option<u64>,
    streamed: bool,
    body: String,
    verdict: Option<Verdict>,
}

impl ResponseParser {
    #[must_use]
    pub fn new(operation: Operation) -> Self {
        Self {
            operation,
            stack: vec![
                State::Verdict,
                State::Whitespace,
                State::Marker,
                State::Whitespace,
                State::RequestId,
            ],
            consumed: String::new(),
            digits: String::new(),
            marker: String::new(),
            request_id: None,
            streamed: false,
            body: String::new(),
            verdict: None,
        }
    }

    /// Feed decoded reply text.
    ///
    /// # Errors
    ///
    /// Returns `ResponseParse` if the request number does not fit a `u64`.
    pub fn feed(&mut self, text: &str) -> Result<(), ClamdError> {
        for c in text.chars() {
            self.consumed.push(c);
            self.step(c)?;
        }
        Ok(())
    }

    fn step(&mut self, c: char) -> Result<(), ClamdError> {
        loop {
            let Some(&state) = self.stack.last() else {
                return Err(ClamdError::parse("trailing input", &self.consumed));
            };
            match state {
                State::RequestId => {
                    if c.is_ascii_digit() {
                        self.digits.push(c);
                        return Ok(());
                    }
                    self.stack.pop();
                    if c == ':' && !self.digits.is_empty() {
                        let id = self.digits.parse().map_err(|_| {
                            ClamdError::parse("request number out of range", &self.consumed)
                        })?;
                        self.request_id = Some(id);
                        self.digits.clear();
                        return Ok(());
                    }
                    if !self.digits.is_empty() {
                        // Not a request number after all: the digits open the body.
                        self.body = std::mem::take(&mut self.digits);
                        self.stack.truncate(1);
                    }
                }
                State::Whitespace => {
                    if c.is_whitespace() {
                        return Ok(());
                    }
                    self.stack.pop();
                }
                State::Marker => {
                    self.marker.push(c);
                    if self.marker == MARKER {
                        self.streamed = true;
                        self.stack.pop();
                        return Ok(());
                    }
                    if MARKER.starts_with(&self.marker) {
                        return Ok(());
                    }
                    self.marker.pop();
                    self.body.push_str(&self.marker);
                    self.stack.truncate(1);
                }
                State::Verdict => {
                    self.body.push(c);
                    return Ok(());
                }
            }
        }
    }

    /// Whether the scan came back clean.
    ///
    /// # Errors
    ///
    /// Returns `IllegalState` until [`finish`](Self::finish) has decided the
    /// verdict.
    pub fn is_ok(&self) -> Result<bool, ClamdError> {
        self.verdict
            .as_ref()
            .map(|v| matches!(v, Verdict::Clean))
            .ok_or(ClamdError::IllegalState("scan result read before parsing completed"))
    }

    /// End of input: decide the verdict.
    ///
    /// # Errors
    ///
    /// Returns `SizeLimitExceeded` or `Scan` for an `ERROR` reply and
    /// `ResponseParse` for anything outside the grammar.
    pub fn finish(&mut self) -> Result<ScanResult, ClamdError> {
        // Partial tokens left on the stack belong to the body.
        match self.stack.last() {
            Some(State::RequestId) if !self.digits.is_empty() => {
                self.body = std::mem::take(&mut self.digits);
            }
            Some(State::Marker) if !self.marker.is_empty() => {
                self.body = std::mem::take(&mut self.marker);
            }
            _ => {}
        }

        let body = self.body.trim();
        let verdict = if body == "OK" {
            Verdict::Clean
        } else if let Some(signature) = strip_keyword(body, FOUND) {
            if signature.is_empty() {
                return Err(ClamdError::parse("FOUND without a signature", &self.consumed));
            }
            Verdict::Found(signature.to_string())
        } else if let Some(message) = strip_keyword(body, ERROR) {
            return Err(self.error_reply(message));
        } else {
            let reason = if self.streamed {
                "expected OK, FOUND or ERROR after stream marker"
            } else {
                "expected stream reply or ERROR"
            };
            return Err(ClamdError::parse(reason, &self.consumed));
        };

        self.verdict = Some(verdict.clone());
        Ok(ScanResult {
            request_id: self.request_id,
            verdict,
        })
    }

    fn error_reply(&self, message: &str) -> ClamdError {
        let message = message
            .strip_prefix(self.operation.name())
            .map_or(message, |rest| rest.trim_start_matches(':'))
            .trim()
            .to_string();
        // Assumes clamd's wording for StreamMaxLength; other wording falls through to Scan.
        if message.to_ascii_lowercase().contains(SIZE_LIMIT) {
            ClamdError::SizeLimitExceeded { message }
        } else {
            ClamdError::Scan { message }
        }
    }
}

/// `"<text> KEYWORD"` (or just `"KEYWORD"`) to the trimmed text.
fn strip_keyword<'a>(body: &'a str, keyword: &str) -> Option<&'a str> {
    let head = body.strip_suffix(keyword)?;
    if head.is_empty() || head.ends_with(char::is_whitespace) {
        Some(head.trim())
    } else {
        None
    }
}

/// Parse a complete scan reply for `operation`.
///
/// # Errors
///
/// See [`ResponseParser::finish`].
pub fn parse_scan_reply(operation: Operation, text: &str) -> Result<ScanResult, ClamdError> {
    let mut parser = ResponseParser::new(operation);
    parser.feed(text)?;
    parser.finish()
}

/// Split the `<n>: ` prefix clamd puts on replies inside a session.
#[must_use]
pub fn split_request_id(text: &str) -> (Option<u64>, &str) {
    if let Some((head, rest)) = text.split_once(':') {
        if !head.is_empty() && head.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(id) = head.parse() {
                return (Some(id), rest.trim_start());
            }
        }
    }
    (None, text)
}

/// Check a reply that must equal `expected`, ignoring any request number.
///
/// # Errors
///
/// Returns `UnexpectedReply` if it does not match.
pub fn expect_literal(operation: Operation, text: &str, expected: &str) -> Result<(), ClamdError> {
    let (_, body) = split_request_id(text);
    if body.trim() == expected {
        Ok(())
    } else {
        Err(ClamdError::UnexpectedReply {
            operation: operation.name(),
            reply: text.to_string(),
        })
    }
}

/// Parse a `VERSION` reply.
///
/// # Errors
///
/// Returns `UnexpectedReply` for an empty reply.
pub fn parse_version(text: &str) -> Result<VersionInfo, ClamdError> {
    let (_, body) = split_request_id(text);
    if body.trim().is_empty() {
        return Err(ClamdError::UnexpectedReply {
            operation: Operation::Version.name(),
            reply: text.to_string(),
        });
    }
    Ok(VersionInfo::parse(body))
}

/// Parse a `VERSIONCOMMANDS` reply into the version and the command names.
///
/// # Errors
///
/// Returns `UnexpectedReply` if the command list is missing.
pub fn parse_version_commands(text: &str) -> Result<(VersionInfo, Vec<String>), ClamdError> {
    let (_, body) = split_request_id(text);
    let Some((version, commands)) = body.split_once(COMMANDS_SEPARATOR) else {
        return Err(ClamdError::UnexpectedReply {
            operation: Operation::VersionCommands.name(),
            reply: text.to_string(),
        });
    };
    let commands = commands.split_whitespace().map(String::from).collect();
    Ok((VersionInfo::parse(version), commands))
}
