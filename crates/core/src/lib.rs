//! Shared types for the clamwire clamd client - endpoints, scan results,
//! configuration and the error taxonomy. No I/O.

pub mod config;
pub mod error;

use std::fmt;

use serde::Serialize;

pub use config::{Charset, ClientConfig};
pub use error::{classify, ClamdError, Failure, PoolError, Result};

/// A `(host, port)` pair identifying one daemon instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Outcome of scanning one payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", content = "signature", rename_all = "lowercase")]
pub enum Verdict {
    Clean,
    Found(String),
}

/// Parsed reply to a stream scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanResult {
    /// Request number echoed by the daemon inside a session.
    pub request_id: Option<u64>,
    #[serde(flatten)]
    pub verdict: Verdict,
}

impl ScanResult {
    #[must_use]
    pub const fn clean(request_id: Option<u64>) -> Self {
        Self {
            request_id,
            verdict: Verdict::Clean,
        }
    }

    pub fn found(request_id: Option<u64>, signature: impl Into<String>) -> Self {
        Self {
            request_id,
            verdict: Verdict::Found(signature.into()),
        }
    }

    #[must_use]
    pub const fn is_ok(&self) -> bool {
        matches!(self.verdict, Verdict::Clean)
    }

    /// Malware signature name, present only when the scan was not ok.
    #[must_use]
    pub fn signature(&self) -> Option<&str> {
        match &self.verdict {
            Verdict::Clean => None,
            Verdict::Found(name) => Some(name),
        }
    }
}

/// Daemon version banner, split into its parts when it has the usual
/// `ClamAV <engine>/<db version>/<db date>` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VersionInfo {
    pub raw: String,
    pub engine: Option<String>,
    pub database_version: Option<u64>,
    pub database_date: Option<String>,
}

impl VersionInfo {
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        let mut info = Self {
            raw: raw.to_string(),
            engine: None,
            database_version: None,
            database_date: None,
        };
        let Some(rest) = raw.strip_prefix("ClamAV ") else {
            return info;
        };

        let mut parts = rest.splitn(3, '/');
        info.engine = non_empty(parts.next());
        info.database_version = parts.next().and_then(|s| s.trim().parse().ok());
        info.database_date = non_empty(parts.next());
        info
    }
}

fn non_empty(part: Option<&str>) -> Option<String> {
    part.map(str::trim).filter(|s| !s.is_empty()).map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_banner_split() {
        let info = VersionInfo::parse("ClamAV 1.4.1/27400/Mon Oct  7 08:36:21 2024\n");
        assert_eq!(info.engine.as_deref(), Some("1.4.1"));
        assert_eq!(info.database_version, Some(27400));
        assert_eq!(info.database_date.as_deref(), Some("Mon Oct  7 08:36:21 2024"));
        assert_eq!(info.raw, "ClamAV 1.4.1/27400/Mon Oct  7 08:36:21 2024");
    }

    #[test]
    fn version_without_database() {
        let info = VersionInfo::parse("ClamAV 1.0.0");
        assert_eq!(info.engine.as_deref(), Some("1.0.0"));
        assert_eq!(info.database_version, None);
        assert_eq!(info.database_date, None);
    }

    #[test]
    fn unknown_banner_kept_raw() {
        let info = VersionInfo::parse("something else");
        assert_eq!(info.raw, "something else");
        assert_eq!(info.engine, None);
    }

    #[test]
    fn endpoint_equality_is_by_value() {
        let a = Endpoint::new("127.0.0.1", 3310);
        let b = Endpoint::new(String::from("127.0.0.1"), 3310);
        assert_eq!(a, b);
        assert_ne!(a, Endpoint::new("127.0.0.1", 3311));
        assert_eq!(a.to_string(), "127.0.0.1:3310");
    }

    #[test]
    fn clean_result_has_no_signature() {
        let result = ScanResult::clean(None);
        assert!(result.is_ok());
        assert_eq!(result.signature(), None);
    }

    #[test]
    fn found_result_carries_signature() {
        let result = ScanResult::found(Some(3), "Eicar-Test-Signature");
        assert!(!result.is_ok());
        assert_eq!(result.signature(), Some("Eicar-Test-Signature"));
        assert_eq!(result.request_id, Some(3));
    }

    #[test]
    fn result_serializes_flat() {
        let json = serde_json::to_value(ScanResult::found(None, "Eicar")).unwrap();
        assert_eq!(json["verdict"], "found");
        assert_eq!(json["signature"], "Eicar");
        assert!(json["request_id"].is_null());
    }
}
