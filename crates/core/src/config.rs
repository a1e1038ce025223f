//! Client configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use eyre::WrapErr;
use serde::Deserialize;

const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 3000;
const DEFAULT_READ_TIMEOUT_MS: u64 = 3000;
const DEFAULT_MAX_CONNECTIONS: usize = 10;
const DEFAULT_CHUNK_SIZE: usize = 2048;

/// Text encoding used for command headers and daemon replies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum Charset {
    #[default]
    #[serde(rename = "utf-8", alias = "utf8", alias = "UTF-8")]
    Utf8,
    #[serde(rename = "iso-8859-1", alias = "latin1", alias = "ISO-8859-1")]
    Latin1,
}

impl Charset {
    /// Encode header text. Characters outside Latin-1 become `?`.
    #[must_use]
    pub fn encode(self, text: &str) -> Vec<u8> {
        match self {
            Self::Utf8 => text.as_bytes().to_vec(),
            Self::Latin1 => text
                .chars()
                .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
                .collect(),
        }
    }

    /// Decode daemon reply bytes.
    #[must_use]
    pub fn decode(self, bytes: &[u8]) -> String {
        match self {
            Self::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
            Self::Latin1 => bytes.iter().map(|&b| char::from(b)).collect(),
        }
    }
}

/// Factory-level client settings. Every field has a default, so a TOML file
/// only needs the values it overrides.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    /// Pooled connections per endpoint.
    pub max_connections: usize,
    pub charset: Charset,
    /// Payload bytes per stream frame.
    pub chunk_size: usize,
    /// Bound on waiting for a pooled connection. `None` waits forever.
    pub command_timeout_ms: Option<u64>,
    /// Extra attempts after a broken pipe or connection reset.
    pub max_retries: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            read_timeout_ms: DEFAULT_READ_TIMEOUT_MS,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            charset: Charset::default(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            command_timeout_ms: None,
            max_retries: 0,
        }
    }
}

impl ClientConfig {
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    #[must_use]
    pub const fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    #[must_use]
    pub fn command_timeout(&self) -> Option<Duration> {
        self.command_timeout_ms.map(Duration::from_millis)
    }

    /// Reject settings the pool and framing cannot honour.
    ///
    /// # Errors
    ///
    /// Returns an error if `max_connections` is zero or `chunk_size` does not
    /// fit a frame length.
    pub fn validate(&self) -> crate::Result<()> {
        if self.max_connections == 0 {
            return Err(eyre::eyre!("max_connections must be at least 1"));
        }
        if self.chunk_size == 0 || u32::try_from(self.chunk_size).is_err() {
            return Err(eyre::eyre!(
                "chunk_size must be between 1 and {}, got {}",
                u32::MAX,
                self.chunk_size
            ));
        }
        Ok(())
    }

    /// Parse a TOML document.
    ///
    /// # Errors
    ///
    /// Returns an error on malformed TOML, unknown keys or invalid values.
    pub fn from_toml_str(content: &str) -> crate::Result<Self> {
        let config: Self = toml::from_str(content).wrap_err("invalid client config")?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML config file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("failed to read {}", path.display()))?;
        Self::from_toml_str(&content).wrap_err_with(|| format!("in {}", path.display()))
    }

    /// Load `~/.config/clamwire/client.toml`, or defaults when it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_default() -> crate::Result<Self> {
        match default_config_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }
}

fn default_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|p| p.join(".config").join("clamwire").join("client.toml"))
}
