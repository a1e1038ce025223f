//! CLI argument parsing.

use std::path::PathBuf;

use clamwire_core::ClientConfig;
use clap::{Parser, Subcommand};
use eyre::WrapErr;

fn chunk_size_in_range(s: &str) -> Result<usize, String> {
    let val: usize = s.parse().map_err(|e| format!("{e}"))?;
    if val > 0 && u32::try_from(val).is_ok() {
        Ok(val)
    } else {
        Err(format!("chunk size must be between 1 and {}, got {val}", u32::MAX))
    }
}

#[derive(Parser)]
#[command(name = "clamwire", about = "Talk to a clamd daemon over TCP")]
pub struct Cli {
    /// Daemon host
    #[arg(long, env = "CLAMWIRE_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Daemon port
    #[arg(long, env = "CLAMWIRE_PORT", default_value = "3310")]
    pub port: u16,

    /// Client config file (default: ~/.config/clamwire/client.toml)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Resends allowed after a broken pipe or connection reset
    #[arg(long)]
    pub retries: Option<u32>,

    /// Payload bytes per stream frame
    #[arg(long, value_parser = chunk_size_in_range)]
    pub chunk_size: Option<usize>,

    /// Print results as JSON
    #[arg(long)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    /// File config (or defaults) with command-line overrides applied.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file cannot be loaded or the result is
    /// invalid.
    pub fn resolve_config(&self) -> eyre::Result<ClientConfig> {
        let mut config = match &self.config {
            Some(path) => ClientConfig::load(path)?,
            None => ClientConfig::load_default()?,
        };
        if let Some(retries) = self.retries {
            config.max_retries = retries;
        }
        if let Some(chunk_size) = self.chunk_size {
            config.chunk_size = chunk_size;
        }
        config.validate().wrap_err("invalid command-line overrides")?;
        Ok(config)
    }
}

#[derive(Subcommand)]
pub enum Command {
    /// Check that the daemon answers PONG
    Ping,
    /// Show engine and signature database versions
    Version,
    /// List the commands the daemon accepts
    Commands,
    /// Dump daemon statistics
    Stats,
    /// Reload signature databases
    Reload,
    /// Stream files (or stdin) to the daemon; exit 1 if anything is found
    Scan {
        /// Files to scan; reads stdin when omitted
        #[arg(value_name = "FILE")]
        files: Vec<PathBuf>,
    },
}
