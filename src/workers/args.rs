//! Command-line argument parsing and configuration.
//!
//! Supports:
//! - CLI arguments via clap
//! - TOML configuration file (`--config`, or `roomdrop.toml` in the working directory)
//! - Merging CLI with file config (CLI takes precedence)

use crate::core::config::{TransferConfig, DEFAULT_RELAY_URL, DEFAULT_STUN_SERVER};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CONFIG_FILE: &str = "roomdrop.toml";

/// roomdrop - share files with one peer over WebRTC, using a 4-digit room code.
#[derive(Parser, Clone, Debug)]
#[command(author, version, about)]
#[command(propagate_version = true)]
pub struct Args {
    #[command(subcommand)]
    pub mode: Mode,

    /// Signaling relay WebSocket URL.
    #[arg(long, global = true)]
    pub relay: Option<String>,

    /// ICE server URL (repeatable). Defaults to a public STUN server.
    #[arg(long = "ice-server", global = true)]
    pub ice_servers: Vec<String>,

    /// Chunk size in bytes.
    #[arg(long, global = true)]
    pub chunk_size: Option<usize>,

    /// Maximum unflushed bytes on the data channel before the sender waits.
    #[arg(long, global = true)]
    pub high_water_mark: Option<usize>,

    /// Seconds without data before an inbound transfer is abandoned.
    #[arg(long, global = true)]
    pub stall_timeout_secs: Option<u64>,

    /// TOML configuration file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Clone, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Open a room and serve files to whoever joins it.
    Host {
        /// Files to offer.
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Join a room by code and download what the host offers.
    Join {
        /// 4-digit room code.
        code: String,

        /// Directory received files are written to.
        #[arg(long)]
        out: Option<PathBuf>,

        /// Download only this file (repeatable). Without it, everything is downloaded.
        #[arg(long = "only")]
        only: Vec<String>,
    },
}

/// Settings read from the TOML file. Every key is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub relay: Option<String>,
    pub ice_servers: Option<Vec<String>>,
    pub out_dir: Option<PathBuf>,
    pub verbose: Option<u8>,
    pub transfer: TransferConfig,
}

/// Effective settings after merging file and CLI.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub relay_url: String,
    pub ice_servers: Vec<String>,
    pub out_dir: PathBuf,
    pub verbose: u8,
    pub transfer: TransferConfig,
}

impl Args {
    pub fn load() -> Self {
        Args::parse()
    }

    /// Read the config file (if any) and apply CLI overrides on top.
    pub fn settings(&self) -> Result<Settings> {
        let file = match &self.config {
            Some(path) => Self::from_file(path)?,
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_FILE);
                if default_path.exists() {
                    Self::from_file(default_path)?
                } else {
                    FileConfig::default()
                }
            }
        };
        Ok(self.merge(file))
    }

    fn from_file(path: &Path) -> Result<FileConfig> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("cannot read config file {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("invalid config file {}", path.display()))
    }

    /// Merge file config with CLI args (CLI takes precedence).
    fn merge(&self, file: FileConfig) -> Settings {
        let mut transfer = file.transfer;
        if let Some(chunk_size) = self.chunk_size {
            transfer.chunk_size = chunk_size;
        }
        if let Some(high_water_mark) = self.high_water_mark {
            transfer.high_water_mark = high_water_mark;
        }
        if let Some(secs) = self.stall_timeout_secs {
            transfer.stall_timeout = Duration::from_secs(secs);
        }

        let ice_servers = if !self.ice_servers.is_empty() {
            self.ice_servers.clone()
        } else {
            file.ice_servers
                .filter(|servers| !servers.is_empty())
                .unwrap_or_else(|| vec![DEFAULT_STUN_SERVER.to_string()])
        };

        let cli_out = match &self.mode {
            Mode::Join { out, .. } => out.clone(),
            Mode::Host { .. } => None,
        };

        Settings {
            relay_url: self
                .relay
                .clone()
                .or(file.relay)
                .unwrap_or_else(|| DEFAULT_RELAY_URL.to_string()),
            ice_servers,
            out_dir: cli_out
                .or(file.out_dir)
                .unwrap_or_else(|| PathBuf::from(".")),
            verbose: if self.verbose > 0 {
                self.verbose
            } else {
                file.verbose.unwrap_or(0)
            },
            transfer: transfer.sanitized(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> Args {
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn host_requires_files() {
        assert!(Args::try_parse_from(["roomdrop", "host"]).is_err());
        let args = parse(&["roomdrop", "host", "a.txt", "b.txt"]);
        assert_eq!(
            args.mode,
            Mode::Host {
                files: vec![PathBuf::from("a.txt"), PathBuf::from("b.txt")]
            }
        );
    }

    #[test]
    fn join_with_options() {
        let args = parse(&[
            "roomdrop", "join", "4821", "--out", "downloads", "--only", "a.txt", "-vv",
        ]);
        assert_eq!(args.verbose, 2);
        match args.mode {
            Mode::Join { code, out, only } => {
                assert_eq!(code, "4821");
                assert_eq!(out, Some(PathBuf::from("downloads")));
                assert_eq!(only, vec!["a.txt".to_string()]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn defaults_without_file() {
        let settings = parse(&["roomdrop", "join", "1234"]).merge(FileConfig::default());
        assert_eq!(settings.relay_url, DEFAULT_RELAY_URL);
        assert_eq!(settings.ice_servers, vec![DEFAULT_STUN_SERVER.to_string()]);
        assert_eq!(settings.out_dir, PathBuf::from("."));
        assert_eq!(settings.transfer, TransferConfig::default());
    }

    #[test]
    fn cli_overrides_file() {
        let file: FileConfig = toml::from_str(
            r#"
            relay = "ws://relay.example:5000/ws"
            out_dir = "inbox"
            verbose = 1

            [transfer]
            chunk_size = 32768
            high_water_mark = 1048576
            "#,
        )
        .unwrap();

        let args = parse(&[
            "roomdrop",
            "--chunk-size",
            "16384",
            "--stall-timeout-secs",
            "5",
            "join",
            "1234",
        ]);
        let settings = args.merge(file);

        assert_eq!(settings.relay_url, "ws://relay.example:5000/ws");
        assert_eq!(settings.out_dir, PathBuf::from("inbox"));
        assert_eq!(settings.verbose, 1);
        assert_eq!(settings.transfer.chunk_size, 16384);
        assert_eq!(settings.transfer.high_water_mark, 1048576);
        assert_eq!(settings.transfer.stall_timeout, Duration::from_secs(5));
    }

    #[test]
    fn config_file_is_read() {
        let dir = std::env::temp_dir().join("roomdrop_test").join("args");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("roomdrop.toml");
        std::fs::write(&path, "ice_servers = [\"stun:stun.example:3478\"]\n").unwrap();

        let args = parse(&["roomdrop", "--config", path.to_str().unwrap(), "host", "x"]);
        let settings = args.settings().unwrap();
        assert_eq!(settings.ice_servers, vec!["stun:stun.example:3478".to_string()]);

        std::fs::write(&path, "relay = [").unwrap();
        assert!(args.settings().is_err());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
