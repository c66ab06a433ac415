//! Command-line argument parsing and configuration.
//!
//! Supports:
//! - CLI arguments via clap
//! - TOML configuration file, with engine settings under `[engine]`
//! - Merging CLI with file config (CLI takes precedence)

use clap::{Parser, ValueEnum};
use peermesh::core::config::EngineConfig;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

const DEFAULT_FILE_SIZE: u64 = 4 * 1024 * 1024;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 20;

/// Peermesh - two engines negotiating, sharing media and a file.
#[derive(Parser, Deserialize, Clone, Debug)]
#[command(author, version, about)]
#[command(propagate_version = true)]
#[serde(default)]
pub struct Args {
    /// Verbosity level (-v, -vv, -vvv).
    #[clap(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Connection backend for the demo peers.
    #[clap(short, long, value_enum, default_value_t = Backend::Loopback)]
    pub backend: Backend,

    /// Size of the demo file in bytes.
    #[clap(long, default_value_t = DEFAULT_FILE_SIZE)]
    pub file_size: u64,

    /// Override the engine chunk size.
    #[clap(long)]
    pub chunk_size: Option<usize>,

    /// Seconds to wait for the peers to connect.
    #[clap(long, default_value_t = DEFAULT_CONNECT_TIMEOUT_SECS)]
    pub connect_timeout: u64,

    /// Configuration file. Defaults to ./config.toml when present.
    #[clap(long)]
    #[serde(skip)]
    pub conf: Option<PathBuf>,

    #[clap(skip)]
    pub engine: EngineConfig,
}

#[derive(ValueEnum, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// In-process connections with a simulated drain rate.
    Loopback,
    /// Real webrtc-rs peer connections over the host network.
    Webrtc,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            verbose: 0,
            backend: Backend::Loopback,
            file_size: DEFAULT_FILE_SIZE,
            chunk_size: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT_SECS,
            conf: None,
            engine: EngineConfig::default(),
        }
    }
}

impl Args {
    /// Load Args from CLI + TOML file (if it exists).
    /// CLI values override those from the file.
    pub fn load() -> anyhow::Result<Self> {
        let cli_args = Args::parse();

        let path = cli_args
            .conf
            .clone()
            .unwrap_or_else(|| PathBuf::from("config.toml"));
        let mut args = match Self::from_file(&path)? {
            Some(file_args) => Self::merge(file_args, cli_args),
            None => cli_args,
        };

        if let Some(chunk_size) = args.chunk_size {
            args.engine.chunk_size = chunk_size;
        }
        args.engine.validate()?;
        Ok(args)
    }

    /// Load args from a TOML file. A missing file is not an error, a broken one is.
    fn from_file(path: &Path) -> anyhow::Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path)?;
        Ok(Some(Self::parse_toml(&content)?))
    }

    fn parse_toml(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str::<Args>(content)?)
    }

    /// Merge file args with CLI args (CLI takes precedence).
    fn merge(mut file: Args, cli: Args) -> Args {
        if cli.verbose > 0 {
            file.verbose = cli.verbose;
        }
        if cli.backend != Backend::Loopback {
            file.backend = cli.backend;
        }
        if cli.file_size != DEFAULT_FILE_SIZE {
            file.file_size = cli.file_size;
        }
        if cli.chunk_size.is_some() {
            file.chunk_size = cli.chunk_size;
        }
        if cli.connect_timeout != DEFAULT_CONNECT_TIMEOUT_SECS {
            file.connect_timeout = cli.connect_timeout;
        }
        file.conf = cli.conf;
        file
    }
}
