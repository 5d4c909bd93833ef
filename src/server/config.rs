//! Configuration types and constants for the v3kn server.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

/// Per-user byte budget across savedata and trophy uploads.
pub(crate) const QUOTA_TOTAL: u64 = 50 * 1024 * 1024;
/// Largest request body accepted anywhere (save uploads dominate).
pub(crate) const MAX_BODY_SIZE: usize = 100 * 1024 * 1024;
pub(crate) const MAX_AVATAR_SIZE: usize = 2 * 1024 * 1024;
pub(crate) const MAX_AVATAR_DIM: u32 = 128;
/// How long a long poll may hold its worker before returning empty.
pub(crate) const POLL_BUDGET: Duration = Duration::from_secs(30);

/// Back-end network service for the Vita3K emulator community.
///
/// Configuration can be set via CLI arguments or environment variables.
/// CLI arguments take precedence over environment variables.
#[derive(Parser, Debug)]
#[command(name = "v3kn", version, about)]
pub struct Cli {
    /// HTTP server bind address [env: V3KN_BIND] [default: 0.0.0.0:3000]
    #[arg(long, short = 'b')]
    pub bind: Option<String>,

    /// Data directory holding the v3kn tree and log files [env: V3KN_DATA_DIR] [default: .]
    #[arg(long, short = 'd')]
    pub data_dir: Option<PathBuf>,
}

pub struct Config {
    pub bind_addr: String,
    pub data_dir: PathBuf,
}

impl Config {
    pub fn from_cli_and_env(cli: Cli) -> Self {
        let bind_addr = cli
            .bind
            .or_else(|| std::env::var("V3KN_BIND").ok())
            .unwrap_or_else(|| "0.0.0.0:3000".to_string());

        let data_dir = cli
            .data_dir
            .or_else(|| std::env::var("V3KN_DATA_DIR").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("."));

        Self {
            bind_addr,
            data_dir,
        }
    }
}
