use clap::Parser;
use std::path::PathBuf;

use crate::logging::LogFormat;

/// CLI arguments for termbridge.
///
/// Every flag can also be set through a `TERMBRIDGE_*` environment variable
/// (a `.env` file in the working directory is loaded first). Flags override
/// the config file.
#[derive(Parser, Debug)]
#[command(name = "termbridge")]
#[command(about = "Serve interactive shell sessions over WebSocket and REST")]
#[command(version)]
pub struct Cli {
    /// TOML configuration file
    #[arg(short, long, value_name = "FILE", env = "TERMBRIDGE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Address to bind the server to
    #[arg(long, value_name = "ADDR", env = "TERMBRIDGE_BIND")]
    pub bind: Option<String>,

    /// Port to listen on
    #[arg(short, long, env = "TERMBRIDGE_PORT")]
    pub port: Option<u16>,

    /// Shell to launch for new sessions
    #[arg(long, value_name = "PATH", env = "TERMBRIDGE_SHELL")]
    pub shell: Option<String>,

    /// Working directory for new sessions
    #[arg(long, value_name = "DIR", env = "TERMBRIDGE_CWD")]
    pub cwd: Option<PathBuf>,

    /// Maximum number of concurrent sessions
    #[arg(long, value_name = "N", env = "TERMBRIDGE_MAX_SESSIONS")]
    pub max_sessions: Option<usize>,

    /// Seconds a detached session may stay idle before it is reaped (0 disables)
    #[arg(long, value_name = "SECS", env = "TERMBRIDGE_IDLE_TIMEOUT")]
    pub idle_timeout: Option<u64>,

    /// Seconds between reaper sweeps
    #[arg(long, value_name = "SECS", env = "TERMBRIDGE_SWEEP_INTERVAL")]
    pub sweep_interval: Option<u64>,

    /// Write per-session transcripts into this directory
    #[arg(long, value_name = "DIR", env = "TERMBRIDGE_TRANSCRIPT_DIR")]
    pub transcript_dir: Option<PathBuf>,

    /// Make DELETE /sessions/:id a no-op and leave cleanup to the reaper
    #[arg(long, env = "TERMBRIDGE_NO_REST_DELETE")]
    pub no_rest_delete: bool,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Pretty, env = "TERMBRIDGE_LOG_FORMAT")]
    pub log_format: LogFormat,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    pub print_config: bool,
}
