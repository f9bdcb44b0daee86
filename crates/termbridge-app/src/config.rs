use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

use termbridge_terminal::TerminalConfig;

use crate::cli::Cli;

/// HTTP/WebSocket listener settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    /// Frames queued per connection before forwarders wait on the socket
    pub outbound_queue: usize,
    /// When false, DELETE /sessions/:id leaves the session to the idle reaper
    pub allow_rest_delete: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 8080,
            outbound_queue: 1024,
            allow_rest_delete: true,
        }
    }
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.bind, self.port)
            .parse()
            .with_context(|| format!("invalid bind address '{}:{}'", self.bind, self.port))
    }
}

/// Full configuration: defaults, then the TOML file, then CLI/env overrides
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub terminal: TerminalConfig,
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_toml_str(&text)
            .with_context(|| format!("invalid config file {}", path.display()))
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn from_cli(cli: &Cli) -> Result<Self> {
        let mut config = match &cli.config {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        config.apply_cli(cli);
        config.validate()?;
        Ok(config)
    }

    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(bind) = &cli.bind {
            self.server.bind = bind.clone();
        }
        if let Some(port) = cli.port {
            self.server.port = port;
        }
        if cli.no_rest_delete {
            self.server.allow_rest_delete = false;
        }

        let terminal = &mut self.terminal;
        if let Some(shell) = &cli.shell {
            terminal.shell = Some(shell.clone());
        }
        if let Some(cwd) = &cli.cwd {
            terminal.working_dir = Some(cwd.clone());
        }
        if let Some(max) = cli.max_sessions {
            terminal.max_sessions = max;
        }
        if let Some(secs) = cli.idle_timeout {
            terminal.idle_timeout_secs = secs;
        }
        if let Some(secs) = cli.sweep_interval {
            terminal.sweep_interval_secs = secs;
        }
        if let Some(dir) = &cli.transcript_dir {
            terminal.transcript_dir = Some(dir.clone());
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.server.socket_addr()?;
        ensure!(
            self.terminal.max_sessions > 0,
            "terminal.max_sessions must be at least 1"
        );
        ensure!(
            self.terminal.default_dimensions().is_valid(),
            "terminal.default_rows and terminal.default_cols must be non-zero"
        );
        if let Some(dir) = &self.terminal.working_dir {
            ensure!(dir.is_dir(), "working directory {} does not exist", dir.display());
        }
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("failed to render configuration")
    }
}
