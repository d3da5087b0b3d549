//! Server configuration: a `clap`-parsed CLI overlay on a `toml` file,
//! in the style of `aura-cli`'s `--config` flag.

use std::path::{Path, PathBuf};

use clap::Parser;
use serde::Deserialize;

#[derive(Parser)]
#[command(name = "gca-server", about = "GCA energy-reporting server")]
pub struct Cli {
    /// Path to a TOML config file; CLI flags below override its values.
    #[arg(short, long, default_value = "gca-server.toml")]
    pub config: PathBuf,

    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    #[arg(long)]
    pub http_port: Option<u16>,

    #[arg(long)]
    pub tcp_port: Option<u16>,

    #[arg(long)]
    pub udp_port: Option<u16>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default = "default_tcp_port")]
    pub tcp_port: u16,
    #[serde(default = "default_udp_port")]
    pub udp_port: u16,
    #[serde(default = "default_rotation_interval_secs")]
    pub rotation_interval_secs: u64,
    #[serde(default = "default_watchdog_timeout_secs")]
    pub watchdog_timeout_secs: u64,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn default_http_port() -> u16 {
    35000
}
fn default_tcp_port() -> u16 {
    35010
}
fn default_udp_port() -> u16 {
    35030
}
fn default_rotation_interval_secs() -> u64 {
    3600
}
fn default_watchdog_timeout_secs() -> u64 {
    86_400
}

impl Default for Config {
    fn default() -> Self {
        Config {
            data_dir: default_data_dir(),
            http_port: default_http_port(),
            tcp_port: default_tcp_port(),
            udp_port: default_udp_port(),
            rotation_interval_secs: default_rotation_interval_secs(),
            watchdog_timeout_secs: default_watchdog_timeout_secs(),
        }
    }
}

impl Config {
    /// Load `path` if present, falling back to defaults when it's missing
    /// (a fresh deployment shouldn't need to hand-author a config file
    /// before its first run).
    pub fn load(path: &Path) -> anyhow::Result<Config> {
        if !path.exists() {
            return Ok(Config::default());
        }
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }

    pub fn apply_cli(mut self, cli: &Cli) -> Config {
        if let Some(dir) = &cli.data_dir {
            self.data_dir = dir.clone();
        }
        if let Some(port) = cli.http_port {
            self.http_port = port;
        }
        if let Some(port) = cli.tcp_port {
            self.tcp_port = port;
        }
        if let Some(port) = cli.udp_port {
            self.udp_port = port;
        }
        self
    }
}
