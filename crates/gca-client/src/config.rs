//! Client configuration: same `clap`-over-`toml` overlay as the server's
//! `Config`, with this protocol's client-side defaults instead.

use std::path::{Path, PathBuf};

use clap::Parser;
use serde::Deserialize;

#[derive(Parser)]
#[command(name = "gca-client", about = "GCA energy-reporting client")]
pub struct Cli {
    /// Path to a TOML config file; CLI flags below override its values.
    #[arg(short, long, default_value = "gca-client.toml")]
    pub config: PathBuf,

    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    #[arg(long)]
    pub csv_path: Option<PathBuf>,

    /// Use the test tick period (50ms) and test sync-every count instead
    /// of the production values.
    #[arg(long)]
    pub test_timing: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_csv_path")]
    pub csv_path: PathBuf,
    #[serde(default = "default_watchdog_timeout_secs")]
    pub watchdog_timeout_secs: u64,
    #[serde(default)]
    pub test_timing: bool,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./client-data")
}
fn default_csv_path() -> PathBuf {
    PathBuf::from("./energy_data.csv")
}
fn default_watchdog_timeout_secs() -> u64 {
    86_400
}

impl Default for Config {
    fn default() -> Self {
        Config {
            data_dir: default_data_dir(),
            csv_path: default_csv_path(),
            watchdog_timeout_secs: default_watchdog_timeout_secs(),
            test_timing: false,
        }
    }
}

impl Config {
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
        if let Some(path) = &cli.csv_path {
            self.csv_path = path.clone();
        }
        if cli.test_timing {
            self.test_timing = true;
        }
        self
    }

    /// §4.6: 60s in production, 50ms in tests.
    pub fn tick_period(&self) -> std::time::Duration {
        if self.test_timing {
            std::time::Duration::from_millis(50)
        } else {
            std::time::Duration::from_secs(60)
        }
    }

    /// §4.6: sync every 300 ticks, biased to ~280 so the first sync
    /// lands roughly 20 minutes after boot rather than immediately.
    pub fn ticks_per_sync(&self) -> u64 {
        300
    }

    pub fn initial_tick_bias(&self) -> u64 {
        280
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config::load(&dir.path().join("missing.toml")).unwrap();
        assert_eq!(cfg.csv_path, default_csv_path());
    }

    #[test]
    fn production_tick_period_is_sixty_seconds() {
        let cfg = Config::default();
        assert_eq!(cfg.tick_period(), std::time::Duration::from_secs(60));
    }

    #[test]
    fn test_timing_flag_shortens_tick_period() {
        let mut cfg = Config::default();
        cfg.test_timing = true;
        assert_eq!(cfg.tick_period(), std::time::Duration::from_millis(50));
    }
}
