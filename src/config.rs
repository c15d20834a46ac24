//! Configuration (`spec.md` §6 "Configuration keys consumed";
//! `SPEC_FULL.md` ambient-stack addition): a TOML file merged with CLI
//! overrides via `clap`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;

fn default_cache_size() -> u64 {
    512 * 1024 * 1024
}

fn default_lease_break_timeout() -> u64 {
    35
}

fn default_grace_period() -> u64 {
    90
}

fn default_max_locks_per_file() -> usize {
    10_000
}

fn default_max_locks_per_client() -> usize {
    100_000
}

fn default_max_locks_total() -> usize {
    1_000_000
}

fn default_upload_workers() -> usize {
    4
}

fn default_download_workers() -> usize {
    4
}

fn default_bind_addr() -> String {
    "0.0.0.0:2049".into()
}

fn default_log_filter() -> String {
    "info".into()
}

#[derive(Debug, Deserialize)]
pub struct CacheConfig {
    pub path: PathBuf,
    #[serde(default = "default_cache_size")]
    pub size: u64,
}

#[derive(Debug, Deserialize)]
pub struct LockConfig {
    #[serde(default = "default_lease_break_timeout")]
    pub lease_break_timeout: u64,
    #[serde(default = "default_grace_period")]
    pub grace_period: u64,
    #[serde(default = "default_max_locks_per_file")]
    pub max_locks_per_file: usize,
    #[serde(default = "default_max_locks_per_client")]
    pub max_locks_per_client: usize,
    #[serde(default = "default_max_locks_total")]
    pub max_locks_total: usize,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lease_break_timeout: default_lease_break_timeout(),
            grace_period: default_grace_period(),
            max_locks_per_file: default_max_locks_per_file(),
            max_locks_per_client: default_max_locks_per_client(),
            max_locks_total: default_max_locks_total(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct PayloadWorkersConfig {
    #[serde(default = "default_upload_workers")]
    pub uploads: usize,
    #[serde(default = "default_download_workers")]
    pub downloads: usize,
}

impl Default for PayloadWorkersConfig {
    fn default() -> Self {
        Self { uploads: default_upload_workers(), downloads: default_download_workers() }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct PayloadConfig {
    #[serde(default)]
    pub workers: PayloadWorkersConfig,
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    pub export_path: PathBuf,
}

#[derive(Debug, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { filter: default_log_filter() }
    }
}

#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub cache: CacheConfig,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub payload: PayloadConfig,
    #[serde(default)]
    pub log: LogConfig,
}

impl Config {
    pub fn load(path: &std::path::Path) -> crate::error::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        toml::from_str(&raw).map_err(|e| crate::error::Error::InvalidArgument(e.to_string()))
    }

    pub fn bind_addr(&self) -> crate::error::Result<SocketAddr> {
        self.server
            .bind_addr
            .parse()
            .map_err(|_| crate::error::Error::InvalidArgument(format!("invalid bind_addr: {}", self.server.bind_addr)))
    }

    pub fn lease_break_timeout(&self) -> Duration {
        Duration::from_secs(self.lock.lease_break_timeout)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.lock.grace_period)
    }
}

/// CLI overrides (`SPEC_FULL.md`): a config file path plus a handful of
/// flags that shadow the matching TOML keys.
#[derive(Debug, Parser)]
#[command(name = "dittofs", about = "DittoFS storage core")]
pub struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "/etc/dittofs/dittofs.toml")]
    pub config: PathBuf,

    /// Overrides `server.bind_addr`.
    #[arg(long)]
    pub bind_addr: Option<String>,

    /// Overrides `log.filter`.
    #[arg(long)]
    pub log_filter: Option<String>,
}

impl Cli {
    pub fn load_config(&self) -> crate::error::Result<Config> {
        let mut config = Config::load(&self.config)?;
        if let Some(bind_addr) = &self.bind_addr {
            config.server.bind_addr = bind_addr.clone();
        }
        if let Some(filter) = &self.log_filter {
            config.log.filter = filter.clone();
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_toml_with_defaults() {
        let toml = r#"
            [server]
            export_path = "/srv/export"

            [cache]
            path = "/var/lib/dittofs/wal"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.cache.size, default_cache_size());
        assert_eq!(config.lock.grace_period, 90);
        assert_eq!(config.payload.workers.uploads, 4);
        assert_eq!(config.server.bind_addr, "0.0.0.0:2049");
    }

    #[test]
    fn cli_override_replaces_bind_addr() {
        let cli = Cli { config: PathBuf::from("unused"), bind_addr: Some("127.0.0.1:9999".into()), log_filter: None };
        let mut config: Config = toml::from_str(
            r#"
            [server]
            export_path = "/srv/export"
            [cache]
            path = "/tmp/wal"
        "#,
        )
        .unwrap();
        if let Some(bind_addr) = &cli.bind_addr {
            config.server.bind_addr = bind_addr.clone();
        }
        assert_eq!(config.server.bind_addr, "127.0.0.1:9999");
    }
}
