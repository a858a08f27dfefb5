//! Rebalancer configuration
//!
//! Loaded from a TOML file, with secrets overridable from the environment.
//!
//! ```toml
//! hosts = ["192.168.101.106", "192.168.101.108", "192.168.101.110"]
//! port = 8123
//! username = "default"
//! data_dir = "/data01/clickhouse"
//! table = "nginx_access_log"
//! os_user = "root"
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {error}")]
    Read {
        path: PathBuf,
        error: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Cluster topology, credentials and the table to rebalance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebalancerConfig {
    /// Storage node hosts, in collection order
    pub hosts: Vec<String>,

    /// Catalog HTTP port on every host
    #[serde(default = "default_port")]
    pub port: u16,

    /// Catalog user
    #[serde(default = "default_username")]
    pub username: String,

    /// Catalog password
    #[serde(default)]
    pub password: String,

    /// Database holding the table
    #[serde(default = "default_database")]
    pub database: String,

    /// Base data directory of the storage engine on every host
    pub data_dir: String,

    /// Table to rebalance
    pub table: String,

    /// OS user for remote commands
    #[serde(default = "default_os_user")]
    pub os_user: String,

    /// OS password; key-based auth is used when absent
    #[serde(default)]
    pub os_password: Option<String>,

    /// SSH port on every host
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,

    /// Plan only, never move data
    #[serde(default)]
    pub dry_run: bool,
}

fn default_port() -> u16 {
    8123
}

fn default_username() -> String {
    "default".to_string()
}

fn default_database() -> String {
    "default".to_string()
}

fn default_os_user() -> String {
    "root".to_string()
}

fn default_ssh_port() -> u16 {
    22
}

impl Default for RebalancerConfig {
    fn default() -> Self {
        Self {
            hosts: Vec::new(),
            port: default_port(),
            username: default_username(),
            password: String::new(),
            database: default_database(),
            data_dir: String::new(),
            table: String::new(),
            os_user: default_os_user(),
            os_password: None,
            ssh_port: default_ssh_port(),
            dry_run: false,
        }
    }
}

impl RebalancerConfig {
    /// Load configuration from a TOML file and apply environment overrides
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|error| ConfigError::Read {
            path: path.to_path_buf(),
            error,
        })?;

        let mut config = Self::from_toml_str(&content)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from TOML text without validating it
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Replace secrets with `CKBALANCE_PASSWORD` / `CKBALANCE_OS_PASSWORD` when set
    pub fn apply_env_overrides(&mut self) {
        if let Ok(password) = std::env::var("CKBALANCE_PASSWORD") {
            self.password = password;
        }
        if let Ok(os_password) = std::env::var("CKBALANCE_OS_PASSWORD") {
            self.os_password = Some(os_password);
        }
    }

    /// Check the topology and names before any connection is attempted
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hosts.is_empty() {
            return Err(ConfigError::InvalidValue(
                "hosts".to_string(),
                "at least one host is required".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for host in &self.hosts {
            if host.trim().is_empty() {
                return Err(ConfigError::InvalidValue(
                    "hosts".to_string(),
                    "empty host name".to_string(),
                ));
            }
            if !seen.insert(host.as_str()) {
                return Err(ConfigError::InvalidValue(
                    "hosts".to_string(),
                    format!("duplicate host {}", host),
                ));
            }
        }

        if !is_safe_path(&self.data_dir) {
            return Err(ConfigError::InvalidValue(
                "data_dir".to_string(),
                format!("{:?} is not an absolute path of plain components", self.data_dir),
            ));
        }

        if self.os_user.is_empty()
            || !self
                .os_user
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        {
            return Err(ConfigError::InvalidValue(
                "os_user".to_string(),
                format!("{:?} is not a plain user name", self.os_user),
            ));
        }

        for (key, value) in [("database", &self.database), ("table", &self.table)] {
            if !is_identifier(value) {
                return Err(ConfigError::InvalidValue(
                    key.to_string(),
                    format!("{:?} is not a plain identifier", value),
                ));
            }
        }

        Ok(())
    }

    /// Directory where detached partitions of the table are staged
    pub fn staging_dir(&self) -> String {
        format!(
            "{}/data/{}/{}/detached",
            self.data_dir.trim_end_matches('/'),
            self.database,
            self.table
        )
    }
}

/// Absolute path made of alphanumerics, `/`, `.`, `_` and `-`; it is spliced
/// into remote shell commands unquoted
fn is_safe_path(value: &str) -> bool {
    value.starts_with('/')
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '_' | '-'))
}

fn is_identifier(value: &str) -> bool {
    !value.is_empty()
        && !value.starts_with(|c: char| c.is_ascii_digit())
        && value.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}
