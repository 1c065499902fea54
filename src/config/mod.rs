//! Configuration management for netcluster.
//!
//! A cluster run is described by one flat record: the servers to use, the
//! ssh user, the placement strategy and a handful of tunables. It is read
//! once at startup and never changed while the cluster is up.
//!
//! # Configuration File Location
//!
//! The configuration file is stored at:
//! - Linux: `~/.config/netcluster/config.yml`
//! - macOS: `~/Library/Application Support/netcluster/config.yml`
//!
//! # Example Configuration
//!
//! ```yaml
//! servers:
//!   - name: localhost
//!   - name: ubuntu2
//!     ip: 192.168.94.129
//! user: mininet
//! placement: switch-bin
//! precheck: true
//! control_path: true
//! handshake_timeout_secs: 10
//! migration:
//!   attempts: 3
//!   delay_ms: 10
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::placement::PlacerKind;
use crate::server::LOCALHOST;

/// Default time to wait for the tunnel sentinel byte.
const DEFAULT_HANDSHAKE_TIMEOUT: u64 = 10;

/// Default number of namespace-move attempts per interface.
const DEFAULT_MIGRATION_ATTEMPTS: u32 = 3;

/// Default fixed delay between namespace-move attempts.
const DEFAULT_MIGRATION_DELAY_MS: u64 = 10;

/// Control path pattern used when `control_path: true`.
pub const DEFAULT_CONTROL_PATH: &str = "~/.ssh/mn/%r@%h:%p";

/// Main configuration structure for a cluster run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Servers taking part in the cluster, in placement order
    #[serde(default = "default_servers")]
    pub servers: Vec<ServerConfig>,

    /// SSH user (defaults to SUDO_USER, then the current user)
    #[serde(default)]
    pub user: Option<String>,

    /// Placement strategy
    #[serde(default)]
    pub placement: PlacerKind,

    /// Verify every remote server before creating anything
    #[serde(default = "default_precheck")]
    pub precheck: bool,

    /// Shared ssh connections
    #[serde(default)]
    pub control_path: ControlPath,

    /// Seconds to wait for a tunnel to report readiness
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,

    /// Interface namespace-move retry policy
    #[serde(default)]
    pub migration: MigrationConfig,
}

/// One physical server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Hostname, IP address or `localhost`
    pub name: String,

    /// Address override; resolved from the name when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<Ipv4Addr>,
}

/// Either a plain on/off switch or an explicit ssh `ControlPath` pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ControlPath {
    Enabled(bool),
    Pattern(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationConfig {
    pub attempts: u32,
    pub delay_ms: u64,
}

fn default_servers() -> Vec<ServerConfig> {
    vec![ServerConfig::new(LOCALHOST)]
}

fn default_precheck() -> bool {
    true
}

fn default_handshake_timeout() -> u64 {
    DEFAULT_HANDSHAKE_TIMEOUT
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            servers: default_servers(),
            user: None,
            placement: PlacerKind::default(),
            precheck: default_precheck(),
            control_path: ControlPath::default(),
            handshake_timeout_secs: DEFAULT_HANDSHAKE_TIMEOUT,
            migration: MigrationConfig::default(),
        }
    }
}

impl Default for ControlPath {
    fn default() -> Self {
        ControlPath::Enabled(false)
    }
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_MIGRATION_ATTEMPTS,
            delay_ms: DEFAULT_MIGRATION_DELAY_MS,
        }
    }
}

impl ControlPath {
    /// The ssh `ControlPath` pattern to use, if shared connections are on.
    pub fn pattern(&self) -> Option<String> {
        match self {
            ControlPath::Enabled(false) => None,
            ControlPath::Enabled(true) => Some(DEFAULT_CONTROL_PATH.to_string()),
            ControlPath::Pattern(p) if p.is_empty() => None,
            ControlPath::Pattern(p) => Some(p.clone()),
        }
    }
}

impl ServerConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ip: None,
        }
    }

    pub fn with_ip(mut self, ip: Ipv4Addr) -> Self {
        self.ip = Some(ip);
        self
    }
}

impl ClusterConfig {
    /// Returns the default configuration file path for the current platform.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("netcluster").join("config.yml"))
    }

    /// Loads configuration from the default location.
    ///
    /// Returns `Ok(ClusterConfig::default())` if no config file exists.
    pub fn load() -> Result<Self> {
        match Self::default_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(ClusterConfig::default()),
        }
    }

    /// Loads configuration from a specific file path.
    ///
    /// Returns `Ok(ClusterConfig::default())` if the file doesn't exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(ClusterConfig::default());
        }

        let contents = fs::read_to_string(path).map_err(|e| {
            Error::Io(std::io::Error::new(
                e.kind(),
                format!(
                    "Failed to read config file: {}\n\n\
                     File path: {}\n\n\
                     Suggestions:\n\
                     • Check file permissions: ls -la {}\n\
                     • Try recreating with: netcluster config init --force",
                    e,
                    path.display(),
                    path.display()
                ),
            ))
        })?;

        let config: ClusterConfig = serde_yaml::from_str(&contents).map_err(|e| {
            Error::Config(format!(
                "Failed to parse config file: {}\n\n\
                 File path: {}\n\n\
                 Suggestions:\n\
                 • Check YAML syntax in the config file\n\
                 • Verify indentation uses spaces, not tabs\n\n\
                 Example valid config:\n\
                 servers:\n\
                   - name: localhost\n\
                   - name: server2.example.com\n\
                 placement: switch-bin",
                e,
                path.display()
            ))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Saves configuration to the default location.
    pub fn save(&self) -> Result<()> {
        match Self::default_path() {
            Some(path) => self.save_to(&path),
            None => Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "Could not determine config directory\n\n\
                 Suggestions:\n\
                 • Check HOME environment variable is set\n\
                 • Pass an explicit path with --config <path>",
            ))),
        }
    }

    /// Saves configuration to a specific file path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                Error::Io(std::io::Error::new(
                    e.kind(),
                    format!(
                        "Failed to create config directory: {}\n\n\
                         Directory: {}",
                        e,
                        parent.display()
                    ),
                ))
            })?;
        }

        let contents = serde_yaml::to_string(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;

        fs::write(path, contents).map_err(|e| {
            Error::Io(std::io::Error::new(
                e.kind(),
                format!(
                    "Failed to write config file: {}\n\nFile path: {}",
                    e,
                    path.display()
                ),
            ))
        })?;

        Ok(())
    }

    /// Rejects configurations no cluster run could use.
    pub fn validate(&self) -> Result<()> {
        if self.servers.is_empty() {
            return Err(Error::Config(
                "At least one server must be configured (use `localhost` for this machine)"
                    .to_string(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for server in &self.servers {
            if !seen.insert(server.name.as_str()) {
                return Err(Error::Config(format!(
                    "Server '{}' is listed more than once",
                    server.name
                )));
            }
        }
        if self.migration.attempts == 0 {
            return Err(Error::Config(
                "migration.attempts must be at least 1".to_string(),
            ));
        }
        if self.handshake_timeout_secs == 0 {
            return Err(Error::Config(
                "handshake_timeout_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Adds a server, replacing any existing entry with the same name.
    pub fn set_server(&mut self, server: ServerConfig) {
        match self.servers.iter_mut().find(|s| s.name == server.name) {
            Some(existing) => *existing = server,
            None => self.servers.push(server),
        }
    }

    /// Removes a server by name.
    pub fn remove_server(&mut self, name: &str) -> Option<ServerConfig> {
        let idx = self.servers.iter().position(|s| s.name == name)?;
        Some(self.servers.remove(idx))
    }

    /// Returns true if every configured server is this machine.
    pub fn is_local_only(&self) -> bool {
        self.servers.iter().all(|s| s.name == LOCALHOST)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}
