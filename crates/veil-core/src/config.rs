//! Configuration system for Veil.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $VEIL_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/veil/config.toml
//!   3. ~/.config/veil/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VeilConfig {
    pub identity: IdentityConfig,
    pub network: NetworkConfig,
    pub paths: PathsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Transport key file. Generated on first run.
    pub transport_keyfile: PathBuf,
    /// Use a fresh in-memory transport key on every run instead of the key file.
    pub ephemeral_keys: bool,
}

/// Address family a link layer binds with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressFamily {
    #[default]
    Inet,
    Inet6,
}

impl std::str::FromStr for AddressFamily {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inet" | "ipv4" | "4" => Ok(Self::Inet),
            "inet6" | "ipv6" | "6" => Ok(Self::Inet6),
            other => Err(format!("unknown address family '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Interface to bind. "*" = all interfaces of `family`.
    pub interface: String,
    pub family: AddressFamily,
    /// UDP port. 0 = OS-assigned.
    pub port: u16,
    /// Rank advertised in our address info. Lower is preferred.
    pub rank: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Paths a client keeps built at once.
    pub num_paths: usize,
    /// Hops per path.
    pub num_hops: usize,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            transport_keyfile: data_dir().join("transport.key"),
            ephemeral_keys: false,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            interface: "*".to_string(),
            family: AddressFamily::Inet,
            port: 1090,
            rank: 1,
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            num_paths: 4,
            num_hops: 4,
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("veil")
}

pub fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("veil")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl VeilConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            VeilConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse a config file without env overrides.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("VEIL_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&VeilConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply VEIL_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("VEIL_NETWORK__INTERFACE") {
            self.network.interface = v;
        }
        if let Ok(v) = std::env::var("VEIL_NETWORK__PORT") {
            if let Ok(p) = v.parse() {
                self.network.port = p;
            }
        }
        if let Ok(v) = std::env::var("VEIL_NETWORK__FAMILY") {
            if let Ok(f) = v.parse() {
                self.network.family = f;
            }
        }
        if let Ok(v) = std::env::var("VEIL_IDENTITY__EPHEMERAL_KEYS") {
            self.identity.ephemeral_keys = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("VEIL_PATHS__NUM_PATHS") {
            if let Ok(n) = v.parse() {
                self.paths.num_paths = n;
            }
        }
    }
}
