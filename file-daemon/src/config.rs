//! Configuration management for the file daemon.
//!
//! Built-in defaults, then an optional TOML file, then `FD_`-prefixed
//! environment variables (`FD_CLIENT__HEARTBEAT_INTERVAL=60`).

use crate::utils::errors::{FdError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub client: ClientConfig,
    pub storage: PeerConfig,
    #[serde(default)]
    pub director: Option<PeerConfig>,
    #[serde(default)]
    pub pki: PkiConfig,
    pub log: LogConfig,
    pub daemon: DaemonConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Client name reported to the director
    pub name: String,

    /// Working directory for state files
    pub working_directory: PathBuf,

    /// Seconds between heartbeats to the director, 0 disables them
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: u64,

    /// Read size for file data and the receive buffer size
    #[serde(default = "default_max_network_buffer_size")]
    pub max_network_buffer_size: usize,

    /// Watchdog in seconds for a single network read or write
    #[serde(default = "default_network_timeout")]
    pub network_timeout: u64,
}

/// Address of a peer daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    pub address: String,
    pub port: u16,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PkiConfig {
    /// Sign file digests with `signing_key`
    #[serde(default)]
    pub signatures: bool,

    /// Encrypt file data for `encryption_key` and every master key
    #[serde(default)]
    pub encryption: bool,

    /// Ed25519 secret key (hex)
    #[serde(default)]
    pub signing_key: Option<PathBuf>,

    /// Ed25519 public keys whose signatures are accepted on restore (hex)
    #[serde(default)]
    pub signers: Vec<PathBuf>,

    /// X25519 secret key used to encrypt for ourselves and to decrypt (hex)
    #[serde(default)]
    pub encryption_key: Option<PathBuf>,

    /// Additional X25519 recipients able to decrypt our backups (hex)
    #[serde(default)]
    pub master_keys: Vec<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// PID file location
    pub pid_file: PathBuf,
}

// Default values
fn default_heartbeat_interval() -> u64 {
    300
}

fn default_max_network_buffer_size() -> usize {
    bnet::channel::MAX_NETWORK_BUFFER_SIZE
}

fn default_network_timeout() -> u64 {
    30 * 60
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Config {
            client: ClientConfig {
                name: hostname::get()
                    .ok()
                    .and_then(|h| h.into_string().ok())
                    .map(|h| format!("{}-fd", h))
                    .unwrap_or_else(|| "file-daemon".to_string()),
                working_directory: PathBuf::from("/var/lib/file-daemon"),
                heartbeat_interval: default_heartbeat_interval(),
                max_network_buffer_size: default_max_network_buffer_size(),
                network_timeout: default_network_timeout(),
            },
            storage: PeerConfig {
                address: "localhost".to_string(),
                port: 9103,
            },
            director: None,
            pki: PkiConfig::default(),
            log: LogConfig {
                level: default_log_level(),
            },
            daemon: DaemonConfig {
                pid_file: PathBuf::from("/var/run/file-daemon.pid"),
            },
        }
    }
}

impl Config {
    /// Load defaults, the optional TOML file, then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder =
            ::config::Config::builder().add_source(::config::Config::try_from(&Config::default())?);
        if let Some(path) = path {
            builder = builder.add_source(
                ::config::File::from(path.to_path_buf()).format(::config::FileFormat::Toml),
            );
        }
        builder = builder.add_source(
            ::config::Environment::with_prefix("FD")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );
        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file only
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config =
            toml::from_str(&content).map_err(|e| FdError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| FdError::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.client.max_network_buffer_size == 0
            || self.client.max_network_buffer_size > bnet::channel::MAX_PACKET_SIZE
        {
            return Err(FdError::Config(format!(
                "max_network_buffer_size {} out of range",
                self.client.max_network_buffer_size
            )));
        }
        if self.pki.signatures && self.pki.signing_key.is_none() {
            return Err(FdError::Config(
                "pki.signatures requires pki.signing_key".to_string(),
            ));
        }
        if self.pki.encryption && self.pki.encryption_key.is_none() && self.pki.master_keys.is_empty()
        {
            return Err(FdError::Config(
                "pki.encryption requires pki.encryption_key or pki.master_keys".to_string(),
            ));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.client.heartbeat_interval)
    }

    pub fn network_timeout(&self) -> Duration {
        Duration::from_secs(self.client.network_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.client.heartbeat_interval, 300);
        assert_eq!(config.storage.port, 9103);
        assert!(config.client.name.ends_with("-fd") || config.client.name == "file-daemon");
    }

    #[test]
    fn test_load_file_overrides_defaults() -> anyhow::Result<()> {
        let mut file = NamedTempFile::new()?;
        writeln!(
            file,
            r#"
[client]
name = "web01-fd"
working_directory = "/tmp/fd"
heartbeat_interval = 15

[storage]
address = "sd.example.com"
port = 9203

[log]
level = "debug"

[daemon]
pid_file = "/tmp/fd.pid"
"#
        )?;
        let config = Config::load(Some(file.path()))?;
        assert_eq!(config.client.name, "web01-fd");
        assert_eq!(config.client.heartbeat_interval, 15);
        assert_eq!(config.storage.address, "sd.example.com");
        assert_eq!(config.log.level, "debug");
        assert!(config.director.is_none());
        assert!(!config.pki.signatures);
        Ok(())
    }

    #[test]
    fn test_toml_roundtrip() -> anyhow::Result<()> {
        let config = Config::default();
        let text = config.to_toml()?;
        let mut file = NamedTempFile::new()?;
        file.write_all(text.as_bytes())?;
        let back = Config::from_file(file.path())?;
        assert_eq!(back.client.name, config.client.name);
        assert_eq!(back.storage.port, config.storage.port);
        Ok(())
    }

    #[test]
    fn test_signatures_require_key() {
        let mut config = Config::default();
        config.pki.signatures = true;
        assert!(matches!(config.validate(), Err(FdError::Config(_))));
    }
}
