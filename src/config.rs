use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::watcher::WatchOptions;

/// File name looked up in the working directory when `--config` is not given.
pub const CONFIG_FILE_NAME: &str = "maputnik.toml";

/// Why a config file could not be used.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Configuration loaded from `maputnik.toml`.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct BridgeConfig {
    pub server: ServerConfig,
    pub watch: WatchConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to listen on.
    pub bind: String,
    /// Port to listen on; 0 picks a free one.
    pub port: u16,
    /// Largest style accepted by `PUT /styles/{id}`.
    pub max_body_bytes: usize,
    /// Allowed CORS origins. Empty allows any origin.
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 8000,
            max_body_bytes: 16 * 1024 * 1024,
            cors_origins: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Per-subscriber send deadline during a broadcast.
    pub send_timeout_ms: u64,
    /// Notifications that may queue per subscriber.
    pub channel_capacity: usize,
    /// Websocket heartbeat interval. 0 disables pings and idle detection.
    pub ping_interval_secs: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            send_timeout_ms: 2000,
            channel_capacity: 16,
            ping_interval_secs: 30,
        }
    }
}

impl WatchConfig {
    pub fn options(&self) -> WatchOptions {
        WatchOptions {
            send_timeout: Duration::from_millis(self.send_timeout_ms),
            channel_capacity: self.channel_capacity,
        }
    }

    pub fn ping_interval(&self) -> Option<Duration> {
        (self.ping_interval_secs > 0).then(|| Duration::from_secs(self.ping_interval_secs))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default level: error, warn, info, debug or trace.
    pub default: String,
    /// Per-target overrides, e.g. `maputnik_desktop::watcher = "debug"`.
    pub modules: BTreeMap<String, String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            default: "info".to_string(),
            modules: BTreeMap::new(),
        }
    }
}

impl LoggingConfig {
    /// `EnvFilter` directive string, e.g. `info,tower_http=debug`.
    pub fn filter_directive(&self) -> String {
        let mut directive = self.default.clone();
        for (module, level) in &self.modules {
            directive.push_str(&format!(",{module}={level}"));
        }
        directive
    }
}

impl BridgeConfig {
    /// Load `maputnik.toml` from `dir`.
    pub fn load_from_dir(dir: &Path) -> Result<Self, ConfigError> {
        Self::load(&dir.join(CONFIG_FILE_NAME))
    }

    /// Load configuration from `path`.
    ///
    /// A missing file is not an error and yields the defaults. Callers
    /// typically fall back to the defaults on error as well, after logging
    /// it (logging itself is configured from this file).
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str::<Self>(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}
