use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::protocol::encode_query_value;

pub const DEFAULT_HOST: &str = "10.0.0.10";
pub const DEFAULT_PORT: u16 = 8000;
pub const DEFAULT_OPERATOR: &str = "statter";
pub const DEFAULT_PLATFORM: &str = "Macintosh; Intel Mac OS X 10_15_7";

/// The server-side "view" a connection observes. The server tailors what it
/// pushes to the role.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Source {
    #[default]
    Root,
    /// Scoreboard operator.
    Operator,
    JamTimer,
    /// The standard scoreboard display.
    Scoreboard,
    Custom(String),
}

impl Source {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Root => "root",
            Self::Operator => "/nso/sbo",
            Self::JamTimer => "/nso/jt",
            Self::Scoreboard => "/views/standard",
            Self::Custom(s) => s,
        }
    }
}

impl From<String> for Source {
    fn from(s: String) -> Self {
        match s.as_str() {
            "root" => Self::Root,
            "/nso/sbo" => Self::Operator,
            "/nso/jt" => Self::JamTimer,
            "/views/standard" => Self::Scoreboard,
            _ => Self::Custom(s),
        }
    }
}

impl From<Source> for String {
    fn from(source: Source) -> Self {
        source.as_str().to_owned()
    }
}

/// Keepalive probe timing, in milliseconds so tests can run it fast.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeepaliveConfig {
    /// Delay before the first probe on a fresh socket.
    pub initial_delay_ms: u64,
    /// Delay after a successful probe.
    pub interval_ms: u64,
    /// Delay after a failed probe.
    pub retry_ms: u64,
    /// How long to wait for a pong.
    pub probe_timeout_ms: u64,
    /// Consecutive failures on one socket before it is torn down.
    pub max_failures: u32,
}

impl KeepaliveConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn retry(&self) -> Duration {
        Duration::from_millis(self.retry_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 30_000,
            interval_ms: 20_000,
            retry_ms: 3_000,
            probe_timeout_ms: 10_000,
            max_failures: 3,
        }
    }
}

/// Where and as whom to connect. Loaded from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Scoreboard host. `None` means offline: every connect fails.
    pub host: Option<String>,
    pub port: u16,
    /// Operator name reported to the server. Ignored when `team` is set.
    pub operator: Option<String>,
    /// Team being edited, if any.
    pub team: Option<String>,
    pub source: Source,
    pub platform: String,
    /// `Set` commands held while disconnected. Zero drops them.
    pub pending_write_capacity: usize,
    /// How long to wait for the WebSocket handshake.
    pub connect_timeout_ms: u64,
    pub keepalive: KeepaliveConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: Some(DEFAULT_HOST.to_owned()),
            port: DEFAULT_PORT,
            operator: Some(DEFAULT_OPERATOR.to_owned()),
            team: None,
            source: Source::Root,
            platform: DEFAULT_PLATFORM.to_owned(),
            pending_write_capacity: 32,
            connect_timeout_ms: 10_000,
            keepalive: KeepaliveConfig::default(),
        }
    }
}

impl ConnectionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// A config with no host, for browsing saved snapshots.
    pub fn offline() -> Self {
        Self {
            host: None,
            operator: Some("<static>".to_owned()),
            ..Self::default()
        }
    }

    pub fn with_host(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: Some(host.into()),
            port,
            ..Self::default()
        }
    }

    /// Edit a team. Operator and team are mutually exclusive.
    pub fn set_team(&mut self, team: Option<String>) {
        self.team = team;
        if self.team.is_some() {
            self.operator = None;
        }
    }

    /// The `source` query value: role path, then game and identity.
    pub fn source_param(&self, game: Option<Uuid>) -> String {
        let mut source = self.source.as_str().to_owned();
        match game {
            Some(game) => source.push_str(&format!("?game={game}&")),
            None => source.push('?'),
        }
        if let Some(team) = &self.team {
            source.push_str(&format!("team={team}"));
        } else if let Some(operator) = &self.operator {
            source.push_str(&format!("operator={operator}"));
        }
        source
    }

    /// `ws://{host}:{port}/WS?source=...&platform=...`, or `None` when offline.
    pub fn websocket_url(&self, game: Option<Uuid>) -> Option<String> {
        let host = self.host.as_deref()?;
        Some(format!(
            "ws://{}:{}/WS?source={}&platform={}",
            host,
            self.port,
            encode_query_value(&self.source_param(game)),
            encode_query_value(&self.platform),
        ))
    }

    /// HTTP URL for an asset hosted by the scoreboard server.
    pub fn asset_url(&self, path: &str) -> Option<String> {
        let host = self.host.as_deref()?;
        Some(format!(
            "http://{}:{}/{}",
            host,
            self.port,
            path.trim_start_matches('/')
        ))
    }

    /// `<config dir>/statter/config.toml`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("statter").join("config.toml"))
    }

    /// Load config from a TOML file path. Returns None if file doesn't exist.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
        Ok(Some(config))
    }

    /// Save config to a TOML file path, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
        }
        let contents = toml::to_string_pretty(self).map_err(ConfigError::SerializeFailed)?;
        std::fs::write(path, contents)
            .map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
        Ok(())
    }
}

/// Errors that can occur when loading or saving config.
#[derive(Debug)]
pub enum ConfigError {
    ReadFailed(PathBuf, std::io::Error),
    ParseFailed(PathBuf, toml::de::Error),
    WriteFailed(PathBuf, std::io::Error),
    SerializeFailed(toml::ser::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReadFailed(path, e) => {
                write!(f, "Failed to read config {}: {}", path.display(), e)
            }
            Self::ParseFailed(path, e) => {
                write!(f, "Failed to parse config {}: {}", path.display(), e)
            }
            Self::WriteFailed(path, e) => {
                write!(f, "Failed to write config {}: {}", path.display(), e)
            }
            Self::SerializeFailed(e) => write!(f, "Failed to serialize config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}
