use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use url::Url;
use wadesk_core::FormRequirements;

use crate::{push::ReconnectPolicy, sync::SyncSettings};

pub const DEFAULT_API_BASE_URL: &str = "http://localhost:5111/api";
pub const CONFIG_FILE_NAME: &str = "config.json";
pub const CONFIG_DIR_ENV: &str = "WADESK_CONFIG_DIR";
pub const TOKEN_ENV: &str = "WADESK_TOKEN";
pub const MAX_CONFIG_BYTES: u64 = 64 * 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to stat {path}: {source}")]
    Metadata {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("{path} is too large ({size} bytes, limit {limit})", limit = MAX_CONFIG_BYTES)]
    TooLarge { path: PathBuf, size: u64 },
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("invalid URL {url}: {source}")]
    Url { url: String, source: url::ParseError },
    #[error("unsupported scheme {0}; expected http or https")]
    UnsupportedScheme(String),
}

/// Which message form variant the console offers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FormSettings {
    #[serde(flatten)]
    pub requirements: FormRequirements,
    /// Load templates from `GET /templates` instead of the built-in catalog.
    pub dynamic_templates: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    pub api_base_url: String,
    /// Derived from `api_base_url` when unset.
    pub push_url: Option<String>,
    pub token: Option<String>,
    #[serde(with = "millis")]
    pub request_timeout: Duration,
    pub sync: SyncSettings,
    pub reconnect: ReconnectPolicy,
    pub form: FormSettings,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_owned(),
            push_url: None,
            token: None,
            request_timeout: Duration::from_secs(15),
            sync: SyncSettings::default(),
            reconnect: ReconnectPolicy::default(),
            form: FormSettings::default(),
        }
    }
}

impl ConsoleConfig {
    /// Push endpoint: the explicit setting, else `ws(s)://host[:port]/ws`.
    pub fn push_url(&self) -> Result<String, ConfigError> {
        if let Some(url) = self.push_url.as_deref().filter(|url| !url.trim().is_empty()) {
            return Ok(url.trim().to_owned());
        }
        derive_push_url(&self.api_base_url)
    }

    /// Token from the environment wins over the file.
    pub fn resolve_token(&self) -> Option<String> {
        std::env::var(TOKEN_ENV)
            .ok()
            .filter(|token| !token.trim().is_empty())
            .or_else(|| self.token.clone())
    }
}

pub fn derive_push_url(api_base_url: &str) -> Result<String, ConfigError> {
    let mut url = Url::parse(api_base_url.trim()).map_err(|source| ConfigError::Url {
        url: api_base_url.to_owned(),
        source,
    })?;
    let scheme = match url.scheme() {
        "http" => "ws",
        "https" => "wss",
        other => return Err(ConfigError::UnsupportedScheme(other.to_owned())),
    };
    url.set_scheme(scheme)
        .map_err(|()| ConfigError::UnsupportedScheme(scheme.to_owned()))?;
    url.set_path("/ws");
    url.set_query(None);
    url.set_fragment(None);
    Ok(url.to_string())
}

pub fn config_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(CONFIG_DIR_ENV) {
        return PathBuf::from(dir);
    }
    std::env::var_os("XDG_CONFIG_HOME")
        .map(|base| PathBuf::from(base).join("wadesk"))
        .unwrap_or_else(|| PathBuf::from("."))
}

pub fn config_path() -> PathBuf {
    config_dir().join(CONFIG_FILE_NAME)
}

pub fn load_config_from_path(path: &Path) -> Result<ConsoleConfig, ConfigError> {
    let meta = std::fs::metadata(path).map_err(|source| ConfigError::Metadata {
        path: path.to_owned(),
        source,
    })?;
    if meta.len() > MAX_CONFIG_BYTES {
        return Err(ConfigError::TooLarge {
            path: path.to_owned(),
            size: meta.len(),
        });
    }

    let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_owned(),
        source,
    })?;
    serde_json::from_str(&data).map_err(|source| ConfigError::Parse {
        path: path.to_owned(),
        source,
    })
}

/// Loads the config file, falling back to defaults when it is missing or unusable.
pub fn load_config(explicit: Option<&Path>) -> ConsoleConfig {
    let path = explicit.map(Path::to_path_buf).unwrap_or_else(config_path);
    if !path.exists() {
        info!(path = %path.display(), "config file not found, using defaults");
        return ConsoleConfig::default();
    }

    match load_config_from_path(&path) {
        Ok(config) => {
            info!(path = %path.display(), api = %config.api_base_url, "loaded configuration");
            config
        }
        Err(err) => {
            warn!(error = %err, "failed to load config, using defaults");
            ConsoleConfig::default()
        }
    }
}

/// Serde adapter for durations stored as whole milliseconds.
pub(crate) mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_url_follows_api_scheme_and_host() {
        assert_eq!(
            derive_push_url("http://localhost:5111/api").unwrap(),
            "ws://localhost:5111/ws"
        );
        assert_eq!(
            derive_push_url("https://console.example.com/api/").unwrap(),
            "wss://console.example.com/ws"
        );
        assert!(matches!(
            derive_push_url("ftp://example.com"),
            Err(ConfigError::UnsupportedScheme(_))
        ));
    }

    #[test]
    fn explicit_push_url_wins() {
        let config = ConsoleConfig {
            push_url: Some("ws://relay:9000/events".to_owned()),
            ..ConsoleConfig::default()
        };
        assert_eq!(config.push_url().unwrap(), "ws://relay:9000/events");
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: ConsoleConfig = serde_json::from_str(
            r#"{"api_base_url":"http://10.0.0.2:5111/api","sync":{"qr_poll_interval":500},"form":{"require_attachment":true}}"#,
        )
        .unwrap();
        assert_eq!(config.api_base_url, "http://10.0.0.2:5111/api");
        assert_eq!(config.sync.qr_poll_interval, Duration::from_millis(500));
        assert_eq!(config.sync.qr_poll_ceiling, Duration::from_secs(30));
        assert!(config.form.requirements.require_attachment);
        assert!(!config.form.dynamic_templates);
        assert_eq!(config.reconnect, ReconnectPolicy::default());
    }
}
