//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The renewal credential is loaded from CHAT_REFRESH_TOKEN or
//! refresh_token_file, never stored in the TOML directly.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chat_channel::{ReconnectPolicy, SessionConfig};
use common::Secret;
use reqwest::Url;
use serde::Deserialize;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub session: SessionSettings,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Chat server endpoints
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_ws_url")]
    pub ws_url: String,
    #[serde(default = "default_sub_prefix")]
    pub sub_prefix: String,
    #[serde(default = "default_pub_prefix")]
    pub pub_prefix: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

/// Channel session and credential settings
#[derive(Debug, Deserialize)]
pub struct SessionSettings {
    #[serde(default = "default_heartbeat")]
    pub heartbeat_ms: u64,
    #[serde(default = "default_auth_retry")]
    pub auth_retry_delay_ms: u64,
    /// 0 disables reconnect after an unexpected close
    #[serde(default = "default_close_retry")]
    pub close_retry_delay_ms: u64,
    /// Persist the access credential here; in memory only when unset
    #[serde(default)]
    pub access_token_path: Option<PathBuf>,
    #[serde(default)]
    pub refresh_token_file: Option<PathBuf>,
    #[serde(skip)]
    pub refresh_token: Option<Secret<String>>,
}

/// Optional Prometheus listener
#[derive(Debug, Default, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub listen_addr: Option<SocketAddr>,
}

fn default_base_url() -> String {
    "http://localhost:8080".into()
}

fn default_ws_url() -> String {
    "ws://localhost:8080/chat/inbox/websocket".into()
}

fn default_sub_prefix() -> String {
    "/sub".into()
}

fn default_pub_prefix() -> String {
    "/pub".into()
}

fn default_timeout() -> u64 {
    30
}

fn default_heartbeat() -> u64 {
    10_000
}

fn default_auth_retry() -> u64 {
    300
}

fn default_close_retry() -> u64 {
    3_000
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            heartbeat_ms: default_heartbeat(),
            auth_retry_delay_ms: default_auth_retry(),
            close_retry_delay_ms: default_close_retry(),
            access_token_path: None,
            refresh_token_file: None,
            refresh_token: None,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// Renewal credential resolution order:
    /// 1. CHAT_REFRESH_TOKEN env var
    /// 2. refresh_token_file path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.validate()?;

        if let Some(token) = std::env::var("CHAT_REFRESH_TOKEN")
            .ok()
            .filter(|t| !t.trim().is_empty())
        {
            config.session.refresh_token = Some(Secret::new(token.trim().to_owned()));
        } else if let Some(ref file) = config.session.refresh_token_file {
            let token = std::fs::read_to_string(file).map_err(|e| {
                common::Error::Config(format!(
                    "failed to read refresh_token_file {}: {e}",
                    file.display()
                ))
            })?;
            let token = token.trim().to_owned();
            if !token.is_empty() {
                config.session.refresh_token = Some(Secret::new(token));
            }
        }

        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        let base = self.base_url()?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(common::Error::InvalidUrl {
                field: "base_url",
                reason: format!("scheme must be http or https, got {}", base.scheme()),
            });
        }
        let ws = self.ws_url()?;
        if !matches!(ws.scheme(), "ws" | "wss") {
            return Err(common::Error::InvalidUrl {
                field: "ws_url",
                reason: format!("scheme must be ws or wss, got {}", ws.scheme()),
            });
        }
        if self.server.timeout_secs == 0 {
            return Err(common::Error::Config(
                "timeout_secs must be greater than 0".into(),
            ));
        }
        for (name, prefix) in [
            ("sub_prefix", &self.server.sub_prefix),
            ("pub_prefix", &self.server.pub_prefix),
        ] {
            if !prefix.starts_with('/') {
                return Err(common::Error::Config(format!(
                    "{name} must start with '/', got: {prefix}"
                )));
            }
        }
        Ok(())
    }

    /// Base URL with a trailing slash so endpoint paths join onto it.
    pub fn base_url(&self) -> common::Result<Url> {
        let raw = self.server.base_url.trim_end_matches('/');
        Url::parse(&format!("{raw}/")).map_err(|e| common::Error::InvalidUrl {
            field: "base_url",
            reason: e.to_string(),
        })
    }

    pub fn ws_url(&self) -> common::Result<Url> {
        Url::parse(&self.server.ws_url).map_err(|e| common::Error::InvalidUrl {
            field: "ws_url",
            reason: e.to_string(),
        })
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.server.timeout_secs)
    }

    pub fn heartbeat(&self) -> Option<Duration> {
        (self.session.heartbeat_ms > 0).then(|| Duration::from_millis(self.session.heartbeat_ms))
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            auth_retry_delay: Duration::from_millis(self.session.auth_retry_delay_ms),
            close_retry_delay: (self.session.close_retry_delay_ms > 0)
                .then(|| Duration::from_millis(self.session.close_retry_delay_ms)),
        }
    }

    /// Channel session parameters; `host` comes from the WebSocket URL.
    pub fn session_config(&self) -> common::Result<SessionConfig> {
        let ws = self.ws_url()?;
        Ok(SessionConfig {
            host: ws.host_str().unwrap_or("localhost").to_string(),
            sub_prefix: self.server.sub_prefix.trim_end_matches('/').to_string(),
            pub_prefix: self.server.pub_prefix.trim_end_matches('/').to_string(),
            heartbeat_ms: self.session.heartbeat_ms,
            policy: self.reconnect_policy(),
        })
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("chat-client.toml")
    }
}
