//! Client configuration

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub server: ServerConfig,
    pub push: PushConfig,
    pub timing: TimingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
    pub api_prefix: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8000,
            use_tls: false,
            api_prefix: "/api".to_string(),
        }
    }
}

/// Pusher-compatible broadcast service (Laravel WebSockets, Reverb, Soketi).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PushConfig {
    pub app_key: String,
    /// Defaults to the API host when empty.
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            app_key: "local".to_string(),
            host: String::new(),
            port: 6001,
            use_tls: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub poll_interval_ms: u64,
    pub ring_timeout_secs: u64,
    pub ringtone_ceiling_secs: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5_000,
            ring_timeout_secs: 30,
            ringtone_ceiling_secs: 30,
        }
    }
}

impl TimingConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn ring_timeout(&self) -> Duration {
        Duration::from_secs(self.ring_timeout_secs)
    }

    pub fn ringtone_ceiling(&self) -> Duration {
        Duration::from_secs(self.ringtone_ceiling_secs)
    }
}

impl ClientConfig {
    pub fn new(host: &str, port: u16, use_tls: bool) -> Self {
        Self {
            server: ServerConfig {
                host: host.to_string(),
                port,
                use_tls,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn http_url(&self) -> String {
        let scheme = if self.server.use_tls { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.server.host, self.server.port)
    }

    /// Absolute url of an API endpoint, e.g. `api_url("incoming-calls")`.
    pub fn api_url(&self, path: &str) -> Result<Url> {
        let prefix = self.server.api_prefix.trim_matches('/');
        let base = if prefix.is_empty() {
            format!("{}/", self.http_url())
        } else {
            format!("{}/{}/", self.http_url(), prefix)
        };
        Ok(Url::parse(&base)?.join(path.trim_start_matches('/'))?)
    }

    /// Laravel registers the channel authorizer outside the API prefix.
    pub fn auth_url(&self) -> Result<Url> {
        Ok(Url::parse(&self.http_url())?.join("broadcasting/auth")?)
    }

    pub fn push_url(&self) -> Result<Url> {
        let scheme = if self.push.use_tls { "wss" } else { "ws" };
        let host = if self.push.host.is_empty() {
            &self.server.host
        } else {
            &self.push.host
        };
        let mut url = Url::parse(&format!(
            "{}://{}:{}/app/{}",
            scheme, host, self.push.port, self.push.app_key
        ))?;
        url.query_pairs_mut()
            .append_pair("protocol", "7")
            .append_pair("client", "clientdesk")
            .append_pair("version", env!("CARGO_PKG_VERSION"))
            .append_pair("flash", "false");
        Ok(url)
    }
}
