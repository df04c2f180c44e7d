//! Configuration and persisted session for the clientdesk agent

use clientdesk_core::{ClientConfig, Session};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const CONFIG_FILE: &str = "config.json";
const SESSION_FILE: &str = "session.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    #[serde(flatten)]
    pub client: ClientConfig,
    /// `EnvFilter` directive used when `RUST_LOG` is not set.
    pub log_level: String,
    /// Play the ringtone on the default output device (needs the `audio` feature).
    pub audio: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            client: ClientConfig::default(),
            log_level: "clientdesk_agent=info,clientdesk_core=info".to_string(),
            audio: true,
        }
    }
}

impl AppConfig {
    pub fn load(data_dir: &Path) -> anyhow::Result<Self> {
        let config_path = data_dir.join(CONFIG_FILE);

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let config: Self = serde_json::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, data_dir: &Path) -> anyhow::Result<()> {
        let config_path = data_dir.join(CONFIG_FILE);
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }
}

pub fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("clientdesk")
}

pub fn load_session(data_dir: &Path) -> anyhow::Result<Option<Session>> {
    let path = data_dir.join(SESSION_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(&path)?;
    Ok(Some(serde_json::from_str(&content)?))
}

pub fn save_session(data_dir: &Path, session: &Session) -> anyhow::Result<()> {
    let content = serde_json::to_string_pretty(session)?;
    std::fs::write(data_dir.join(SESSION_FILE), content)?;
    Ok(())
}

/// Returns `true` if a session was stored.
pub fn clear_session(data_dir: &Path) -> anyhow::Result<bool> {
    let path = data_dir.join(SESSION_FILE);
    if !path.exists() {
        return Ok(false);
    }
    std::fs::remove_file(path)?;
    Ok(true)
}
