//! Client configuration (`~/.config/ferry/client.toml`).

use std::path::{Path, PathBuf};

use ferry_queue::QueueConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Server WebSocket URL.
    #[serde(default = "default_url")]
    pub url: String,

    #[serde(default)]
    pub token: String,

    /// Zone used when `--zone` is not given.
    #[serde(default = "default_zone")]
    pub zone: String,

    #[serde(default)]
    pub queue: QueueConfig,
}

fn default_url() -> String {
    "ws://127.0.0.1:7420".into()
}

fn default_zone() -> String {
    "uploads".into()
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            token: String::new(),
            zone: default_zone(),
            queue: QueueConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Missing file means defaults; nothing is written.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }
}

pub fn default_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
    PathBuf::from(home)
        .join(".config")
        .join("ferry")
        .join("client.toml")
}
