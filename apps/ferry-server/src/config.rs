//! Server configuration.
//!
//! Stored as TOML, by default at `~/.config/ferry/server.toml`. A missing
//! file is created with defaults, including one freshly generated admin
//! token.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::bail;
use ferry_protocol::constants::MAX_BINARY_PAYLOAD;
use ferry_sessions::{
    Caller, DEFAULT_MAX_TOTAL_CHUNKS, SessionLimits, StaticPolicy, ZoneResolver,
};
use ferry_server::StaticTokens;
use serde::{Deserialize, Serialize};

/// Who a configured token authenticates as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenEntry {
    pub user: String,
    #[serde(default)]
    pub admin: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Listen address.
    #[serde(default = "default_bind")]
    pub bind: String,

    /// WebSocket port (0 = auto-assign).
    #[serde(default = "default_port")]
    pub port: u16,

    /// Where chunks of open sessions are kept.
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: PathBuf,

    #[serde(default = "default_chunk_size")]
    pub default_chunk_size: u64,

    #[serde(default = "default_min_chunk_size")]
    pub min_chunk_size: u64,

    /// Must fit in one WebSocket message with its frame header.
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: u64,

    /// Sessions needing more chunks than this are refused.
    #[serde(default = "default_max_total_chunks")]
    pub max_total_chunks: u32,

    /// Sessions untouched for this long are deleted.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Zone name -> root directory.
    #[serde(default = "default_zones")]
    pub zones: HashMap<String, PathBuf>,

    /// Token -> identity.
    #[serde(default)]
    pub tokens: HashMap<String, TokenEntry>,

    #[serde(default)]
    pub policy: StaticPolicy,
}

fn default_bind() -> String {
    "0.0.0.0".into()
}

fn default_port() -> u16 {
    7420
}

fn data_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
    PathBuf::from(home).join(".local").join("share").join("ferry")
}

fn default_scratch_dir() -> PathBuf {
    data_dir().join("scratch")
}

fn default_chunk_size() -> u64 {
    ferry_transfer::DEFAULT_CHUNK_SIZE
}

fn default_min_chunk_size() -> u64 {
    256 * 1024
}

fn default_max_chunk_size() -> u64 {
    32 * 1024 * 1024
}

fn default_max_total_chunks() -> u32 {
    DEFAULT_MAX_TOTAL_CHUNKS
}

fn default_idle_timeout_secs() -> u64 {
    24 * 60 * 60
}

fn default_sweep_interval_secs() -> u64 {
    10 * 60
}

fn default_zones() -> HashMap<String, PathBuf> {
    HashMap::from([("uploads".to_string(), data_dir().join("uploads"))])
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            scratch_dir: default_scratch_dir(),
            default_chunk_size: default_chunk_size(),
            min_chunk_size: default_min_chunk_size(),
            max_chunk_size: default_max_chunk_size(),
            max_total_chunks: default_max_total_chunks(),
            idle_timeout_secs: default_idle_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            zones: default_zones(),
            tokens: HashMap::new(),
            policy: StaticPolicy::default(),
        }
    }
}

impl ServerSettings {
    /// Loads settings from `path`, writing defaults there if it does not
    /// exist yet. Chunk bounds that cannot work are an error.
    pub fn load_or_create(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let settings: ServerSettings = toml::from_str(&content)?;
            settings.validate()?;
            return Ok(settings);
        }

        let mut settings = ServerSettings::default();
        let token = uuid::Uuid::new_v4().simple().to_string();
        settings.tokens.insert(
            token,
            TokenEntry {
                user: "admin".into(),
                admin: true,
            },
        );
        settings.save(path)?;
        tracing::info!(path = %path.display(), "wrote default configuration with a new admin token");
        Ok(settings)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_chunk_size > MAX_BINARY_PAYLOAD {
            bail!(
                "max_chunk_size {} exceeds the {MAX_BINARY_PAYLOAD}-byte frame payload limit",
                self.max_chunk_size
            );
        }
        if self.min_chunk_size == 0 || self.min_chunk_size > self.max_chunk_size {
            bail!(
                "min_chunk_size must be between 1 and max_chunk_size ({})",
                self.max_chunk_size
            );
        }
        if self.max_total_chunks == 0 {
            bail!("max_total_chunks must be greater than zero");
        }
        Ok(())
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;

        // Tokens are secrets.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    pub fn limits(&self) -> SessionLimits {
        SessionLimits {
            default_chunk_size: self.default_chunk_size,
            min_chunk_size: self.min_chunk_size,
            max_chunk_size: self.max_chunk_size,
            max_total_chunks: self.max_total_chunks,
        }
    }

    pub fn resolver(&self) -> ZoneResolver {
        ZoneResolver::new(self.zones.clone())
    }

    pub fn authenticator(&self) -> StaticTokens {
        let tokens = self
            .tokens
            .iter()
            .map(|(token, entry)| {
                let caller = if entry.admin {
                    Caller::admin(&entry.user)
                } else {
                    Caller::user(&entry.user)
                };
                (token.clone(), caller)
            })
            .collect();
        StaticTokens::new(tokens)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// `~/.config/ferry/server.toml`.
pub fn default_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
    PathBuf::from(home)
        .join(".config")
        .join("ferry")
        .join("server.toml")
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_server::Authenticator;

    #[test]
    fn partial_toml_takes_defaults() {
        let settings: ServerSettings = toml::from_str(
            r#"
            port = 9000

            [zones]
            media = "/srv/media"

            [tokens.abc123]
            user = "alice"

            [policy]
            denied_extensions = ["exe"]
            "#,
        )
        .unwrap();

        assert_eq!(settings.port, 9000);
        assert_eq!(settings.bind, "0.0.0.0");
        assert_eq!(settings.zones["media"], PathBuf::from("/srv/media"));
        assert!(!settings.zones.contains_key("uploads"));
        assert_eq!(settings.limits().max_chunk_size, 32 * 1024 * 1024);
        assert_eq!(settings.limits().max_total_chunks, DEFAULT_MAX_TOTAL_CHUNKS);
        assert_eq!(settings.policy.denied_extensions, vec!["exe".to_string()]);

        let auth = settings.authenticator();
        let alice = auth.authenticate("abc123").unwrap();
        assert_eq!(alice.id, "alice");
        assert!(!alice.is_admin);
        assert!(auth.authenticate("other").is_none());
    }

    #[test]
    fn missing_file_is_created_with_admin_token() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("server.toml");

        let created = ServerSettings::load_or_create(&path).unwrap();
        assert!(path.exists());
        assert_eq!(created.tokens.len(), 1);
        assert!(created.tokens.values().all(|t| t.admin));

        let loaded = ServerSettings::load_or_create(&path).unwrap();
        assert_eq!(loaded.tokens, created.tokens);
        assert_eq!(loaded.port, created.port);
    }

    #[test]
    fn chunk_larger_than_a_message_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.toml");
        std::fs::write(&path, "max_chunk_size = 134217728\n").unwrap();

        let err = ServerSettings::load_or_create(&path).unwrap_err();
        assert!(err.to_string().contains("max_chunk_size"), "{err}");

        std::fs::write(&path, format!("max_chunk_size = {MAX_BINARY_PAYLOAD}\n")).unwrap();
        let settings = ServerSettings::load_or_create(&path).unwrap();
        assert_eq!(settings.limits().max_chunk_size, MAX_BINARY_PAYLOAD);
    }

    #[test]
    fn inverted_or_empty_bounds_are_refused() {
        let inverted = ServerSettings {
            min_chunk_size: 2 * 1024 * 1024,
            max_chunk_size: 1024 * 1024,
            ..ServerSettings::default()
        };
        assert!(inverted.validate().is_err());

        let no_chunks = ServerSettings {
            max_total_chunks: 0,
            ..ServerSettings::default()
        };
        assert!(no_chunks.validate().is_err());
        assert!(ServerSettings::default().validate().is_ok());
    }

    #[test]
    fn sweep_interval_is_never_zero() {
        let settings = ServerSettings {
            sweep_interval_secs: 0,
            ..ServerSettings::default()
        };
        assert_eq!(settings.sweep_interval(), Duration::from_secs(1));
    }

    #[test]
    fn default_path_is_under_config() {
        assert!(default_path().ends_with(".config/ferry/server.toml"));
    }
}
