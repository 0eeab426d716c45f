//! Configuration for chatwire.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $CHATWIRE_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/chatwire/config.toml
//!   3. ~/.config/chatwire/config.toml
//!
//! Both peers must agree on the shared key and on the chat size limit.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::wire::{BUFFER_LIFETIME_SECS, HEADER_RESERVE, MAX_CHAT_BYTES, MAX_HEADER_BYTES};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatwireConfig {
    pub channel: ChannelConfig,
    pub reassembly: ReassemblyConfig,
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Hard size limit of one chat message, in bytes.
    pub max_chat_bytes: usize,
    /// Bytes per frame kept free for prefix, header fields, and tag.
    pub header_reserve: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReassemblyConfig {
    /// Partial messages idle longer than this are discarded.
    pub buffer_lifetime_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Secret the frame tag key is derived from.
    pub shared_key: String,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            max_chat_bytes: MAX_CHAT_BYTES,
            header_reserve: HEADER_RESERVE,
        }
    }
}

impl Default for ReassemblyConfig {
    fn default() -> Self {
        Self {
            buffer_lifetime_secs: BUFFER_LIFETIME_SECS,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        // Peers built from the same release agree without extra setup.
        Self {
            shared_key: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl ChannelConfig {
    /// Base64 bytes that fit in one frame.
    pub fn chunk_budget(&self) -> usize {
        self.max_chat_bytes.saturating_sub(self.header_reserve)
    }
}

impl ReassemblyConfig {
    pub fn buffer_lifetime(&self) -> Duration {
        Duration::from_secs(self.buffer_lifetime_secs)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("chatwire")
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
    #[error("failed to parse config: {0}")]
    ParseFailed(#[from] toml::de::Error),
    #[error("header_reserve {reserve} is below the worst-case frame header of {needed} bytes")]
    HeaderReserveTooSmall { reserve: usize, needed: usize },
    #[error("header_reserve {reserve} leaves no payload room in {max} byte messages")]
    NoPayloadRoom { reserve: usize, max: usize },
    #[error("shared_key must not be empty")]
    EmptyKey,
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl ChatwireConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::load_file(&Self::file_path())?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("CHATWIRE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Read a config file, or defaults if it does not exist.
    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Apply CHATWIRE_* env var overrides.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Apply overrides from any key lookup. Unparsable values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("CHATWIRE_CHANNEL__MAX_CHAT_BYTES") {
            if let Ok(n) = v.parse() {
                self.channel.max_chat_bytes = n;
            }
        }
        if let Some(v) = lookup("CHATWIRE_CHANNEL__HEADER_RESERVE") {
            if let Ok(n) = v.parse() {
                self.channel.header_reserve = n;
            }
        }
        if let Some(v) = lookup("CHATWIRE_REASSEMBLY__BUFFER_LIFETIME_SECS") {
            if let Ok(n) = v.parse() {
                self.reassembly.buffer_lifetime_secs = n;
            }
        }
        if let Some(v) = lookup("CHATWIRE_AUTH__SHARED_KEY") {
            self.auth.shared_key = v;
        }
    }

    /// Reject settings under which a frame could exceed the chat limit.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let reserve = self.channel.header_reserve;
        if reserve < MAX_HEADER_BYTES {
            return Err(ConfigError::HeaderReserveTooSmall {
                reserve,
                needed: MAX_HEADER_BYTES,
            });
        }
        if self.channel.chunk_budget() == 0 {
            return Err(ConfigError::NoPayloadRoom {
                reserve,
                max: self.channel.max_chat_bytes,
            });
        }
        if self.auth.shared_key.is_empty() {
            return Err(ConfigError::EmptyKey);
        }
        Ok(())
    }
}
