//! Soak configuration at `~/.mux/soak.toml`.
//!
//! CLI flags always override config file values.

use anyhow::{Context, Result};
use mux_session::ManagerConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Session manager tunables.
    #[serde(default)]
    pub manager: ManagerConfig,

    /// Soak run shape.
    #[serde(default)]
    pub soak: SoakSection,
}

/// `[soak]` section of the config TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SoakSection {
    /// Number of concurrent sessions.
    #[serde(default = "default_sessions")]
    pub sessions: u16,

    /// Chunks sent in each direction per session.
    #[serde(default = "default_chunks_per_session")]
    pub chunks_per_session: usize,

    /// Payload bytes per chunk.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// "stream" or "packet".
    #[serde(default = "default_transfer")]
    pub transfer: String,
}

impl Default for SoakSection {
    fn default() -> Self {
        Self {
            sessions: default_sessions(),
            chunks_per_session: default_chunks_per_session(),
            chunk_size: default_chunk_size(),
            transfer: default_transfer(),
        }
    }
}

fn default_sessions() -> u16 {
    8
}

fn default_chunks_per_session() -> usize {
    64
}

fn default_chunk_size() -> usize {
    1024
}

fn default_transfer() -> String {
    "stream".to_string()
}

impl Config {
    /// Load configuration from a TOML file, returning defaults if the file
    /// does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config at {}", path.display()))?;

        debug!(path = %path.display(), "loaded config");
        Ok(config)
    }
}

/// Expand a leading `~/` to the user's home directory.
pub fn expand_tilde(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
