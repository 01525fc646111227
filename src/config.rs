// ABOUTME: Configuration loading for llamasup.
// ABOUTME: Reads ~/.llamasup/config.toml (or --config / LLAMASUP_CONFIG) into timeouts and model entries.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use crate::catalog::{ModelCatalog, ModelDescriptor};

/// Environment variable that overrides the config file location.
pub const CONFIG_ENV_VAR: &str = "LLAMASUP_CONFIG";

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Unix socket the daemon listens on.
    pub socket: Option<PathBuf>,
    /// Default thread count handed to every model; falls back to available parallelism.
    pub threads: Option<u32>,
    pub idle_timeout_ms: u64,
    pub first_output_timeout_ms: u64,
    pub stop_grace_ms: u64,
    pub startup_check_ms: u64,
    pub models: Vec<ModelDescriptor>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            socket: None,
            threads: None,
            idle_timeout_ms: 1500,
            first_output_timeout_ms: 120_000,
            stop_grace_ms: 3000,
            startup_check_ms: 200,
            models: Vec::new(),
        }
    }
}

/// Effective per-session tuning after merging model overrides onto the globals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    pub threads: u32,
    pub idle_timeout: Duration,
    pub first_output_timeout: Duration,
    pub startup_check: Duration,
    pub prompt_marker: Option<String>,
    pub submit_sentinel: String,
}

impl Config {
    /// Load config, honouring an explicit path, then the env var, then the default location.
    ///
    /// A missing file at the default location yields the defaults; a missing
    /// explicitly named file is an error.
    pub fn load(explicit: Option<&Path>) -> anyhow::Result<Self> {
        if let Some(path) = explicit {
            return Self::load_from(path);
        }
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            if !path.is_empty() {
                return Self::load_from(Path::new(&path));
            }
        }
        let path = Self::config_path();
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    /// Load config from a specific file.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Self =
            toml::from_str(&content).with_context(|| format!("parsing config {}", path.display()))?;
        Ok(config)
    }

    /// Directory holding config and the default socket.
    pub fn base_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".llamasup")
    }

    /// Path to the default config file.
    pub fn config_path() -> PathBuf {
        Self::base_dir().join("config.toml")
    }

    /// Socket path, from config or the default location.
    pub fn socket_path(&self) -> PathBuf {
        self.socket
            .clone()
            .unwrap_or_else(|| Self::base_dir().join("llamasup.sock"))
    }

    /// Build the model catalog from the `[[models]]` entries.
    pub fn catalog(&self) -> anyhow::Result<ModelCatalog> {
        Ok(ModelCatalog::new(self.models.clone())?)
    }

    pub fn default_threads(&self) -> u32 {
        self.threads.filter(|t| *t > 0).unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get() as u32)
                .unwrap_or(1)
        })
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    /// Merge a model's overrides onto the global settings.
    pub fn session_settings(&self, model: &ModelDescriptor) -> SessionSettings {
        SessionSettings {
            threads: model
                .threads
                .filter(|t| *t > 0)
                .unwrap_or_else(|| self.default_threads()),
            idle_timeout: Duration::from_millis(
                model.idle_timeout_ms.unwrap_or(self.idle_timeout_ms),
            ),
            first_output_timeout: Duration::from_millis(
                model
                    .first_output_timeout_ms
                    .unwrap_or(self.first_output_timeout_ms),
            ),
            startup_check: Duration::from_millis(self.startup_check_ms),
            prompt_marker: Some(model.prompt_marker.clone()).filter(|m| !m.is_empty()),
            submit_sentinel: model.submit_sentinel.clone(),
        }
    }
}
