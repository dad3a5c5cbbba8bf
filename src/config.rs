//! Configuration management
//!
//! Loads the YAML configuration file: MIDI port name patterns, SysEx device
//! id and the reply timeout. Every field has a default, so running without
//! a config file works against a stock M3 setup.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub midi: MidiConfig,
    /// SysEx device id (0-15), folded into the frame's channel byte.
    #[serde(default)]
    pub device_id: u8,
    /// How long to wait for a reply before giving up on an exchange.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

/// MIDI port configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MidiConfig {
    #[serde(default = "default_input_port")]
    pub input_port: String,
    #[serde(default = "default_output_port")]
    pub output_port: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            midi: MidiConfig::default(),
            device_id: 0,
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl Default for MidiConfig {
    fn default() -> Self {
        Self {
            input_port: default_input_port(),
            output_port: default_output_port(),
        }
    }
}

impl AppConfig {
    /// Load configuration from file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: AppConfig = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse YAML config: {}", path.display()))?;

        Ok(config)
    }

    /// Load from an explicit path, or fall back to the default locations
    /// and finally to built-in defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }
        for candidate in Self::default_paths() {
            if candidate.exists() {
                info!("Loading configuration from {}", candidate.display());
                return Self::load(&candidate);
            }
        }
        info!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Candidate config locations: working directory first, then the
    /// platform config directory.
    pub fn default_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from("config.yaml")];
        if let Some(dir) = dirs::config_dir() {
            paths.push(dir.join("m3combi").join("config.yaml"));
        }
        paths
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

// Default value functions
fn default_input_port() -> String {
    "M3 1 KEYBOARD".to_string()
}
fn default_output_port() -> String {
    "M3 1 SOUND".to_string()
}
fn default_timeout_ms() -> u64 {
    5000
}
