//! Configuration management for the dewarp tool.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Batch-processing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Case-sensitive filename suffix selecting input files.
    #[serde(default = "default_extension")]
    pub extension: String,

    /// Inserted between the file stem and the extension of outputs.
    #[serde(default = "default_suffix")]
    pub suffix: String,

    /// Worker count for per-file parallelism; 0 means one per core.
    #[serde(default)]
    pub jobs: usize,
}

fn default_extension() -> String {
    "JPG".to_string()
}

fn default_suffix() -> String {
    "_dewarped".to_string()
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            extension: default_extension(),
            suffix: default_suffix(),
            jobs: 0,
        }
    }
}

/// Settings for the external exiftool process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExifToolConfig {
    /// Executable to invoke; a bare name is resolved through PATH.
    #[serde(default = "default_command")]
    pub command: String,

    /// Bounded wait for each metadata command, in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Extra attempts for the metadata copy step, the one external call that
    /// fails transiently.
    #[serde(default = "default_copy_retries")]
    pub copy_retries: u32,
}

fn default_command() -> String {
    "exiftool".to_string()
}

fn default_timeout_secs() -> u64 {
    20
}

fn default_copy_retries() -> u32 {
    1
}

impl Default for ExifToolConfig {
    fn default() -> Self {
        Self {
            command: default_command(),
            timeout_secs: default_timeout_secs(),
            copy_retries: default_copy_retries(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub batch: BatchConfig,

    #[serde(default)]
    pub exiftool: ExifToolConfig,
}

impl Config {
    /// Load configuration from a file, or create default if it doesn't exist
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {:?}", path))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config from {:?}", path))?;
            tracing::info!("Loaded configuration from {:?}", path);
            Ok(config)
        } else {
            let config = Config::default();
            config.save(path)?;
            tracing::info!("Created default configuration at {:?}", path);
            Ok(config)
        }
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create config directory {:?}", parent))?;
            }
        }

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config to {:?}", path))?;

        Ok(())
    }
}
