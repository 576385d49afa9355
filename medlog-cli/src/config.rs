//! Configuration loading and parsing

use anyhow::{Context, Result};
use medlog_decoder::{DecoderConfig, FamilyKind};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Main application configuration (loaded from config.toml)
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub input: InputConfig,
    #[serde(default)]
    pub decoder: DecoderConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct InputConfig {
    /// Recorded meter sessions (raw 64-byte HID reports)
    #[serde(default)]
    pub captures: Vec<PathBuf>,
    /// Pump draft event files (JSON arrays)
    #[serde(default)]
    pub drafts: Vec<PathBuf>,
    /// Device family the draft files come from
    pub family: Option<FamilyKind>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OutputConfig {
    /// Directory for `<upload id>.json` files (default: stdout)
    pub output_dir: Option<PathBuf>,
    #[serde(default)]
    pub pretty: bool,
    #[serde(default = "default_summary")]
    pub summary: bool,
}

fn default_summary() -> bool {
    true
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            output_dir: None,
            pretty: false,
            summary: default_summary(),
        }
    }
}

impl AppConfig {
    pub fn validate(&self) -> Result<()> {
        self.decoder
            .validate()
            .context("Invalid [decoder] section")?;
        if !self.input.drafts.is_empty() && self.input.family.is_none() {
            anyhow::bail!("Draft files need a device family (input.family or --family)");
        }
        Ok(())
    }
}

/// Load configuration from a TOML file
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    let config: AppConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {:?}", path))?;

    Ok(config)
}
