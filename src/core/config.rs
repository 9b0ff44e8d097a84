use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::core::state::BookRequest;
use crate::services::llm::LlmConfig;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_build")]
    pub build_folder: String,

    #[serde(default)]
    pub unattended: bool,

    pub llm: LlmConfig,

    #[serde(default)]
    pub generation: GenerationConfig,

    #[serde(default)]
    pub book: Option<BookRequest>,
}

/// Knobs for the page loop and the coherence tracker.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_recent_window_size")]
    pub recent_window_size: usize,
    #[serde(default = "default_page_char_cap")]
    pub page_char_cap: usize,
    #[serde(default = "default_summary_cadence")]
    pub summary_cadence: u32,
    #[serde(default = "default_plot_point_limit")]
    pub plot_point_limit: usize,
    #[serde(default = "default_subplot_limit")]
    pub subplot_limit: usize,
    #[serde(default = "default_fact_limit")]
    pub fact_limit: usize,
    #[serde(default = "default_figurative_limit")]
    pub figurative_limit: usize,

    #[serde(default = "default_page_temperature")]
    pub page_temperature: f32,
    #[serde(default = "default_extraction_temperature")]
    pub extraction_temperature: f32,
    #[serde(default = "default_summary_temperature")]
    pub summary_temperature: f32,
    #[serde(default = "default_outline_temperature")]
    pub outline_temperature: f32,

    #[serde(default = "default_page_max_tokens")]
    pub page_max_tokens: u32,
    #[serde(default = "default_extraction_max_tokens")]
    pub extraction_max_tokens: u32,
    #[serde(default = "default_summary_max_tokens")]
    pub summary_max_tokens: u32,
    #[serde(default = "default_outline_max_tokens")]
    pub outline_max_tokens: u32,

    #[serde(default = "default_page_timeout")]
    pub page_timeout_seconds: u64,
    #[serde(default = "default_extraction_timeout")]
    pub extraction_timeout_seconds: u64,
    #[serde(default = "default_summary_timeout")]
    pub summary_timeout_seconds: u64,
    #[serde(default = "default_outline_timeout")]
    pub outline_timeout_seconds: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            recent_window_size: default_recent_window_size(),
            page_char_cap: default_page_char_cap(),
            summary_cadence: default_summary_cadence(),
            plot_point_limit: default_plot_point_limit(),
            subplot_limit: default_subplot_limit(),
            fact_limit: default_fact_limit(),
            figurative_limit: default_figurative_limit(),
            page_temperature: default_page_temperature(),
            extraction_temperature: default_extraction_temperature(),
            summary_temperature: default_summary_temperature(),
            outline_temperature: default_outline_temperature(),
            page_max_tokens: default_page_max_tokens(),
            extraction_max_tokens: default_extraction_max_tokens(),
            summary_max_tokens: default_summary_max_tokens(),
            outline_max_tokens: default_outline_max_tokens(),
            page_timeout_seconds: default_page_timeout(),
            extraction_timeout_seconds: default_extraction_timeout(),
            summary_timeout_seconds: default_summary_timeout(),
            outline_timeout_seconds: default_outline_timeout(),
        }
    }
}

impl GenerationConfig {
    pub fn page_timeout(&self) -> Duration {
        Duration::from_secs(self.page_timeout_seconds)
    }

    pub fn extraction_timeout(&self) -> Duration {
        Duration::from_secs(self.extraction_timeout_seconds)
    }

    pub fn summary_timeout(&self) -> Duration {
        Duration::from_secs(self.summary_timeout_seconds)
    }

    pub fn outline_timeout(&self) -> Duration {
        Duration::from_secs(self.outline_timeout_seconds)
    }
}

fn default_build() -> String {
    "build".to_string()
}
fn default_recent_window_size() -> usize {
    10
}
fn default_page_char_cap() -> usize {
    2500
}
fn default_summary_cadence() -> u32 {
    5
}
fn default_plot_point_limit() -> usize {
    5
}
fn default_subplot_limit() -> usize {
    5
}
fn default_fact_limit() -> usize {
    10
}
fn default_figurative_limit() -> usize {
    10
}
fn default_page_temperature() -> f32 {
    0.8
}
fn default_extraction_temperature() -> f32 {
    0.2
}
fn default_summary_temperature() -> f32 {
    0.3
}
fn default_outline_temperature() -> f32 {
    0.7
}
fn default_page_max_tokens() -> u32 {
    4096
}
fn default_extraction_max_tokens() -> u32 {
    2048
}
fn default_summary_max_tokens() -> u32 {
    2048
}
fn default_outline_max_tokens() -> u32 {
    8192
}
fn default_page_timeout() -> u64 {
    180
}
fn default_extraction_timeout() -> u64 {
    60
}
fn default_summary_timeout() -> u64 {
    90
}
fn default_outline_timeout() -> u64 {
    120
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from("config.yml")
    }

    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            anyhow::bail!("{} not found. Please create one.", path.display());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_yaml(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml_ng::from_str(content)?)
    }

    pub fn ensure_directories(&self) -> Result<()> {
        fs::create_dir_all(&self.build_folder)?;
        Ok(())
    }
}
