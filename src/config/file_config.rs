use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    // Core settings (can override CLI)
    pub db_path: Option<String>,

    pub storage: Option<StorageConfig>,
    pub api: Option<ApiConfig>,
    pub window: Option<WindowConfig>,
    pub processing: Option<ProcessingConfig>,
    /// Keyed by call class: `search`, `download`, `sources`.
    pub limits: HashMap<String, LimitOverride>,
    /// Keyed by failure domain: `storage`, `database`, `api`, `auth`, `filesystem`.
    pub retries: HashMap<String, RetryConfig>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub root: Option<String>,
    pub max_files_per_dir: Option<usize>,
    pub max_sub_dirs_per_dir: Option<usize>,
    pub archive_prefix: Option<String>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: Option<String>,
    pub token_url: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub scope: Option<String>,
    pub timeout_secs: Option<u64>,
    pub page_size: Option<i64>,
    pub max_job_retries: Option<i32>,
}

/// `HH:MM` bounds of the processing window.
#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct WindowConfig {
    pub weekday_start: Option<String>,
    pub weekday_end: Option<String>,
    pub weekend_start: Option<String>,
    pub weekend_end: Option<String>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct ProcessingConfig {
    pub poll_interval_ms: Option<u64>,
    pub wait_slice_secs: Option<u64>,
    pub retention_days: Option<u64>,
}

/// Configured quota for a call class. Unset values fall back to the limits
/// last reported by the API.
#[derive(Debug, Deserialize, Default, Clone, Copy, PartialEq, Eq)]
#[serde(default)]
pub struct LimitOverride {
    pub per_minute: Option<i64>,
    pub per_hour: Option<i64>,
    pub per_day: Option<i64>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: Option<u32>,
    pub backoff_secs: Option<u64>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        Self::parse(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }
}
