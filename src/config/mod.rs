mod file_config;

pub use file_config::{
    ApiConfig, FileConfig, LimitOverride, ProcessingConfig, RetryConfig, StorageConfig,
    WindowConfig,
};

use crate::processors::FailureDomain;
use crate::rate_limit::{CallClass, DailyWindow, ProcessingWindow};
use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// CLI arguments that can be used for config resolution.
/// TOML values override them where present.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub db_path: Option<PathBuf>,
    pub storage_root: Option<PathBuf>,
    pub api_base_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_path: PathBuf,
    pub storage: StorageSettings,
    pub api: ApiSettings,
    pub window: ProcessingWindow,
    pub processing: ProcessingSettings,
    pub limit_overrides: HashMap<CallClass, LimitOverride>,
    pub retries: RetriesSettings,
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let db_path = file
            .db_path
            .map(PathBuf::from)
            .or_else(|| cli.db_path.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("db_path must be specified via --db-path or in config file")
            })?;

        let storage_file = file.storage.unwrap_or_default();
        let storage_defaults = StorageSettings::default();
        let storage = StorageSettings {
            root: storage_file
                .root
                .map(PathBuf::from)
                .or_else(|| cli.storage_root.clone())
                .ok_or_else(|| {
                    anyhow::anyhow!(
                        "storage root must be specified via --storage-root or in config file"
                    )
                })?,
            max_files_per_dir: storage_file
                .max_files_per_dir
                .unwrap_or(storage_defaults.max_files_per_dir),
            max_sub_dirs_per_dir: storage_file
                .max_sub_dirs_per_dir
                .unwrap_or(storage_defaults.max_sub_dirs_per_dir),
            archive_prefix: storage_file
                .archive_prefix
                .unwrap_or(storage_defaults.archive_prefix),
        };
        if storage.max_files_per_dir == 0 || storage.max_sub_dirs_per_dir == 0 {
            bail!("max_files_per_dir and max_sub_dirs_per_dir must be positive");
        }

        let api_file = file.api.unwrap_or_default();
        let api_defaults = ApiSettings::default();
        let api = ApiSettings {
            base_url: api_file
                .base_url
                .or_else(|| cli.api_base_url.clone())
                .unwrap_or(api_defaults.base_url),
            token_url: api_file.token_url.unwrap_or(api_defaults.token_url),
            client_id: api_file.client_id.unwrap_or_default(),
            client_secret: api_file.client_secret.unwrap_or_default(),
            scope: api_file.scope.unwrap_or(api_defaults.scope),
            timeout_secs: api_file.timeout_secs.unwrap_or(api_defaults.timeout_secs),
            page_size: api_file.page_size.unwrap_or(api_defaults.page_size),
            max_job_retries: api_file
                .max_job_retries
                .unwrap_or(api_defaults.max_job_retries),
        };
        if api.page_size <= 0 {
            bail!("page_size must be positive, got {}", api.page_size);
        }

        let window = resolve_window(file.window.unwrap_or_default())?;

        let processing_file = file.processing.unwrap_or_default();
        let processing_defaults = ProcessingSettings::default();
        let processing = ProcessingSettings {
            poll_interval_ms: processing_file
                .poll_interval_ms
                .unwrap_or(processing_defaults.poll_interval_ms),
            wait_slice_secs: processing_file
                .wait_slice_secs
                .unwrap_or(processing_defaults.wait_slice_secs)
                .clamp(1, 10),
            retention_days: processing_file
                .retention_days
                .unwrap_or(processing_defaults.retention_days),
        };

        let mut limit_overrides = HashMap::new();
        for (name, limit) in file.limits {
            let class = CallClass::from_str(&name.to_ascii_uppercase())
                .with_context(|| format!("Unknown call class in [limits]: {}", name))?;
            limit_overrides.insert(class, limit);
        }

        let mut retries = RetriesSettings::default();
        for (name, retry) in file.retries {
            let domain = FailureDomain::from_str(&name)
                .with_context(|| format!("Unknown failure domain in [retries]: {}", name))?;
            let Some(settings) = retries.get_mut(domain) else {
                bail!("Failure domain {} takes no retry settings", name);
            };
            if let Some(max_retries) = retry.max_retries {
                settings.max_retries = max_retries;
            }
            if let Some(backoff_secs) = retry.backoff_secs {
                settings.backoff_secs = backoff_secs;
            }
        }

        Ok(Self {
            db_path,
            storage,
            api,
            window,
            processing,
            limit_overrides,
            retries,
        })
    }
}

fn resolve_window(file: WindowConfig) -> Result<ProcessingWindow> {
    let pair = |start: Option<String>, end: Option<String>, label: &str| -> Result<DailyWindow> {
        match (start, end) {
            (None, None) => Ok(DailyWindow::full_day()),
            (Some(start), Some(end)) => DailyWindow::parse(&start, &end)
                .with_context(|| format!("Invalid {} window", label)),
            _ => bail!("{} window needs both start and end", label),
        }
    };
    Ok(ProcessingWindow::new(
        pair(file.weekday_start, file.weekday_end, "weekday")?,
        pair(file.weekend_start, file.weekend_end, "weekend")?,
    ))
}

#[derive(Debug, Clone)]
pub struct StorageSettings {
    pub root: PathBuf,
    pub max_files_per_dir: usize,
    pub max_sub_dirs_per_dir: usize,
    /// Prefix of archive names, spaces are stripped.
    pub archive_prefix: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            max_files_per_dir: 1000,
            max_sub_dirs_per_dir: 1000,
            archive_prefix: "TextAssembler".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApiSettings {
    pub base_url: String,
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub scope: String,
    pub timeout_secs: u64,
    pub page_size: i64,
    /// Errors reported by the API for one search before it is failed.
    pub max_job_retries: i32,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            base_url: "https://services-api.lexisnexis.com/v1".to_string(),
            token_url: "https://auth-api.lexisnexis.com/oauth/v2/token".to_string(),
            client_id: String::new(),
            client_secret: String::new(),
            scope: "http://oauth.lexisnexis.com/all".to_string(),
            timeout_secs: 120,
            page_size: 10,
            max_job_retries: 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProcessingSettings {
    /// Delay before each poll of the queue.
    pub poll_interval_ms: u64,
    /// Longest single sleep, so shutdown is noticed promptly.
    pub wait_slice_secs: u64,
    pub retention_days: u64,
}

impl ProcessingSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn wait_slice(&self) -> Duration {
        Duration::from_secs(self.wait_slice_secs)
    }
}

impl Default for ProcessingSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            wait_slice_secs: 10,
            retention_days: 90,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub backoff_secs: u64,
}

/// Retry settings for each failure domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetriesSettings {
    pub storage: RetrySettings,
    pub database: RetrySettings,
    pub api: RetrySettings,
    pub auth: RetrySettings,
    pub filesystem: RetrySettings,
}

impl RetriesSettings {
    pub fn get(&self, domain: FailureDomain) -> RetrySettings {
        match domain {
            FailureDomain::Storage => self.storage,
            FailureDomain::Database => self.database,
            FailureDomain::Api => self.api,
            FailureDomain::Auth => self.auth,
            FailureDomain::Filesystem => self.filesystem,
            FailureDomain::Internal => RetrySettings {
                max_retries: 0,
                backoff_secs: 0,
            },
        }
    }

    fn get_mut(&mut self, domain: FailureDomain) -> Option<&mut RetrySettings> {
        match domain {
            FailureDomain::Storage => Some(&mut self.storage),
            FailureDomain::Database => Some(&mut self.database),
            FailureDomain::Api => Some(&mut self.api),
            FailureDomain::Auth => Some(&mut self.auth),
            FailureDomain::Filesystem => Some(&mut self.filesystem),
            FailureDomain::Internal => None,
        }
    }
}

impl Default for RetriesSettings {
    fn default() -> Self {
        Self {
            storage: RetrySettings {
                max_retries: 3,
                backoff_secs: 300,
            },
            database: RetrySettings {
                max_retries: 5,
                backoff_secs: 60,
            },
            api: RetrySettings {
                max_retries: 5,
                backoff_secs: 60,
            },
            auth: RetrySettings {
                max_retries: 3,
                backoff_secs: 60,
            },
            filesystem: RetrySettings {
                max_retries: 3,
                backoff_secs: 30,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;

    fn cli() -> CliConfig {
        CliConfig {
            db_path: Some(PathBuf::from("/data/searches.db")),
            storage_root: Some(PathBuf::from("/data/results")),
            api_base_url: None,
        }
    }

    #[test]
    fn test_resolve_cli_only() {
        let config = AppConfig::resolve(&cli(), None).unwrap();

        assert_eq!(config.db_path, PathBuf::from("/data/searches.db"));
        assert_eq!(config.storage.root, PathBuf::from("/data/results"));
        assert_eq!(config.storage.max_files_per_dir, 1000);
        assert_eq!(config.api.page_size, 10);
        assert_eq!(config.processing.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.window, ProcessingWindow::always_open());
        assert_eq!(config.retries, RetriesSettings::default());
        assert!(config.limit_overrides.is_empty());
    }

    #[test]
    fn test_toml_overrides_cli() {
        let file = FileConfig::parse(
            r#"
            db_path = "/other/searches.db"
            [storage]
            root = "/other/results"
            max_sub_dirs_per_dir = 20
            [window]
            weekday_start = "01:00"
            weekday_end = "05:00"
            weekend_start = "22:00"
            weekend_end = "06:00"
            [limits.download]
            per_minute = 4
            [retries.auth]
            max_retries = 1
            "#,
        )
        .unwrap();

        let config = AppConfig::resolve(&cli(), Some(file)).unwrap();
        assert_eq!(config.db_path, PathBuf::from("/other/searches.db"));
        assert_eq!(config.storage.root, PathBuf::from("/other/results"));
        assert_eq!(config.storage.max_sub_dirs_per_dir, 20);
        assert_eq!(
            config.window.weekend.start,
            NaiveTime::from_hms_opt(22, 0, 0).unwrap()
        );
        assert_eq!(config.limit_overrides[&CallClass::Download].per_minute, Some(4));
        assert_eq!(config.retries.auth.max_retries, 1);
        assert_eq!(config.retries.auth.backoff_secs, 60);
    }

    #[test]
    fn test_missing_paths_fail() {
        assert!(AppConfig::resolve(&CliConfig::default(), None).is_err());

        let no_storage = CliConfig {
            storage_root: None,
            ..cli()
        };
        assert!(AppConfig::resolve(&no_storage, None).is_err());
    }

    #[test]
    fn test_rejects_unknown_names_and_half_windows() {
        let file = FileConfig::parse("[limits.preview]\nper_day = 1").unwrap();
        assert!(AppConfig::resolve(&cli(), Some(file)).is_err());

        let file = FileConfig::parse("[retries.network]\nmax_retries = 1").unwrap();
        assert!(AppConfig::resolve(&cli(), Some(file)).is_err());

        let file = FileConfig::parse("[window]\nweekday_start = \"22:00\"").unwrap();
        assert!(AppConfig::resolve(&cli(), Some(file)).is_err());
    }

    #[test]
    fn test_wait_slice_is_capped() {
        let file = FileConfig::parse("[processing]\nwait_slice_secs = 60").unwrap();
        let config = AppConfig::resolve(&cli(), Some(file)).unwrap();
        assert_eq!(config.processing.wait_slice(), Duration::from_secs(10));
    }
}
