//! Environment configuration.
//!
//! Every option has a documented default; values are validated at startup
//! so a misconfigured process fails fast instead of mid-job.

use anyhow::{bail, Context, Result};
use std::path::PathBuf;

use stevedore_protocol::defaults::{
    DEFAULT_BATCH_SIZE, DEFAULT_CANCEL_CHECK_INTERVAL, DEFAULT_FILE_RETENTION_HOURS,
    DEFAULT_MAX_FILE_SIZE, DEFAULT_MAX_RECORDS, DEFAULT_STREAM_MAX_LIMIT,
    DEFAULT_WORKER_CONCURRENCY,
};
use stevedore_worker::WorkerSettings;

#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite database path or URL.
    pub database_url: String,
    /// Root directory for artifacts, import sources and error reports.
    /// Import sources live under `imports/`, error reports under
    /// `import-errors/`, export artifacts at the top level.
    pub storage_path: PathBuf,
    pub worker_concurrency: usize,
    pub batch_size: usize,
    pub max_file_size: u64,
    pub max_records: usize,
    pub stream_max_limit: usize,
    pub cancel_check_interval: usize,
    pub file_retention_hours: i64,
    /// Remote-fetch host allowlist; empty means any globally-routable host.
    pub allowed_hosts: Vec<String>,
    pub download_base_url: Option<String>,
    pub log_level: Option<String>,
    pub log_json: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "stevedore.db".to_string(),
            storage_path: PathBuf::from("./storage"),
            worker_concurrency: DEFAULT_WORKER_CONCURRENCY,
            batch_size: DEFAULT_BATCH_SIZE,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            max_records: DEFAULT_MAX_RECORDS,
            stream_max_limit: DEFAULT_STREAM_MAX_LIMIT,
            cancel_check_interval: DEFAULT_CANCEL_CHECK_INTERVAL,
            file_retention_hours: DEFAULT_FILE_RETENTION_HOURS,
            allowed_hosts: Vec::new(),
            download_base_url: None,
            log_level: None,
            log_json: false,
        }
    }
}

impl Config {
    /// Read `STEVEDORE_*` environment variables over the defaults.
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();

        if let Some(value) = read("STEVEDORE_DATABASE_URL") {
            config.database_url = value;
        }
        if let Some(value) = read("STEVEDORE_STORAGE_PATH") {
            config.storage_path = PathBuf::from(value);
        }
        if let Some(value) = read("STEVEDORE_WORKER_CONCURRENCY") {
            config.worker_concurrency = parse(&value, "STEVEDORE_WORKER_CONCURRENCY")?;
        }
        if let Some(value) = read("STEVEDORE_BATCH_SIZE") {
            config.batch_size = parse(&value, "STEVEDORE_BATCH_SIZE")?;
        }
        if let Some(value) = read("STEVEDORE_MAX_FILE_SIZE") {
            config.max_file_size = parse(&value, "STEVEDORE_MAX_FILE_SIZE")?;
        }
        if let Some(value) = read("STEVEDORE_MAX_RECORDS") {
            config.max_records = parse(&value, "STEVEDORE_MAX_RECORDS")?;
        }
        if let Some(value) = read("STEVEDORE_STREAM_MAX_LIMIT") {
            config.stream_max_limit = parse(&value, "STEVEDORE_STREAM_MAX_LIMIT")?;
        }
        if let Some(value) = read("STEVEDORE_CANCEL_CHECK_INTERVAL") {
            config.cancel_check_interval = parse(&value, "STEVEDORE_CANCEL_CHECK_INTERVAL")?;
        }
        if let Some(value) = read("STEVEDORE_FILE_RETENTION_HOURS") {
            config.file_retention_hours = parse(&value, "STEVEDORE_FILE_RETENTION_HOURS")?;
        }
        if let Some(value) = read("STEVEDORE_ALLOWED_HOSTS") {
            config.allowed_hosts = value
                .split(',')
                .map(|host| host.trim().to_ascii_lowercase())
                .filter(|host| !host.is_empty())
                .collect();
        }
        if let Some(value) = read("STEVEDORE_DOWNLOAD_BASE_URL") {
            config.download_base_url = Some(value);
        }
        if let Some(value) = read("STEVEDORE_LOG_LEVEL") {
            config.log_level = Some(value);
        }
        if let Some(value) = read("STEVEDORE_LOG_JSON") {
            config.log_json = matches!(value.trim(), "1" | "true" | "TRUE");
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker_concurrency == 0 {
            bail!("worker_concurrency must be at least 1");
        }
        if self.batch_size == 0 {
            bail!("batch_size must be at least 1");
        }
        if self.max_file_size == 0 {
            bail!("max_file_size must be positive");
        }
        if self.max_records == 0 {
            bail!("max_records must be positive");
        }
        if self.stream_max_limit == 0 {
            bail!("stream_max_limit must be positive");
        }
        if self.file_retention_hours <= 0 {
            bail!("file_retention_hours must be positive");
        }
        if let Some(level) = &self.log_level {
            if !["error", "warn", "info", "debug", "trace"].contains(&level.as_str()) {
                bail!("unknown log level: {level}");
            }
        }
        Ok(())
    }

    /// Subset handed to job runs.
    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            batch_size: self.batch_size,
            max_records: self.max_records,
            stream_max_limit: self.stream_max_limit,
            cancel_check_interval: self.cancel_check_interval,
            file_retention_hours: self.file_retention_hours,
            download_base_url: self.download_base_url.clone(),
        }
    }
}

fn read(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse<T: std::str::FromStr>(value: &str, key: &str) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .with_context(|| format!("invalid value for {key}: {value:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let config = Config {
            worker_concurrency: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn unknown_log_level_is_rejected() {
        let config = Config {
            log_level: Some("loud".to_string()),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
