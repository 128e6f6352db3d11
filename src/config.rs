use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::domain::ApiHost;
use crate::download::{DownloadOptions, ExistingPolicy, PackageLayout};
use crate::error::NbiaError;

pub const DEFAULT_CONFIG_FILE: &str = "nbia-fetch.json";
pub const DEFAULT_DESTINATION: &str = "tciaDownload";

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub api: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub page_size: Option<usize>,
    #[serde(default)]
    pub max_pages: Option<usize>,
    #[serde(default)]
    pub retry: Option<RetryEntry>,
    #[serde(default)]
    pub download: Option<DownloadEntry>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct RetryEntry {
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub base_delay_ms: Option<u64>,
    #[serde(default)]
    pub max_delay_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct DownloadEntry {
    #[serde(default)]
    pub destination: Option<String>,
    #[serde(default)]
    pub concurrency: Option<usize>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub verify_md5: Option<bool>,
    #[serde(default)]
    pub layout: Option<PackageLayout>,
    #[serde(default)]
    pub existing: Option<ExistingPolicy>,
}

/// How the HTTP client reaches the archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    pub host: ApiHost,
    pub base_url: Option<String>,
    pub timeout_secs: u64,
}

impl ClientSettings {
    pub fn api_base_url(&self) -> String {
        match &self.base_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => self.host.base_url(),
        }
    }
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            host: ApiHost::default(),
            base_url: None,
            timeout_secs: 300,
        }
    }
}

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `attempt` (0-based): base * 2^attempt, capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PagerOptions {
    pub page_size: usize,
    /// Hard ceiling on requests per query.
    pub max_pages: usize,
    pub retry: RetryPolicy,
}

impl Default for PagerOptions {
    fn default() -> Self {
        Self {
            page_size: 100,
            max_pages: 10_000,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub client: ClientSettings,
    pub pager: PagerOptions,
    pub download: DownloadOptions,
    pub destination: Utf8PathBuf,
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Loads `path`, or `nbia-fetch.json` from the current directory when it
    /// exists. Without either, defaults apply.
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, NbiaError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Self::resolve_config(Config::default());
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| NbiaError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| NbiaError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, NbiaError> {
        let schema_version = config.schema_version.unwrap_or(1);

        let host: ApiHost = config.api.as_deref().unwrap_or("services").parse()?;
        let client_defaults = ClientSettings::default();
        let client = ClientSettings {
            host,
            base_url: config.base_url.filter(|url| !url.trim().is_empty()),
            timeout_secs: config.timeout_secs.unwrap_or(client_defaults.timeout_secs),
        };
        if client.timeout_secs == 0 {
            return Err(NbiaError::InvalidConfig(
                "timeout_secs must be positive".to_string(),
            ));
        }

        let retry_defaults = RetryPolicy::default();
        let retry = match config.retry {
            Some(entry) => RetryPolicy {
                max_retries: entry.max_retries.unwrap_or(retry_defaults.max_retries),
                base_delay: entry
                    .base_delay_ms
                    .map(Duration::from_millis)
                    .unwrap_or(retry_defaults.base_delay),
                max_delay: entry
                    .max_delay_ms
                    .map(Duration::from_millis)
                    .unwrap_or(retry_defaults.max_delay),
            },
            None => retry_defaults,
        };

        let pager_defaults = PagerOptions::default();
        let pager = PagerOptions {
            page_size: config.page_size.unwrap_or(pager_defaults.page_size),
            max_pages: config.max_pages.unwrap_or(pager_defaults.max_pages),
            retry,
        };
        if pager.page_size == 0 || pager.max_pages == 0 {
            return Err(NbiaError::InvalidConfig(
                "page_size and max_pages must be positive".to_string(),
            ));
        }

        let entry = config.download.unwrap_or_default();
        let download_defaults = DownloadOptions::default();
        let download = DownloadOptions {
            concurrency: entry.concurrency.unwrap_or(download_defaults.concurrency),
            max_retries: entry.max_retries.unwrap_or(download_defaults.max_retries),
            retry_delay: retry,
            verify_md5: entry.verify_md5.unwrap_or(download_defaults.verify_md5),
            layout: entry.layout.unwrap_or(download_defaults.layout),
            existing: entry.existing.unwrap_or(download_defaults.existing),
            limit: None,
        };
        if download.concurrency == 0 {
            return Err(NbiaError::InvalidConfig(
                "download.concurrency must be at least 1".to_string(),
            ));
        }
        let destination = Utf8PathBuf::from(
            entry
                .destination
                .unwrap_or_else(|| DEFAULT_DESTINATION.to_string()),
        );

        Ok(ResolvedConfig {
            schema_version,
            client,
            pager,
            download,
            destination,
        })
    }
}
