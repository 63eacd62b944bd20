use normalizer::EntityKind;
use serde::Deserialize;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use url::Url;

const DEFAULT_TAG_MANAGER_URL: &str = "https://tagmanager.googleapis.com/tagmanager/v2/";
const DEFAULT_BIGQUERY_URL: &str = "https://bigquery.googleapis.com/bigquery/v2/";

/// Longest allowed gap between two dispatches.
pub const MAX_SPACING: Duration = Duration::from_secs(24 * 60 * 60);

/// Upper bound for `request.max_retries`; backoff doubles per retry.
pub const MAX_RETRIES: u32 = 10;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("could not load config from file: {0}")]
    LoadError(#[from] std::io::Error),
    #[error("could not parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),
    #[error("invalid value {value:?} for environment variable {var}")]
    InvalidEnv { var: &'static str, value: String },
}

#[derive(Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("Port cannot be 0")]
    InvalidPort,

    #[error("Rate must be a positive number of requests per interval")]
    InvalidRate,

    #[error("Rate limit interval cannot be 0")]
    InvalidInterval,

    #[error("Rate is too low: dispatches would be more than a day apart")]
    RateTooLow,

    #[error("max_retries cannot exceed {}", MAX_RETRIES)]
    TooManyRetries,

    #[error("Concurrency cannot be 0")]
    InvalidConcurrency,

    #[error("Request timeout cannot be 0")]
    InvalidTimeout,

    #[error("max_rows_per_request cannot be 0")]
    InvalidBatchSize,

    #[error("A warehouse dataset is required for the bigquery sink")]
    MissingDataset,

    #[error("A fixture directory is required for the fixture source")]
    MissingFixtureDir,
}

/// Exporter configuration. Every section has defaults, so an empty file (or
/// no file at all) plus environment variables is a valid setup.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Where the HTTP trigger listens
    pub listener: Listener,
    /// Credentials file for the remote APIs. When unset, tokens come from the
    /// metadata server of the host the exporter runs on.
    pub credentials_file: Option<PathBuf>,
    pub source: SourceConfig,
    pub warehouse: WarehouseConfig,
    pub rate_limit: RateLimitConfig,
    pub request: RequestConfig,
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        let data = serde_yaml::from_reader(file)?;

        Ok(data)
    }

    /// Overrides file values with environment variables. `lookup` returns the
    /// value of a variable, if set.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |var: &'static str| lookup(var).filter(|v| !v.is_empty());

        if let Some(host) = get("GTM_SYNC_HOST") {
            self.listener.host = host;
        }
        if let Some(port) = get("PORT") {
            self.listener.port = parse_env("PORT", port)?;
        }
        if let Some(path) = get("GOOGLE_APPLICATION_CREDENTIALS") {
            self.credentials_file = Some(path.into());
        }
        if let Some(source) = get("GTM_SYNC_SOURCE") {
            self.source.r#type = parse_env("GTM_SYNC_SOURCE", source)?;
        }
        if let Some(dir) = get("GTM_SYNC_FIXTURE_DIR") {
            self.source.fixture_dir = Some(dir.into());
        }
        if let Some(sink) = get("GTM_SYNC_WAREHOUSE") {
            self.warehouse.r#type = parse_env("GTM_SYNC_WAREHOUSE", sink)?;
        }
        if let Some(project) = get("GTM_SYNC_PROJECT_ID") {
            self.warehouse.project_id = Some(project);
        }
        if let Some(dataset) = get("GTM_SYNC_DATASET") {
            self.warehouse.dataset = Some(dataset);
        }
        if let Some(prefix) = lookup("GTM_SYNC_TABLE_PREFIX") {
            self.warehouse.table_prefix = prefix;
        }
        if let Some(interval) = get("GTM_SYNC_RATE_INTERVAL_MS") {
            self.rate_limit.interval_ms = parse_env("GTM_SYNC_RATE_INTERVAL_MS", interval)?;
        }
        if let Some(rate) = get("GTM_SYNC_RATE") {
            self.rate_limit.rate = parse_env("GTM_SYNC_RATE", rate)?;
        }
        if let Some(concurrency) = get("GTM_SYNC_CONCURRENCY") {
            self.rate_limit.concurrency = parse_env("GTM_SYNC_CONCURRENCY", concurrency)?;
        }
        if let Some(timeout) = get("GTM_SYNC_REQUEST_TIMEOUT_SECS") {
            self.request.timeout_secs = parse_env("GTM_SYNC_REQUEST_TIMEOUT_SECS", timeout)?;
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        self.listener.validate()?;
        self.rate_limit.validate()?;

        if self.request.timeout_secs == 0 {
            return Err(ValidationError::InvalidTimeout);
        }
        if self.request.max_retries > MAX_RETRIES {
            return Err(ValidationError::TooManyRetries);
        }

        if self.source.r#type == SourceType::Fixture && self.source.fixture_dir.is_none() {
            return Err(ValidationError::MissingFixtureDir);
        }

        if self.warehouse.r#type == WarehouseType::Bigquery && self.warehouse.dataset.is_none() {
            return Err(ValidationError::MissingDataset);
        }

        if self.warehouse.max_rows_per_request == 0 {
            return Err(ValidationError::InvalidBatchSize);
        }

        Ok(())
    }
}

fn parse_env<T: FromStr>(var: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::InvalidEnv { var, value })
}

/// Network listener configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Listener {
    /// Host address to bind to (e.g., "0.0.0.0" or "127.0.0.1")
    pub host: String,
    /// Port number to listen on
    pub port: u16,
}

impl Default for Listener {
    fn default() -> Self {
        Listener {
            host: "0.0.0.0".into(),
            port: 8080,
        }
    }
}

impl Listener {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.port == 0 {
            return Err(ValidationError::InvalidPort);
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    /// Live tag-manager API
    #[default]
    Remote,
    /// JSON files on disk, for local runs and tests
    Fixture,
}

impl FromStr for SourceType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "remote" => Ok(SourceType::Remote),
            "fixture" => Ok(SourceType::Fixture),
            _ => Err(()),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct SourceConfig {
    pub r#type: SourceType,
    pub api_base_url: Url,
    /// Directory holding `accounts.json`, `containers.json` and `versions.json`
    pub fixture_dir: Option<PathBuf>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        SourceConfig {
            r#type: SourceType::Remote,
            api_base_url: default_url(DEFAULT_TAG_MANAGER_URL),
            fixture_dir: None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WarehouseType {
    #[default]
    Bigquery,
    /// Keeps rows in memory; nothing is written anywhere
    Memory,
}

impl FromStr for WarehouseType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bigquery" => Ok(WarehouseType::Bigquery),
            "memory" => Ok(WarehouseType::Memory),
            _ => Err(()),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct WarehouseConfig {
    pub r#type: WarehouseType,
    pub api_base_url: Url,
    /// Falls back to the project of the service account credentials
    pub project_id: Option<String>,
    pub dataset: Option<String>,
    pub table_prefix: String,
    /// Let the warehouse drop columns it does not know instead of rejecting
    /// the whole batch
    pub tolerate_schema_mismatch: bool,
    pub max_rows_per_request: usize,
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        WarehouseConfig {
            r#type: WarehouseType::Bigquery,
            api_base_url: default_url(DEFAULT_BIGQUERY_URL),
            project_id: None,
            dataset: None,
            table_prefix: "gtm_".into(),
            tolerate_schema_mismatch: true,
            max_rows_per_request: 500,
        }
    }
}

impl WarehouseConfig {
    pub fn table_name(&self, kind: EntityKind) -> String {
        let suffix = match kind {
            EntityKind::Account => "accounts",
            EntityKind::Container => "containers",
            EntityKind::Tag => "tags",
            EntityKind::Variable => "variables",
            EntityKind::BuiltInVariable => "built_in_variables",
            EntityKind::Trigger => "triggers",
        };
        format!("{}{suffix}", self.table_prefix)
    }
}

/// Limits applied to the fan-out phases against the remote API.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Length of one rate window in milliseconds
    pub interval_ms: u64,
    /// Requests dispatched per window. Fractions spread one request over
    /// several windows.
    pub rate: f64,
    /// Requests allowed in flight at once
    pub concurrency: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        RateLimitConfig {
            interval_ms: 1000,
            rate: 0.25,
            concurrency: 4,
        }
    }
}

impl RateLimitConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !(self.rate.is_finite() && self.rate > 0.0) {
            return Err(ValidationError::InvalidRate);
        }
        if self.interval_ms == 0 {
            return Err(ValidationError::InvalidInterval);
        }
        if self.concurrency == 0 {
            return Err(ValidationError::InvalidConcurrency);
        }
        if self.spacing().is_none() {
            return Err(ValidationError::RateTooLow);
        }
        Ok(())
    }

    /// Gap between two dispatches, `interval / rate`. None when the result
    /// is not a finite duration or exceeds [`MAX_SPACING`].
    pub fn spacing(&self) -> Option<Duration> {
        let secs = Duration::from_millis(self.interval_ms).as_secs_f64() / self.rate;
        Duration::try_from_secs_f64(secs)
            .ok()
            .filter(|spacing| *spacing <= MAX_SPACING)
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct RequestConfig {
    /// Applies to every outbound call, remote API and warehouse alike
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
}

impl Default for RequestConfig {
    fn default() -> Self {
        RequestConfig {
            timeout_secs: 4,
            max_retries: 3,
            retry_base_delay_ms: 500,
        }
    }
}

fn default_url(url: &str) -> Url {
    Url::parse(url).expect("built-in URL is valid")
}

/// `url` with a trailing slash, so relative joins append to its path instead
/// of replacing the last segment.
pub(crate) fn base_url(url: &Url) -> Url {
    let mut url = url.clone();
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}
