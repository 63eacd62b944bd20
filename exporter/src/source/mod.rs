//! Where the raw tag-manager data comes from.
//!
//! The orchestrator only sees [`TagManagerSource`]. [`RemoteSource`] talks to
//! the live API; [`FixtureSource`] serves the same shapes from JSON files.
mod fixture;
mod remote;

pub use fixture::FixtureSource;
pub use remote::RemoteSource;

use crate::errors::SyncError;
use async_trait::async_trait;
use normalizer::{AccountRecord, ContainerRecord};
use serde_json::Value;
use std::path::PathBuf;

#[derive(thiserror::Error, Debug)]
pub enum UpstreamError {
    #[error("request to {path} timed out")]
    Timeout { path: String },

    #[error("request to {path} failed: {source}")]
    Transport {
        path: String,
        source: reqwest::Error,
    },

    #[error("{path} returned {status}")]
    Status {
        path: String,
        status: reqwest::StatusCode,
    },

    #[error("{path} still returned {status} after {attempts} attempts")]
    RetriesExhausted {
        path: String,
        status: reqwest::StatusCode,
        attempts: u32,
    },

    #[error("invalid response from {path}: {source}")]
    Decode {
        path: String,
        source: reqwest::Error,
    },

    #[error("invalid request URL for {path}: {source}")]
    InvalidUrl {
        path: String,
        source: url::ParseError,
    },

    #[error("no fixture directory configured")]
    MissingFixtureDir,

    #[error("could not read fixture {path}: {source}")]
    FixtureIo {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("could not parse fixture {path}: {source}")]
    FixtureParse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("request slot unavailable: {0}")]
    Throttle(#[from] tokio::sync::AcquireError),

    #[error("request task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Read-only access to the account → container → live version hierarchy.
#[async_trait]
pub trait TagManagerSource: Send + Sync {
    /// Makes sure credentials are usable before anything is fetched.
    async fn authenticate(&self) -> Result<(), SyncError>;

    async fn list_accounts(&self) -> Result<Vec<Value>, SyncError>;

    async fn list_containers(&self, account: &AccountRecord) -> Result<Vec<Value>, SyncError>;

    /// The published version of a container, or None if nothing was ever
    /// published.
    async fn live_version(&self, container: &ContainerRecord) -> Result<Option<Value>, SyncError>;
}

/// Resource path of an account, e.g. `accounts/123`.
pub fn account_path(account: &AccountRecord) -> String {
    match account.get_string("path") {
        Some(path) => path,
        None => format!("accounts/{}", account.get_string("accountId").unwrap_or_default()),
    }
}

/// Resource path of a container, e.g. `accounts/123/containers/456`.
pub fn container_path(container: &ContainerRecord) -> String {
    match container.get_string("path") {
        Some(path) => path,
        None => format!(
            "accounts/{}/containers/{}",
            container.get_string("accountId").unwrap_or_default(),
            container.get_string("containerId").unwrap_or_default()
        ),
    }
}
