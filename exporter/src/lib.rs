//! Syncs tag-manager configuration into warehouse tables.
//!
//! [`SyncContext`] holds what survives between runs (configuration and the
//! HTTP client). Everything with run-scoped state, the request policy above
//! all, is built fresh by [`SyncContext::orchestrator`] for every run.
pub mod auth;
pub mod config;
pub mod errors;
pub mod metrics_defs;
pub mod orchestrator;
pub mod policy;
pub mod service;
pub mod sink;
pub mod source;

pub use errors::SyncError;
pub use orchestrator::{Stage, SyncOrchestrator, SyncSummary};

use crate::config::{Config, SourceType, ValidationError, WarehouseType};
use crate::policy::RequestPolicy;
use crate::service::{ServiceError, SyncService};
use crate::sink::{BigQuerySink, MemorySink, WarehouseSink};
use crate::source::{FixtureSource, RemoteSource, TagManagerSource, UpstreamError};
use shared::http::run_http_service;
use std::sync::Arc;
use std::time::Duration;

#[derive(thiserror::Error, Debug)]
pub enum SetupError {
    #[error("invalid config: {0}")]
    Validation(#[from] ValidationError),
    #[error("could not build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

pub struct SyncContext {
    config: Config,
    client: reqwest::Client,
}

impl SyncContext {
    pub fn new(config: Config) -> Result<Self, SetupError> {
        config.validate()?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request.timeout_secs))
            .build()?;

        Ok(SyncContext { config, client })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// A new orchestrator with its own policy, token provider, source and sink.
    pub fn orchestrator(&self) -> Result<SyncOrchestrator, SyncError> {
        let tokens = auth::provider_for(self.config.credentials_file.as_deref(), self.client.clone())?;

        let source: Arc<dyn TagManagerSource> = match self.config.source.r#type {
            SourceType::Remote => Arc::new(RemoteSource::new(
                self.client.clone(),
                &self.config.source.api_base_url,
                tokens.clone(),
                &self.config.request,
            )),
            SourceType::Fixture => {
                let dir = self
                    .config
                    .source
                    .fixture_dir
                    .as_deref()
                    .ok_or(UpstreamError::MissingFixtureDir)?;
                Arc::new(FixtureSource::load(dir)?)
            }
        };

        let sink: Arc<dyn WarehouseSink> = match self.config.warehouse.r#type {
            WarehouseType::Bigquery => Arc::new(BigQuerySink::new(
                self.client.clone(),
                &self.config.warehouse,
                tokens,
            )?),
            WarehouseType::Memory => Arc::new(MemorySink::new()),
        };

        Ok(SyncOrchestrator::new(
            source,
            sink,
            RequestPolicy::new(&self.config.rate_limit),
            &self.config.warehouse,
        ))
    }

    pub async fn run(&self) -> Result<SyncSummary, SyncError> {
        self.orchestrator()?.run().await
    }
}

/// Serves the HTTP trigger until the listener fails.
pub async fn serve(context: SyncContext) -> Result<(), ServiceError> {
    let host = context.config.listener.host.clone();
    let port = context.config.listener.port;
    let service = SyncService::new(Arc::new(context));

    run_http_service(&host, port, service).await
}
