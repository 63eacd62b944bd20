use super::{TagManagerSource, UpstreamError, account_path, container_path};
use crate::auth::TokenProvider;
use crate::config::{RequestConfig, base_url};
use crate::errors::SyncError;
use crate::metrics_defs::{UPSTREAM_REQUESTS, UPSTREAM_RETRIES};
use async_trait::async_trait;
use normalizer::{AccountRecord, ContainerRecord};
use reqwest::StatusCode;
use serde_json::Value;
use shared::counter;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::time::{Duration, sleep};
use url::Url;

const RETRIABLE_STATUS_CODES: &[StatusCode] = &[
    StatusCode::TOO_MANY_REQUESTS,     // 429
    StatusCode::INTERNAL_SERVER_ERROR, // 500
    StatusCode::BAD_GATEWAY,           // 502
    StatusCode::SERVICE_UNAVAILABLE,   // 503
    StatusCode::GATEWAY_TIMEOUT,       // 504
];

/// Reads from the tag manager REST API.
pub struct RemoteSource {
    client: reqwest::Client,
    base_url: Url,
    tokens: Arc<dyn TokenProvider>,
    max_retries: u32,
    retry_base_delay: Duration,
}

impl RemoteSource {
    /// `client` should already carry the per-request timeout.
    pub fn new(
        client: reqwest::Client,
        api_base_url: &Url,
        tokens: Arc<dyn TokenProvider>,
        request: &RequestConfig,
    ) -> Self {
        RemoteSource {
            client,
            base_url: base_url(api_base_url),
            tokens,
            max_retries: request.max_retries,
            retry_base_delay: Duration::from_millis(request.retry_base_delay_ms),
        }
    }

    /// GETs `path`, retrying transient statuses. A 404 yields `None` when
    /// `missing_ok` is set.
    async fn get(
        &self,
        path: &str,
        page_token: Option<&str>,
        endpoint: &'static str,
        missing_ok: bool,
    ) -> Result<Option<Value>, SyncError> {
        let mut url = self
            .base_url
            .join(path)
            .map_err(|source| UpstreamError::InvalidUrl {
                path: path.to_string(),
                source,
            })?;
        if let Some(token) = page_token {
            url.query_pairs_mut().append_pair("pageToken", token);
        }

        let mut retries = 0;

        loop {
            let token = self.tokens.access_token().await?;
            let response = self
                .client
                .get(url.clone())
                .bearer_auth(token)
                .send()
                .await
                .map_err(|e| transport_error(path, e))?;

            let status = response.status();
            counter!(UPSTREAM_REQUESTS, "endpoint" => endpoint, "status" => status.as_u16().to_string())
                .increment(1);

            if status == StatusCode::NOT_FOUND && missing_ok {
                return Ok(None);
            }

            if !status.is_success() {
                if !RETRIABLE_STATUS_CODES.contains(&status) {
                    return Err(UpstreamError::Status {
                        path: path.to_string(),
                        status,
                    }
                    .into());
                }
                if retries >= self.max_retries {
                    return Err(UpstreamError::RetriesExhausted {
                        path: path.to_string(),
                        status,
                        attempts: retries + 1,
                    }
                    .into());
                }

                let delay = backoff(self.retry_base_delay, retries);
                tracing::debug!(path, %status, ?delay, "Retrying request");
                counter!(UPSTREAM_RETRIES).increment(1);
                sleep(delay).await;
                retries += 1;
                continue;
            }

            let body = response.json::<Value>().await.map_err(|source| {
                if source.is_timeout() {
                    UpstreamError::Timeout {
                        path: path.to_string(),
                    }
                } else {
                    UpstreamError::Decode {
                        path: path.to_string(),
                        source,
                    }
                }
            })?;
            return Ok(Some(body));
        }
    }

    /// Collects `items_field` from every page of a list endpoint.
    async fn list_all(
        &self,
        path: &str,
        items_field: &str,
        endpoint: &'static str,
    ) -> Result<Vec<Value>, SyncError> {
        let mut items = Vec::new();
        let mut page_token: Option<String> = None;
        let mut seen_tokens = HashSet::new();
        let mut pages = 0;

        loop {
            let Some(mut page) = self.get(path, page_token.as_deref(), endpoint, false).await?
            else {
                break;
            };
            pages += 1;

            if let Some(Value::Array(page_items)) = page.get_mut(items_field).map(Value::take) {
                items.extend(page_items);
            }

            page_token = page
                .get("nextPageToken")
                .and_then(Value::as_str)
                .filter(|token| !token.is_empty())
                .map(String::from);

            match &page_token {
                None => break,
                Some(token) if !seen_tokens.insert(token.clone()) => {
                    tracing::warn!(path, token, "Page token repeated, stopping pagination");
                    break;
                }
                Some(_) => {}
            }
        }

        tracing::debug!(path, pages, items = items.len(), "Listed {items_field}");
        Ok(items)
    }
}

/// `base * 2^retries`, saturating instead of overflowing.
fn backoff(base: Duration, retries: u32) -> Duration {
    base.saturating_mul(2_u32.saturating_pow(retries))
}

fn transport_error(path: &str, source: reqwest::Error) -> UpstreamError {
    if source.is_timeout() {
        UpstreamError::Timeout {
            path: path.to_string(),
        }
    } else {
        UpstreamError::Transport {
            path: path.to_string(),
            source,
        }
    }
}

#[async_trait]
impl TagManagerSource for RemoteSource {
    async fn authenticate(&self) -> Result<(), SyncError> {
        self.tokens.access_token().await?;
        Ok(())
    }

    async fn list_accounts(&self) -> Result<Vec<Value>, SyncError> {
        self.list_all("accounts", "account", "accounts.list").await
    }

    async fn list_containers(&self, account: &AccountRecord) -> Result<Vec<Value>, SyncError> {
        let path = format!("{}/containers", account_path(account));
        self.list_all(&path, "container", "containers.list").await
    }

    async fn live_version(&self, container: &ContainerRecord) -> Result<Option<Value>, SyncError> {
        let path = format!("{}/versions:live", container_path(container));
        self.get(&path, None, "versions.live", true).await
    }
}
