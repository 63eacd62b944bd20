//! Warehouse sinks. A sink receives one batch per table and either accepts
//! all of it or fails.
use crate::auth::{AuthError, TokenProvider};
use crate::config::{WarehouseConfig, base_url};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use url::Url;

#[derive(thiserror::Error, Debug)]
pub enum SinkError {
    #[error("no warehouse project configured")]
    MissingProject,
    #[error("no warehouse dataset configured")]
    MissingDataset,
    #[error("could not authenticate: {0}")]
    Auth(#[from] AuthError),
    #[error("insert request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("invalid insert URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("warehouse returned {status}: {body}")]
    Rejected {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("{count} rows rejected, first at index {index}: {reason}")]
    RowErrors {
        count: usize,
        index: usize,
        reason: String,
    },
    #[error("could not encode row: {0}")]
    Encode(#[from] serde_json::Error),
    /// A later request of a chunked batch failed after earlier ones landed.
    #[error("{source} ({inserted} rows of this batch were already inserted)")]
    PartiallyInserted {
        inserted: usize,
        source: Box<SinkError>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InsertOptions {
    /// Fields unknown to the table are dropped instead of failing the batch.
    pub tolerate_schema_mismatch: bool,
}

#[async_trait]
pub trait WarehouseSink: Send + Sync {
    /// Inserts `rows` into `table` and returns how many were accepted.
    async fn insert_batch(
        &self,
        table: &str,
        rows: Vec<Value>,
        options: InsertOptions,
    ) -> Result<usize, SinkError>;
}

/// BigQuery streaming inserts (`tabledata.insertAll`).
pub struct BigQuerySink {
    client: reqwest::Client,
    base_url: Url,
    project_id: String,
    dataset: String,
    tokens: Arc<dyn TokenProvider>,
    max_rows_per_request: usize,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InsertAllResponse {
    #[serde(default)]
    insert_errors: Vec<RowInsertError>,
}

#[derive(Deserialize)]
struct RowInsertError {
    index: usize,
    #[serde(default)]
    errors: Vec<ErrorProto>,
}

#[derive(Deserialize)]
struct ErrorProto {
    #[serde(default)]
    reason: String,
    #[serde(default)]
    message: String,
}

impl BigQuerySink {
    /// The project falls back to the one named by the credentials.
    pub fn new(
        client: reqwest::Client,
        config: &WarehouseConfig,
        tokens: Arc<dyn TokenProvider>,
    ) -> Result<Self, SinkError> {
        let project_id = config
            .project_id
            .clone()
            .or_else(|| tokens.project_id().map(String::from))
            .ok_or(SinkError::MissingProject)?;
        let dataset = config.dataset.clone().ok_or(SinkError::MissingDataset)?;

        Ok(BigQuerySink {
            client,
            base_url: base_url(&config.api_base_url),
            project_id,
            dataset,
            tokens,
            max_rows_per_request: config.max_rows_per_request.max(1),
        })
    }

    async fn insert_chunk(
        &self,
        url: &Url,
        offset: usize,
        rows: &[Value],
        options: InsertOptions,
    ) -> Result<(), SinkError> {
        let body = json!({
            "kind": "bigquery#tableDataInsertAllRequest",
            "skipInvalidRows": false,
            "ignoreUnknownValues": options.tolerate_schema_mismatch,
            "rows": rows.iter().map(|row| json!({ "json": row })).collect::<Vec<_>>(),
        });

        let token = self.tokens.access_token().await?;
        let response = self
            .client
            .post(url.clone())
            .bearer_auth(token)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SinkError::Rejected { status, body });
        }

        let result: InsertAllResponse = response.json().await?;
        if let Some(first) = result.insert_errors.first() {
            let reason = first
                .errors
                .first()
                .map(|e| format!("{}: {}", e.reason, e.message))
                .unwrap_or_default();
            return Err(SinkError::RowErrors {
                count: result.insert_errors.len(),
                index: offset + first.index,
                reason,
            });
        }

        Ok(())
    }
}

#[async_trait]
impl WarehouseSink for BigQuerySink {
    async fn insert_batch(
        &self,
        table: &str,
        rows: Vec<Value>,
        options: InsertOptions,
    ) -> Result<usize, SinkError> {
        if rows.is_empty() {
            tracing::debug!(table, "Nothing to insert");
            return Ok(0);
        }

        let url = self.base_url.join(&format!(
            "projects/{}/datasets/{}/tables/{table}/insertAll",
            self.project_id, self.dataset
        ))?;

        for (chunk_index, chunk) in rows.chunks(self.max_rows_per_request).enumerate() {
            let offset = chunk_index * self.max_rows_per_request;
            self.insert_chunk(&url, offset, chunk, options)
                .await
                .map_err(|source| match offset {
                    0 => source,
                    inserted => SinkError::PartiallyInserted {
                        inserted,
                        source: Box::new(source),
                    },
                })?;
        }

        Ok(rows.len())
    }
}

/// Keeps every batch in memory. Used for dry runs and tests.
#[derive(Default)]
pub struct MemorySink {
    batches: Mutex<Vec<(String, Vec<Value>)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table names in the order their batches arrived.
    pub fn tables(&self) -> Vec<String> {
        self.batches
            .lock()
            .iter()
            .map(|(table, _)| table.clone())
            .collect()
    }

    pub fn rows(&self, table: &str) -> Vec<Value> {
        self.batches
            .lock()
            .iter()
            .filter(|(t, _)| t == table)
            .flat_map(|(_, rows)| rows.iter().cloned())
            .collect()
    }
}

#[async_trait]
impl WarehouseSink for MemorySink {
    async fn insert_batch(
        &self,
        table: &str,
        rows: Vec<Value>,
        _options: InsertOptions,
    ) -> Result<usize, SinkError> {
        let count = rows.len();
        self.batches.lock().push((table.to_string(), rows));
        Ok(count)
    }
}
