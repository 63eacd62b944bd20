use crate::auth::AuthError;
use crate::sink::SinkError;
use crate::source::UpstreamError;
use normalizer::SchemaViolation;

/// Why a sync run failed. Every variant is fatal for the run.
#[derive(thiserror::Error, Debug)]
pub enum SyncError {
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("upstream request failed: {0}")]
    Upstream(#[from] UpstreamError),

    #[error("schema violation: {0}")]
    Schema(#[from] SchemaViolation),

    /// The sink could not be set up; nothing was inserted.
    #[error("warehouse unavailable: {0}")]
    Warehouse(#[from] SinkError),

    #[error("insert into {table} failed: {source} (already committed: {})", committed_tables(.committed))]
    Sink {
        table: String,
        /// Tables fully inserted earlier in the same run. They are not rolled back.
        committed: Vec<String>,
        source: SinkError,
    },
}

fn committed_tables(committed: &[String]) -> String {
    if committed.is_empty() {
        "none".to_string()
    } else {
        committed.join(", ")
    }
}
