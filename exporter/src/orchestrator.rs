//! One sync run: accounts → containers → live versions → records → tables.
//!
//! Every run walks the same linear sequence of [`Stage`]s. Any error ends the
//! run; inserts already committed to earlier tables are kept.
use crate::config::WarehouseConfig;
use crate::errors::SyncError;
use crate::metrics_defs::{SYNC_DURATION, SYNC_ROWS_INSERTED, SYNC_RUNS};
use crate::policy::{RequestPolicy, fan_out};
use crate::sink::{InsertOptions, SinkError, WarehouseSink};
use crate::source::TagManagerSource;
use normalizer::{
    AccountRecord, ContainerRecord, EntityKind, NormalizedEntities, extract, flatten_all,
};
use serde::Serialize;
use serde_json::Value;
use shared::{counter, histogram};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Idle,
    Authenticated,
    AccountsFetched,
    ContainersFetched,
    VersionsFetched,
    Extracted,
    Normalized,
    Inserted,
    Done,
}

impl Stage {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Stage::Idle => "idle",
            Stage::Authenticated => "authenticated",
            Stage::AccountsFetched => "accounts_fetched",
            Stage::ContainersFetched => "containers_fetched",
            Stage::VersionsFetched => "versions_fetched",
            Stage::Extracted => "extracted",
            Stage::Normalized => "normalized",
            Stage::Inserted => "inserted",
            Stage::Done => "done",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a successful run did.
#[derive(Clone, Debug, PartialEq)]
pub struct SyncSummary {
    pub accounts: usize,
    pub containers: usize,
    /// Containers that had a published version.
    pub versions: usize,
    /// Rows inserted per table, in insert order.
    pub inserted: Vec<(String, usize)>,
    pub elapsed: Duration,
}

impl SyncSummary {
    pub fn total_rows(&self) -> usize {
        self.inserted.iter().map(|(_, rows)| rows).sum()
    }
}

impl fmt::Display for SyncSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Synced {} live versions from {} containers in {} accounts; inserted {} rows (",
            self.versions,
            self.containers,
            self.accounts,
            self.total_rows()
        )?;
        for (i, (table, rows)) in self.inserted.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{table}: {rows}")?;
        }
        write!(f, ") in {:.1}s", self.elapsed.as_secs_f64())
    }
}

pub struct SyncOrchestrator {
    source: Arc<dyn TagManagerSource>,
    sink: Arc<dyn WarehouseSink>,
    policy: Arc<RequestPolicy>,
    /// Destination table of every kind, in insert order.
    tables: Vec<(EntityKind, String)>,
    insert_options: InsertOptions,
}

impl SyncOrchestrator {
    pub fn new(
        source: Arc<dyn TagManagerSource>,
        sink: Arc<dyn WarehouseSink>,
        policy: RequestPolicy,
        warehouse: &WarehouseConfig,
    ) -> Self {
        SyncOrchestrator {
            source,
            sink,
            policy: Arc::new(policy),
            tables: EntityKind::ALL
                .iter()
                .map(|kind| (*kind, warehouse.table_name(*kind)))
                .collect(),
            insert_options: InsertOptions {
                tolerate_schema_mismatch: warehouse.tolerate_schema_mismatch,
            },
        }
    }

    /// Runs the sync once and records its outcome metrics.
    pub async fn run(&self) -> Result<SyncSummary, SyncError> {
        let started = Instant::now();
        let result = self.execute(started).await;

        let outcome = match &result {
            Ok(_) => "success",
            Err(_) => "failure",
        };
        counter!(SYNC_RUNS, "outcome" => outcome).increment(1);
        histogram!(SYNC_DURATION, "outcome" => outcome).record(started.elapsed().as_secs_f64());

        if let Err(e) = &result {
            tracing::error!(error = %e, "Sync failed");
        }
        result
    }

    async fn execute(&self, started: Instant) -> Result<SyncSummary, SyncError> {
        enter(Stage::Idle);

        self.source.authenticate().await?;
        enter(Stage::Authenticated);

        let accounts: Vec<AccountRecord> = flatten_all(&self.source.list_accounts().await?)?;
        tracing::info!(accounts = accounts.len(), "Listed accounts");
        enter(Stage::AccountsFetched);

        let source = self.source.clone();
        let container_lists = fan_out(self.policy.clone(), accounts.clone(), move |account| {
            let source = source.clone();
            async move { source.list_containers(&account).await }
        })
        .await?;
        let raw_containers: Vec<Value> = container_lists.into_iter().flatten().collect();
        let containers: Vec<ContainerRecord> = flatten_all(&raw_containers)?;
        tracing::info!(containers = containers.len(), "Listed containers");
        enter(Stage::ContainersFetched);

        let source = self.source.clone();
        let live_versions = fan_out(self.policy.clone(), containers.clone(), move |container| {
            let source = source.clone();
            async move { source.live_version(&container).await }
        })
        .await?;
        let versions: Vec<Value> = live_versions.into_iter().flatten().collect();
        tracing::info!(
            versions = versions.len(),
            unpublished = containers.len() - versions.len(),
            "Fetched live versions"
        );
        enter(Stage::VersionsFetched);

        let extracted = extract(&versions);
        tracing::info!(
            tags = extracted.tags.len(),
            variables = extracted.variables.len(),
            built_in_variables = extracted.built_in_variables.len(),
            triggers = extracted.triggers.len(),
            "Extracted entities"
        );
        enter(Stage::Extracted);

        let entities = NormalizedEntities::from_extracted(&extracted)?;
        enter(Stage::Normalized);

        let inserted = self.insert_all(&accounts, &containers, &entities).await?;
        enter(Stage::Inserted);

        let summary = SyncSummary {
            accounts: accounts.len(),
            containers: containers.len(),
            versions: versions.len(),
            inserted,
            elapsed: started.elapsed(),
        };
        enter(Stage::Done);
        tracing::info!(rows = summary.total_rows(), "{summary}");

        Ok(summary)
    }

    /// One batch per table, one table at a time.
    async fn insert_all(
        &self,
        accounts: &[AccountRecord],
        containers: &[ContainerRecord],
        entities: &NormalizedEntities,
    ) -> Result<Vec<(String, usize)>, SyncError> {
        let mut inserted: Vec<(String, usize)> = Vec::with_capacity(self.tables.len());

        for (kind, table) in &self.tables {
            let rows = match kind {
                EntityKind::Account => to_rows(accounts),
                EntityKind::Container => to_rows(containers),
                EntityKind::Tag => to_rows(&entities.tags),
                EntityKind::Variable => to_rows(&entities.variables),
                EntityKind::BuiltInVariable => to_rows(&entities.built_in_variables),
                EntityKind::Trigger => to_rows(&entities.triggers),
            };

            let result = match rows {
                Ok(rows) => {
                    self.sink
                        .insert_batch(table, rows, self.insert_options)
                        .await
                }
                Err(e) => Err(e),
            };

            match result {
                Ok(count) => {
                    tracing::info!(table = %table, rows = count, "Inserted batch");
                    counter!(SYNC_ROWS_INSERTED, "table" => table.clone()).increment(count as u64);
                    inserted.push((table.clone(), count));
                }
                Err(source) => {
                    return Err(SyncError::Sink {
                        table: table.clone(),
                        committed: inserted.into_iter().map(|(table, _)| table).collect(),
                        source,
                    });
                }
            }
        }

        Ok(inserted)
    }
}

fn enter(stage: Stage) {
    tracing::info!(stage = %stage, "Sync stage reached");
}

fn to_rows<T: Serialize>(records: &[T]) -> Result<Vec<Value>, SinkError> {
    records
        .iter()
        .map(|record| serde_json::to_value(record).map_err(SinkError::from))
        .collect()
}
