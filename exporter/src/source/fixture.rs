use super::{TagManagerSource, UpstreamError};
use crate::errors::SyncError;
use async_trait::async_trait;
use normalizer::{AccountRecord, ContainerRecord, scalar_string};
use serde_json::Value;
use std::path::Path;

const ACCOUNTS_FILE: &str = "accounts.json";
const CONTAINERS_FILE: &str = "containers.json";
const VERSIONS_FILE: &str = "versions.json";

/// Serves a recorded snapshot of the API from a directory of JSON arrays.
///
/// Containers are matched to accounts by `accountId` and versions to
/// containers by `accountId` and `containerId`. A missing file counts as an
/// empty array.
#[derive(Debug)]
pub struct FixtureSource {
    accounts: Vec<Value>,
    containers: Vec<Value>,
    versions: Vec<Value>,
}

impl FixtureSource {
    pub fn load(dir: &Path) -> Result<Self, UpstreamError> {
        Ok(FixtureSource {
            accounts: read_array(&dir.join(ACCOUNTS_FILE))?,
            containers: read_array(&dir.join(CONTAINERS_FILE))?,
            versions: read_array(&dir.join(VERSIONS_FILE))?,
        })
    }
}

fn read_array(path: &Path) -> Result<Vec<Value>, UpstreamError> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(UpstreamError::FixtureIo {
                path: path.to_path_buf(),
                source,
            });
        }
    };

    serde_json::from_slice(&data).map_err(|source| UpstreamError::FixtureParse {
        path: path.to_path_buf(),
        source,
    })
}

// Ids compare by string form, so `12` and `"12"` match.
fn field_matches(raw: &Value, field: &str, expected: Option<&str>) -> bool {
    expected.is_some() && raw.get(field).and_then(scalar_string).as_deref() == expected
}

#[async_trait]
impl TagManagerSource for FixtureSource {
    async fn authenticate(&self) -> Result<(), SyncError> {
        Ok(())
    }

    async fn list_accounts(&self) -> Result<Vec<Value>, SyncError> {
        Ok(self.accounts.clone())
    }

    async fn list_containers(&self, account: &AccountRecord) -> Result<Vec<Value>, SyncError> {
        let account_id = account.get_string("accountId");
        Ok(self
            .containers
            .iter()
            .filter(|c| field_matches(c, "accountId", account_id.as_deref()))
            .cloned()
            .collect())
    }

    async fn live_version(&self, container: &ContainerRecord) -> Result<Option<Value>, SyncError> {
        let account_id = container.get_string("accountId");
        let container_id = container.get_string("containerId");
        Ok(self
            .versions
            .iter()
            .find(|v| {
                field_matches(v, "accountId", account_id.as_deref())
                    && field_matches(v, "containerId", container_id.as_deref())
            })
            .cloned())
    }
}
