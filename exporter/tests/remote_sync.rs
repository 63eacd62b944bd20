use exporter::auth::StaticToken;
use exporter::config::{RequestConfig, WarehouseConfig};
use exporter::policy::RequestPolicy;
use exporter::sink::BigQuerySink;
use exporter::source::{RemoteSource, UpstreamError};
use exporter::{SyncError, SyncOrchestrator};
use serde_json::{Value, json};
use std::sync::Arc;
use url::Url;
use wiremock::matchers::{method, path, path_regex, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const TAG_MANAGER: &str = "/tagmanager/v2";
const BIGQUERY: &str = "/bigquery/v2";

fn orchestrator(server: &MockServer) -> SyncOrchestrator {
    let client = reqwest::Client::new();
    let tokens = Arc::new(StaticToken("test-token".into()));
    let request = RequestConfig {
        timeout_secs: 4,
        max_retries: 2,
        retry_base_delay_ms: 1,
    };
    let warehouse = WarehouseConfig {
        api_base_url: Url::parse(&format!("{}{BIGQUERY}", server.uri())).unwrap(),
        project_id: Some("analytics".into()),
        dataset: Some("gtm".into()),
        ..Default::default()
    };

    let source = RemoteSource::new(
        client.clone(),
        &Url::parse(&format!("{}{TAG_MANAGER}", server.uri())).unwrap(),
        tokens.clone(),
        &request,
    );
    let sink = BigQuerySink::new(client, &warehouse, tokens).unwrap();

    SyncOrchestrator::new(
        Arc::new(source),
        Arc::new(sink),
        RequestPolicy::unthrottled(2),
        &warehouse,
    )
}

async fn mount_json(server: &MockServer, route: &str, body: Value) {
    Mock::given(method("GET"))
        .and(path(format!("{TAG_MANAGER}/{route}")))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

async fn mount_hierarchy(server: &MockServer) {
    mount_json(
        server,
        "accounts",
        json!({"account": [{"path": "accounts/1", "accountId": "1", "name": "acme"}]}),
    )
    .await;

    // Second page first, so the unfiltered mock below only answers page one.
    Mock::given(method("GET"))
        .and(path(format!("{TAG_MANAGER}/accounts/1/containers")))
        .and(query_param("pageToken", "next"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "container": [{"path": "accounts/1/containers/11", "accountId": "1", "containerId": "11", "name": "app"}]
        })))
        .mount(server)
        .await;
    mount_json(
        server,
        "accounts/1/containers",
        json!({
            "container": [{"path": "accounts/1/containers/10", "accountId": "1", "containerId": "10", "name": "web"}],
            "nextPageToken": "next"
        }),
    )
    .await;

    mount_json(
        server,
        "accounts/1/containers/10/versions:live",
        json!({
            "accountId": "1",
            "containerId": "10",
            "tag": [{
                "accountId": "1", "containerId": "10", "tagId": "3",
                "name": "t", "type": "html",
                "parameter": [{"type": "template", "value": "x"}],
                "fingerprint": "f"
            }]
        }),
    )
    .await;

    // Never published.
    Mock::given(method("GET"))
        .and(path(format!(
            "{TAG_MANAGER}/accounts/1/containers/11/versions:live"
        )))
        .respond_with(ResponseTemplate::new(404))
        .mount(server)
        .await;
}

fn insert_rows(request: &wiremock::Request) -> Vec<Value> {
    let body: Value = serde_json::from_slice(&request.body).unwrap();
    body["rows"]
        .as_array()
        .unwrap()
        .iter()
        .map(|row| row["json"].clone())
        .collect()
}

#[tokio::test]
async fn test_remote_sync_end_to_end() {
    let server = MockServer::start().await;
    mount_hierarchy(&server).await;

    Mock::given(method("POST"))
        .and(path_regex(r"^/bigquery/v2/projects/analytics/datasets/gtm/tables/gtm_[a-z_]+/insertAll$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&server)
        .await;

    let summary = orchestrator(&server).run().await.unwrap();
    assert_eq!(summary.accounts, 1);
    assert_eq!(summary.containers, 2);
    assert_eq!(summary.versions, 1);

    let inserts: Vec<_> = server
        .received_requests()
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.method.as_str() == "POST")
        .collect();

    // Tables without rows are not sent at all.
    let tables: Vec<&str> = inserts
        .iter()
        .map(|r| r.url.path().split('/').nth(8).unwrap())
        .collect();
    assert_eq!(tables, vec!["gtm_accounts", "gtm_containers", "gtm_tags"]);

    assert_eq!(
        insert_rows(&inserts[2]),
        vec![json!({
            "accountId": "1",
            "containerId": "10",
            "tagId": "3",
            "name": "t",
            "type": "html",
            "parameter": [{"type": "template", "key": null, "value": "x", "list": [], "map": []}],
            "fingerprint": "f",
            "firingTriggerId": [],
            "blockingTriggerId": [],
            "tagFiringOption": null,
            "monitoringMetadata": null
        })]
    );
}

#[tokio::test]
async fn test_upstream_failure_aborts_run() {
    let server = MockServer::start().await;
    mount_json(
        &server,
        "accounts",
        json!({"account": [{"path": "accounts/1", "accountId": "1", "name": "acme"}]}),
    )
    .await;
    Mock::given(method("GET"))
        .and(path(format!("{TAG_MANAGER}/accounts/1/containers")))
        .respond_with(ResponseTemplate::new(500))
        .expect(3)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(0)
        .mount(&server)
        .await;

    let err = orchestrator(&server).run().await.unwrap_err();
    assert!(matches!(
        err,
        SyncError::Upstream(UpstreamError::RetriesExhausted { attempts: 3, .. })
    ));
}

#[tokio::test]
async fn test_rejected_rows_name_the_table() {
    let server = MockServer::start().await;
    mount_hierarchy(&server).await;

    Mock::given(method("POST"))
        .and(path(format!(
            "{BIGQUERY}/projects/analytics/datasets/gtm/tables/gtm_tags/insertAll"
        )))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "insertErrors": [{"index": 0, "errors": [{"reason": "invalid", "message": "bad row"}]}]
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&server)
        .await;

    let err = orchestrator(&server).run().await.unwrap_err();
    assert_eq!(
        err.to_string(),
        "insert into gtm_tags failed: 1 rows rejected, first at index 0: invalid: bad row \
         (already committed: gtm_accounts, gtm_containers)"
    );
}
