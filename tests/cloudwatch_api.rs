//! End-to-end error-log extraction against mocked log and version-control
//! services, covering the blame correlation path.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use ownerlens::config::{AccountConfig, Config, ProjectMapping, Secrets};
use ownerlens::extract::cloudwatch;
use ownerlens::ingest::{self, IngestMessage};
use ownerlens::records::{hash_log_group, hash_user_id, Record};

fn create_config() -> Config {
    Config {
        start_time: "2023-01-01T00:00:00Z".to_string(),
        limit_time: "2023-12-31T23:59:59Z".to_string(),
        start_timestamp: 1_672_531_200,
        limit_timestamp: 1_704_067_199,
        project_acronym: "PROJ".to_string(),
        parent_group: 7,
        aws_accounts: HashMap::from([(
            "111".to_string(),
            AccountConfig {
                name: "development".to_string(),
                region: "eu-central-1".to_string(),
            },
        )]),
        log_groups: vec!["app-service".to_string()],
        project_mappings: HashMap::from([(
            "101".to_string(),
            ProjectMapping {
                log_groups: vec!["app-service".to_string()],
                platforms: vec!["aws".to_string()],
                technologies: vec!["python".to_string()],
            },
        )]),
        log_group_mappings: HashMap::from([("app-service".to_string(), 101)]),
        user_alias: HashMap::new(),
    }
}

fn create_secrets(host: &str) -> Secrets {
    Secrets {
        gitlab_host: host.to_string(),
        gitlab_token: "test-token".to_string(),
        aws_tokens: HashMap::from([("111".to_string(), "aws-token".to_string())]),
        logs_endpoint: Some(host.to_string()),
    }
}

/// A stack-trace message in the service's format: statement lines indented
/// with non-breaking spaces.
fn trace_message() -> String {
    let pad: String = "\u{a0}".repeat(4);
    format!("[ERROR] boom\n/var/task/app/handler.py, line 10, in handler\n{pad}raise ValueError()")
}

#[tokio::test]
async fn test_error_log_rows_are_attributed_and_stripped() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(header("X-Amz-Target", "Logs_20140328.StartQuery"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"queryId": "q-1"})))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(header("X-Amz-Target", "Logs_20140328.GetQueryResults"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "Complete",
            "results": [[
                {"field": "@log", "value": "111:app-service"},
                {"field": "@timestamp", "value": "2023-06-20 10:00:00.000"},
                {"field": "@message", "value": trace_message()}
            ]]
        })))
        .mount(&server)
        .await;

    // Blame flow: last commit before the row's timestamp, its annotation,
    // then identity resolution of the blamed committer.
    Mock::given(method("GET"))
        .and(path("/api/v4/projects/101/repository/commits"))
        .and(query_param("until", "2023-06-20T10:00:00Z"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"id": "abc123"}])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v4/projects/101/repository/files/app%2Fhandler.py/blame"))
        .and(query_param("ref", "abc123"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{
            "commit": {"author_email": "alice@example.com"},
            "lines": ["    raise ValueError()"]
        }])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v4/search"))
        .and(query_param("search", "alice@example.com"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"username": "alice"}])))
        .mount(&server)
        .await;

    let (tx, mut rx) = ingest::channel();
    cloudwatch::run(
        "111".to_string(),
        Arc::new(create_config()),
        Arc::new(create_secrets(&server.uri())),
        tx,
        CancellationToken::new(),
    )
    .await
    .unwrap();

    let mut accounts = 0;
    let mut log_groups = Vec::new();
    let mut error_logs = Vec::new();
    while let Some(message) = rx.recv().await {
        match message {
            IngestMessage::Record(Record::Account(account)) => {
                assert_eq!(account.name, "development");
                accounts += 1;
            }
            IngestMessage::Record(Record::LogGroup(group)) => log_groups.push(group),
            IngestMessage::Record(Record::ErrorLog(log)) => error_logs.push(log),
            message => panic!("unexpected message {message:?}"),
        }
    }

    assert_eq!(accounts, 1);
    assert_eq!(log_groups.len(), 1);
    assert_eq!(log_groups[0].name, hash_log_group("app-service"));
    assert_eq!(log_groups[0].project_id, 101);

    assert_eq!(error_logs.len(), 1);
    let log = &error_logs[0];
    assert_eq!(log.loggroup, hash_log_group("app-service"));
    assert_eq!(log.account, "development");
    assert_eq!(log.author_id, Some(hash_user_id("alice")));
    assert_eq!(log.message, None, "raw messages must not reach the store");
}

#[tokio::test]
async fn test_attribution_keyed_on_submitted_log_group() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(header("X-Amz-Target", "Logs_20140328.StartQuery"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"queryId": "q-1"})))
        .mount(&server)
        .await;
    // The service reports the row under a name absent from the project
    // mapping; the mapping lookup must use the submitted group instead.
    Mock::given(method("POST"))
        .and(header("X-Amz-Target", "Logs_20140328.GetQueryResults"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "Complete",
            "results": [[
                {"field": "@log", "value": "111:app-service-renamed"},
                {"field": "@timestamp", "value": "2023-06-20 10:00:00.000"},
                {"field": "@message", "value": trace_message()}
            ]]
        })))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/api/v4/projects/101/repository/commits"))
        .and(query_param("until", "2023-06-20T10:00:00Z"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"id": "abc123"}])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v4/projects/101/repository/files/app%2Fhandler.py/blame"))
        .and(query_param("ref", "abc123"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{
            "commit": {"author_email": "alice@example.com"},
            "lines": ["    raise ValueError()"]
        }])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v4/search"))
        .and(query_param("search", "alice@example.com"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"username": "alice"}])))
        .mount(&server)
        .await;

    let (tx, mut rx) = ingest::channel();
    cloudwatch::run(
        "111".to_string(),
        Arc::new(create_config()),
        Arc::new(create_secrets(&server.uri())),
        tx,
        CancellationToken::new(),
    )
    .await
    .unwrap();

    let mut error_logs = Vec::new();
    while let Some(IngestMessage::Record(record)) = rx.recv().await {
        if let Record::ErrorLog(log) = record {
            error_logs.push(log);
        }
    }

    assert_eq!(error_logs.len(), 1);
    assert_eq!(error_logs[0].author_id, Some(hash_user_id("alice")));
    // The record itself keeps the service-reported name.
    assert_eq!(error_logs[0].loggroup, hash_log_group("app-service-renamed"));
}

#[tokio::test]
async fn test_unattributable_row_is_kept_without_author() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(header("X-Amz-Target", "Logs_20140328.StartQuery"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"queryId": "q-1"})))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(header("X-Amz-Target", "Logs_20140328.GetQueryResults"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "Complete",
            "results": [[
                {"field": "@log", "value": "111:app-service"},
                {"field": "@timestamp", "value": "2023-06-20 10:00:00.000"},
                {"field": "@message", "value": "[ERROR] boom without a trace"}
            ]]
        })))
        .mount(&server)
        .await;

    let (tx, mut rx) = ingest::channel();
    cloudwatch::run(
        "111".to_string(),
        Arc::new(create_config()),
        Arc::new(create_secrets(&server.uri())),
        tx,
        CancellationToken::new(),
    )
    .await
    .unwrap();

    let mut error_logs = Vec::new();
    while let Some(IngestMessage::Record(record)) = rx.recv().await {
        if let Record::ErrorLog(log) = record {
            error_logs.push(log);
        }
    }

    assert_eq!(error_logs.len(), 1);
    assert_eq!(error_logs[0].author_id, None);
    assert_eq!(error_logs[0].message, None);
}
