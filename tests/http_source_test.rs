//! HTTP changelog source against a mock directory endpoint

use serde_json::json;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use changelog_sentinel::changelog::{validate, ChangelogSource, HttpChangelogSource};
use changelog_sentinel::config::ChangelogConfig;
use changelog_sentinel::error::SentinelError;

fn config_for(server: &MockServer) -> ChangelogConfig {
    ChangelogConfig {
        url: format!("{}/", server.uri()),
        ..ChangelogConfig::default()
    }
}

#[tokio::test]
async fn test_query_sends_window_and_parses_records() {
    let mock_server = MockServer::start().await;
    let body = json!([
        {
            "dn": "changenumber=12, cn=changelog",
            "attributes": [
                {"type": "targetdn", "vals": ["uuid=u1, ou=users, o=smartdc"]},
                {"type": "changetype", "vals": ["add"]},
                {"type": "objectclass", "vals": ["changeLogEntry"]},
                {"type": "changetime", "vals": ["2016-03-01T10:00:00.000Z"]},
                {"type": "changenumber", "vals": ["12"]},
                {"type": "changes", "vals": ["{\"objectclass\":[\"sdcperson\"],\"login\":[\"alice\"]}"]}
            ]
        }
    ]);

    Mock::given(method("GET"))
        .and(path("/changelog"))
        .and(query_param("min", "12"))
        .and(query_param("limit", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(&body))
        .expect(1)
        .mount(&mock_server)
        .await;

    let source = HttpChangelogSource::new(&config_for(&mock_server)).unwrap();
    let records = source.query(12, 2).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].changenumber(), Some(12));

    let entry = validate(&records[0]).unwrap();
    assert_eq!(entry.targetdn, "uuid=u1, ou=users, o=smartdc");
    assert_eq!(entry.changes["login"][0], "alice");
}

#[tokio::test]
async fn test_server_error_is_a_source_error() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/changelog"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&mock_server)
        .await;

    let source = HttpChangelogSource::new(&config_for(&mock_server)).unwrap();
    let err = source.query(0, 10).await.unwrap_err();
    assert!(matches!(err, SentinelError::ChangelogSource(_)));
    assert!(err.is_batch_fatal());
    assert!(!err.needs_operator());
}

#[tokio::test]
async fn test_non_json_body_is_a_source_error() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/changelog"))
        .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
        .mount(&mock_server)
        .await;

    let source = HttpChangelogSource::new(&config_for(&mock_server)).unwrap();
    assert!(matches!(
        source.query(0, 10).await,
        Err(SentinelError::ChangelogSource(_))
    ));
}
