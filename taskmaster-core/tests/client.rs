use std::time::Duration;

use reqwest::StatusCode;
use serde_json::json;
use taskmaster_core::{ApiErrorClass, EntityKind, GatewayError, GatewayOp, TaskmasterClient};
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn create_posts_json_with_bearer_and_idempotency_key() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/tasks"))
        .and(header("authorization", "Bearer test-token"))
        .and(header("idempotency-key", "action-1"))
        .and(body_json(json!({"id": "t1", "title": "Buy milk"})))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "id": "t1",
            "title": "Buy milk",
            "userId": "u1"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = TaskmasterClient::with_base_url(&server.uri(), "test-token").unwrap();
    let created = client
        .create(
            EntityKind::Task,
            &json!({"id": "t1", "title": "Buy milk"}),
            Some("action-1"),
        )
        .await
        .unwrap();

    assert_eq!(created["userId"], "u1");
}

#[tokio::test]
async fn create_unwraps_kind_envelope() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/projects"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "project": {"id": "p-server", "name": "Home"}
        })))
        .mount(&server)
        .await;

    let client = TaskmasterClient::anonymous(&server.uri()).unwrap();
    let created = client
        .create(EntityKind::Project, &json!({"name": "Home"}), None)
        .await
        .unwrap();

    assert_eq!(created, json!({"id": "p-server", "name": "Home"}));
}

#[tokio::test]
async fn update_puts_to_item_path() {
    let server = MockServer::start().await;

    Mock::given(method("PUT"))
        .and(path("/api/notes/n%201"))
        .and(body_json(json!({"id": "n 1", "content": "draft"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "n 1",
            "content": "draft"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = TaskmasterClient::with_base_url(&server.uri(), "test-token").unwrap();
    let updated = client
        .update(
            EntityKind::Note,
            "n 1",
            &json!({"id": "n 1", "content": "draft"}),
        )
        .await
        .unwrap();

    assert_eq!(updated["content"], "draft");
}

#[tokio::test]
async fn update_with_empty_body_returns_null() {
    let server = MockServer::start().await;

    Mock::given(method("PUT"))
        .and(path("/api/habits/h1"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let client = TaskmasterClient::with_base_url(&server.uri(), "test-token").unwrap();
    let updated = client
        .update(EntityKind::Habit, "h1", &json!({"id": "h1"}))
        .await
        .unwrap();

    assert!(updated.is_null());
}

#[tokio::test]
async fn delete_treats_not_found_as_done() {
    let server = MockServer::start().await;

    Mock::given(method("DELETE"))
        .and(path("/api/tasks/gone"))
        .respond_with(ResponseTemplate::new(404).set_body_string("not found"))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/api/tasks/t1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true})))
        .mount(&server)
        .await;

    let client = TaskmasterClient::with_base_url(&server.uri(), "test-token").unwrap();
    client.delete(EntityKind::Task, "gone").await.unwrap();
    client.delete(EntityKind::Task, "t1").await.unwrap();
}

#[tokio::test]
async fn fetch_all_accepts_array_and_envelope() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/tasks"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"id": "t1"},
            {"id": "t2"}
        ])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/habits"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "habits": [{"id": "h1"}]
        })))
        .mount(&server)
        .await;

    let client = TaskmasterClient::with_base_url(&server.uri(), "test-token").unwrap();
    let tasks = client.fetch_all(EntityKind::Task).await.unwrap();
    let habits = client.fetch_all(EntityKind::Habit).await.unwrap();

    assert_eq!(tasks.len(), 2);
    assert_eq!(habits, vec![json!({"id": "h1"})]);
}

#[tokio::test]
async fn fetch_all_rejects_non_collection() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/notes"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .mount(&server)
        .await;

    let client = TaskmasterClient::with_base_url(&server.uri(), "test-token").unwrap();
    let err = client.fetch_all(EntityKind::Note).await.unwrap_err();

    assert!(matches!(
        err,
        GatewayError::UnexpectedPayload {
            kind: EntityKind::Note,
            op: GatewayOp::FetchAll
        }
    ));
}

#[tokio::test]
async fn non_success_carries_kind_op_and_retry_after() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/tasks"))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("retry-after", "7")
                .set_body_string("slow down"),
        )
        .mount(&server)
        .await;

    let client = TaskmasterClient::with_base_url(&server.uri(), "test-token").unwrap();
    let err = client
        .create(EntityKind::Task, &json!({"title": "x"}), None)
        .await
        .unwrap_err();

    match &err {
        GatewayError::Api {
            kind,
            op,
            status,
            body,
            ..
        } => {
            assert_eq!(*kind, EntityKind::Task);
            assert_eq!(*op, GatewayOp::Create);
            assert_eq!(*status, StatusCode::TOO_MANY_REQUESTS);
            assert_eq!(body, "slow down");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(err.classification(), Some(ApiErrorClass::RateLimit));
    assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
    assert!(err.is_retryable());
    assert!(err.to_string().contains("create task"));
}

#[tokio::test]
async fn unreachable_server_is_transient_request_error() {
    let client = TaskmasterClient::with_base_url("http://127.0.0.1:9", "test-token")
        .unwrap()
        .with_timeout(Duration::from_secs(2));
    let err = client.fetch_all(EntityKind::Project).await.unwrap_err();

    assert!(matches!(
        err,
        GatewayError::Request {
            kind: EntityKind::Project,
            op: GatewayOp::FetchAll,
            ..
        }
    ));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn health_returns_status() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/health"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let client = TaskmasterClient::anonymous(&server.uri()).unwrap();
    assert_eq!(
        client.health().await.unwrap(),
        StatusCode::SERVICE_UNAVAILABLE
    );
}
