use std::sync::Arc;
use std::time::Duration;

use carelink_core::{
    ChatApi, ChatError, ChatSession, ConversationContext, Participant, RestChatApi, RetryConfig,
    Role, RoomKey, SendOutcome, SendPath, SendRequest,
};
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn fast_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 3,
        initial_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(50),
        backoff_multiplier: 2.0,
        jitter: false,
    }
}

fn api_for(server: &MockServer) -> RestChatApi {
    RestChatApi::new(&server.uri(), Some("tok-1".to_string()), Duration::from_secs(5))
        .unwrap()
        .with_retry(fast_retry())
}

fn send_request(body: &str) -> SendRequest {
    SendRequest {
        receiver_id: "ph-1".to_string(),
        receiver_model: "Pharmacy".to_string(),
        message: body.to_string(),
        sender_name: Some("Pat".to_string()),
        sender_role: Some("patient".to_string()),
        medical_request_id: Some("req-1".to_string()),
        pharmacy_id: Some("ph-1".to_string()),
        patient_id: Some("pat-1".to_string()),
        client_message_id: Some("cmid-1".to_string()),
    }
}

#[tokio::test]
async fn test_history_envelope_is_parsed() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/chats/history/req-1"))
        .and(header("authorization", "Bearer tok-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "data": [
                {"_id": "m1", "sender": {"_id": "ph-1", "name": "Main St Pharmacy"}, "message": "Your order is ready", "createdAt": "2026-03-01T10:00:00Z"},
                {"sender": "ph-1", "message": "no id"},
                {"_id": "m2", "sender": "pat-1", "message": "Thanks", "createdAt": "2026-03-01T10:01:00Z", "isRead": true}
            ]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let api = api_for(&server);
    let history = api
        .fetch_history(&RoomKey::Order("req-1".into()), "pat-1")
        .await
        .unwrap();

    assert_eq!(history.len(), 2);
    assert_eq!(history[0].id, "m1");
    assert_eq!(history[0].sender_id, "ph-1");
    assert_eq!(history[0].conversation_key.as_deref(), Some("req-1"));
    assert!(history[1].is_read);
}

#[tokio::test]
async fn test_send_posts_with_bearer_and_client_id() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chats"))
        .and(header("authorization", "Bearer tok-1"))
        .and(body_partial_json(json!({
            "receiverId": "ph-1",
            "receiverModel": "Pharmacy",
            "message": "Is it ready?",
            "clientMessageId": "cmid-1",
            "medicalRequestId": "req-1"
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "success": true,
            "data": {"_id": "srv-1", "sender": "pat-1", "message": "Is it ready?", "createdAt": "2026-03-01T10:02:00Z"}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let api = api_for(&server);
    let message = api.send_message(&send_request("Is it ready?")).await.unwrap();

    assert_eq!(message.id, "srv-1");
    assert_eq!(message.client_message_id.as_deref(), Some("cmid-1"));
    assert_eq!(message.conversation_key.as_deref(), Some("req-1"));
}

#[tokio::test]
async fn test_server_errors_are_retried() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/chats/history/req-1"))
        .respond_with(ResponseTemplate::new(500).set_body_string("Internal Server Error"))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/chats/history/req-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true, "data": []})))
        .expect(1)
        .mount(&server)
        .await;

    let api = api_for(&server);
    let history = api
        .fetch_history(&RoomKey::Order("req-1".into()), "pat-1")
        .await
        .unwrap();
    assert!(history.is_empty());
}

#[tokio::test]
async fn test_unauthorized_is_not_retried() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chats"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({"message": "Token expired"})))
        .expect(1)
        .mount(&server)
        .await;

    let api = api_for(&server);
    let err = api.send_message(&send_request("Hello")).await.unwrap_err();

    assert!(matches!(err, ChatError::AuthenticationFailed(ref m) if m == "Token expired"));
    assert_eq!(err.error_code(), "E4003");
}

#[tokio::test]
async fn test_timeout_reports_configured_limit() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/chats/history/req-1"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"success": true, "data": []}))
                .set_delay(Duration::from_secs(3)),
        )
        .mount(&server)
        .await;

    let api = RestChatApi::new(&server.uri(), None, Duration::from_secs(1))
        .unwrap()
        .with_retry(RetryConfig {
            max_attempts: 1,
            ..fast_retry()
        });
    let err = api
        .fetch_history(&RoomKey::Order("req-1".into()), "pat-1")
        .await
        .unwrap_err();

    assert!(matches!(err, ChatError::RequestTimeout(1)), "{:?}", err);
    assert_eq!(err.error_code(), "E1004");
}

#[tokio::test]
async fn test_unsuccessful_envelope_is_rejected() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chats"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": false,
            "message": "Receiver not found"
        })))
        .mount(&server)
        .await;

    let api = api_for(&server);
    let err = api.send_message(&send_request("Hello")).await.unwrap_err();
    assert_eq!(err, ChatError::ServerRejected("Receiver not found".to_string()));
}

#[tokio::test]
async fn test_session_without_socket_sends_over_rest() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/chats/history/req-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "messages": [
                {"_id": "m1", "sender": "ph-1", "message": "Your order is ready", "createdAt": "2026-03-01T10:00:00Z"}
            ]
        })))
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/chats"))
        .and(body_partial_json(json!({"message": "On my way"})))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "success": true,
            "data": {"_id": "srv-9", "sender": "pat-1", "message": "On my way", "createdAt": "2099-01-01T00:00:00Z"}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let me = Participant::new("pat-1", Role::Patient).with_name("Pat");
    let context = ConversationContext::new()
        .with_medical_request("req-1")
        .with_pharmacy("ph-1");
    let session = ChatSession::builder(me, context, Arc::new(api_for(&server)))
        .open()
        .await
        .unwrap();

    assert_eq!(session.send_path(), SendPath::Rest);
    assert_eq!(session.messages().len(), 1);

    let outcome = session.send("On my way").await.unwrap();
    assert!(matches!(outcome, SendOutcome::Delivered(ref m) if m.id == "srv-9"));

    let messages = session.messages();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].id, "srv-9");
    assert!(messages.iter().all(|m| !m.is_temporary()));

    session.close().await;
}
