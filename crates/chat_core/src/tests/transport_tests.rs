use super::*;
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex as StdMutex,
    },
    time::Duration,
};

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::Response,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use shared::domain::FileId;
use shared::protocol::ParticipantSummary;
use tokio::net::TcpListener;

fn at(timestamp: &str) -> DateTime<Utc> {
    timestamp.parse().expect("timestamp")
}

fn sample_message(conversation_id: &str) -> MessagePayload {
    MessagePayload {
        message_id: MessageId::new("m1"),
        conversation_id: ConversationId::new(conversation_id),
        sender_id: UserId::new("coach-9"),
        sender_name: Some("Dana".to_string()),
        content: "welcome aboard".to_string(),
        kind: MessageKind::Text,
        attachments: Vec::new(),
        created_at: at("2026-03-01T10:00:00Z"),
        is_read: false,
        is_encrypted: false,
        correlation_id: None,
    }
}

fn sample_conversation() -> ConversationSummary {
    ConversationSummary {
        conversation_id: ConversationId::new("conv1"),
        title: Some("Onboarding".to_string()),
        participants: vec![ParticipantSummary {
            user_id: UserId::new("coach-9"),
            display_name: "Dana".to_string(),
            is_online: true,
        }],
        last_message: None,
        unread_count: 0,
        updated_at: at("2026-03-01T09:00:00Z"),
    }
}

#[derive(Clone)]
struct MockServerState {
    conversation_queries: Arc<StdMutex<Vec<String>>>,
    send_requests: Arc<StdMutex<Vec<SendMessageRequest>>>,
    read_requests: Arc<StdMutex<Vec<MarkReadRequest>>>,
    typing_requests: Arc<StdMutex<Vec<TypingSignal>>>,
    uploads: Arc<StdMutex<Vec<(String, Vec<u8>)>>>,
    ws_connects: Arc<AtomicUsize>,
}

#[derive(Deserialize)]
struct UserQuery {
    user_id: String,
}

async fn list_conversations(
    State(state): State<MockServerState>,
    Query(query): Query<UserQuery>,
) -> Json<Vec<ConversationSummary>> {
    state
        .conversation_queries
        .lock()
        .expect("lock")
        .push(query.user_id);
    Json(vec![sample_conversation()])
}

async fn list_messages(Path(conversation_id): Path<String>) -> Json<Vec<MessagePayload>> {
    Json(vec![sample_message(&conversation_id)])
}

async fn post_message(
    State(state): State<MockServerState>,
    Path(conversation_id): Path<String>,
    Json(request): Json<SendMessageRequest>,
) -> Json<MessagePayload> {
    state
        .send_requests
        .lock()
        .expect("lock")
        .push(request.clone());
    Json(MessagePayload {
        message_id: MessageId::new("m42"),
        conversation_id: ConversationId::new(conversation_id),
        sender_id: request.sender_id,
        sender_name: None,
        content: request.content,
        kind: request.kind,
        attachments: request.attachments,
        created_at: at("2026-03-01T10:00:00Z"),
        is_read: false,
        is_encrypted: false,
        correlation_id: Some(request.correlation_id),
    })
}

async fn post_read(
    State(state): State<MockServerState>,
    Path(_conversation_id): Path<String>,
    Json(request): Json<MarkReadRequest>,
) -> StatusCode {
    state.read_requests.lock().expect("lock").push(request);
    StatusCode::NO_CONTENT
}

async fn post_typing(
    State(state): State<MockServerState>,
    Path(_conversation_id): Path<String>,
    Json(signal): Json<TypingSignal>,
) -> StatusCode {
    state.typing_requests.lock().expect("lock").push(signal);
    StatusCode::NO_CONTENT
}

#[derive(Deserialize)]
struct UploadQuery {
    filename: String,
}

async fn upload_file(
    State(state): State<MockServerState>,
    Query(query): Query<UploadQuery>,
    body: axum::body::Bytes,
) -> Json<FileUploadResponse> {
    state
        .uploads
        .lock()
        .expect("lock")
        .push((query.filename, body.to_vec()));
    Json(FileUploadResponse {
        file_id: FileId::new("f1"),
        size_bytes: body.len() as u64,
    })
}

async fn events_ws(State(state): State<MockServerState>, ws: WebSocketUpgrade) -> Response {
    state.ws_connects.fetch_add(1, Ordering::SeqCst);
    ws.on_upgrade(|mut socket| async move {
        let event = ServerEvent::MessageReceived {
            message: sample_message("conv1"),
        };
        let text = serde_json::to_string(&event).expect("encode");
        let _ = socket.send(WsMessage::Text(text)).await;
        // Keep the stream open so the reader task stays subscribed.
        loop {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    })
}

async fn spawn_mock_server() -> (String, MockServerState) {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let state = MockServerState {
        conversation_queries: Arc::new(StdMutex::new(Vec::new())),
        send_requests: Arc::new(StdMutex::new(Vec::new())),
        read_requests: Arc::new(StdMutex::new(Vec::new())),
        typing_requests: Arc::new(StdMutex::new(Vec::new())),
        uploads: Arc::new(StdMutex::new(Vec::new())),
        ws_connects: Arc::new(AtomicUsize::new(0)),
    };
    let app = Router::new()
        .route("/conversations", get(list_conversations))
        .route(
            "/conversations/:id/messages",
            get(list_messages).post(post_message),
        )
        .route("/conversations/:id/read", post(post_read))
        .route("/conversations/:id/typing", post(post_typing))
        .route("/files/upload", post(upload_file))
        .route("/events", get(events_ws))
        .with_state(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}"), state)
}

#[test]
fn rejects_urls_that_are_not_http() {
    assert!(HttpChatBackend::new("ftp://example.com").is_err());
    assert!(HttpChatBackend::new("not a url").is_err());
}

#[tokio::test]
async fn get_conversations_hits_the_rest_route_with_the_user_id() {
    let (server_url, state) = spawn_mock_server().await;
    let backend = HttpChatBackend::new(&server_url).expect("backend");

    let conversations = backend
        .get_conversations(&UserId::new("client-4"))
        .await
        .expect("fetch");

    assert_eq!(conversations.len(), 1);
    assert_eq!(conversations[0].title.as_deref(), Some("Onboarding"));
    assert_eq!(
        state.conversation_queries.lock().expect("lock").clone(),
        vec!["client-4"]
    );
}

#[tokio::test]
async fn get_messages_decodes_conversation_history() {
    let (server_url, _state) = spawn_mock_server().await;
    let backend = HttpChatBackend::new(&server_url).expect("backend");

    let messages = backend
        .get_messages(&ConversationId::new("conv7"))
        .await
        .expect("fetch");

    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].conversation_id, ConversationId::new("conv7"));
}

#[tokio::test]
async fn send_message_carries_the_correlation_token() {
    let (server_url, state) = spawn_mock_server().await;
    let backend = HttpChatBackend::new(&server_url).expect("backend");

    let message = backend
        .send_message(
            &ConversationId::new("conv1"),
            OutboundMessage {
                sender_id: UserId::new("client-4"),
                correlation_id: CorrelationId::new("corr-1"),
                content: "hello".to_string(),
                kind: MessageKind::Text,
                attachments: Vec::new(),
            },
        )
        .await
        .expect("send");

    assert_eq!(message.message_id, MessageId::new("m42"));
    let requests = state.send_requests.lock().expect("lock").clone();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].correlation_id, CorrelationId::new("corr-1"));
    assert_eq!(requests[0].content, "hello");
}

#[tokio::test]
async fn send_message_uploads_attachments_before_dispatch() {
    let (server_url, state) = spawn_mock_server().await;
    let backend = HttpChatBackend::new(&server_url).expect("backend");

    let message = backend
        .send_message(
            &ConversationId::new("conv1"),
            OutboundMessage {
                sender_id: UserId::new("client-4"),
                correlation_id: CorrelationId::new("corr-2"),
                content: String::new(),
                kind: MessageKind::File,
                attachments: vec![AttachmentUpload {
                    filename: "goals.pdf".to_string(),
                    mime_type: Some("application/pdf".to_string()),
                    bytes: b"goal sheet".to_vec(),
                }],
            },
        )
        .await
        .expect("send");

    let uploads = state.uploads.lock().expect("lock").clone();
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].0, "goals.pdf");
    assert_eq!(uploads[0].1, b"goal sheet".to_vec());

    let requests = state.send_requests.lock().expect("lock").clone();
    assert_eq!(requests[0].attachments.len(), 1);
    assert_eq!(requests[0].attachments[0].file_id, FileId::new("f1"));
    assert_eq!(message.attachments.len(), 1);
}

#[tokio::test]
async fn mark_as_read_posts_the_message_ids() {
    let (server_url, state) = spawn_mock_server().await;
    let backend = HttpChatBackend::new(&server_url).expect("backend");

    backend
        .mark_as_read(
            &ConversationId::new("conv1"),
            &UserId::new("client-4"),
            vec![MessageId::new("m1"), MessageId::new("m2")],
        )
        .await
        .expect("mark read");

    let requests = state.read_requests.lock().expect("lock").clone();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].user_id, UserId::new("client-4"));
    assert_eq!(
        requests[0].message_ids,
        vec![MessageId::new("m1"), MessageId::new("m2")]
    );
}

#[tokio::test]
async fn typing_indicator_posts_without_blocking_the_caller() {
    let (server_url, state) = spawn_mock_server().await;
    let backend = HttpChatBackend::new(&server_url).expect("backend");

    backend.send_typing_indicator(TypingSignal {
        conversation_id: ConversationId::new("conv1"),
        user_id: UserId::new("client-4"),
        user_name: "Sam".to_string(),
        is_typing: true,
    });

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if !state.typing_requests.lock().expect("lock").is_empty() {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "typing post never arrived"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let requests = state.typing_requests.lock().expect("lock").clone();
    assert!(requests[0].is_typing);
}

#[tokio::test]
async fn initialize_subscribes_to_the_push_stream() {
    let (server_url, _state) = spawn_mock_server().await;
    let backend = HttpChatBackend::new(&server_url).expect("backend");

    let mut events = backend.subscribe_events();
    backend
        .initialize(&UserId::new("client-4"))
        .await
        .expect("initialize");

    let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("push event timeout")
        .expect("event");
    match event {
        ServerEvent::MessageReceived { message } => {
            assert_eq!(message.message_id, MessageId::new("m1"));
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn initialize_twice_reuses_the_push_connection() {
    let (server_url, state) = spawn_mock_server().await;
    let backend = HttpChatBackend::new(&server_url).expect("backend");

    backend
        .initialize(&UserId::new("client-4"))
        .await
        .expect("first initialize");
    backend
        .initialize(&UserId::new("client-4"))
        .await
        .expect("second initialize");

    assert_eq!(state.ws_connects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn disconnect_releases_the_push_connection_and_allows_reconnect() {
    let (server_url, state) = spawn_mock_server().await;
    let backend = HttpChatBackend::new(&server_url).expect("backend");

    backend
        .initialize(&UserId::new("client-4"))
        .await
        .expect("initialize");
    backend.disconnect().await;
    backend.disconnect().await;
    backend
        .initialize(&UserId::new("client-4"))
        .await
        .expect("reconnect");

    assert_eq!(state.ws_connects.load(Ordering::SeqCst), 2);
}
