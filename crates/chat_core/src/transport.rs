//! Backend contract consumed by the session, plus the reference
//! HTTP + WebSocket implementation.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use shared::{
    domain::{ConversationId, CorrelationId, MessageId, MessageKind, UserId},
    error::{ApiError, ErrorCode},
    protocol::{
        AttachmentPayload, ConversationSummary, FileUploadResponse, MarkReadRequest,
        MessagePayload, SendMessageRequest, ServerEvent, TypingSignal,
    },
};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::debug;
use url::Url;

const PUSH_EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Outbound attachment handed to the send pipeline; uploaded by the backend
/// before the message itself is dispatched.
#[derive(Debug, Clone)]
pub struct AttachmentUpload {
    pub filename: String,
    pub mime_type: Option<String>,
    pub bytes: Vec<u8>,
}

/// A validated outbound message on its way to the backend. The correlation
/// token travels with the request so the acknowledgement can be matched back
/// to the optimistic placeholder.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub sender_id: UserId,
    pub correlation_id: CorrelationId,
    pub content: String,
    pub kind: MessageKind,
    pub attachments: Vec<AttachmentUpload>,
}

/// The persistence/transport seam. One live implementation
/// ([`HttpChatBackend`]); tests script their own.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Establish the push subscription for `user_id`. Must be safe to retry
    /// after a failure and a no-op when already connected.
    async fn initialize(&self, user_id: &UserId) -> Result<()>;

    async fn get_conversations(&self, user_id: &UserId) -> Result<Vec<ConversationSummary>>;

    async fn get_messages(&self, conversation_id: &ConversationId) -> Result<Vec<MessagePayload>>;

    /// Dispatch a message; resolves to the authoritative server copy.
    async fn send_message(
        &self,
        conversation_id: &ConversationId,
        outbound: OutboundMessage,
    ) -> Result<MessagePayload>;

    async fn mark_as_read(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
        message_ids: Vec<MessageId>,
    ) -> Result<()>;

    /// Fire-and-forget; delivery failures are invisible to the caller.
    fn send_typing_indicator(&self, signal: TypingSignal);

    /// Release the push subscription. Idempotent.
    async fn disconnect(&self);

    /// Tagged push-event stream. Dropping the receiver unsubscribes.
    fn subscribe_events(&self) -> broadcast::Receiver<ServerEvent>;
}

/// Null backend for wiring a session before a transport exists.
pub struct MissingChatBackend {
    events: broadcast::Sender<ServerEvent>,
}

impl MissingChatBackend {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1);
        Self { events }
    }
}

impl Default for MissingChatBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatBackend for MissingChatBackend {
    async fn initialize(&self, user_id: &UserId) -> Result<()> {
        Err(anyhow!("chat backend unavailable for user {user_id}"))
    }

    async fn get_conversations(&self, _user_id: &UserId) -> Result<Vec<ConversationSummary>> {
        Err(anyhow!("chat backend unavailable"))
    }

    async fn get_messages(&self, conversation_id: &ConversationId) -> Result<Vec<MessagePayload>> {
        Err(anyhow!(
            "chat backend unavailable for conversation {conversation_id}"
        ))
    }

    async fn send_message(
        &self,
        conversation_id: &ConversationId,
        _outbound: OutboundMessage,
    ) -> Result<MessagePayload> {
        Err(anyhow!(
            "chat backend unavailable for conversation {conversation_id}"
        ))
    }

    async fn mark_as_read(
        &self,
        _conversation_id: &ConversationId,
        _user_id: &UserId,
        _message_ids: Vec<MessageId>,
    ) -> Result<()> {
        Err(anyhow!("chat backend unavailable"))
    }

    fn send_typing_indicator(&self, _signal: TypingSignal) {}

    async fn disconnect(&self) {}

    fn subscribe_events(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }
}

/// Reference backend: REST over `reqwest`, push events over a WebSocket
/// republished into a broadcast channel.
pub struct HttpChatBackend {
    http: Client,
    base_url: Url,
    events: broadcast::Sender<ServerEvent>,
    push_task: Mutex<Option<JoinHandle<()>>>,
}

impl HttpChatBackend {
    pub fn new(server_url: &str) -> Result<Arc<Self>> {
        let base_url = Url::parse(server_url)
            .with_context(|| format!("invalid server url: {server_url}"))?;
        if !matches!(base_url.scheme(), "http" | "https") {
            return Err(anyhow!("server url must start with http:// or https://"));
        }
        let (events, _) = broadcast::channel(PUSH_EVENT_CHANNEL_CAPACITY);
        Ok(Arc::new(Self {
            http: Client::new(),
            base_url,
            events,
            push_task: Mutex::new(None),
        }))
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{path}", self.base_url.as_str().trim_end_matches('/'))
    }

    fn push_url(&self, user_id: &UserId) -> String {
        let base = self.base_url.as_str().trim_end_matches('/');
        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else {
            format!("ws://{}", base.trim_start_matches("http://"))
        };
        format!("{ws_base}/events?user_id={user_id}")
    }

    async fn spawn_push_reader(&self, user_id: &UserId) -> Result<JoinHandle<()>> {
        let push_url = self.push_url(user_id);
        let (ws_stream, _) = connect_async(&push_url)
            .await
            .with_context(|| format!("failed to connect push stream: {push_url}"))?;
        let (_, mut reader) = ws_stream.split();

        let events = self.events.clone();
        Ok(tokio::spawn(async move {
            while let Some(frame) = reader.next().await {
                match frame {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerEvent>(&text) {
                        Ok(event) => {
                            let _ = events.send(event);
                        }
                        Err(err) => {
                            let _ = events.send(ServerEvent::Error(ApiError::new(
                                ErrorCode::Internal,
                                format!("invalid push event: {err}"),
                            )));
                        }
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        let _ = events.send(ServerEvent::Error(ApiError::new(
                            ErrorCode::Internal,
                            format!("push stream receive failed: {err}"),
                        )));
                        break;
                    }
                }
            }
        }))
    }

    async fn upload_attachment(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
        upload: AttachmentUpload,
    ) -> Result<AttachmentPayload> {
        let response: FileUploadResponse = self
            .http
            .post(self.endpoint("/files/upload"))
            .query(&[
                ("user_id", user_id.as_str()),
                ("conversation_id", conversation_id.as_str()),
                ("filename", upload.filename.as_str()),
                (
                    "mime_type",
                    upload
                        .mime_type
                        .as_deref()
                        .unwrap_or("application/octet-stream"),
                ),
            ])
            .body(upload.bytes)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(AttachmentPayload {
            file_id: response.file_id,
            filename: upload.filename,
            size_bytes: response.size_bytes,
            mime_type: upload.mime_type,
        })
    }
}

#[async_trait]
impl ChatBackend for HttpChatBackend {
    async fn initialize(&self, user_id: &UserId) -> Result<()> {
        let mut push_task = self.push_task.lock().await;
        if let Some(task) = push_task.as_ref() {
            if !task.is_finished() {
                return Ok(());
            }
        }
        *push_task = Some(self.spawn_push_reader(user_id).await?);
        Ok(())
    }

    async fn get_conversations(&self, user_id: &UserId) -> Result<Vec<ConversationSummary>> {
        let conversations = self
            .http
            .get(self.endpoint("/conversations"))
            .query(&[("user_id", user_id.as_str())])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(conversations)
    }

    async fn get_messages(&self, conversation_id: &ConversationId) -> Result<Vec<MessagePayload>> {
        let messages = self
            .http
            .get(self.endpoint(&format!("/conversations/{conversation_id}/messages")))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(messages)
    }

    async fn send_message(
        &self,
        conversation_id: &ConversationId,
        outbound: OutboundMessage,
    ) -> Result<MessagePayload> {
        let mut attachments = Vec::with_capacity(outbound.attachments.len());
        for upload in outbound.attachments {
            attachments.push(
                self.upload_attachment(conversation_id, &outbound.sender_id, upload)
                    .await?,
            );
        }

        let request = SendMessageRequest {
            sender_id: outbound.sender_id,
            correlation_id: outbound.correlation_id,
            content: outbound.content,
            kind: outbound.kind,
            attachments,
        };
        let message = self
            .http
            .post(self.endpoint(&format!("/conversations/{conversation_id}/messages")))
            .json(&request)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(message)
    }

    async fn mark_as_read(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
        message_ids: Vec<MessageId>,
    ) -> Result<()> {
        self.http
            .post(self.endpoint(&format!("/conversations/{conversation_id}/read")))
            .json(&MarkReadRequest {
                user_id: user_id.clone(),
                message_ids,
            })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    fn send_typing_indicator(&self, signal: TypingSignal) {
        let http = self.http.clone();
        let endpoint = self.endpoint(&format!(
            "/conversations/{}/typing",
            signal.conversation_id
        ));
        tokio::spawn(async move {
            let result = http.post(endpoint).json(&signal).send().await;
            if let Err(err) = result.and_then(|response| response.error_for_status()) {
                debug!(
                    conversation_id = %signal.conversation_id,
                    "chat: typing signal dropped: {err}"
                );
            }
        });
    }

    async fn disconnect(&self) {
        if let Some(task) = self.push_task.lock().await.take() {
            task.abort();
        }
    }

    fn subscribe_events(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
