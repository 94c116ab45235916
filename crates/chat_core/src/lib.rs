//! Real-time conversation subsystem for the coaching platform: conversation
//! directory, ordered message logs, read receipts, typing indicators, and the
//! optimistic outbound send pipeline, all fed by a push-based backend.
//!
//! The [`ChatSession`] is the composition-root entry point: constructed once
//! per login with an injected [`ChatBackend`], torn down on logout. UI code
//! only ever reads through its accessors and mutates through its operations.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::Utc;
use shared::{
    domain::{ConversationId, CorrelationId, FileId, MessageId, MessageKind, UserId},
    protocol::{
        AttachmentPayload, ConversationSummary, MessagePayload, ServerEvent, TypingSignal,
    },
};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

pub mod directory;
pub mod error;
pub mod message_log;
pub mod transport;
pub mod typing;

pub use directory::ConversationDirectory;
pub use error::ChatError;
pub use message_log::{DeliveryState, DuplicateMessageError, LoggedMessage, MessageLog};
pub use transport::{
    AttachmentUpload, ChatBackend, HttpChatBackend, MissingChatBackend, OutboundMessage,
};
pub use typing::{LocalTypingDebounce, Typist, TypingTracker, TYPING_EXPIRY_WINDOW};

const SESSION_EVENT_CHANNEL_CAPACITY: usize = 1024;
const TYPING_SWEEP_INTERVAL: Duration = Duration::from_millis(500);

/// Events fanned out to the UI layer. Dropping the receiver unsubscribes.
#[derive(Debug, Clone)]
pub enum ChatEvent {
    Connected {
        user_id: UserId,
    },
    Disconnected,
    ConversationUpdated {
        conversation: ConversationSummary,
    },
    HistoryLoaded {
        conversation_id: ConversationId,
    },
    MessageAppended {
        message: LoggedMessage,
    },
    /// An optimistic placeholder was replaced by the authoritative server
    /// copy; `local_message_id` no longer exists in the log.
    MessageReconciled {
        conversation_id: ConversationId,
        local_message_id: MessageId,
        message: LoggedMessage,
    },
    /// Dispatch failed; the message stays in the log marked failed.
    MessageSendFailed {
        conversation_id: ConversationId,
        message_id: MessageId,
    },
    TypingChanged {
        conversation_id: ConversationId,
        typists: Vec<Typist>,
    },
    Error(String),
}

struct SessionState {
    user_id: Option<UserId>,
    active_conversation: Option<ConversationId>,
    directory: ConversationDirectory,
    log: MessageLog,
    typing: TypingTracker,
    typing_debounce: LocalTypingDebounce,
    last_typing_broadcast: Vec<Typist>,
    pending_attachments: HashMap<CorrelationId, Vec<AttachmentUpload>>,
    router_task: Option<JoinHandle<()>>,
    sweep_task: Option<JoinHandle<()>>,
}

impl SessionState {
    fn new() -> Self {
        Self {
            user_id: None,
            active_conversation: None,
            directory: ConversationDirectory::new(),
            log: MessageLog::new(),
            typing: TypingTracker::new(),
            typing_debounce: LocalTypingDebounce::new(),
            last_typing_broadcast: Vec::new(),
            pending_attachments: HashMap::new(),
            router_task: None,
            sweep_task: None,
        }
    }

    fn display_name_of(&self, user_id: &UserId) -> String {
        self.directory
            .participant_name(user_id)
            .unwrap_or_else(|| user_id.to_string())
    }
}

/// Owns the push subscription for the current user and routes inbound events
/// into the directory, log, and typing tracker. All mutation of those
/// structures happens here; the UI observes through [`ChatSession::subscribe_events`]
/// and the read accessors.
pub struct ChatSession {
    backend: Arc<dyn ChatBackend>,
    inner: Mutex<SessionState>,
    events: broadcast::Sender<ChatEvent>,
}

impl ChatSession {
    pub fn new(backend: Arc<dyn ChatBackend>) -> Arc<Self> {
        let (events, _) = broadcast::channel(SESSION_EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            backend,
            inner: Mutex::new(SessionState::new()),
            events,
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ChatEvent> {
        self.events.subscribe()
    }

    /// Establish the push subscription for `user_id` and load the
    /// conversation directory. Safe to retry after a failure; calling again
    /// while connected for the same user is a no-op.
    pub async fn connect(self: &Arc<Self>, user_id: &UserId) -> Result<(), ChatError> {
        if user_id.as_str().trim().is_empty() {
            return Err(ChatError::Connection("missing user identity".to_string()));
        }

        let previous_user = {
            let inner = self.inner.lock().await;
            let router_alive = inner
                .router_task
                .as_ref()
                .is_some_and(|task| !task.is_finished());
            if inner.user_id.as_ref() == Some(user_id) && router_alive {
                return Ok(());
            }
            inner.user_id.clone()
        };
        if previous_user.is_some_and(|previous| &previous != user_id) {
            // Hot identity switch: release the old push subscription first.
            self.backend.disconnect().await;
        }

        self.backend
            .initialize(user_id)
            .await
            .map_err(|err| ChatError::Connection(err.to_string()))?;

        // Subscribe before the directory fetch so nothing pushed in between
        // is lost.
        let push_events = self.backend.subscribe_events();

        let conversations = self
            .backend
            .get_conversations(user_id)
            .await
            .map_err(|err| ChatError::Load {
                what: "conversation directory",
                source: err,
            })?;

        {
            let mut inner = self.inner.lock().await;
            if inner.user_id.as_ref() != Some(user_id) {
                // New identity: previous session's state must not leak.
                inner.directory = ConversationDirectory::new();
                inner.log = MessageLog::new();
                inner.typing.clear();
                inner.typing_debounce.clear();
                inner.last_typing_broadcast = Vec::new();
                inner.pending_attachments.clear();
                inner.active_conversation = None;
            }
            inner.user_id = Some(user_id.clone());
            for conversation in conversations {
                inner.directory.apply_update(conversation);
            }
            if let Some(task) = inner.router_task.take() {
                task.abort();
            }
            if let Some(task) = inner.sweep_task.take() {
                task.abort();
            }
            inner.router_task = Some(self.spawn_event_router(push_events));
            inner.sweep_task = Some(self.spawn_typing_sweeper());
        }

        info!(user_id = %user_id, "chat: session connected");
        let _ = self.events.send(ChatEvent::Connected {
            user_id: user_id.clone(),
        });
        Ok(())
    }

    /// Release the push subscription and clear session identity. Idempotent;
    /// the directory and log stay readable until the next login.
    pub async fn disconnect(&self) {
        let (router_task, sweep_task) = {
            let mut inner = self.inner.lock().await;
            inner.user_id = None;
            inner.active_conversation = None;
            inner.typing.clear();
            inner.typing_debounce.clear();
            inner.last_typing_broadcast = Vec::new();
            (inner.router_task.take(), inner.sweep_task.take())
        };
        if let Some(task) = router_task {
            task.abort();
        }
        if let Some(task) = sweep_task {
            task.abort();
        }
        self.backend.disconnect().await;
        info!("chat: session disconnected");
        let _ = self.events.send(ChatEvent::Disconnected);
    }

    /// Switch the conversation the user is viewing. Loads its history
    /// wholesale and marks the visible inbound messages read. `None` clears
    /// the selection. In-flight sends are unaffected.
    pub async fn select_conversation(
        &self,
        conversation_id: Option<ConversationId>,
    ) -> Result<(), ChatError> {
        {
            let mut inner = self.inner.lock().await;
            if inner.user_id.is_none() {
                return Err(ChatError::Connection("not connected".to_string()));
            }
            // Set before the fetch so messages arriving mid-load already
            // count as viewed.
            inner.active_conversation = conversation_id.clone();
            inner.last_typing_broadcast = Vec::new();
        }

        let Some(conversation_id) = conversation_id else {
            return Ok(());
        };

        let history = self
            .backend
            .get_messages(&conversation_id)
            .await
            .map_err(|err| ChatError::Load {
                what: "message history",
                source: err,
            })?;

        let receipts = {
            let mut inner = self.inner.lock().await;
            let Some(user_id) = inner.user_id.clone() else {
                return Ok(());
            };
            inner.log.replace_history(&conversation_id, history);
            let unread = inner.log.unread_message_ids(&conversation_id, &user_id);
            let flipped = inner.log.mark_read(&conversation_id, &unread);
            let remaining = inner.log.unread_from_others(&conversation_id, &user_id);
            inner.directory.set_unread(&conversation_id, remaining);

            let typists = inner
                .typing
                .active_typists(&conversation_id, Instant::now());
            inner.last_typing_broadcast = typists.clone();

            let _ = self.events.send(ChatEvent::HistoryLoaded {
                conversation_id: conversation_id.clone(),
            });
            let _ = self.events.send(ChatEvent::TypingChanged {
                conversation_id: conversation_id.clone(),
                typists,
            });
            if let Some(conversation) = inner.directory.get(&conversation_id) {
                let _ = self.events.send(ChatEvent::ConversationUpdated {
                    conversation: conversation.clone(),
                });
            }
            if flipped.is_empty() {
                None
            } else {
                Some((user_id, flipped))
            }
        };

        if let Some((user_id, flipped)) = receipts {
            self.sync_read_receipts(&conversation_id, &user_id, flipped)
                .await;
        }
        Ok(())
    }

    /// Validate and dispatch a message, appending it optimistically first.
    /// Resolves to the authoritative message id on success; on dispatch
    /// failure the placeholder stays in the log marked failed.
    pub async fn send_message(
        &self,
        conversation_id: &ConversationId,
        content: &str,
        kind: MessageKind,
        attachments: Vec<AttachmentUpload>,
    ) -> Result<MessageId, ChatError> {
        if content.trim().is_empty() && attachments.is_empty() {
            return Err(ChatError::Validation("message content must not be empty"));
        }

        let correlation = CorrelationId::generate();
        let (user_id, local_id, stop_signal) = {
            let mut inner = self.inner.lock().await;
            let Some(user_id) = inner.user_id.clone() else {
                return Err(ChatError::Connection("not connected".to_string()));
            };

            let message = MessagePayload {
                message_id: MessageId::local(),
                conversation_id: conversation_id.clone(),
                sender_id: user_id.clone(),
                sender_name: Some(inner.display_name_of(&user_id)),
                content: content.to_string(),
                kind,
                attachments: attachments
                    .iter()
                    .map(|upload| AttachmentPayload {
                        file_id: FileId::local(),
                        filename: upload.filename.clone(),
                        size_bytes: upload.bytes.len() as u64,
                        mime_type: upload.mime_type.clone(),
                    })
                    .collect(),
                created_at: Utc::now(),
                is_read: false,
                is_encrypted: false,
                correlation_id: Some(correlation.clone()),
            };
            let local_id = message.message_id.clone();

            if inner
                .log
                .append_pending(message.clone(), correlation.clone())
                .is_err()
            {
                return Err(ChatError::Send {
                    message_id: local_id,
                    source: anyhow::anyhow!("local message id collision"),
                });
            }
            inner
                .directory
                .apply_inbound_message(&message, &user_id, false);
            if !attachments.is_empty() {
                inner
                    .pending_attachments
                    .insert(correlation.clone(), attachments.clone());
            }

            if let Some(logged) = inner.log.get(conversation_id, &local_id) {
                let _ = self.events.send(ChatEvent::MessageAppended {
                    message: logged.clone(),
                });
            }
            if let Some(conversation) = inner.directory.get(conversation_id) {
                let _ = self.events.send(ChatEvent::ConversationUpdated {
                    conversation: conversation.clone(),
                });
            }

            let stop_signal = inner
                .typing_debounce
                .note_stop(conversation_id)
                .then(|| TypingSignal {
                    conversation_id: conversation_id.clone(),
                    user_id: user_id.clone(),
                    user_name: inner.display_name_of(&user_id),
                    is_typing: false,
                });
            (user_id, local_id, stop_signal)
        };

        // Sending ends the local keystroke burst immediately.
        if let Some(signal) = stop_signal {
            self.backend.send_typing_indicator(signal);
        }

        info!(
            conversation_id = %conversation_id,
            message_id = %local_id,
            "chat: dispatching message"
        );
        let outbound = OutboundMessage {
            sender_id: user_id.clone(),
            correlation_id: correlation.clone(),
            content: content.to_string(),
            kind,
            attachments,
        };
        self.dispatch_outbound(conversation_id, &user_id, local_id, correlation, outbound)
            .await
    }

    /// Re-dispatch a failed optimistic message, reusing its correlation
    /// token so the backend can deduplicate a retry racing its first
    /// attempt.
    pub async fn retry_send(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
    ) -> Result<MessageId, ChatError> {
        let (user_id, payload, correlation, attachments) = {
            let mut inner = self.inner.lock().await;
            let Some(user_id) = inner.user_id.clone() else {
                return Err(ChatError::Connection("not connected".to_string()));
            };
            let Some((payload, correlation)) = inner.log.begin_retry(conversation_id, message_id)
            else {
                return Err(ChatError::Validation("message is not retryable"));
            };
            let attachments = inner
                .pending_attachments
                .get(&correlation)
                .cloned()
                .unwrap_or_default();
            (user_id, payload, correlation, attachments)
        };

        info!(
            conversation_id = %conversation_id,
            message_id = %message_id,
            "chat: retrying failed message"
        );
        let outbound = OutboundMessage {
            sender_id: user_id.clone(),
            correlation_id: correlation.clone(),
            content: payload.content.clone(),
            kind: payload.kind,
            attachments,
        };
        self.dispatch_outbound(
            conversation_id,
            &user_id,
            payload.message_id.clone(),
            correlation,
            outbound,
        )
        .await
    }

    /// Flip `is_read` for the given messages and recompute the unread count.
    /// The only mutation path for read state; already-read ids are a no-op
    /// and skip the backend sync entirely.
    pub async fn mark_read(
        &self,
        conversation_id: &ConversationId,
        message_ids: &[MessageId],
    ) -> Result<(), ChatError> {
        let (user_id, flipped) = {
            let mut inner = self.inner.lock().await;
            let Some(user_id) = inner.user_id.clone() else {
                return Err(ChatError::Connection("not connected".to_string()));
            };
            let flipped = inner.log.mark_read(conversation_id, message_ids);
            if !flipped.is_empty() {
                let remaining = inner.log.unread_from_others(conversation_id, &user_id);
                inner.directory.set_unread(conversation_id, remaining);
                if let Some(conversation) = inner.directory.get(conversation_id) {
                    let _ = self.events.send(ChatEvent::ConversationUpdated {
                        conversation: conversation.clone(),
                    });
                }
            }
            (user_id, flipped)
        };

        if flipped.is_empty() {
            return Ok(());
        }
        self.backend
            .mark_as_read(conversation_id, &user_id, flipped)
            .await
            .map_err(|err| ChatError::Load {
                what: "read receipt sync",
                source: err,
            })
    }

    /// Debounced local typing signal: at most one start per keystroke burst,
    /// one stop after inactivity or on send.
    pub async fn notify_typing(
        &self,
        conversation_id: &ConversationId,
        is_typing: bool,
    ) -> Result<(), ChatError> {
        let signal = {
            let mut inner = self.inner.lock().await;
            let Some(user_id) = inner.user_id.clone() else {
                return Err(ChatError::Connection("not connected".to_string()));
            };
            let should_emit = if is_typing {
                inner
                    .typing_debounce
                    .note_keystroke(conversation_id, Instant::now())
            } else {
                inner.typing_debounce.note_stop(conversation_id)
            };
            should_emit.then(|| TypingSignal {
                conversation_id: conversation_id.clone(),
                user_id: user_id.clone(),
                user_name: inner.display_name_of(&user_id),
                is_typing,
            })
        };

        if let Some(signal) = signal {
            self.backend.send_typing_indicator(signal);
        }
        Ok(())
    }

    /// Recency-ordered conversation list.
    pub async fn conversations(&self) -> Vec<ConversationSummary> {
        self.inner.lock().await.directory.list()
    }

    pub async fn conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Option<ConversationSummary> {
        self.inner.lock().await.directory.get(conversation_id).cloned()
    }

    /// Case-insensitive search over conversation titles and participant
    /// names.
    pub async fn search_conversations(&self, query: &str) -> Vec<ConversationSummary> {
        self.inner.lock().await.directory.search(query)
    }

    /// Ordered message view for one conversation.
    pub async fn messages(&self, conversation_id: &ConversationId) -> Vec<LoggedMessage> {
        self.inner.lock().await.log.messages(conversation_id).to_vec()
    }

    /// Non-expired typists in first-signaled order.
    pub async fn active_typists(&self, conversation_id: &ConversationId) -> Vec<Typist> {
        self.inner
            .lock()
            .await
            .typing
            .active_typists(conversation_id, Instant::now())
    }

    pub async fn unread_total(&self) -> u32 {
        self.inner.lock().await.directory.unread_total()
    }

    pub async fn active_conversation(&self) -> Option<ConversationId> {
        self.inner.lock().await.active_conversation.clone()
    }

    async fn dispatch_outbound(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
        local_id: MessageId,
        correlation: CorrelationId,
        outbound: OutboundMessage,
    ) -> Result<MessageId, ChatError> {
        match self.backend.send_message(conversation_id, outbound).await {
            Ok(authoritative) => {
                let mut inner = self.inner.lock().await;
                let removed =
                    inner
                        .log
                        .confirm_delivery(conversation_id, &correlation, authoritative.clone());
                inner
                    .directory
                    .reconcile_last_message(&local_id, &authoritative, user_id);
                inner.pending_attachments.remove(&correlation);

                // When the push echo reconciled first, the placeholder is
                // already gone and the event was already emitted.
                if removed.is_some() {
                    if let Some(logged) = inner.log.get(conversation_id, &authoritative.message_id)
                    {
                        let _ = self.events.send(ChatEvent::MessageReconciled {
                            conversation_id: conversation_id.clone(),
                            local_message_id: local_id,
                            message: logged.clone(),
                        });
                    }
                }
                if let Some(conversation) = inner.directory.get(conversation_id) {
                    let _ = self.events.send(ChatEvent::ConversationUpdated {
                        conversation: conversation.clone(),
                    });
                }
                Ok(authoritative.message_id)
            }
            Err(err) => {
                let mut inner = self.inner.lock().await;
                inner.log.fail_delivery(conversation_id, &correlation);
                warn!(
                    conversation_id = %conversation_id,
                    message_id = %local_id,
                    "chat: message dispatch failed: {err}"
                );
                let _ = self.events.send(ChatEvent::MessageSendFailed {
                    conversation_id: conversation_id.clone(),
                    message_id: local_id.clone(),
                });
                Err(ChatError::Send {
                    message_id: local_id,
                    source: err,
                })
            }
        }
    }

    fn spawn_event_router(
        self: &Arc<Self>,
        mut push_events: broadcast::Receiver<ServerEvent>,
    ) -> JoinHandle<()> {
        let session = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match push_events.recv().await {
                    Ok(event) => session.route_server_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "chat: push event stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    fn spawn_typing_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let session = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(TYPING_SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                session.sweep_typing(Instant::now()).await;
            }
        })
    }

    async fn route_server_event(&self, event: ServerEvent) {
        match event {
            ServerEvent::MessageReceived { message } => self.apply_inbound_message(message).await,
            ServerEvent::ConversationUpdated { conversation } => {
                self.apply_conversation_update(conversation).await;
            }
            ServerEvent::TypingSignaled { signal } => self.apply_typing_signal(signal).await,
            ServerEvent::Error(err) => {
                warn!(code = ?err.code, "chat: backend reported error: {}", err.message);
                let _ = self.events.send(ChatEvent::Error(err.message));
            }
        }
    }

    /// Inbound message arrival. Idempotent under redelivery: the duplicate
    /// guard stops a replayed event before any directory or unread mutation.
    async fn apply_inbound_message(&self, message: MessagePayload) {
        let receipts = {
            let mut inner = self.inner.lock().await;
            let Some(user_id) = inner.user_id.clone() else {
                return;
            };
            let conversation_id = message.conversation_id.clone();
            let is_active = inner.active_conversation.as_ref() == Some(&conversation_id);

            // Echo of our own outbound send: reconcile against the pending
            // placeholder instead of appending a second copy.
            if message.sender_id == user_id {
                if let Some(correlation) = message.correlation_id.clone() {
                    self.reconcile_outbound_echo(&mut inner, &conversation_id, correlation, message);
                    return;
                }
            }

            if let Err(duplicate) = inner.log.append(message.clone()) {
                debug!(
                    conversation_id = %duplicate.conversation_id,
                    message_id = %duplicate.message_id,
                    "chat: duplicate delivery ignored"
                );
                return;
            }
            inner
                .directory
                .apply_inbound_message(&message, &user_id, !is_active);

            let mut receipts = None;
            if is_active && message.sender_id != user_id && !message.is_read {
                let flipped = inner
                    .log
                    .mark_read(&conversation_id, std::slice::from_ref(&message.message_id));
                let remaining = inner.log.unread_from_others(&conversation_id, &user_id);
                inner.directory.set_unread(&conversation_id, remaining);
                if !flipped.is_empty() {
                    receipts = Some((conversation_id.clone(), user_id, flipped));
                }
            }

            if let Some(logged) = inner.log.get(&conversation_id, &message.message_id) {
                let _ = self.events.send(ChatEvent::MessageAppended {
                    message: logged.clone(),
                });
            }
            if let Some(conversation) = inner.directory.get(&conversation_id) {
                let _ = self.events.send(ChatEvent::ConversationUpdated {
                    conversation: conversation.clone(),
                });
            }
            receipts
        };

        if let Some((conversation_id, user_id, flipped)) = receipts {
            self.sync_read_receipts(&conversation_id, &user_id, flipped)
                .await;
        }
    }

    /// Handle the push fan-out's copy of a message this session sent. If the
    /// acknowledgement has not resolved yet, the echo's correlation token
    /// reconciles the placeholder right now; the later ack becomes a no-op.
    fn reconcile_outbound_echo(
        &self,
        state: &mut SessionState,
        conversation_id: &ConversationId,
        correlation: CorrelationId,
        message: MessagePayload,
    ) {
        if state.log.get(conversation_id, &message.message_id).is_some() {
            debug!(
                conversation_id = %conversation_id,
                message_id = %message.message_id,
                "chat: duplicate delivery ignored"
            );
            return;
        }

        let removed = state
            .log
            .confirm_delivery(conversation_id, &correlation, message.clone());
        state.pending_attachments.remove(&correlation);
        let user_id = message.sender_id.clone();
        match &removed {
            Some(local_id) => state
                .directory
                .reconcile_last_message(local_id, &message, &user_id),
            None => state
                .directory
                .apply_inbound_message(&message, &user_id, false),
        }

        if let Some(logged) = state.log.get(conversation_id, &message.message_id) {
            match removed {
                Some(local_message_id) => {
                    let _ = self.events.send(ChatEvent::MessageReconciled {
                        conversation_id: conversation_id.clone(),
                        local_message_id,
                        message: logged.clone(),
                    });
                }
                None => {
                    let _ = self.events.send(ChatEvent::MessageAppended {
                        message: logged.clone(),
                    });
                }
            }
        }
        if let Some(conversation) = state.directory.get(conversation_id) {
            let _ = self.events.send(ChatEvent::ConversationUpdated {
                conversation: conversation.clone(),
            });
        }
    }

    async fn apply_conversation_update(&self, conversation: ConversationSummary) {
        let snapshot = {
            let mut inner = self.inner.lock().await;
            if inner.user_id.is_none() {
                return;
            }
            inner.directory.apply_update(conversation.clone());
            inner.directory.get(&conversation.conversation_id).cloned()
        };
        if let Some(conversation) = snapshot {
            let _ = self.events.send(ChatEvent::ConversationUpdated { conversation });
        }
    }

    /// Typing signals keep full tracker state for every conversation, but
    /// only the active one is surfaced to the UI; switching back replays the
    /// still-valid set.
    async fn apply_typing_signal(&self, signal: TypingSignal) {
        let mut inner = self.inner.lock().await;
        let Some(user_id) = inner.user_id.clone() else {
            return;
        };
        if signal.user_id == user_id {
            // Self-echo from the fan-out; local state already reflects it.
            return;
        }
        let now = Instant::now();
        inner.typing.record_signal(&signal, now);

        if inner.active_conversation.as_ref() == Some(&signal.conversation_id) {
            let typists = inner.typing.active_typists(&signal.conversation_id, now);
            if typists != inner.last_typing_broadcast {
                inner.last_typing_broadcast = typists.clone();
                let _ = self.events.send(ChatEvent::TypingChanged {
                    conversation_id: signal.conversation_id.clone(),
                    typists,
                });
            }
        }
    }

    /// Expire stale typing state and flush overdue local stop signals.
    async fn sweep_typing(&self, now: Instant) {
        let (stop_signals, refresh) = {
            let mut inner = self.inner.lock().await;
            let Some(user_id) = inner.user_id.clone() else {
                return;
            };
            inner.typing.sweep(now);

            let user_name = inner.display_name_of(&user_id);
            let stop_signals: Vec<TypingSignal> = inner
                .typing_debounce
                .idle_conversations(now)
                .into_iter()
                .map(|conversation_id| TypingSignal {
                    conversation_id,
                    user_id: user_id.clone(),
                    user_name: user_name.clone(),
                    is_typing: false,
                })
                .collect();

            let refresh = inner.active_conversation.clone().and_then(|active| {
                let typists = inner.typing.active_typists(&active, now);
                if typists != inner.last_typing_broadcast {
                    inner.last_typing_broadcast = typists.clone();
                    Some((active, typists))
                } else {
                    None
                }
            });
            (stop_signals, refresh)
        };

        for signal in stop_signals {
            self.backend.send_typing_indicator(signal);
        }
        if let Some((conversation_id, typists)) = refresh {
            let _ = self.events.send(ChatEvent::TypingChanged {
                conversation_id,
                typists,
            });
        }
    }

    /// Best-effort receipt sync for the automatic mark-read paths; the local
    /// flip already happened and re-syncs with the next explicit call.
    async fn sync_read_receipts(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
        message_ids: Vec<MessageId>,
    ) {
        if let Err(err) = self
            .backend
            .mark_as_read(conversation_id, user_id, message_ids)
            .await
        {
            warn!(
                conversation_id = %conversation_id,
                "chat: read receipt sync failed: {err}"
            );
        }
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
