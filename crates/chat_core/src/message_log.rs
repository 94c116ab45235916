//! Per-conversation ordered message storage with duplicate suppression and
//! optimistic-send reconciliation.

use std::collections::{HashMap, HashSet};

use shared::{
    domain::{ConversationId, CorrelationId, MessageId, UserId},
    protocol::MessagePayload,
};
use thiserror::Error;

/// Two-phase delivery state attached to each log entry. Inbound messages are
/// always `Confirmed`; only locally-authored entries pass through `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Pending,
    Confirmed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct LoggedMessage {
    pub message: MessagePayload,
    pub delivery: DeliveryState,
    pub(crate) correlation: Option<CorrelationId>,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("message {message_id} already present in conversation {conversation_id}")]
pub struct DuplicateMessageError {
    pub conversation_id: ConversationId,
    pub message_id: MessageId,
}

#[derive(Debug, Default)]
struct ConversationLog {
    entries: Vec<LoggedMessage>,
    ids: HashSet<MessageId>,
}

impl ConversationLog {
    fn insert(&mut self, entry: LoggedMessage) -> Result<(), DuplicateMessageError> {
        if self.ids.contains(&entry.message.message_id) {
            return Err(DuplicateMessageError {
                conversation_id: entry.message.conversation_id.clone(),
                message_id: entry.message.message_id.clone(),
            });
        }

        let created_at = entry.message.created_at;
        let message_id = entry.message.message_id.clone();
        let at = self.entries.partition_point(|existing| {
            (existing.message.created_at, existing.message.message_id.as_str())
                <= (created_at, message_id.as_str())
        });
        self.ids.insert(message_id);
        self.entries.insert(at, entry);
        Ok(())
    }

    fn remove_by_correlation(&mut self, correlation: &CorrelationId) -> Option<LoggedMessage> {
        let at = self
            .entries
            .iter()
            .position(|entry| entry.correlation.as_ref() == Some(correlation))?;
        let entry = self.entries.remove(at);
        self.ids.remove(&entry.message.message_id);
        Some(entry)
    }
}

/// Append-only ordered log, keyed by conversation. The sole bulk mutation is
/// [`MessageLog::replace_history`]; everything else is a sorted insert or an
/// `is_read` flip.
#[derive(Debug, Default)]
pub struct MessageLog {
    conversations: HashMap<ConversationId, ConversationLog>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an inbound message at its sorted `(created_at, id)` position.
    /// A message whose id is already present is reported as a duplicate so
    /// the caller can drop the redelivery without side effects.
    pub fn append(&mut self, message: MessagePayload) -> Result<(), DuplicateMessageError> {
        let conversation_id = message.conversation_id.clone();
        self.conversation_mut(&conversation_id).insert(LoggedMessage {
            message,
            delivery: DeliveryState::Confirmed,
            correlation: None,
        })
    }

    /// Insert an optimistic outbound placeholder awaiting backend
    /// acknowledgement, keyed by its correlation token.
    pub(crate) fn append_pending(
        &mut self,
        message: MessagePayload,
        correlation: CorrelationId,
    ) -> Result<(), DuplicateMessageError> {
        let conversation_id = message.conversation_id.clone();
        self.conversation_mut(&conversation_id).insert(LoggedMessage {
            message,
            delivery: DeliveryState::Pending,
            correlation: Some(correlation),
        })
    }

    /// Replace one conversation's confirmed content wholesale from a backend
    /// fetch. Pending and failed local placeholders survive the reload
    /// unless the fetched page already contains their id.
    pub fn replace_history(
        &mut self,
        conversation_id: &ConversationId,
        history: Vec<MessagePayload>,
    ) {
        let log = self.conversation_mut(conversation_id);
        let carried: Vec<LoggedMessage> = log
            .entries
            .drain(..)
            .filter(|entry| entry.delivery != DeliveryState::Confirmed)
            .collect();
        log.ids.clear();

        for message in history {
            let _ = log.insert(LoggedMessage {
                message,
                delivery: DeliveryState::Confirmed,
                correlation: None,
            });
        }
        for entry in carried {
            let _ = log.insert(entry);
        }
    }

    /// Ordered view; empty when the conversation has no loaded messages.
    pub fn messages(&self, conversation_id: &ConversationId) -> &[LoggedMessage] {
        self.conversations
            .get(conversation_id)
            .map(|log| log.entries.as_slice())
            .unwrap_or(&[])
    }

    pub fn get(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
    ) -> Option<&LoggedMessage> {
        self.conversations
            .get(conversation_id)?
            .entries
            .iter()
            .find(|entry| &entry.message.message_id == message_id)
    }

    /// Flip `is_read` false→true for the given ids, returning the ids that
    /// actually changed. Re-invoking with already-read ids is a no-op.
    pub fn mark_read(
        &mut self,
        conversation_id: &ConversationId,
        message_ids: &[MessageId],
    ) -> Vec<MessageId> {
        let Some(log) = self.conversations.get_mut(conversation_id) else {
            return Vec::new();
        };

        let mut flipped = Vec::new();
        for entry in &mut log.entries {
            if !entry.message.is_read && message_ids.contains(&entry.message.message_id) {
                entry.message.is_read = true;
                flipped.push(entry.message.message_id.clone());
            }
        }
        flipped
    }

    /// Ids of unread messages authored by someone other than `reader`.
    pub fn unread_message_ids(
        &self,
        conversation_id: &ConversationId,
        reader: &UserId,
    ) -> Vec<MessageId> {
        self.messages(conversation_id)
            .iter()
            .filter(|entry| !entry.message.is_read && &entry.message.sender_id != reader)
            .map(|entry| entry.message.message_id.clone())
            .collect()
    }

    /// The unread-count invariant source: messages not authored by `reader`
    /// with `is_read == false`.
    pub fn unread_from_others(&self, conversation_id: &ConversationId, reader: &UserId) -> u32 {
        self.messages(conversation_id)
            .iter()
            .filter(|entry| !entry.message.is_read && &entry.message.sender_id != reader)
            .count() as u32
    }

    /// Swap the placeholder carrying `correlation` for the authoritative
    /// backend message, returning the placeholder's id when one was removed.
    /// If the authoritative copy already landed (push echo beat the ack),
    /// the placeholder is simply dropped. Idempotent: a second
    /// acknowledgement finds no placeholder and changes nothing.
    pub(crate) fn confirm_delivery(
        &mut self,
        conversation_id: &ConversationId,
        correlation: &CorrelationId,
        authoritative: MessagePayload,
    ) -> Option<MessageId> {
        let log = self.conversation_mut(conversation_id);
        let removed = log
            .remove_by_correlation(correlation)
            .map(|placeholder| placeholder.message.message_id);
        let _ = log.insert(LoggedMessage {
            message: authoritative,
            delivery: DeliveryState::Confirmed,
            correlation: None,
        });
        removed
    }

    /// Mark the placeholder carrying `correlation` as failed. The entry is
    /// retained so the caller can surface and retry it.
    pub(crate) fn fail_delivery(
        &mut self,
        conversation_id: &ConversationId,
        correlation: &CorrelationId,
    ) -> Option<MessageId> {
        let log = self.conversations.get_mut(conversation_id)?;
        let entry = log
            .entries
            .iter_mut()
            .find(|entry| entry.correlation.as_ref() == Some(correlation))?;
        entry.delivery = DeliveryState::Failed;
        Some(entry.message.message_id.clone())
    }

    /// Move a failed placeholder back to pending for re-dispatch, reusing
    /// its original correlation token.
    pub(crate) fn begin_retry(
        &mut self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
    ) -> Option<(MessagePayload, CorrelationId)> {
        let log = self.conversations.get_mut(conversation_id)?;
        let entry = log
            .entries
            .iter_mut()
            .find(|entry| &entry.message.message_id == message_id)?;
        if entry.delivery != DeliveryState::Failed {
            return None;
        }
        let correlation = entry.correlation.clone()?;
        entry.delivery = DeliveryState::Pending;
        Some((entry.message.clone(), correlation))
    }

    fn conversation_mut(&mut self, conversation_id: &ConversationId) -> &mut ConversationLog {
        self.conversations
            .entry(conversation_id.clone())
            .or_default()
    }
}

#[cfg(test)]
#[path = "tests/message_log_tests.rs"]
mod tests;
