//! In-memory conversation directory: recency-ordered listing, pushed-update
//! merging, and unread-count bookkeeping.

use std::collections::HashMap;

use shared::{
    domain::{ConversationId, MessageId, UserId},
    protocol::{ConversationSummary, MessagePayload},
};

/// Directory entries are created on first sight (initial load or push) and
/// never deleted here; archival belongs to the backend.
#[derive(Debug, Default)]
pub struct ConversationDirectory {
    entries: HashMap<ConversationId, ConversationSummary>,
}

impl ConversationDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Most recently updated first; id as the tie-break so listings are
    /// stable across calls.
    pub fn list(&self) -> Vec<ConversationSummary> {
        let mut conversations: Vec<ConversationSummary> = self.entries.values().cloned().collect();
        conversations.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| a.conversation_id.as_str().cmp(b.conversation_id.as_str()))
        });
        conversations
    }

    pub fn get(&self, conversation_id: &ConversationId) -> Option<&ConversationSummary> {
        self.entries.get(conversation_id)
    }

    /// Merge pushed metadata into the known entry, or insert it wholesale if
    /// the conversation is new. For known conversations the locally
    /// recomputed `unread_count` wins over the pushed value; the local log
    /// is the authority for that invariant once loaded.
    pub fn apply_update(&mut self, update: ConversationSummary) {
        if let Some(existing) = self.entries.get_mut(&update.conversation_id) {
            if update.title.is_some() {
                existing.title = update.title;
            }
            if !update.participants.is_empty() {
                existing.participants = update.participants;
            }
            let newer_last_message = match (&existing.last_message, &update.last_message) {
                (Some(current), Some(pushed)) => current.ordering_key() <= pushed.ordering_key(),
                (None, Some(_)) => true,
                _ => false,
            };
            if newer_last_message {
                existing.last_message = update.last_message;
            }
            if existing.updated_at < update.updated_at {
                existing.updated_at = update.updated_at;
            }
            return;
        }
        self.entries.insert(update.conversation_id.clone(), update);
    }

    /// Roll a message (inbound or locally authored) into the directory:
    /// refresh `last_message`/`updated_at` and, when `count_as_unread` is
    /// set, bump the unread count for messages authored by someone else.
    pub fn apply_inbound_message(
        &mut self,
        message: &MessagePayload,
        current_user: &UserId,
        count_as_unread: bool,
    ) {
        let entry = self
            .entries
            .entry(message.conversation_id.clone())
            .or_insert_with(|| ConversationSummary {
                conversation_id: message.conversation_id.clone(),
                title: None,
                participants: Vec::new(),
                last_message: None,
                unread_count: 0,
                updated_at: message.created_at,
            });

        let newer = entry
            .last_message
            .as_ref()
            .is_none_or(|last| last.ordering_key() <= message.ordering_key());
        if newer {
            entry.last_message = Some(message.clone());
        }
        if entry.updated_at < message.created_at {
            entry.updated_at = message.created_at;
        }
        if count_as_unread && &message.sender_id != current_user && !message.is_read {
            entry.unread_count += 1;
        }
    }

    /// Replace `last_message` when it still points at the local placeholder
    /// that `authoritative` reconciles; otherwise fall back to the normal
    /// newer-wins rule.
    pub(crate) fn reconcile_last_message(
        &mut self,
        local_message_id: &MessageId,
        authoritative: &MessagePayload,
        current_user: &UserId,
    ) {
        if let Some(entry) = self.entries.get_mut(&authoritative.conversation_id) {
            let points_at_placeholder = entry
                .last_message
                .as_ref()
                .is_some_and(|last| &last.message_id == local_message_id);
            if points_at_placeholder {
                entry.last_message = Some(authoritative.clone());
                if entry.updated_at < authoritative.created_at {
                    entry.updated_at = authoritative.created_at;
                }
                return;
            }
        }
        self.apply_inbound_message(authoritative, current_user, false);
    }

    pub fn set_unread(&mut self, conversation_id: &ConversationId, unread_count: u32) {
        if let Some(entry) = self.entries.get_mut(conversation_id) {
            entry.unread_count = unread_count;
        }
    }

    pub fn unread_total(&self) -> u32 {
        self.entries.values().map(|entry| entry.unread_count).sum()
    }

    /// Case-insensitive substring match over titles and participant names.
    pub fn search(&self, query: &str) -> Vec<ConversationSummary> {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return self.list();
        }

        let mut matches: Vec<ConversationSummary> = self
            .entries
            .values()
            .filter(|conversation| {
                let title_match = conversation
                    .title
                    .as_ref()
                    .is_some_and(|title| title.to_lowercase().contains(&needle));
                title_match
                    || conversation.participants.iter().any(|participant| {
                        participant.display_name.to_lowercase().contains(&needle)
                    })
            })
            .cloned()
            .collect();
        matches.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| a.conversation_id.as_str().cmp(b.conversation_id.as_str()))
        });
        matches
    }

    /// Display name for `user_id` as known to any tracked conversation.
    pub fn participant_name(&self, user_id: &UserId) -> Option<String> {
        self.entries.values().find_map(|conversation| {
            conversation
                .participants
                .iter()
                .find(|participant| &participant.user_id == user_id)
                .map(|participant| participant.display_name.clone())
        })
    }
}

#[cfg(test)]
#[path = "tests/directory_tests.rs"]
mod tests;
