//! Ephemeral typing-indicator state: per-conversation typist tracking with
//! automatic expiry, plus the sender-side debounce.

use std::collections::{hash_map::Entry, HashMap};
use std::time::{Duration, Instant};

use shared::{
    domain::{ConversationId, UserId},
    protocol::TypingSignal,
};

/// A typing signal goes stale once this much time passes without renewal.
pub const TYPING_EXPIRY_WINDOW: Duration = Duration::from_millis(2000);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Typist {
    pub user_id: UserId,
    pub user_name: String,
}

#[derive(Debug)]
struct TypistEntry {
    user_id: UserId,
    user_name: String,
    last_signal: Instant,
}

impl TypistEntry {
    fn expired(&self, now: Instant) -> bool {
        now.duration_since(self.last_signal) > TYPING_EXPIRY_WINDOW
    }
}

/// Tracks who is typing in each conversation. Entries live only in memory:
/// created on a typing signal, removed on an explicit stop, expiry, or
/// session teardown. Vec order is first-signaled order, which keeps the
/// rendered set deterministic.
#[derive(Debug, Default)]
pub struct TypingTracker {
    conversations: HashMap<ConversationId, Vec<TypistEntry>>,
}

impl TypingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a signal, resetting the expiry clock for that typist. A signal
    /// from a typist whose previous entry already expired starts a fresh
    /// entry at the back of the ordering.
    pub fn record_signal(&mut self, signal: &TypingSignal, now: Instant) {
        let typists = self
            .conversations
            .entry(signal.conversation_id.clone())
            .or_default();
        typists.retain(|entry| !entry.expired(now));

        if signal.is_typing {
            if let Some(entry) = typists
                .iter_mut()
                .find(|entry| entry.user_id == signal.user_id)
            {
                entry.last_signal = now;
                entry.user_name = signal.user_name.clone();
            } else {
                typists.push(TypistEntry {
                    user_id: signal.user_id.clone(),
                    user_name: signal.user_name.clone(),
                    last_signal: now,
                });
            }
        } else {
            typists.retain(|entry| entry.user_id != signal.user_id);
        }
    }

    /// Current non-expired typists in first-signaled order. Expired entries
    /// are discarded lazily here as well as by [`TypingTracker::sweep`].
    pub fn active_typists(&mut self, conversation_id: &ConversationId, now: Instant) -> Vec<Typist> {
        let Some(typists) = self.conversations.get_mut(conversation_id) else {
            return Vec::new();
        };
        typists.retain(|entry| !entry.expired(now));
        typists
            .iter()
            .map(|entry| Typist {
                user_id: entry.user_id.clone(),
                user_name: entry.user_name.clone(),
            })
            .collect()
    }

    /// Periodic cleanup so conversations nobody reads anymore cannot pin
    /// stale entries forever.
    pub fn sweep(&mut self, now: Instant) {
        for typists in self.conversations.values_mut() {
            typists.retain(|entry| !entry.expired(now));
        }
        self.conversations.retain(|_, typists| !typists.is_empty());
    }

    pub fn clear(&mut self) {
        self.conversations.clear();
    }
}

/// Sender-side debounce: at most one start signal per keystroke burst, and
/// exactly one stop signal after [`TYPING_EXPIRY_WINDOW`] of local
/// inactivity or immediately on send.
#[derive(Debug, Default)]
pub struct LocalTypingDebounce {
    announced: HashMap<ConversationId, Instant>,
}

impl LocalTypingDebounce {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a keystroke. Returns whether a start signal should be emitted:
    /// only for the first keystroke of a burst, or when the previous
    /// announcement has already expired on the receiving side.
    pub fn note_keystroke(&mut self, conversation_id: &ConversationId, now: Instant) -> bool {
        match self.announced.entry(conversation_id.clone()) {
            Entry::Occupied(mut occupied) => {
                let stale = now.duration_since(*occupied.get()) > TYPING_EXPIRY_WINDOW;
                occupied.insert(now);
                stale
            }
            Entry::Vacant(vacant) => {
                vacant.insert(now);
                true
            }
        }
    }

    /// Record an explicit stop (message sent, input cleared). Returns whether
    /// a stop signal is owed to the backend.
    pub fn note_stop(&mut self, conversation_id: &ConversationId) -> bool {
        self.announced.remove(conversation_id).is_some()
    }

    /// Conversations whose keystroke burst has gone quiet; each owes the
    /// backend one stop signal.
    pub fn idle_conversations(&mut self, now: Instant) -> Vec<ConversationId> {
        let idle: Vec<ConversationId> = self
            .announced
            .iter()
            .filter(|(_, last)| now.duration_since(**last) > TYPING_EXPIRY_WINDOW)
            .map(|(conversation_id, _)| conversation_id.clone())
            .collect();
        for conversation_id in &idle {
            self.announced.remove(conversation_id);
        }
        idle
    }

    pub fn clear(&mut self) {
        self.announced.clear();
    }
}

#[cfg(test)]
#[path = "tests/typing_tests.rs"]
mod tests;
