//! Per-conversation message log merging paginated history with realtime pushes.
//!
//! Invariants kept by every mutation:
//! - no two entries share a non-temporary id;
//! - after a page merge, entries are non-decreasing by [`ChatMessage::sort_time`].
//!
//! Pushes are appended without re-sorting; they are assumed to arrive in send
//! order.

use std::collections::HashSet;

use shared::{
    domain::{ConversationKey, MessageId, UserId},
    protocol::ChatMessage,
};

pub const HISTORY_PAGE_SIZE: u32 = 20;

/// Tracks the last history page loaded (1-based, 0 before the first) and
/// whether older history exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaginationCursor {
    loaded: u32,
    has_more: bool,
}

impl Default for PaginationCursor {
    fn default() -> Self {
        Self {
            loaded: 0,
            has_more: true,
        }
    }
}

impl PaginationCursor {
    pub fn page(&self) -> u32 {
        self.loaded
    }

    pub fn next_page(&self) -> u32 {
        self.loaded + 1
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    /// Records a successful fetch of `page` that returned `fetched` items.
    /// The page number never moves backwards and exhaustion is permanent.
    pub fn record_fetch(&mut self, page: u32, fetched: usize) {
        self.loaded = self.loaded.max(page);
        if fetched < HISTORY_PAGE_SIZE as usize {
            self.has_more = false;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Appended,
    /// An optimistic entry at this index was patched with the server's id.
    Confirmed(usize),
    Duplicate,
}

#[derive(Debug, Clone, Default)]
pub struct ConversationLog {
    entries: Vec<ChatMessage>,
}

impl ConversationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[ChatMessage] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains_id(&self, id: &MessageId) -> bool {
        self.entries.iter().any(|entry| entry.id.as_ref() == Some(id))
    }

    /// Prepends the not-yet-seen items of an older page and re-sorts the log.
    /// Returns how many items were added.
    pub fn merge_page(&mut self, page: Vec<ChatMessage>) -> usize {
        if page.is_empty() {
            return 0;
        }

        let mut seen: HashSet<MessageId> = self
            .entries
            .iter()
            .filter_map(|entry| entry.id.clone())
            .collect();
        let fresh: Vec<ChatMessage> = page
            .into_iter()
            .filter(|message| match &message.id {
                Some(id) => seen.insert(id.clone()),
                None => true,
            })
            .collect();
        let added = fresh.len();

        let mut merged = fresh;
        merged.append(&mut self.entries);
        // Stable: equal or missing times keep their relative order.
        merged.sort_by_key(ChatMessage::sort_time);
        self.entries = merged;
        added
    }

    /// Applies a realtime push that already belongs to this conversation.
    ///
    /// A push is a duplicate when an entry has the same id, or the same body
    /// and sender. The content match can misfire for identical messages sent in
    /// quick succession. When the content match is an optimistic entry and the
    /// push carries a server id, that entry takes over the server's id and
    /// timestamps in place.
    pub fn apply_push(&mut self, message: ChatMessage) -> PushOutcome {
        if let Some(id) = &message.id {
            if self.contains_id(id) {
                return PushOutcome::Duplicate;
            }
        }

        let content_match = self.entries.iter().position(|entry| {
            entry.body == message.body && entry.sender_id == message.sender_id
        });

        match content_match {
            Some(index) => {
                let entry = &mut self.entries[index];
                let confirms = entry.has_temporary_id()
                    && message.id.as_ref().is_some_and(|id| !id.is_temporary());
                if !confirms {
                    return PushOutcome::Duplicate;
                }
                entry.id = message.id;
                entry.created_at = message.created_at.or(entry.created_at);
                entry.timestamp = message.timestamp.or(entry.timestamp);
                entry.time_stamp = message.time_stamp.or(entry.time_stamp);
                PushOutcome::Confirmed(index)
            }
            None => {
                self.entries.push(message);
                PushOutcome::Appended
            }
        }
    }

    /// Appends a locally composed message before any confirmation. Assigns a
    /// temporary id if the message has none.
    pub fn append_optimistic(&mut self, mut message: ChatMessage) -> &ChatMessage {
        if message.id.is_none() {
            message.id = Some(MessageId::temporary());
        }
        let index = self.entries.len();
        self.entries.push(message);
        &self.entries[index]
    }
}

/// Whether a pushed message belongs to the conversation `key` as seen by `me`.
pub fn belongs_to(key: &ConversationKey, me: &UserId, message: &ChatMessage) -> bool {
    match key {
        ConversationKey::Direct { peer } => {
            let sender = message.sender_id.as_ref();
            let receiver = message.receiver_id.as_ref();
            (sender == Some(peer) && receiver == Some(me))
                || (sender == Some(me) && receiver == Some(peer))
        }
        ConversationKey::Server { server_id } => message.server_id.as_ref() == Some(server_id),
    }
}

#[cfg(test)]
#[path = "tests/reconciliation_tests.rs"]
mod tests;
