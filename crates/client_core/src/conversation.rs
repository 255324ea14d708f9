//! An open conversation: its reconciled log, history cursor and the send path.

use std::sync::Arc;

use chrono::Utc;
use shared::{
    domain::{ConversationKey, MessageId, UserId},
    protocol::{ChatMessage, OutboundEvent},
};
use tracing::{debug, info, warn};

use crate::{
    error::{ClientError, ClientResult},
    events::ClientEvent,
    gateway::Gateway,
    realtime::RealtimeChannel,
    reconciliation::{belongs_to, ConversationLog, PaginationCursor, PushOutcome},
};

/// A history fetch that has been started but not yet applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    page: u32,
}

impl PageRequest {
    pub fn page(&self) -> u32 {
        self.page
    }
}

pub struct ConversationView {
    key: ConversationKey,
    me: UserId,
    my_name: String,
    gateway: Gateway,
    realtime: Arc<RealtimeChannel>,
    log: ConversationLog,
    cursor: PaginationCursor,
    in_flight: Option<PageRequest>,
}

impl ConversationView {
    pub fn new(
        key: ConversationKey,
        me: UserId,
        my_name: impl Into<String>,
        gateway: Gateway,
        realtime: Arc<RealtimeChannel>,
    ) -> Self {
        Self {
            key,
            me,
            my_name: my_name.into(),
            gateway,
            realtime,
            log: ConversationLog::new(),
            cursor: PaginationCursor::default(),
            in_flight: None,
        }
    }

    pub fn key(&self) -> &ConversationKey {
        &self.key
    }

    pub fn entries(&self) -> &[ChatMessage] {
        self.log.entries()
    }

    pub fn has_more(&self) -> bool {
        self.cursor.has_more()
    }

    pub fn is_fetching(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Reserves the next history page. `None` while a fetch is in flight or
    /// once history is exhausted.
    pub fn begin_fetch(&mut self) -> Option<PageRequest> {
        if self.in_flight.is_some() || !self.cursor.has_more() {
            return None;
        }
        let request = PageRequest {
            page: self.cursor.next_page(),
        };
        self.in_flight = Some(request);
        Some(request)
    }

    /// Applies the outcome of a fetch started with [`begin_fetch`](Self::begin_fetch).
    /// A failed fetch leaves the cursor where it was so the page can be retried.
    pub fn complete_fetch(
        &mut self,
        request: PageRequest,
        result: ClientResult<Vec<ChatMessage>>,
    ) -> ClientResult<usize> {
        if self.in_flight != Some(request) {
            debug!(page = request.page, "conversation: ignoring stale page");
            return Ok(0);
        }
        self.in_flight = None;

        let page = result.inspect_err(|err| {
            warn!(conversation = %self.key, page = request.page, "conversation: history fetch failed: {err}");
        })?;
        let fetched = page.len();
        self.cursor.record_fetch(request.page, fetched);
        let added = self.log.merge_page(page);
        debug!(
            conversation = %self.key,
            page = request.page,
            fetched,
            added,
            has_more = self.cursor.has_more(),
            "conversation: history page merged"
        );
        Ok(added)
    }

    pub async fn load_next_page(&mut self) -> ClientResult<usize> {
        let Some(request) = self.begin_fetch() else {
            return Ok(0);
        };
        let result = self.gateway.fetch_history(&self.key, request.page).await;
        self.complete_fetch(request, result)
    }

    pub async fn load_initial(&mut self) -> ClientResult<usize> {
        self.load_next_page().await
    }

    /// Loads an older page when the viewport has reached the top edge.
    pub async fn on_scroll(&mut self, offset: f64) -> ClientResult<usize> {
        if offset > 0.0 {
            return Ok(0);
        }
        self.load_next_page().await
    }

    /// Applies a bus event if it is a message for this conversation.
    pub fn handle_event(&mut self, event: &ClientEvent) -> Option<PushOutcome> {
        let message = match (event, &self.key) {
            (ClientEvent::PrivateMessage(message), ConversationKey::Direct { .. })
            | (ClientEvent::ServerMessage(message), ConversationKey::Server { .. }) => message,
            _ => return None,
        };
        if !belongs_to(&self.key, &self.me, message) {
            return None;
        }
        Some(self.log.apply_push(message.clone()))
    }

    /// Shows `text` immediately as an optimistic entry, then emits it.
    /// If the emit fails the entry stays and the error is returned.
    pub async fn send(&mut self, text: &str) -> ClientResult<MessageId> {
        let body = text.trim();
        if body.is_empty() {
            return Err(ClientError::Validation("message is empty".into()));
        }

        let (receiver_id, server_id) = match &self.key {
            ConversationKey::Direct { peer } => (Some(peer.clone()), None),
            ConversationKey::Server { server_id } => (None, Some(server_id.clone())),
        };
        let draft = ChatMessage {
            id: None,
            body: body.to_string(),
            sender_id: Some(self.me.clone()),
            sender_name: Some(self.my_name.clone()),
            receiver_id,
            server_id,
            created_at: None,
            timestamp: Some(Utc::now()),
            time_stamp: None,
        };
        let message = self.log.append_optimistic(draft).clone();
        let temporary_id = message.id.clone().unwrap_or_else(MessageId::temporary);

        let event = match &self.key {
            ConversationKey::Direct { peer } => OutboundEvent::SendPrivateMessage {
                message,
                receiver_id: peer.clone(),
            },
            ConversationKey::Server { server_id } => OutboundEvent::SendServerMessage {
                server_id: server_id.clone(),
                message,
            },
        };
        self.realtime.emit(&event).await.inspect_err(|err| {
            warn!(conversation = %self.key, "conversation: send failed: {err}");
        })?;
        info!(conversation = %self.key, "conversation: message sent");
        Ok(temporary_id)
    }
}

#[cfg(test)]
#[path = "tests/conversation_tests.rs"]
mod tests;
