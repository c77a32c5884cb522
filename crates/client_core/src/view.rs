//! Local state for one open conversation.
//!
//! Entries are kept in insertion order: chronological at seed time, append
//! order afterwards. A send shows up immediately as a provisional entry keyed
//! by its [`ClientId`] and is swapped in place for the durable message once
//! the server echoes it back.

use chrono::{DateTime, Utc};
use shared::{
    domain::{ClientId, ConversationId, MessageId, MessageType, UserId},
    protocol::{Message, SendMessageRequest},
};

/// A message the server has not confirmed yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMessage {
    pub client_id: ClientId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: String,
    pub message_type: MessageType,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewEntry {
    Provisional(PendingMessage),
    Confirmed(Message),
}

impl ViewEntry {
    pub fn message_id(&self) -> Option<MessageId> {
        match self {
            Self::Confirmed(message) => Some(message.id),
            Self::Provisional(_) => None,
        }
    }

    pub fn client_id(&self) -> Option<&ClientId> {
        match self {
            Self::Provisional(pending) => Some(&pending.client_id),
            Self::Confirmed(message) => message.client_id.as_ref(),
        }
    }

    pub fn sender_id(&self) -> UserId {
        match self {
            Self::Provisional(pending) => pending.sender_id,
            Self::Confirmed(message) => message.sender_id,
        }
    }

    pub fn content(&self) -> &str {
        match self {
            Self::Provisional(pending) => &pending.content,
            Self::Confirmed(message) => &message.content,
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        match self {
            Self::Provisional(pending) => pending.created_at,
            Self::Confirmed(message) => message.created_at,
        }
    }

    pub fn is_provisional(&self) -> bool {
        matches!(self, Self::Provisional(_))
    }

    fn is_provisional_for(&self, client_id: &ClientId) -> bool {
        matches!(self, Self::Provisional(pending) if &pending.client_id == client_id)
    }
}

/// What [`ConversationView::apply_new_message`] did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciled {
    /// A provisional entry at `index` was upgraded to the durable message.
    Replaced { index: usize },
    Appended,
    /// The durable message was already present, so the stale provisional
    /// entry at `index` was removed.
    Collapsed { index: usize },
    /// Already present by durable id; state untouched.
    Duplicate,
    /// Belongs to another conversation.
    Ignored,
}

#[derive(Debug, Clone)]
pub struct ConversationView {
    conversation_id: ConversationId,
    entries: Vec<ViewEntry>,
}

impl ConversationView {
    pub fn new(conversation_id: ConversationId) -> Self {
        Self {
            conversation_id,
            entries: Vec::new(),
        }
    }

    /// Builds a view from a newest-first history page.
    pub fn from_history(conversation_id: ConversationId, newest_first: Vec<Message>) -> Self {
        let mut view = Self::new(conversation_id);
        view.seed(newest_first);
        view
    }

    /// Installs a newest-first history page underneath whatever arrived while
    /// it was loading. Entries already covered by the page are dropped.
    pub fn seed(&mut self, newest_first: Vec<Message>) {
        let mut seeded: Vec<ViewEntry> = newest_first
            .into_iter()
            .rev()
            .filter(|message| message.conversation_id == self.conversation_id)
            .map(ViewEntry::Confirmed)
            .collect();

        for entry in self.entries.drain(..) {
            let covered = match entry.message_id() {
                Some(id) => seeded.iter().any(|seen| seen.message_id() == Some(id)),
                None => false,
            };
            if !covered {
                seeded.push(entry);
            }
        }
        self.entries = seeded;
    }

    pub fn conversation_id(&self) -> ConversationId {
        self.conversation_id
    }

    /// Display order, oldest first.
    pub fn messages(&self) -> &[ViewEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains_message(&self, id: MessageId) -> bool {
        self.entries.iter().any(|entry| entry.message_id() == Some(id))
    }

    pub fn pending(&self, client_id: &ClientId) -> Option<&PendingMessage> {
        self.entries.iter().find_map(|entry| match entry {
            ViewEntry::Provisional(pending) if &pending.client_id == client_id => Some(pending),
            _ => None,
        })
    }

    /// Appends a provisional entry and returns the request that should carry it.
    pub fn begin_send(
        &mut self,
        sender_id: UserId,
        content: &str,
    ) -> (ClientId, SendMessageRequest) {
        let client_id = ClientId::generate();
        self.entries.push(ViewEntry::Provisional(PendingMessage {
            client_id: client_id.clone(),
            conversation_id: self.conversation_id,
            sender_id,
            content: content.to_string(),
            message_type: MessageType::Text,
            created_at: Utc::now(),
        }));

        let request = SendMessageRequest {
            conversation_id: Some(self.conversation_id),
            content: content.to_string(),
            client_id: Some(client_id.clone()),
            message_type: Some(MessageType::Text),
            reply_to_id: None,
        };
        (client_id, request)
    }

    /// Drops the provisional entry for `client_id`. Returns whether one was present.
    pub fn rollback(&mut self, client_id: &ClientId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|entry| !entry.is_provisional_for(client_id));
        self.entries.len() != before
    }

    pub fn apply_new_message(&mut self, message: Message) -> Reconciled {
        if message.conversation_id != self.conversation_id {
            return Reconciled::Ignored;
        }

        let already_confirmed = self.contains_message(message.id);

        if let Some(client_id) = message.client_id.as_ref() {
            if let Some(index) = self
                .entries
                .iter()
                .position(|entry| entry.is_provisional_for(client_id))
            {
                if already_confirmed {
                    self.entries.remove(index);
                    return Reconciled::Collapsed { index };
                }
                self.entries[index] = ViewEntry::Confirmed(message);
                return Reconciled::Replaced { index };
            }
        }

        if already_confirmed {
            return Reconciled::Duplicate;
        }
        self.entries.push(ViewEntry::Confirmed(message));
        Reconciled::Appended
    }
}

#[cfg(test)]
#[path = "tests/view_tests.rs"]
mod tests;
