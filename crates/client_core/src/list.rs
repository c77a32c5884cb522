use chrono::{DateTime, Utc};
use shared::{
    domain::{ClientId, ConversationId},
    protocol::{ConversationSummary, Message},
};

use crate::view::PendingMessage;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationEntry {
    pub summary: ConversationSummary,
    /// Optimistic preview from an unconfirmed send.
    pub pending: Option<PendingMessage>,
}

impl ConversationEntry {
    pub fn conversation_id(&self) -> ConversationId {
        self.summary.conversation_id
    }

    /// Timestamp the list is ordered by.
    pub fn activity_at(&self) -> DateTime<Utc> {
        let confirmed = self
            .summary
            .last_message
            .as_ref()
            .map(|message| message.created_at)
            .unwrap_or(self.summary.updated_at);
        match &self.pending {
            Some(pending) if pending.created_at > confirmed => pending.created_at,
            _ => confirmed,
        }
    }

    pub fn preview(&self) -> Option<&str> {
        if let Some(pending) = &self.pending {
            return Some(&pending.content);
        }
        self.summary
            .last_message
            .as_ref()
            .map(|message| message.content.as_str())
    }
}

/// The signed-in user's conversations, most recently active first.
#[derive(Debug, Clone, Default)]
pub struct ConversationList {
    entries: Vec<ConversationEntry>,
}

impl ConversationList {
    pub fn new(summaries: Vec<ConversationSummary>) -> Self {
        let mut list = Self::default();
        list.replace_all(summaries);
        list
    }

    pub fn replace_all(&mut self, summaries: Vec<ConversationSummary>) {
        self.entries = summaries
            .into_iter()
            .map(|summary| ConversationEntry {
                summary,
                pending: None,
            })
            .collect();
        self.sort();
    }

    pub fn entries(&self) -> &[ConversationEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, conversation_id: ConversationId) -> Option<&ConversationEntry> {
        self.entries
            .iter()
            .find(|entry| entry.conversation_id() == conversation_id)
    }

    pub fn position(&self, conversation_id: ConversationId) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| entry.conversation_id() == conversation_id)
    }

    /// Applies a `conversation-update`. Unknown conversations are ignored
    /// until the next full reload.
    pub fn apply_update(&mut self, conversation_id: ConversationId, last_message: Message) -> bool {
        let Some(entry) = self
            .entries
            .iter_mut()
            .find(|entry| entry.conversation_id() == conversation_id)
        else {
            return false;
        };

        let confirms_pending = matches!(
            (&entry.pending, &last_message.client_id),
            (Some(pending), Some(client_id)) if &pending.client_id == client_id
        );
        if confirms_pending {
            entry.pending = None;
        }
        entry.summary.last_message = Some(last_message);
        self.sort();
        true
    }

    pub fn set_optimistic_last(&mut self, pending: PendingMessage) -> bool {
        let Some(entry) = self
            .entries
            .iter_mut()
            .find(|entry| entry.conversation_id() == pending.conversation_id)
        else {
            return false;
        };
        entry.pending = Some(pending);
        self.sort();
        true
    }

    /// Removes the optimistic preview if it still belongs to `client_id`.
    pub fn clear_optimistic(&mut self, conversation_id: ConversationId, client_id: &ClientId) -> bool {
        let Some(entry) = self
            .entries
            .iter_mut()
            .find(|entry| entry.conversation_id() == conversation_id)
        else {
            return false;
        };
        if !matches!(&entry.pending, Some(pending) if &pending.client_id == client_id) {
            return false;
        }
        entry.pending = None;
        self.sort();
        true
    }

    // stable, so equal timestamps keep their relative order
    fn sort(&mut self) {
        self.entries
            .sort_by(|a, b| b.activity_at().cmp(&a.activity_at()));
    }
}

#[cfg(test)]
#[path = "tests/list_tests.rs"]
mod tests;
