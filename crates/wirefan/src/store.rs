use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::types::{serde_bytes32, InnerMessage};
use crate::Result;

/// Unique key of a stored message. An insert with an existing key is a
/// no-op, which is what deduplicates redelivered wire nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageKey {
    pub chat: String,
    pub id: String,
    pub sender: String,
    pub from_me: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageStatus {
    Pending,
    Sent,
    Delivered,
    Read,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reaction {
    pub sender: String,
    pub emoji: String,
}

/// Per-poll state captured from the creation message. Option hashes map
/// the opaque values inside encrypted votes back to option names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollState {
    #[serde(with = "serde_bytes32")]
    pub enc_key: [u8; 32],
    pub options: Vec<String>,
    pub option_hashes: HashMap<String, String>,
    pub votes: HashMap<String, Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub key: MessageKey,
    pub timestamp: u64,
    pub message: InnerMessage,
    pub status: MessageStatus,
    /// Excluded from unread counting (system/reacted-to messages).
    #[serde(default)]
    pub ignore_unread: bool,
    #[serde(default)]
    pub reactions: Vec<Reaction>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub poll: Option<PollState>,
    #[serde(default)]
    pub delivered_to: Vec<String>,
    #[serde(default)]
    pub read_by: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chat {
    pub id: String,
    pub unread: u32,
    pub archived: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub ephemeral_expiration: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub past_participants: Vec<String>,
}

impl Chat {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            unread: 0,
            archived: false,
            ephemeral_expiration: None,
            display_name: None,
            past_participants: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub push_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub last_seen: Option<u64>,
}

/// Chat/contact/message persistence. Used by the pipeline for
/// deduplication, unread counters and history merges.
pub trait Store: Send + Sync {
    /// Returns false when a message with the same key already exists
    /// (the insert is then a no-op).
    fn upsert_message(&self, message: ChatMessage) -> bool;
    fn get_message(&self, chat: &str, id: &str) -> Option<ChatMessage>;
    fn remove_message(&self, chat: &str, id: &str) -> bool;
    fn set_message_status(&self, chat: &str, id: &str, status: MessageStatus);
    fn mark_ignored(&self, chat: &str, id: &str);
    fn add_reaction(&self, chat: &str, target_id: &str, reaction: Reaction);
    /// Replaces the voter's previous selection.
    fn record_poll_vote(&self, chat: &str, poll_id: &str, voter: &str, selection: Vec<String>)
        -> bool;
    fn add_receipt_recipient(&self, chat: &str, id: &str, user_id: &str, read: bool);

    fn chat(&self, id: &str) -> Option<Chat>;
    fn ensure_chat(&self, id: &str) -> Chat;
    fn upsert_chat(&self, chat: Chat);
    fn increment_unread(&self, id: &str);
    fn set_archived(&self, id: &str, archived: bool);
    fn set_ephemeral_expiration(&self, id: &str, expiration: Option<u64>);
    fn add_past_participants(&self, id: &str, participants: Vec<String>);

    fn contact(&self, user_id: &str) -> Option<Contact>;
    fn upsert_contact(&self, user_id: &str, push_name: Option<String>);
    fn touch_last_seen(&self, user_id: &str, timestamp: u64);

    fn flush(&self) -> Result<()>;
}

#[derive(Default)]
struct MemoryStoreInner {
    chats: HashMap<String, Chat>,
    messages: HashMap<String, Vec<ChatMessage>>,
    contacts: HashMap<String, Contact>,
}

/// In-memory [`Store`], sufficient for tests and embedding.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryStoreInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn message_count(&self, chat: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .messages
            .get(chat)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

impl MemoryStoreInner {
    fn find_message(&mut self, chat: &str, id: &str) -> Option<&mut ChatMessage> {
        self.messages
            .get_mut(chat)
            .and_then(|list| list.iter_mut().find(|m| m.key.id == id))
    }
}

impl Store for MemoryStore {
    fn upsert_message(&self, message: ChatMessage) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let list = inner.messages.entry(message.key.chat.clone()).or_default();
        if list.iter().any(|m| m.key == message.key) {
            return false;
        }
        list.push(message);
        true
    }

    fn get_message(&self, chat: &str, id: &str) -> Option<ChatMessage> {
        self.inner.lock().unwrap().find_message(chat, id).map(|m| m.clone())
    }

    fn remove_message(&self, chat: &str, id: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if let Some(list) = inner.messages.get_mut(chat) {
            let before = list.len();
            list.retain(|m| m.key.id != id);
            return list.len() != before;
        }
        false
    }

    fn set_message_status(&self, chat: &str, id: &str, status: MessageStatus) {
        if let Some(message) = self.inner.lock().unwrap().find_message(chat, id) {
            message.status = status;
        }
    }

    fn mark_ignored(&self, chat: &str, id: &str) {
        if let Some(message) = self.inner.lock().unwrap().find_message(chat, id) {
            message.ignore_unread = true;
        }
    }

    fn add_reaction(&self, chat: &str, target_id: &str, reaction: Reaction) {
        if let Some(message) = self.inner.lock().unwrap().find_message(chat, target_id) {
            message.reactions.push(reaction);
        }
    }

    fn record_poll_vote(
        &self,
        chat: &str,
        poll_id: &str,
        voter: &str,
        selection: Vec<String>,
    ) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if let Some(message) = inner.find_message(chat, poll_id) {
            if let Some(poll) = message.poll.as_mut() {
                poll.votes.insert(voter.to_string(), selection);
                return true;
            }
        }
        false
    }

    fn add_receipt_recipient(&self, chat: &str, id: &str, user_id: &str, read: bool) {
        if let Some(message) = self.inner.lock().unwrap().find_message(chat, id) {
            if !message.delivered_to.iter().any(|u| u == user_id) {
                message.delivered_to.push(user_id.to_string());
            }
            if read && !message.read_by.iter().any(|u| u == user_id) {
                message.read_by.push(user_id.to_string());
            }
        }
    }

    fn chat(&self, id: &str) -> Option<Chat> {
        self.inner.lock().unwrap().chats.get(id).cloned()
    }

    fn ensure_chat(&self, id: &str) -> Chat {
        self.inner
            .lock()
            .unwrap()
            .chats
            .entry(id.to_string())
            .or_insert_with(|| Chat::new(id))
            .clone()
    }

    fn upsert_chat(&self, chat: Chat) {
        self.inner.lock().unwrap().chats.insert(chat.id.clone(), chat);
    }

    fn increment_unread(&self, id: &str) {
        let mut inner = self.inner.lock().unwrap();
        let chat = inner
            .chats
            .entry(id.to_string())
            .or_insert_with(|| Chat::new(id));
        chat.unread += 1;
    }

    fn set_archived(&self, id: &str, archived: bool) {
        let mut inner = self.inner.lock().unwrap();
        let chat = inner
            .chats
            .entry(id.to_string())
            .or_insert_with(|| Chat::new(id));
        chat.archived = archived;
    }

    fn set_ephemeral_expiration(&self, id: &str, expiration: Option<u64>) {
        let mut inner = self.inner.lock().unwrap();
        let chat = inner
            .chats
            .entry(id.to_string())
            .or_insert_with(|| Chat::new(id));
        chat.ephemeral_expiration = expiration;
    }

    fn add_past_participants(&self, id: &str, participants: Vec<String>) {
        let mut inner = self.inner.lock().unwrap();
        let chat = inner
            .chats
            .entry(id.to_string())
            .or_insert_with(|| Chat::new(id));
        for participant in participants {
            if !chat.past_participants.contains(&participant) {
                chat.past_participants.push(participant);
            }
        }
    }

    fn contact(&self, user_id: &str) -> Option<Contact> {
        self.inner.lock().unwrap().contacts.get(user_id).cloned()
    }

    fn upsert_contact(&self, user_id: &str, push_name: Option<String>) {
        let mut inner = self.inner.lock().unwrap();
        let contact = inner
            .contacts
            .entry(user_id.to_string())
            .or_insert_with(|| Contact {
                user_id: user_id.to_string(),
                push_name: None,
                last_seen: None,
            });
        if push_name.is_some() {
            contact.push_name = push_name;
        }
    }

    fn touch_last_seen(&self, user_id: &str, timestamp: u64) {
        let mut inner = self.inner.lock().unwrap();
        let contact = inner
            .contacts
            .entry(user_id.to_string())
            .or_insert_with(|| Contact {
                user_id: user_id.to_string(),
                push_name: None,
                last_seen: None,
            });
        if contact.last_seen.map(|prior| prior < timestamp).unwrap_or(true) {
            contact.last_seen = Some(timestamp);
        }
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}
