use crate::store::ChatMessage;
use crate::types::{CiphertextType, DecodeFailure};

/// One-way notifications surfaced to the embedding application. Also the
/// error channel for inbound terminal failures: decode failures that
/// exhaust the retry budget arrive here, never as an unwinding fault.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    NewMessage {
        chat: String,
        message: ChatMessage,
    },
    NewStatus {
        message: ChatMessage,
    },
    NewContact {
        user_id: String,
        push_name: Option<String>,
    },
    ChatsLoaded {
        count: usize,
    },
    HistorySyncProgress {
        percent: u8,
    },
    MessageDeleted {
        chat: String,
        id: String,
    },
    SettingChanged {
        chat: String,
        ephemeral_expiration: Option<u64>,
    },
    ConversationNoLongerRecent {
        chat: String,
    },
    ActionApplied {
        chat: String,
        target_id: String,
        action: String,
    },
    RetryExhausted {
        message_id: String,
        sender: String,
        participant: Option<String>,
        enc_type: CiphertextType,
        cause: DecodeFailure,
    },
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: ClientEvent);
}

/// A plain channel sender works as a sink; tests drain the receiver.
impl EventSink for crossbeam_channel::Sender<ClientEvent> {
    fn emit(&self, event: ClientEvent) {
        let _ = self.send(event);
    }
}
