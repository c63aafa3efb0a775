use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

use crate::store::ChatMessage;
use crate::Result;

/// Which slice of history a sync payload carries. Ordering matters to the
/// reconciliation logic: `InitialBootstrap` seeds the tracked conversation
/// set, later `Recent`/`Full` payloads diff and narrow it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistorySyncType {
    InitialBootstrap,
    Recent,
    Full,
    InitialStatusV3,
    PushName,
    NonBlockingData,
}

/// One conversation's slice inside a history payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationHistory {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub unread: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub archived: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub ephemeral_expiration: Option<u64>,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushNameRecord {
    pub user_id: String,
    pub push_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PastParticipants {
    pub group_id: String,
    pub participants: Vec<String>,
}

/// The inflated body of a history sync notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistorySyncPayload {
    pub sync_type: HistorySyncType,
    #[serde(default)]
    pub conversations: Vec<ConversationHistory>,
    #[serde(default)]
    pub statuses: Vec<ChatMessage>,
    #[serde(default)]
    pub push_names: Vec<PushNameRecord>,
    #[serde(default)]
    pub past_participants: Vec<PastParticipants>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub progress: Option<u8>,
}

pub fn inflate_history_payload(compressed: &[u8]) -> Result<HistorySyncPayload> {
    let mut decoder = ZlibDecoder::new(compressed);
    let mut raw = Vec::new();
    decoder.read_to_end(&mut raw)?;
    Ok(serde_json::from_slice(&raw)?)
}

pub fn deflate_history_payload(payload: &HistorySyncPayload) -> Result<Vec<u8>> {
    let raw = serde_json::to_vec(payload)?;
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&raw)?;
    Ok(encoder.finish()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inflate_rejects_garbage() {
        assert!(inflate_history_payload(b"not zlib at all").is_err());
    }

    #[test]
    fn payload_survives_compression() {
        let payload = HistorySyncPayload {
            sync_type: HistorySyncType::Recent,
            conversations: vec![ConversationHistory {
                id: "bob".to_string(),
                display_name: Some("Bob".to_string()),
                unread: Some(2),
                archived: None,
                ephemeral_expiration: None,
                messages: Vec::new(),
            }],
            statuses: Vec::new(),
            push_names: vec![PushNameRecord {
                user_id: "bob".to_string(),
                push_name: "Bob".to_string(),
            }],
            past_participants: Vec::new(),
            progress: Some(40),
        };

        let compressed = deflate_history_payload(&payload).unwrap();
        let back = inflate_history_payload(&compressed).unwrap();
        assert_eq!(back.sync_type, HistorySyncType::Recent);
        assert_eq!(back.conversations.len(), 1);
        assert_eq!(back.conversations[0].id, "bob");
        assert_eq!(back.progress, Some(40));
    }
}
