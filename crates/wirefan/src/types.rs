use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{Error, Result};

/// Wire protocol version stamped on every `enc` child.
pub const WIRE_VERSION: &str = "2";

/// Pseudo-conversation id for status broadcasts.
pub const STATUS_BROADCAST: &str = "status@broadcast";

/// Suffix distinguishing group conversation ids from user ids on the wire.
pub const GROUP_SUFFIX: &str = "@g";

/// One physical session endpoint: a user id plus a device index.
/// Device 0 is the primary device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceAddress {
    pub user_id: String,
    pub device_id: u16,
}

impl DeviceAddress {
    pub fn new(user_id: impl Into<String>, device_id: u16) -> Self {
        Self {
            user_id: user_id.into(),
            device_id,
        }
    }

    pub fn primary(user_id: impl Into<String>) -> Self {
        Self::new(user_id, 0)
    }

    pub fn is_primary(&self) -> bool {
        self.device_id == 0
    }

    /// Parses the `user:device` wire form. A bare user id means device 0.
    pub fn parse(s: &str) -> Result<Self> {
        match s.rsplit_once(':') {
            Some((user, device)) => {
                let device_id = device
                    .parse::<u16>()
                    .map_err(|_| Error::InvalidAddress(s.to_string()))?;
                if user.is_empty() {
                    return Err(Error::InvalidAddress(s.to_string()));
                }
                Ok(Self::new(user, device_id))
            }
            None if !s.is_empty() => Ok(Self::primary(s)),
            None => Err(Error::InvalidAddress(s.to_string())),
        }
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.user_id, self.device_id)
    }
}

/// Routing key of a conversation: a peer user (1:1, status) or a group.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConversationId {
    Direct(String),
    Group(String),
}

impl ConversationId {
    /// Classifies a wire id; group ids carry the group suffix.
    pub fn from_wire(id: &str) -> Self {
        if id.ends_with(GROUP_SUFFIX) {
            ConversationId::Group(id.to_string())
        } else {
            ConversationId::Direct(id.to_string())
        }
    }

    pub fn wire_id(&self) -> &str {
        match self {
            ConversationId::Direct(id) | ConversationId::Group(id) => id,
        }
    }

    pub fn is_group(&self) -> bool {
        matches!(self, ConversationId::Group(_))
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_id())
    }
}

/// Wire type tag of an `enc` child, used for decode dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CiphertextType {
    /// Pairwise ciphertext carrying an embedded session bootstrap bundle.
    PreKey,
    /// Plain pairwise ratchet ciphertext over an established session.
    Ratchet,
    /// Group ciphertext under the sender's shared key chain.
    SenderKey,
}

impl CiphertextType {
    pub fn as_wire(&self) -> &'static str {
        match self {
            CiphertextType::PreKey => "pkmsg",
            CiphertextType::Ratchet => "msg",
            CiphertextType::SenderKey => "skmsg",
        }
    }

    pub fn from_wire(tag: &str) -> Option<Self> {
        match tag {
            "pkmsg" => Some(CiphertextType::PreKey),
            "msg" => Some(CiphertextType::Ratchet),
            "skmsg" => Some(CiphertextType::SenderKey),
            _ => None,
        }
    }
}

/// Expected, recoverable decode failures. Carried as data inside
/// [`DecodedMessage`] and never thrown across the pipeline boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecodeFailure {
    BadMac,
    MissingSession,
    MissingSenderKey,
    CounterRegression,
    Malformed(String),
    MessageUnavailable,
}

impl fmt::Display for DecodeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeFailure::BadMac => f.write_str("bad mac"),
            DecodeFailure::MissingSession => f.write_str("missing session"),
            DecodeFailure::MissingSenderKey => f.write_str("missing sender key"),
            DecodeFailure::CounterRegression => f.write_str("counter regression"),
            DecodeFailure::Malformed(why) => write!(f, "malformed payload: {why}"),
            DecodeFailure::MessageUnavailable => f.write_str("message not available"),
        }
    }
}

/// Outcome of decoding one ciphertext. Exactly one of plaintext or failure
/// is populated, and the original wire type tag is always retained: the
/// retry-receipt protocol needs it to ask for the right bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedMessage {
    pub enc_type: CiphertextType,
    pub outcome: std::result::Result<Vec<u8>, DecodeFailure>,
}

impl DecodedMessage {
    pub fn plaintext(enc_type: CiphertextType, bytes: Vec<u8>) -> Self {
        Self {
            enc_type,
            outcome: Ok(bytes),
        }
    }

    pub fn failed(enc_type: CiphertextType, cause: DecodeFailure) -> Self {
        Self {
            enc_type,
            outcome: Err(cause),
        }
    }
}

/// One logical outgoing message, consumed exactly once by the pipeline.
/// Not retried internally; a higher layer may resubmit.
#[derive(Debug, Clone)]
pub struct OutgoingRequest {
    pub conversation: ConversationId,
    pub message: InnerMessage,
    /// Restricts fan-out to a single device, skipping address resolution.
    pub recipient_override: Option<DeviceAddress>,
    /// Bypasses device and group metadata caches.
    pub force_refresh: bool,
    /// Extra attributes copied onto the outgoing wire node.
    pub extra_attrs: Vec<(String, String)>,
}

impl OutgoingRequest {
    pub fn new(conversation: ConversationId, message: InnerMessage) -> Self {
        Self {
            conversation,
            message,
            recipient_override: None,
            force_refresh: false,
            extra_attrs: Vec::new(),
        }
    }

    pub fn text(conversation: ConversationId, text: impl Into<String>) -> Self {
        Self::new(conversation, InnerMessage::Chat { text: text.into() })
    }
}

/// Per-inbound-node addressing context, one per `enc` child.
#[derive(Debug, Clone)]
pub struct IncomingEnvelope {
    pub sender: DeviceAddress,
    /// Sending device inside a group (the pairwise/sender-key peer).
    pub participant: Option<DeviceAddress>,
    pub timestamp: u64,
    pub message_id: String,
    pub business_name: Option<String>,
    pub payload: Option<Vec<u8>>,
    pub enc_type: CiphertextType,
    /// Peer-originated protocol messages are acknowledged separately.
    pub peer_originated: bool,
}

impl IncomingEnvelope {
    /// The address whose session decodes this envelope.
    pub fn decrypt_address(&self) -> &DeviceAddress {
        self.participant.as_ref().unwrap_or(&self.sender)
    }
}

/// The decrypted logical message content, serialized as the plaintext of
/// every ciphertext. Closed set: decode dispatch matches exhaustively.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InnerMessage {
    Chat {
        text: String,
    },
    /// Companion echo sent to the sender's own other devices: same logical
    /// content, different envelope.
    DeviceSent {
        destination: String,
        message: Box<InnerMessage>,
    },
    Reaction {
        target_id: String,
        emoji: String,
    },
    PollCreation {
        name: String,
        options: Vec<String>,
        #[serde(with = "serde_bytes32")]
        enc_key: [u8; 32],
    },
    PollUpdate {
        target_id: String,
        /// base64 AEAD ciphertext of the selected option hashes.
        payload: String,
    },
    /// Sender-key chain parameters, delivered pairwise-wrapped.
    SenderKeyDistribution {
        distribution: crate::sender_key::SenderKeyDistribution,
    },
    Protocol(ProtocolMessage),
}

/// Server/control messages, distinct from user content. Every variant
/// triggers a persistence flush after handling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ProtocolMessage {
    HistorySyncNotification {
        /// base64 of the zlib-compressed history payload.
        payload: String,
    },
    AppStateKeyShare {
        keys: Vec<AppStateKey>,
    },
    Revoke {
        target_id: String,
    },
    EphemeralSetting {
        /// Seconds; zero disables disappearing messages.
        expiration: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppStateKey {
    pub key_id: String,
    #[serde(with = "hex::serde")]
    pub key_data: Vec<u8>,
}

pub(crate) mod serde_bytes32 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 32], D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        if bytes.len() != 32 {
            return Err(serde::de::Error::custom("Invalid 32-byte hex"));
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(arr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_address_wire_roundtrip() {
        let addr = DeviceAddress::new("alice", 3);
        assert_eq!(addr.to_string(), "alice:3");
        assert_eq!(DeviceAddress::parse("alice:3").unwrap(), addr);
        assert_eq!(
            DeviceAddress::parse("alice").unwrap(),
            DeviceAddress::primary("alice")
        );
        assert!(DeviceAddress::parse(":1").is_err());
        assert!(DeviceAddress::parse("").is_err());
    }

    #[test]
    fn conversation_classification() {
        assert!(ConversationId::from_wire("team@g").is_group());
        assert!(!ConversationId::from_wire("bob").is_group());
    }

    #[test]
    fn ciphertext_type_tags() {
        for ty in [
            CiphertextType::PreKey,
            CiphertextType::Ratchet,
            CiphertextType::SenderKey,
        ] {
            assert_eq!(CiphertextType::from_wire(ty.as_wire()), Some(ty));
        }
        assert_eq!(CiphertextType::from_wire("frame"), None);
    }

    #[test]
    fn inner_message_json_roundtrip() {
        let msg = InnerMessage::DeviceSent {
            destination: "bob".to_string(),
            message: Box::new(InnerMessage::Chat {
                text: "hi".to_string(),
            }),
        };
        let json = serde_json::to_string(&msg).unwrap();
        let back: InnerMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);

        let control = InnerMessage::Protocol(ProtocolMessage::Revoke {
            target_id: "m1".to_string(),
        });
        let json = serde_json::to_string(&control).unwrap();
        let back: InnerMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, control);
    }
}
