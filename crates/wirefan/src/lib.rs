//! Message encode/decode pipeline for a multi-device end-to-end encrypted
//! messaging client.
//!
//! The pipeline turns one logical outgoing message into per-device
//! ciphertexts (pairwise double-ratchet sessions for 1:1, sender keys for
//! groups) and turns inbound wire nodes back into decrypted content,
//! driving session bootstrap, retry receipts and history reconciliation
//! along the way. Transport framing, persistence and the concrete ratchet
//! live behind the [`Transport`], [`Store`] and [`KeyStore`] seams;
//! in-memory reference implementations of the latter two ship with the
//! crate.

pub mod cache;
pub mod error;
pub mod establisher;
pub mod events;
pub mod group;
pub mod history;
pub mod keystore;
pub mod node;
pub mod pairwise;
pub mod pipeline;
pub mod resolver;
pub mod retry;
pub mod sender_key;
pub mod store;
pub mod transport;
pub mod types;
pub mod utils;

pub use cache::{DeviceCache, GroupMetadata, GroupMetadataCache, HistoryReconciliationSet, TtlCache};
pub use error::{Error, Result};
pub use establisher::SessionEstablisher;
pub use events::{ClientEvent, EventSink};
pub use group::GroupCodec;
pub use history::{HistorySyncPayload, HistorySyncType};
pub use keystore::{KeyStore, MemoryKeyStore, PairwiseCiphertext, PreKeyBundle};
pub use node::Node;
pub use pairwise::PairwiseCodec;
pub use pipeline::{MessagePipeline, PipelineConfig};
pub use resolver::AddressResolver;
pub use retry::{RetryDecision, RetryLedger, MAX_RETRY_ATTEMPTS};
pub use sender_key::{SenderKeyDistribution, SenderKeyState};
pub use store::{Chat, ChatMessage, Contact, MemoryStore, MessageKey, MessageStatus, Store};
pub use transport::Transport;
pub use types::{
    CiphertextType, ConversationId, DecodeFailure, DecodedMessage, DeviceAddress,
    IncomingEnvelope, InnerMessage, OutgoingRequest, ProtocolMessage, STATUS_BROADCAST,
    WIRE_VERSION,
};
