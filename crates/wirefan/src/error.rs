use thiserror::Error;

use crate::types::{CiphertextType, DecodeFailure};

#[derive(Error, Debug)]
pub enum Error {
    #[error("Address resolution error: {0}")]
    AddressResolution(String),

    #[error("Session bootstrap error: {0}")]
    SessionBootstrap(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Decryption error: {0}")]
    Decryption(String),

    #[error("Too many skipped messages")]
    TooManySkippedMessages,

    #[error("Invalid node: {0}")]
    InvalidNode(String),

    #[error("Missing attribute '{0}'")]
    MissingAttribute(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Retry exhausted for message {message_id} from {sender} ({enc_type:?}): {cause}")]
    RetryExhausted {
        message_id: String,
        sender: String,
        participant: Option<String>,
        enc_type: CiphertextType,
        cause: DecodeFailure,
    },

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Hex(#[from] hex::FromHexError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
