use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::types::serde_bytes32;
use crate::utils::{derive_key_nonce, kdf, now_seconds, open, seal};
use crate::{Error, Result};

/// Maximum number of message keys we will derive-and-cache to support
/// out-of-order delivery within a sender's chain.
pub const SENDER_KEY_MAX_SKIP: usize = 10_000;

/// Bound the amount of cached skipped message keys to limit memory/CPU DoS.
pub const SENDER_KEY_MAX_STORED_SKIPPED_KEYS: usize = 2_000;

const SENDER_KEY_KDF_SALT: &[u8] = b"wirefan-sender-key-v1";
const SENDER_KEY_AEAD_LABEL: &[u8] = b"wirefan-sender-key-msg";

/// Public parameters of a sender's chain, delivered pairwise-wrapped to
/// participants who lack it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SenderKeyDistribution {
    pub group_id: String,
    pub key_id: u32,
    #[serde(with = "serde_bytes32")]
    pub chain_key: [u8; 32],
    pub iteration: u32,
    pub created_at: u64,
}

impl SenderKeyDistribution {
    pub fn new(group_id: String, key_id: u32, chain_key: [u8; 32], iteration: u32) -> Self {
        Self {
            group_id,
            key_id,
            chain_key,
            iteration,
            created_at: now_seconds(),
        }
    }

    pub fn new_random(group_id: String, key_id: u32) -> Self {
        Self::new(group_id, key_id, rand::random::<[u8; 32]>(), 0)
    }
}

/// One direction of a group sender chain: the symmetric ratchet either for
/// our own outgoing messages or for one participant's incoming messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SenderKeyState {
    pub key_id: u32,
    #[serde(with = "serde_bytes32")]
    chain_key: [u8; 32],
    iteration: u32,
    #[serde(default)]
    skipped_message_keys: HashMap<u32, [u8; 32]>,
}

impl SenderKeyState {
    pub fn new(key_id: u32, chain_key: [u8; 32], iteration: u32) -> Self {
        Self {
            key_id,
            chain_key,
            iteration,
            skipped_message_keys: HashMap::new(),
        }
    }

    pub fn from_distribution(distribution: &SenderKeyDistribution) -> Self {
        Self::new(
            distribution.key_id,
            distribution.chain_key,
            distribution.iteration,
        )
    }

    pub fn chain_key(&self) -> [u8; 32] {
        self.chain_key
    }

    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    pub fn skipped_len(&self) -> usize {
        self.skipped_message_keys.len()
    }

    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<(u32, Vec<u8>)> {
        let message_number = self.iteration;
        let (next_chain_key, message_key) = derive_message_key(&self.chain_key);

        self.chain_key = next_chain_key;
        self.iteration = self.iteration.saturating_add(1);

        let (key, nonce) = derive_key_nonce(&message_key, SENDER_KEY_AEAD_LABEL);
        let ciphertext = seal(&key, &nonce, plaintext)?;
        Ok((message_number, ciphertext))
    }

    pub fn decrypt(&mut self, message_number: u32, ciphertext: &[u8]) -> Result<Vec<u8>> {
        // Old message: try cached skipped key.
        if message_number < self.iteration {
            let message_key = self
                .skipped_message_keys
                .remove(&message_number)
                .ok_or_else(|| {
                    Error::Decryption("Missing skipped sender key message".to_string())
                })?;

            return decrypt_with_message_key(&message_key, ciphertext);
        }

        // Fast-fail if the sender is too far ahead.
        let delta = (message_number - self.iteration) as usize;
        if delta > SENDER_KEY_MAX_SKIP {
            return Err(Error::TooManySkippedMessages);
        }

        // Derive and cache keys for skipped messages so we can decrypt
        // out-of-order later.
        while self.iteration < message_number {
            let (next_chain_key, message_key) = derive_message_key(&self.chain_key);
            self.chain_key = next_chain_key;
            self.skipped_message_keys
                .insert(self.iteration, message_key);
            self.iteration = self.iteration.saturating_add(1);
        }

        let (next_chain_key, message_key) = derive_message_key(&self.chain_key);
        self.chain_key = next_chain_key;
        self.iteration = self.iteration.saturating_add(1);

        prune_skipped(&mut self.skipped_message_keys);

        decrypt_with_message_key(&message_key, ciphertext)
    }
}

fn decrypt_with_message_key(message_key: &[u8; 32], ciphertext: &[u8]) -> Result<Vec<u8>> {
    let (key, nonce) = derive_key_nonce(message_key, SENDER_KEY_AEAD_LABEL);
    open(&key, &nonce, ciphertext)
}

fn derive_message_key(chain_key: &[u8; 32]) -> ([u8; 32], [u8; 32]) {
    let outputs = kdf(chain_key, SENDER_KEY_KDF_SALT, 2);
    (outputs[0], outputs[1])
}

fn prune_skipped(map: &mut HashMap<u32, [u8; 32]>) {
    if map.len() <= SENDER_KEY_MAX_STORED_SKIPPED_KEYS {
        return;
    }

    // Remove oldest first (smallest message number).
    let mut keys: Vec<u32> = map.keys().cloned().collect();
    keys.sort_unstable();
    let to_remove = map.len().saturating_sub(SENDER_KEY_MAX_STORED_SKIPPED_KEYS);
    for k in keys.into_iter().take(to_remove) {
        map.remove(&k);
    }
}
