use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::sender_key::{SenderKeyDistribution, SenderKeyState};
use crate::types::{CiphertextType, DecodeFailure, DecodedMessage, DeviceAddress};
use crate::{Error, Result};

#[derive(Debug, Serialize, Deserialize)]
struct GroupEnvelope {
    key_id: u32,
    n: u32,
    body: String,
}

/// Sender-key encrypt/decrypt for groups: one outgoing chain per group for
/// our own identity, one incoming chain per (group, participant device).
///
/// A participant's incoming chain only ever comes from a distribution
/// message; a group ciphertext from a participant without one is a decode
/// failure, never an implicit chain creation.
#[derive(Default)]
pub struct GroupCodec {
    own_chains: HashMap<String, SenderKeyState>,
    incoming: HashMap<String, HashMap<DeviceAddress, SenderKeyState>>,
    next_key_id: u32,
}

impl GroupCodec {
    pub fn new() -> Self {
        Self {
            own_chains: HashMap::new(),
            incoming: HashMap::new(),
            next_key_id: 1,
        }
    }

    fn own_chain(&mut self, group_id: &str) -> &mut SenderKeyState {
        if !self.own_chains.contains_key(group_id) {
            let key_id = self.next_key_id;
            self.next_key_id += 1;
            let distribution = SenderKeyDistribution::new_random(group_id.to_string(), key_id);
            self.own_chains.insert(
                group_id.to_string(),
                SenderKeyState::from_distribution(&distribution),
            );
        }
        self.own_chains.get_mut(group_id).expect("just inserted")
    }

    /// Advances our own chain for the group and wraps the ciphertext in the
    /// sender-key wire envelope.
    pub fn encrypt_outgoing(&mut self, group_id: &str, plaintext: &[u8]) -> Result<Vec<u8>> {
        let chain = self.own_chain(group_id);
        let key_id = chain.key_id;
        let (n, ciphertext) = chain.encrypt(plaintext)?;

        let envelope = GroupEnvelope {
            key_id,
            n,
            body: base64::engine::general_purpose::STANDARD.encode(ciphertext),
        };
        Ok(serde_json::to_vec(&envelope)?)
    }

    /// Packages the current public parameters of our outgoing chain for
    /// participants who do not have it yet. Creates the chain on first use.
    pub fn build_distribution(&mut self, group_id: &str) -> SenderKeyDistribution {
        let chain = self.own_chain(group_id);
        SenderKeyDistribution::new(
            group_id.to_string(),
            chain.key_id,
            chain.chain_key(),
            chain.iteration(),
        )
    }

    /// Creates or replaces the participant's incoming chain. Replacement is
    /// deliberate re-keying by the sender.
    pub fn ingest_distribution(
        &mut self,
        group_id: &str,
        participant: &DeviceAddress,
        distribution: &SenderKeyDistribution,
    ) {
        self.incoming
            .entry(group_id.to_string())
            .or_default()
            .insert(
                participant.clone(),
                SenderKeyState::from_distribution(distribution),
            );
    }

    pub fn has_incoming_chain(&self, group_id: &str, participant: &DeviceAddress) -> bool {
        self.incoming
            .get(group_id)
            .map(|chains| chains.contains_key(participant))
            .unwrap_or(false)
    }

    pub fn decrypt(
        &mut self,
        group_id: &str,
        participant: &DeviceAddress,
        ciphertext: &[u8],
    ) -> DecodedMessage {
        let envelope: GroupEnvelope = match serde_json::from_slice(ciphertext) {
            Ok(envelope) => envelope,
            Err(e) => {
                return DecodedMessage::failed(
                    CiphertextType::SenderKey,
                    DecodeFailure::Malformed(e.to_string()),
                )
            }
        };

        let body = match base64::engine::general_purpose::STANDARD.decode(&envelope.body) {
            Ok(body) => body,
            Err(e) => {
                return DecodedMessage::failed(
                    CiphertextType::SenderKey,
                    DecodeFailure::Malformed(e.to_string()),
                )
            }
        };

        let chain = match self
            .incoming
            .get_mut(group_id)
            .and_then(|chains| chains.get_mut(participant))
        {
            Some(chain) => chain,
            None => {
                return DecodedMessage::failed(
                    CiphertextType::SenderKey,
                    DecodeFailure::MissingSenderKey,
                )
            }
        };

        if chain.key_id != envelope.key_id {
            return DecodedMessage::failed(
                CiphertextType::SenderKey,
                DecodeFailure::MissingSenderKey,
            );
        }

        match chain.decrypt(envelope.n, &body) {
            Ok(plaintext) => DecodedMessage::plaintext(CiphertextType::SenderKey, plaintext),
            Err(Error::Decryption(_)) => {
                DecodedMessage::failed(CiphertextType::SenderKey, DecodeFailure::BadMac)
            }
            Err(e) => DecodedMessage::failed(
                CiphertextType::SenderKey,
                DecodeFailure::Malformed(e.to_string()),
            ),
        }
    }
}
