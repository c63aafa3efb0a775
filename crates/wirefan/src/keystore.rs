use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use crate::types::{serde_bytes32, CiphertextType, DecodeFailure, DeviceAddress};
use crate::utils::{derive_key_nonce, kdf, open, seal};
use crate::{Error, Result};

const PAIRWISE_KDF_LABEL: &[u8] = b"wirefan-pairwise-v1";
const SESSION_KDF_LABEL: &[u8] = b"wirefan-session-v1";

/// A recipient's published key material, used to bootstrap a session
/// without prior interaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKeyBundle {
    pub registration_id: u32,
    #[serde(with = "serde_bytes32")]
    pub identity_key: [u8; 32],
    pub signed_prekey_id: u32,
    #[serde(with = "serde_bytes32")]
    pub signed_prekey: [u8; 32],
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub one_time_prekey_id: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub one_time_prekey: Option<[u8; 32]>,
}

/// Output of a pairwise session encrypt: the ratchet ciphertext plus the
/// type tag the receiver dispatches on.
#[derive(Debug, Clone)]
pub struct PairwiseCiphertext {
    pub enc_type: CiphertextType,
    pub ciphertext: Vec<u8>,
}

/// Session and long-term key storage. Per-address ratchet state lives here;
/// the pipeline holds no cryptographic state of its own and mutates sessions
/// only through these primitives, under its single serializing context.
pub trait KeyStore: Send + Sync {
    fn has_session(&self, addr: &DeviceAddress) -> bool;

    /// Establishes the outgoing session for `addr` from a fetched bundle,
    /// overwriting any prior session. A fresh bundle supersedes old state.
    fn create_session(&self, addr: &DeviceAddress, bundle: &PreKeyBundle) -> Result<()>;

    /// Advances the sender ratchet for `addr`. Pre-key-typed output until
    /// the session is confirmed by a successful inbound decrypt.
    fn session_encrypt(&self, addr: &DeviceAddress, plaintext: &[u8]) -> Result<PairwiseCiphertext>;

    /// Decrypts one pairwise ciphertext. Expected failures are returned as
    /// data; this never panics or unwinds on bad input.
    fn session_decrypt(
        &self,
        addr: &DeviceAddress,
        enc_type: CiphertextType,
        ciphertext: &[u8],
    ) -> std::result::Result<Vec<u8>, DecodeFailure>;

    fn registration_id(&self) -> u32;

    /// Public identity block attached (once) to outgoing nodes that contain
    /// at least one pre-key-typed ciphertext.
    fn identity_block(&self) -> Vec<u8>;

    /// Allocates a fresh one-time pre-key bundle for retry re-establishment.
    fn allocate_one_time_prekey(&self) -> Result<PreKeyBundle>;

    fn store_app_state_key(&self, key_id: &str, key_data: &[u8]) -> Result<()>;

    fn has_app_state_keys(&self) -> bool;

    /// Persists ratchet-affecting state immediately.
    fn flush(&self) -> Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionRecord {
    #[serde(with = "serde_bytes32")]
    secret: [u8; 32],
    bundle: PreKeyBundle,
    send_counter: u32,
    seen_counters: HashSet<u32>,
    confirmed: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct PairwiseEnvelope {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    bundle: Option<PreKeyBundle>,
    n: u32,
    body: String,
}

/// In-memory reference implementation of [`KeyStore`].
///
/// The session scheme is a deterministic hkdf message-key chain with
/// ChaCha20-Poly1305, sufficient to exercise the pipeline's orchestration
/// and the pre-key/ratchet type transitions. It is not a vetted ratchet;
/// production embedders supply their own KeyStore.
pub struct MemoryKeyStore {
    registration_id: u32,
    identity_key: [u8; 32],
    own_bundle: PreKeyBundle,
    sessions: Mutex<HashMap<DeviceAddress, SessionRecord>>,
    app_state_keys: Mutex<HashMap<String, Vec<u8>>>,
    prekey_counter: Mutex<u32>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        let identity_key = rand::random::<[u8; 32]>();
        let signed_prekey = rand::random::<[u8; 32]>();
        let registration_id = rand::random::<u32>();
        Self {
            registration_id,
            identity_key,
            own_bundle: PreKeyBundle {
                registration_id,
                identity_key,
                signed_prekey_id: 1,
                signed_prekey,
                one_time_prekey_id: None,
                one_time_prekey: None,
            },
            sessions: Mutex::new(HashMap::new()),
            app_state_keys: Mutex::new(HashMap::new()),
            prekey_counter: Mutex::new(1),
        }
    }

    /// The bundle this endpoint publishes to the relay for others to fetch.
    pub fn own_bundle(&self) -> PreKeyBundle {
        self.own_bundle.clone()
    }

    fn session_secret(bundle: &PreKeyBundle) -> [u8; 32] {
        let mut input = Vec::with_capacity(68);
        input.extend_from_slice(&bundle.identity_key);
        input.extend_from_slice(&bundle.signed_prekey);
        input.extend_from_slice(&bundle.registration_id.to_be_bytes());
        if let Some(otp) = &bundle.one_time_prekey {
            input.extend_from_slice(otp);
        }
        kdf(&input, SESSION_KDF_LABEL, 1)[0]
    }

    fn message_key(secret: &[u8; 32], n: u32) -> ([u8; 32], [u8; 12]) {
        let derived = kdf(secret, &n.to_be_bytes(), 1)[0];
        derive_key_nonce(&derived, PAIRWISE_KDF_LABEL)
    }

    fn decrypt_with_record(
        record: &mut SessionRecord,
        envelope: &PairwiseEnvelope,
    ) -> std::result::Result<Vec<u8>, DecodeFailure> {
        if record.seen_counters.contains(&envelope.n) {
            return Err(DecodeFailure::CounterRegression);
        }

        let ciphertext = base64::engine::general_purpose::STANDARD
            .decode(&envelope.body)
            .map_err(|e| DecodeFailure::Malformed(e.to_string()))?;

        let (key, nonce) = Self::message_key(&record.secret, envelope.n);
        let plaintext = open(&key, &nonce, &ciphertext).map_err(|_| DecodeFailure::BadMac)?;

        record.seen_counters.insert(envelope.n);
        record.confirmed = true;
        Ok(plaintext)
    }
}

impl Default for MemoryKeyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyStore for MemoryKeyStore {
    fn has_session(&self, addr: &DeviceAddress) -> bool {
        self.sessions.lock().unwrap().contains_key(addr)
    }

    fn create_session(&self, addr: &DeviceAddress, bundle: &PreKeyBundle) -> Result<()> {
        let record = SessionRecord {
            secret: Self::session_secret(bundle),
            bundle: bundle.clone(),
            send_counter: 0,
            seen_counters: HashSet::new(),
            confirmed: false,
        };
        self.sessions.lock().unwrap().insert(addr.clone(), record);
        Ok(())
    }

    fn session_encrypt(
        &self,
        addr: &DeviceAddress,
        plaintext: &[u8],
    ) -> Result<PairwiseCiphertext> {
        let mut sessions = self.sessions.lock().unwrap();
        let record = sessions
            .get_mut(addr)
            .ok_or_else(|| Error::Encryption(format!("no session for {addr}")))?;

        let n = record.send_counter;
        record.send_counter += 1;

        let (key, nonce) = Self::message_key(&record.secret, n);
        let body = base64::engine::general_purpose::STANDARD
            .encode(seal(&key, &nonce, plaintext)?);

        let (enc_type, bundle) = if record.confirmed {
            (CiphertextType::Ratchet, None)
        } else {
            (CiphertextType::PreKey, Some(record.bundle.clone()))
        };

        let envelope = PairwiseEnvelope { bundle, n, body };
        Ok(PairwiseCiphertext {
            enc_type,
            ciphertext: serde_json::to_vec(&envelope)?,
        })
    }

    fn session_decrypt(
        &self,
        addr: &DeviceAddress,
        enc_type: CiphertextType,
        ciphertext: &[u8],
    ) -> std::result::Result<Vec<u8>, DecodeFailure> {
        let envelope: PairwiseEnvelope = serde_json::from_slice(ciphertext)
            .map_err(|e| DecodeFailure::Malformed(e.to_string()))?;

        let mut sessions = self.sessions.lock().unwrap();

        match enc_type {
            CiphertextType::PreKey => {
                // Materialize the session from the embedded bundle before
                // decrypting, if we do not already have one.
                let bundle = envelope
                    .bundle
                    .as_ref()
                    .ok_or_else(|| DecodeFailure::Malformed("pkmsg without bundle".into()))?;
                let record = sessions
                    .entry(addr.clone())
                    .or_insert_with(|| SessionRecord {
                        secret: Self::session_secret(bundle),
                        bundle: bundle.clone(),
                        send_counter: 0,
                        seen_counters: HashSet::new(),
                        confirmed: false,
                    });
                Self::decrypt_with_record(record, &envelope)
            }
            CiphertextType::Ratchet => {
                let record = sessions.get_mut(addr).ok_or(DecodeFailure::MissingSession)?;
                Self::decrypt_with_record(record, &envelope)
            }
            CiphertextType::SenderKey => {
                Err(DecodeFailure::Malformed("skmsg is not pairwise".into()))
            }
        }
    }

    fn registration_id(&self) -> u32 {
        self.registration_id
    }

    fn identity_block(&self) -> Vec<u8> {
        hex::encode(self.identity_key).into_bytes()
    }

    fn allocate_one_time_prekey(&self) -> Result<PreKeyBundle> {
        let mut counter = self.prekey_counter.lock().unwrap();
        *counter += 1;
        let mut bundle = self.own_bundle.clone();
        bundle.one_time_prekey_id = Some(*counter);
        bundle.one_time_prekey = Some(rand::random::<[u8; 32]>());
        Ok(bundle)
    }

    fn store_app_state_key(&self, key_id: &str, key_data: &[u8]) -> Result<()> {
        self.app_state_keys
            .lock()
            .unwrap()
            .insert(key_id.to_string(), key_data.to_vec());
        Ok(())
    }

    fn has_app_state_keys(&self) -> bool {
        !self.app_state_keys.lock().unwrap().is_empty()
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}
