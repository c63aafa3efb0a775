use std::sync::Arc;

use crate::keystore::{KeyStore, PairwiseCiphertext};
use crate::types::{CiphertextType, DecodeFailure, DecodedMessage, DeviceAddress};
use crate::Result;

/// Pairwise encrypt/decrypt for one device address. The ratchet itself
/// lives in the KeyStore; this layer tags outputs for decode dispatch and
/// turns expected failures into data.
pub struct PairwiseCodec {
    keystore: Arc<dyn KeyStore>,
}

impl PairwiseCodec {
    pub fn new(keystore: Arc<dyn KeyStore>) -> Self {
        Self { keystore }
    }

    /// Advances the sender ratchet for `addr`. The output is pre-key typed
    /// until the session has been confirmed by inbound traffic.
    pub fn encrypt(&self, addr: &DeviceAddress, plaintext: &[u8]) -> Result<PairwiseCiphertext> {
        self.keystore.session_encrypt(addr, plaintext)
    }

    /// Never returns a raw error across the decode boundary: cryptographic
    /// failures come back as `DecodedMessage` data, tagged with the
    /// original wire type.
    pub fn decrypt(
        &self,
        addr: &DeviceAddress,
        enc_type: CiphertextType,
        ciphertext: Option<&[u8]>,
    ) -> DecodedMessage {
        let Some(ciphertext) = ciphertext else {
            return DecodedMessage::failed(enc_type, DecodeFailure::MessageUnavailable);
        };

        match self.keystore.session_decrypt(addr, enc_type, ciphertext) {
            Ok(plaintext) => DecodedMessage::plaintext(enc_type, plaintext),
            Err(cause) => DecodedMessage::failed(enc_type, cause),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::MemoryKeyStore;

    #[test]
    fn decrypt_without_payload_is_unavailable() {
        let codec = PairwiseCodec::new(Arc::new(MemoryKeyStore::new()));
        let decoded = codec.decrypt(
            &DeviceAddress::primary("alice"),
            CiphertextType::Ratchet,
            None,
        );
        assert_eq!(
            decoded.outcome.unwrap_err(),
            DecodeFailure::MessageUnavailable
        );
        assert_eq!(decoded.enc_type, CiphertextType::Ratchet);
    }

    #[test]
    fn codec_roundtrip_via_keystores() {
        let alice_store = Arc::new(MemoryKeyStore::new());
        let bob_store = Arc::new(MemoryKeyStore::new());
        let alice = PairwiseCodec::new(alice_store.clone());
        let bob = PairwiseCodec::new(bob_store.clone());

        let alice_addr = DeviceAddress::primary("alice");
        let bob_addr = DeviceAddress::primary("bob");

        alice_store
            .create_session(&bob_addr, &bob_store.own_bundle())
            .unwrap();

        let ct = alice.encrypt(&bob_addr, b"ping").unwrap();
        let decoded = bob.decrypt(&alice_addr, ct.enc_type, Some(&ct.ciphertext));
        assert_eq!(decoded.outcome.unwrap(), b"ping");
    }
}
