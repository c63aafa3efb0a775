use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use sha2::Sha256;

use crate::{Error, Result};

pub fn kdf(input: &[u8], salt: &[u8], num_outputs: usize) -> Vec<[u8; 32]> {
    let hk = Hkdf::<Sha256>::new(Some(salt), input);

    let mut outputs = Vec::with_capacity(num_outputs);
    for i in 1..=num_outputs {
        let mut okm = [0u8; 32];
        hk.expand(&[i as u8], &mut okm)
            .expect("32 bytes is valid length");
        outputs.push(okm);
    }
    outputs
}

/// Derives an AEAD key and nonce pair from a message key.
pub fn derive_key_nonce(message_key: &[u8; 32], label: &[u8]) -> ([u8; 32], [u8; 12]) {
    let outputs = kdf(message_key, label, 2);
    let mut nonce = [0u8; 12];
    nonce.copy_from_slice(&outputs[1][..12]);
    (outputs[0], nonce)
}

pub fn seal(key: &[u8; 32], nonce: &[u8; 12], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .encrypt(Nonce::from_slice(nonce), plaintext)
        .map_err(|_| Error::Encryption("aead seal failed".to_string()))
}

pub fn open(key: &[u8; 32], nonce: &[u8; 12], ciphertext: &[u8]) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| Error::Decryption("aead open failed".to_string()))
}

pub fn now_seconds() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kdf_is_deterministic_and_distinct() {
        let a = kdf(b"chain", b"salt", 2);
        let b = kdf(b"chain", b"salt", 2);
        assert_eq!(a, b);
        assert_ne!(a[0], a[1]);
    }

    #[test]
    fn seal_open_roundtrip() {
        let (key, nonce) = derive_key_nonce(&[7u8; 32], b"test");
        let ct = seal(&key, &nonce, b"payload").unwrap();
        assert_eq!(open(&key, &nonce, &ct).unwrap(), b"payload");
        assert!(open(&key, &nonce, &ct[..ct.len() - 1]).is_err());
    }
}
