/// Authenticated encryption for secrets at rest (TOTP seeds)
///
/// Sealed values are hex of `nonce (12 bytes) || ciphertext`. The record id
/// is bound as associated data so a sealed secret cannot be moved between
/// records.
use crate::error::{IdpError, IdpResult};
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use rand::{rngs::OsRng, RngCore};

const NONCE_LEN: usize = 12;

#[derive(Clone)]
pub struct SecretBox {
    cipher: ChaCha20Poly1305,
}

impl SecretBox {
    /// Build from a 64 hex character master key
    pub fn from_hex(master_key: &str) -> IdpResult<Self> {
        let bytes = hex::decode(master_key.trim())
            .map_err(|_| IdpError::Startup("TOTP master key is not valid hex".to_string()))?;
        if bytes.len() != 32 {
            return Err(IdpError::Startup(
                "TOTP master key must be 32 bytes".to_string(),
            ));
        }

        Ok(Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(&bytes)),
        })
    }

    pub fn seal(&self, plaintext: &[u8], context: &str) -> IdpResult<String> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: plaintext,
                    aad: context.as_bytes(),
                },
            )
            .map_err(|e| IdpError::Internal(format!("Encryption failure: {}", e)))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(hex::encode(sealed))
    }

    pub fn open(&self, sealed: &str, context: &str) -> IdpResult<Vec<u8>> {
        let data = hex::decode(sealed)
            .map_err(|_| IdpError::Internal("Sealed secret is not valid hex".to_string()))?;
        if data.len() <= NONCE_LEN {
            return Err(IdpError::Internal("Invalid ciphertext length".to_string()));
        }

        let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
        self.cipher
            .decrypt(
                Nonce::from_slice(nonce_bytes),
                Payload {
                    msg: ciphertext,
                    aad: context.as_bytes(),
                },
            )
            .map_err(|e| IdpError::Internal(format!("Decryption failure: {}", e)))
    }
}
