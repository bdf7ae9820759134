// AES-256-GCM field cipher. Key = SHA-256(master key); field = base64(nonce || ciphertext || tag).

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use sha2::{Digest, Sha256};

use crate::error::VaultError;

const NONCE_LEN: usize = 12;

#[derive(Clone)]
pub struct FieldCipher {
    cipher: Aes256Gcm,
}

impl FieldCipher {
    pub fn from_master_key(master_key: &str) -> Result<Self, VaultError> {
        if master_key.is_empty() {
            return Err(VaultError::CryptoInit("master key is empty".into()));
        }
        let digest = Sha256::digest(master_key.as_bytes());
        let cipher = Aes256Gcm::new_from_slice(&digest)
            .map_err(|e| VaultError::CryptoInit(format!("key setup: {}", e)))?;
        Ok(Self { cipher })
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String, VaultError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| VaultError::Encrypt(e.to_string()))?;
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(out))
    }

    /// `None` on bad base64, short input or authentication failure.
    pub fn decrypt(&self, field: &str) -> Option<Vec<u8>> {
        let raw = STANDARD.decode(field.trim()).ok()?;
        if raw.len() <= NONCE_LEN {
            return None;
        }
        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .ok()
    }

    pub fn decrypt_string(&self, field: &str) -> Option<String> {
        String::from_utf8(self.decrypt(field)?).ok()
    }
}

impl std::fmt::Debug for FieldCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FieldCipher(<key>)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_with_same_key() {
        let c = FieldCipher::from_master_key("hunter2").unwrap();
        let field = c.encrypt(b"root").unwrap();
        assert_ne!(field, "root");
        assert_eq!(c.decrypt_string(&field).as_deref(), Some("root"));
    }

    #[test]
    fn fresh_nonce_per_field() {
        let c = FieldCipher::from_master_key("hunter2").unwrap();
        assert_ne!(c.encrypt(b"same").unwrap(), c.encrypt(b"same").unwrap());
    }

    #[test]
    fn wrong_key_does_not_decrypt() {
        let a = FieldCipher::from_master_key("one").unwrap();
        let b = FieldCipher::from_master_key("two").unwrap();
        let field = a.encrypt(b"secret").unwrap();
        assert!(b.decrypt(&field).is_none());
        assert!(a.decrypt("not base64 !!").is_none());
        assert!(a.decrypt("AAAA").is_none());
    }

    #[test]
    fn empty_master_key_rejected() {
        assert!(matches!(
            FieldCipher::from_master_key(""),
            Err(VaultError::CryptoInit(_))
        ));
    }
}
