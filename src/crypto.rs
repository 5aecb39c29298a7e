// =============================================================================
// At-rest encryption for the persisted session cookie
// =============================================================================
//
// AES-256-GCM keyed by SHA-256(ENCRYPTION_SECRET), mirroring the way
// `upstream/signing.rs` derives a fixed-size key from an arbitrary-length
// secret. Output layout is `nonce || ciphertext`, the common AEAD-at-rest
// shape, so no separate nonce column is needed in the store.
//
// Acquiring the session cookie in the first place (logging in / refreshing
// it against the upstream site) is out of scope here — see DESIGN.md. This
// module only covers decrypting it on read and is the primitive whatever
// process writes `auth:cookies` would call to encrypt it on write.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key};
use sha2::{Digest, Sha256};
use thiserror::Error;

const NONCE_LEN: usize = 12;

fn derive_key(secret: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.finalize().into()
}

#[derive(Debug, Error)]
pub enum CookieCryptoError {
    #[error("ciphertext shorter than the nonce prefix")]
    Truncated,
    #[error("decryption failed (wrong key or corrupted ciphertext)")]
    DecryptFailed,
    #[error("decrypted bytes are not valid utf-8")]
    InvalidUtf8,
}

/// Encrypts `plaintext`, returning `nonce || ciphertext`.
pub fn encrypt_cookie(secret: &str, plaintext: &str) -> Vec<u8> {
    let key = Key::<Aes256Gcm>::from_slice(&derive_key(secret)).to_owned();
    let cipher = Aes256Gcm::new(&key);
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let mut out = nonce.to_vec();
    out.extend(
        cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .expect("AES-256-GCM encryption with a valid 96-bit nonce cannot fail"),
    );
    out
}

/// Decrypts bytes produced by `encrypt_cookie`.
pub fn decrypt_cookie(secret: &str, data: &[u8]) -> Result<String, CookieCryptoError> {
    if data.len() <= NONCE_LEN {
        return Err(CookieCryptoError::Truncated);
    }
    let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
    let key = Key::<Aes256Gcm>::from_slice(&derive_key(secret)).to_owned();
    let cipher = Aes256Gcm::new(&key);
    let nonce = aes_gcm::Nonce::from_slice(nonce_bytes);
    let plaintext = cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| CookieCryptoError::DecryptFailed)?;
    String::from_utf8(plaintext).map_err(|_| CookieCryptoError::InvalidUtf8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_then_decrypt_round_trips() {
        let ciphertext = encrypt_cookie("topsecret", "session=abc123");
        let plaintext = decrypt_cookie("topsecret", &ciphertext).unwrap();
        assert_eq!(plaintext, "session=abc123");
    }

    #[test]
    fn decrypt_rejects_wrong_key() {
        let ciphertext = encrypt_cookie("topsecret", "session=abc123");
        assert!(decrypt_cookie("wrongsecret", &ciphertext).is_err());
    }

    #[test]
    fn decrypt_rejects_truncated_input() {
        assert!(matches!(
            decrypt_cookie("topsecret", b"short"),
            Err(CookieCryptoError::Truncated)
        ));
    }
}
