//! Credential vault for the encrypted usernames and passwords stored in the config file.
//!
//! Credentials are AES in full-block CFB mode, keyed and seeded by the shared
//! `encryption.secret` / `encryption.iv` pair, and stored base64 encoded. The key
//! length picks the AES variant (16, 24 or 32 bytes).

use aes::cipher::{AsyncStreamCipher, KeyIvInit};
use aes::{Aes128, Aes192, Aes256};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use thiserror::Error;

use crate::config::EncryptionConfig;

const IV_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("Invalid key length {0}: expected 16, 24 or 32 bytes")]
    InvalidKeyLength(usize),

    #[error("Invalid iv length {0}: expected 16 bytes")]
    InvalidIvLength(usize),

    #[error("Ciphertext is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Decrypted credential is not valid UTF-8")]
    NotUtf8,
}

macro_rules! cfb_apply {
    ($mode:ident, $method:ident, $key:expr, $iv:expr, $buf:expr) => {
        match $key.len() {
            16 => cfb_mode::$mode::<Aes128>::new_from_slices($key, $iv)
                .map(|c| c.$method($buf))
                .map_err(|_| VaultError::InvalidKeyLength($key.len())),
            24 => cfb_mode::$mode::<Aes192>::new_from_slices($key, $iv)
                .map(|c| c.$method($buf))
                .map_err(|_| VaultError::InvalidKeyLength($key.len())),
            32 => cfb_mode::$mode::<Aes256>::new_from_slices($key, $iv)
                .map(|c| c.$method($buf))
                .map_err(|_| VaultError::InvalidKeyLength($key.len())),
            n => Err(VaultError::InvalidKeyLength(n)),
        }
    };
}

fn check_iv(iv: &[u8]) -> Result<(), VaultError> {
    if iv.len() != IV_LEN {
        return Err(VaultError::InvalidIvLength(iv.len()));
    }
    Ok(())
}

/// Encrypt `plaintext` and return it base64 encoded.
pub fn encrypt(plaintext: &str, key: &str, iv: &str) -> Result<String, VaultError> {
    check_iv(iv.as_bytes())?;
    let mut buf = plaintext.as_bytes().to_vec();
    cfb_apply!(Encryptor, encrypt, key.as_bytes(), iv.as_bytes(), &mut buf)?;
    Ok(BASE64.encode(buf))
}

/// Decrypt a base64 ciphertext produced by [`encrypt`].
pub fn decrypt(ciphertext: &str, key: &str, iv: &str) -> Result<String, VaultError> {
    check_iv(iv.as_bytes())?;
    let mut buf = BASE64.decode(ciphertext.trim())?;
    cfb_apply!(Decryptor, decrypt, key.as_bytes(), iv.as_bytes(), &mut buf)?;
    String::from_utf8(buf).map_err(|_| VaultError::NotUtf8)
}

/// Key material bound once at startup and handed to whoever needs credentials.
#[derive(Clone)]
pub struct Vault {
    key: String,
    iv: String,
}

impl Vault {
    pub fn new(config: &EncryptionConfig) -> Self {
        log::debug!(
            "Credential vault initialised: key_len={}, iv_len={}",
            config.secret.len(),
            config.iv.len()
        );
        Self {
            key: config.secret.clone(),
            iv: config.iv.clone(),
        }
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, VaultError> {
        encrypt(plaintext, &self.key, &self.iv)
    }

    pub fn decrypt(&self, ciphertext: &str) -> Result<String, VaultError> {
        decrypt(ciphertext, &self.key, &self.iv)
    }
}

impl std::fmt::Debug for Vault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vault")
            .field("key_len", &self.key.len())
            .field("iv_len", &self.iv.len())
            .finish()
    }
}
