//! Symmetric key material and the P_SHA256 derivation function

use std::fmt;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::Zeroize;

use crate::error::{ChannelError, Result};
use crate::status::StatusCode;

type HmacSha256 = Hmac<Sha256>;

/// Signing key, encryption key and IV for one direction of a channel
#[derive(Clone, PartialEq, Eq)]
pub struct SecretKeys {
    signing_key: Vec<u8>,
    encryption_key: Vec<u8>,
    iv: Vec<u8>,
}

impl SecretKeys {
    pub fn new(signing_key: Vec<u8>, encryption_key: Vec<u8>, iv: Vec<u8>) -> Self {
        Self {
            signing_key,
            encryption_key,
            iv,
        }
    }

    /// Keys used by policies without cryptography
    pub fn empty() -> Self {
        Self::new(Vec::new(), Vec::new(), Vec::new())
    }

    pub fn signing_key(&self) -> &[u8] {
        &self.signing_key
    }

    pub fn encryption_key(&self) -> &[u8] {
        &self.encryption_key
    }

    pub fn iv(&self) -> &[u8] {
        &self.iv
    }
}

impl Drop for SecretKeys {
    fn drop(&mut self) {
        self.signing_key.zeroize();
        self.encryption_key.zeroize();
        self.iv.zeroize();
    }
}

impl fmt::Debug for SecretKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretKeys")
            .field("signing_key_len", &self.signing_key.len())
            .field("encryption_key_len", &self.encryption_key.len())
            .field("iv_len", &self.iv.len())
            .finish()
    }
}

/// Keys for both directions of a channel
///
/// `local` protects what we send, `remote` verifies what we receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySet {
    pub local: SecretKeys,
    pub remote: SecretKeys,
}

/// P_SHA256 pseudo random function (RFC 5246 section 5)
pub fn p_sha256(secret: &[u8], seed: &[u8], length: usize) -> Result<Vec<u8>> {
    let hmac = |parts: &[&[u8]]| -> Result<Vec<u8>> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(secret).map_err(|e| {
            ChannelError::security(StatusCode::BAD_INTERNAL_ERROR, format!("HMAC key: {}", e))
        })?;
        for part in parts {
            mac.update(part);
        }
        Ok(mac.finalize().into_bytes().to_vec())
    };

    let mut output = Vec::with_capacity(length + 32);
    let mut a = hmac(&[seed])?;
    while output.len() < length {
        output.extend_from_slice(&hmac(&[&a, seed])?);
        a = hmac(&[&a])?;
    }
    output.truncate(length);
    Ok(output)
}

/// Split derived bytes into signing key, encryption key and IV
pub fn derive_with_p_sha256(
    secret: &[u8],
    seed: &[u8],
    signing_key_len: usize,
    encryption_key_len: usize,
    iv_len: usize,
) -> Result<SecretKeys> {
    let mut bytes = p_sha256(secret, seed, signing_key_len + encryption_key_len + iv_len)?;
    let iv = bytes.split_off(signing_key_len + encryption_key_len);
    let encryption_key = bytes.split_off(signing_key_len);
    Ok(SecretKeys::new(bytes, encryption_key, iv))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_p_sha256_prefix_stable() {
        let short = p_sha256(b"secret", b"seed", 20).unwrap();
        let long = p_sha256(b"secret", b"seed", 80).unwrap();
        assert_eq!(short.len(), 20);
        assert_eq!(long.len(), 80);
        assert_eq!(&long[..20], &short[..]);
        assert_ne!(p_sha256(b"other", b"seed", 20).unwrap(), short);
    }

    #[test]
    fn test_split_lengths() {
        let keys = derive_with_p_sha256(&[1; 32], &[2; 32], 32, 32, 16).unwrap();
        assert_eq!(keys.signing_key().len(), 32);
        assert_eq!(keys.encryption_key().len(), 32);
        assert_eq!(keys.iv().len(), 16);
        assert_ne!(keys.signing_key(), keys.encryption_key());
    }
}
