//! The `Basic256Sha256` security policy
//!
//! - Asymmetric signature: RSA PKCS#1 v1.5 with SHA-256
//! - Asymmetric encryption: RSA-OAEP with SHA-1
//! - Symmetric signature: HMAC-SHA256 (32 bytes)
//! - Symmetric encryption: AES-256-CBC, no padding (the chunk framer pads)
//! - Key derivation: P_SHA256, 32 byte signing key, 32 byte encryption key, 16 byte IV
//! - RSA keys between 2048 and 4096 bits

use aes::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha1::Sha1;
use sha2::{Digest, Sha256};

use super::keys::derive_with_p_sha256;
use super::{uris, PrivateKey, SecretKeys, SecurityPolicy};
use crate::error::{ChannelError, Result};
use crate::status::StatusCode;

type HmacSha256 = Hmac<Sha256>;
type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const SIGNATURE_KEY_LENGTH: usize = 32;
const ENCRYPTION_KEY_LENGTH: usize = 32;
const ENCRYPTION_BLOCK_SIZE: usize = 16;
const NONCE_LENGTH: usize = 32;
const HMAC_SIZE: usize = 32;

const MIN_KEY_BYTES: usize = 2048 / 8;
const MAX_KEY_BYTES: usize = 4096 / 8;

/// OAEP with SHA-1 spends 2 * 20 + 2 bytes of every block
const OAEP_SHA1_OVERHEAD: usize = 42;

/// Basic256Sha256 policy
#[derive(Debug, Clone, Copy, Default)]
pub struct Basic256Sha256;

fn security_error(reason: impl Into<String>) -> ChannelError {
    ChannelError::security(StatusCode::BAD_SECURITY_CHECKS_FAILED, reason)
}

fn private_key(key: &PrivateKey) -> Result<RsaPrivateKey> {
    RsaPrivateKey::from_pkcs8_der(key.der())
        .map_err(|e| ChannelError::Configuration(format!("invalid RSA private key: {}", e)))
}

fn public_key(spki: &[u8]) -> Result<RsaPublicKey> {
    RsaPublicKey::from_public_key_der(spki).map_err(|e| {
        ChannelError::security(
            StatusCode::BAD_CERTIFICATE_INVALID,
            format!("certificate does not carry an RSA public key: {}", e),
        )
    })
}

fn check_key_size(size: usize) -> Result<usize> {
    if !(MIN_KEY_BYTES..=MAX_KEY_BYTES).contains(&size) {
        return Err(ChannelError::security(
            StatusCode::BAD_SECURITY_POLICY_REJECTED,
            format!("RSA key of {} bits not allowed by Basic256Sha256", size * 8),
        ));
    }
    Ok(size)
}

fn hmac(key: &[u8]) -> Result<HmacSha256> {
    <HmacSha256 as Mac>::new_from_slice(key).map_err(|e| security_error(format!("HMAC key: {}", e)))
}

fn check_block_aligned(data: &[u8]) -> Result<()> {
    if data.len() % ENCRYPTION_BLOCK_SIZE != 0 {
        return Err(security_error(format!(
            "{} bytes not a multiple of the AES block size",
            data.len()
        )));
    }
    Ok(())
}

impl SecurityPolicy for Basic256Sha256 {
    fn uri(&self) -> &'static str {
        uris::BASIC256_SHA256
    }

    fn nonce_length(&self) -> usize {
        NONCE_LENGTH
    }

    fn derive_keys(&self, secret: &[u8], seed: &[u8]) -> Result<SecretKeys> {
        derive_with_p_sha256(
            secret,
            seed,
            SIGNATURE_KEY_LENGTH,
            ENCRYPTION_KEY_LENGTH,
            ENCRYPTION_BLOCK_SIZE,
        )
    }

    fn symmetric_signature_size(&self) -> usize {
        HMAC_SIZE
    }

    fn symmetric_block_size(&self) -> usize {
        ENCRYPTION_BLOCK_SIZE
    }

    fn symmetric_sign(&self, keys: &SecretKeys, data: &[u8]) -> Result<Vec<u8>> {
        let mut mac = hmac(keys.signing_key())?;
        mac.update(data);
        Ok(mac.finalize().into_bytes().to_vec())
    }

    fn symmetric_verify(&self, keys: &SecretKeys, data: &[u8], signature: &[u8]) -> Result<()> {
        let mut mac = hmac(keys.signing_key())?;
        mac.update(data);
        mac.verify_slice(signature)
            .map_err(|_| security_error("symmetric signature verification failed"))
    }

    fn symmetric_encrypt(&self, keys: &SecretKeys, data: &mut [u8]) -> Result<()> {
        check_block_aligned(data)?;
        let len = data.len();
        Aes256CbcEnc::new_from_slices(keys.encryption_key(), keys.iv())
            .map_err(|e| security_error(format!("AES key: {}", e)))?
            .encrypt_padded_mut::<NoPadding>(data, len)
            .map_err(|_| security_error("AES-CBC encryption failed"))?;
        Ok(())
    }

    fn symmetric_decrypt(&self, keys: &SecretKeys, data: &mut [u8]) -> Result<()> {
        check_block_aligned(data)?;
        Aes256CbcDec::new_from_slices(keys.encryption_key(), keys.iv())
            .map_err(|e| security_error(format!("AES key: {}", e)))?
            .decrypt_padded_mut::<NoPadding>(data)
            .map_err(|_| security_error("AES-CBC decryption failed"))?;
        Ok(())
    }

    fn private_key_size(&self, key: &PrivateKey) -> Result<usize> {
        check_key_size(private_key(key)?.size())
    }

    fn public_key_size(&self, spki: &[u8]) -> Result<usize> {
        check_key_size(public_key(spki)?.size())
    }

    fn asymmetric_plain_block_size(&self, key_size: usize) -> usize {
        key_size.saturating_sub(OAEP_SHA1_OVERHEAD)
    }

    fn asymmetric_sign(&self, key: &PrivateKey, data: &[u8]) -> Result<Vec<u8>> {
        let digest = Sha256::digest(data);
        private_key(key)?
            .sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
            .map_err(|e| security_error(format!("RSA signing failed: {}", e)))
    }

    fn asymmetric_verify(&self, spki: &[u8], data: &[u8], signature: &[u8]) -> Result<()> {
        let digest = Sha256::digest(data);
        public_key(spki)?
            .verify(Pkcs1v15Sign::new::<Sha256>(), &digest, signature)
            .map_err(|_| security_error("asymmetric signature verification failed"))
    }

    fn asymmetric_encrypt(&self, spki: &[u8], data: &[u8]) -> Result<Vec<u8>> {
        let key = public_key(spki)?;
        let key_size = check_key_size(key.size())?;
        let plain_block = self.asymmetric_plain_block_size(key_size);
        let mut rng = OsRng;
        let mut out = Vec::with_capacity(data.len() / plain_block * key_size + key_size);
        for block in data.chunks(plain_block) {
            let encrypted = key
                .encrypt(&mut rng, Oaep::new::<Sha1>(), block)
                .map_err(|e| security_error(format!("RSA-OAEP encryption failed: {}", e)))?;
            out.extend_from_slice(&encrypted);
        }
        Ok(out)
    }

    fn asymmetric_decrypt(&self, key: &PrivateKey, data: &[u8]) -> Result<Vec<u8>> {
        let key = private_key(key)?;
        let key_size = check_key_size(key.size())?;
        if data.len() % key_size != 0 {
            return Err(security_error(format!(
                "{} bytes not a multiple of the RSA block size {}",
                data.len(),
                key_size
            )));
        }
        let mut out = Vec::with_capacity(data.len());
        for block in data.chunks(key_size) {
            let decrypted = key
                .decrypt(Oaep::new::<Sha1>(), block)
                .map_err(|_| security_error("RSA-OAEP decryption failed"))?;
            out.extend_from_slice(&decrypted);
        }
        Ok(out)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::OnceLock;

    use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey};

    use super::*;
    use crate::certificate::testing::leaf_params;
    use crate::certificate::Certificate;

    /// One RSA-2048 key pair shared by all tests, as (PKCS#8, SPKI)
    pub(crate) fn test_key_pair() -> &'static (PrivateKey, Vec<u8>) {
        static KEY: OnceLock<(PrivateKey, Vec<u8>)> = OnceLock::new();
        KEY.get_or_init(|| {
            let key = RsaPrivateKey::new(&mut OsRng, 2048).unwrap();
            let pkcs8 = key.to_pkcs8_der().unwrap().as_bytes().to_vec();
            let spki = key.to_public_key().to_public_key_der().unwrap().as_bytes().to_vec();
            (PrivateKey::from_pkcs8_der(pkcs8), spki)
        })
    }

    /// Self-signed certificate over [`test_key_pair`]
    pub(crate) fn test_certificate() -> &'static Certificate {
        static CERT: OnceLock<Certificate> = OnceLock::new();
        CERT.get_or_init(|| {
            let key = rcgen::KeyPair::try_from(test_key_pair().0.der()).unwrap();
            let cert = leaf_params("RSA Test Application").self_signed(&key).unwrap();
            Certificate::from_der(cert.der()).unwrap()
        })
    }

    fn keys() -> SecretKeys {
        Basic256Sha256.derive_keys(&[3; 32], &[4; 32]).unwrap()
    }

    #[test]
    fn test_symmetric_sign_verify() {
        let policy = Basic256Sha256;
        let keys = keys();
        let signature = policy.symmetric_sign(&keys, b"chunk bytes").unwrap();
        assert_eq!(signature.len(), 32);
        assert!(policy.symmetric_verify(&keys, b"chunk bytes", &signature).is_ok());
        assert!(policy.symmetric_verify(&keys, b"chunk bytez", &signature).is_err());
    }

    #[test]
    fn test_symmetric_encrypt_decrypt() {
        let policy = Basic256Sha256;
        let keys = keys();
        let plain: Vec<u8> = (0..64u8).collect();
        let mut data = plain.clone();
        policy.symmetric_encrypt(&keys, &mut data).unwrap();
        assert_ne!(data, plain);
        policy.symmetric_decrypt(&keys, &mut data).unwrap();
        assert_eq!(data, plain);

        let mut unaligned = vec![0u8; 15];
        assert!(policy.symmetric_encrypt(&keys, &mut unaligned).is_err());
    }

    #[test]
    fn test_asymmetric_round_trip() {
        let policy = Basic256Sha256;
        let (private, spki) = test_key_pair();
        assert_eq!(policy.private_key_size(private).unwrap(), 256);
        assert_eq!(policy.asymmetric_plain_block_size(256), 214);

        let data = vec![0x42u8; 214 * 2];
        let encrypted = policy.asymmetric_encrypt(spki, &data).unwrap();
        assert_eq!(encrypted.len(), 512);
        assert_eq!(policy.asymmetric_decrypt(private, &encrypted).unwrap(), data);

        let signature = policy.asymmetric_sign(private, b"open").unwrap();
        assert_eq!(signature.len(), 256);
        assert!(policy.asymmetric_verify(spki, b"open", &signature).is_ok());
        assert!(policy.asymmetric_verify(spki, b"opem", &signature).is_err());
    }
}
