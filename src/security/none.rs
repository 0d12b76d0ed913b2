//! The `None` security policy

use super::{uris, PrivateKey, SecretKeys, SecurityPolicy};
use crate::error::{ChannelError, Result};
use crate::status::StatusCode;

/// Policy without signatures or encryption
#[derive(Debug, Clone, Copy, Default)]
pub struct NonePolicy;

fn unsupported(operation: &str) -> ChannelError {
    ChannelError::security(
        StatusCode::BAD_SECURITY_POLICY_REJECTED,
        format!("{} not available with SecurityPolicy#None", operation),
    )
}

impl SecurityPolicy for NonePolicy {
    fn uri(&self) -> &'static str {
        uris::NONE
    }

    fn is_none(&self) -> bool {
        true
    }

    fn nonce_length(&self) -> usize {
        0
    }

    fn derive_keys(&self, _secret: &[u8], _seed: &[u8]) -> Result<SecretKeys> {
        Ok(SecretKeys::empty())
    }

    fn symmetric_signature_size(&self) -> usize {
        0
    }

    fn symmetric_block_size(&self) -> usize {
        1
    }

    fn symmetric_sign(&self, _keys: &SecretKeys, _data: &[u8]) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }

    fn symmetric_verify(&self, _keys: &SecretKeys, _data: &[u8], _signature: &[u8]) -> Result<()> {
        Ok(())
    }

    fn symmetric_encrypt(&self, _keys: &SecretKeys, _data: &mut [u8]) -> Result<()> {
        Ok(())
    }

    fn symmetric_decrypt(&self, _keys: &SecretKeys, _data: &mut [u8]) -> Result<()> {
        Ok(())
    }

    fn private_key_size(&self, _key: &PrivateKey) -> Result<usize> {
        Ok(0)
    }

    fn public_key_size(&self, _public_key: &[u8]) -> Result<usize> {
        Ok(0)
    }

    fn asymmetric_plain_block_size(&self, _key_size: usize) -> usize {
        1
    }

    fn asymmetric_sign(&self, _key: &PrivateKey, _data: &[u8]) -> Result<Vec<u8>> {
        Err(unsupported("asymmetric signing"))
    }

    fn asymmetric_verify(&self, _public_key: &[u8], _data: &[u8], _signature: &[u8]) -> Result<()> {
        Err(unsupported("asymmetric verification"))
    }

    fn asymmetric_encrypt(&self, _public_key: &[u8], _data: &[u8]) -> Result<Vec<u8>> {
        Err(unsupported("asymmetric encryption"))
    }

    fn asymmetric_decrypt(&self, _key: &PrivateKey, _data: &[u8]) -> Result<Vec<u8>> {
        Err(unsupported("asymmetric decryption"))
    }
}
