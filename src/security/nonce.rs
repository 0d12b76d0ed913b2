//! Nonce generation and validation

use bytes::Bytes;
use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::{ChannelError, Result};
use crate::status::StatusCode;

/// Generate a random nonce of `length` bytes
pub fn generate_nonce(length: usize) -> Bytes {
    let mut nonce = vec![0u8; length];
    OsRng.fill_bytes(&mut nonce);
    Bytes::from(nonce)
}

/// Check that a peer nonce is long enough and not trivially predictable
pub fn validate_nonce(nonce: Option<&[u8]>, required_length: usize) -> Result<()> {
    let nonce = nonce.unwrap_or_default();
    if nonce.len() < required_length {
        return Err(ChannelError::security(
            StatusCode::BAD_NONCE_INVALID,
            format!(
                "nonce length {} shorter than required {}",
                nonce.len(),
                required_length
            ),
        ));
    }
    if required_length > 0 && nonce.iter().all(|b| *b == nonce[0]) {
        return Err(ChannelError::security(
            StatusCode::BAD_NONCE_INVALID,
            "nonce has no entropy",
        ));
    }
    Ok(())
}
