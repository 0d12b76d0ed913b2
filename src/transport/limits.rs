//! Connection limits and their negotiation

use super::AcknowledgeMessage;
use crate::error::{ChannelError, Result};
use crate::status::StatusCode;

/// Default maximum chunk size (bytes)
pub const DEFAULT_MAX_CHUNK_SIZE: u32 = 65_535;

/// Default maximum message size (2 MiB)
pub const DEFAULT_MAX_MESSAGE_SIZE: u32 = 2 * 1024 * 1024;

/// Smallest buffer size a peer may announce
pub const MIN_BUFFER_SIZE: u32 = 8192;

/// Locally configured encoding limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EncodingLimits {
    /// Largest chunk we send or accept
    pub max_chunk_size: u32,

    /// Largest reassembled message we accept (0 = unlimited)
    pub max_message_size: u32,

    /// Largest chunk count per message we accept (0 = unlimited)
    pub max_chunk_count: u32,
}

impl EncodingLimits {
    pub fn new(max_chunk_size: u32, max_message_size: u32) -> Self {
        Self {
            max_chunk_size,
            max_message_size,
            max_chunk_count: default_max_chunk_count(max_message_size, max_chunk_size),
        }
    }
}

impl Default for EncodingLimits {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CHUNK_SIZE, DEFAULT_MAX_MESSAGE_SIZE)
    }
}

/// Twice the number of full chunks a maximum size message needs
pub fn default_max_chunk_count(max_message_size: u32, max_chunk_size: u32) -> u32 {
    if max_chunk_size == 0 {
        return 0;
    }
    (max_message_size / max_chunk_size).saturating_mul(2)
}

/// Parameters negotiated with the server during Hello / Acknowledge
///
/// `local_*` values bound what we send and accept on our side, `remote_*`
/// values are what the server declared. Fixed for one TCP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelParameters {
    pub local_max_message_size: u32,
    pub local_receive_buffer_size: u32,
    pub local_send_buffer_size: u32,
    pub local_max_chunk_count: u32,
    pub remote_max_message_size: u32,
    pub remote_receive_buffer_size: u32,
    pub remote_send_buffer_size: u32,
    pub remote_max_chunk_count: u32,
}

impl ChannelParameters {
    /// Derive parameters from our limits and the server's Acknowledge
    pub fn negotiate(limits: &EncodingLimits, ack: &AcknowledgeMessage) -> Result<Self> {
        if ack.receive_buffer_size < MIN_BUFFER_SIZE || ack.send_buffer_size < MIN_BUFFER_SIZE {
            return Err(ChannelError::protocol(
                StatusCode::BAD_CONNECTION_REJECTED,
                format!(
                    "server buffer sizes {}/{} below minimum {}",
                    ack.receive_buffer_size, ack.send_buffer_size, MIN_BUFFER_SIZE
                ),
            ));
        }

        Ok(Self {
            local_max_message_size: limits.max_message_size,
            local_receive_buffer_size: ack.send_buffer_size.min(limits.max_chunk_size),
            local_send_buffer_size: ack.receive_buffer_size.min(limits.max_chunk_size),
            local_max_chunk_count: limits.max_chunk_count,
            remote_max_message_size: ack.max_message_size,
            remote_receive_buffer_size: ack.receive_buffer_size,
            remote_send_buffer_size: ack.send_buffer_size,
            remote_max_chunk_count: ack.max_chunk_count,
        })
    }

    /// Parameters that allow the given chunk size in both directions and no other limit
    pub fn symmetric(chunk_size: u32, limits: &EncodingLimits) -> Self {
        Self {
            local_max_message_size: limits.max_message_size,
            local_receive_buffer_size: chunk_size,
            local_send_buffer_size: chunk_size,
            local_max_chunk_count: limits.max_chunk_count,
            remote_max_message_size: limits.max_message_size,
            remote_receive_buffer_size: chunk_size,
            remote_send_buffer_size: chunk_size,
            remote_max_chunk_count: limits.max_chunk_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits() {
        let limits = EncodingLimits::default();
        assert_eq!(limits.max_chunk_size, 65_535);
        assert_eq!(limits.max_message_size, 2_097_152);
        assert_eq!(limits.max_chunk_count, (2_097_152 / 65_535) * 2);
    }

    #[test]
    fn test_negotiate_takes_minimum() {
        let limits = EncodingLimits::default();
        let ack = AcknowledgeMessage {
            protocol_version: 0,
            receive_buffer_size: 16_384,
            send_buffer_size: 1_048_576,
            max_message_size: 4_194_304,
            max_chunk_count: 0,
        };
        let params = ChannelParameters::negotiate(&limits, &ack).unwrap();
        assert_eq!(params.local_receive_buffer_size, 65_535);
        assert_eq!(params.local_send_buffer_size, 16_384);
        assert_eq!(params.local_max_message_size, limits.max_message_size);
        assert_eq!(params.local_max_chunk_count, limits.max_chunk_count);
        assert_eq!(params.remote_max_message_size, 4_194_304);
        assert_eq!(params.remote_max_chunk_count, 0);
    }

    #[test]
    fn test_negotiate_rejects_tiny_buffers() {
        let ack = AcknowledgeMessage {
            protocol_version: 0,
            receive_buffer_size: 1024,
            send_buffer_size: 8192,
            max_message_size: 0,
            max_chunk_count: 0,
        };
        let err = ChannelParameters::negotiate(&EncodingLimits::default(), &ack).unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BAD_CONNECTION_REJECTED);
    }
}
