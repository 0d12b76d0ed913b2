//! Secure Conversation channel
//!
//! - [`secure_channel`]: channel identity, security configuration and the
//!   installed security tokens with their grace window
//! - [`headers`]: security and sequence headers
//! - [`chunk`]: the Chunk Framer turning message bodies into protected
//!   chunks and back

pub mod chunk;
pub mod headers;
pub mod secure_channel;

pub use chunk::{
    abort_body, ChunkDecoder, ChunkEncoder, DecodeOutcome, DecodedMessage, MAX_SEQUENCE_NUMBER,
};
pub use headers::{AsymmetricSecurityHeader, SequenceHeader, SymmetricSecurityHeader};
pub use secure_channel::{ChannelSecurity, SecureChannel};
