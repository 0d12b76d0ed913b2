//! OPC UA Secure Conversation client transport
//!
//! This crate implements the client side of the OPC UA TCP transport and the
//! UA Secure Conversation (UASC) layer that runs on top of it:
//!
//! - **Handshake**: Hello / Acknowledge negotiation of buffer and message limits
//! - **Secure channel lifecycle**: OpenSecureChannel issue and renew, CloseSecureChannel
//! - **Chunk framing**: asymmetric and symmetric chunks with signing, encryption and padding
//! - **Correlation**: request ids mapped back to the awaiting caller
//! - **Certificate trust validation**: path building, usage and revocation checks
//!
//! # Layering
//!
//! ```text
//! +-----------------------------------------------+
//! |  client::UascClient  (connect / send / close) |
//! +-----------------------------------------------+
//! |  client::handshake   |  client::dispatcher    |
//! +-----------------------------------------------+
//! |  channel::chunk  (ChunkEncoder / ChunkDecoder)|
//! +-----------------------------------------------+
//! |  security (policies) |  certificate (trust)   |
//! +-----------------------------------------------+
//! |  transport (HEL/ACK/ERR framing, limits)      |
//! +-----------------------------------------------+
//! ```
//!
//! The higher-level service data model is not part of this crate. Requests
//! and responses cross the client boundary through the
//! [`client::MessageCodec`] trait; [`client::RawCodec`] passes pre-encoded
//! bodies through untouched.

pub mod certificate;
pub mod channel;
pub mod encoding;
pub mod error;
pub mod security;
pub mod status;
pub mod transport;

#[cfg(feature = "async")]
pub mod client;

pub use error::{ChannelError, Result};
pub use status::StatusCode;

#[cfg(feature = "async")]
pub use client::{UascClient, UascClientConfig};

/// UA TCP protocol version spoken by this implementation
pub const PROTOCOL_VERSION: u32 = 0;
