//! OPC UA TCP (UACP) Message Framing
//!
//! Every message on the socket starts with an 8 byte header:
//!
//! ```text
//! +--------+--------+--------+--------+--------+--------+--------+--------+
//! |      message type (3 ASCII)       | chunk  |   message size (u32 LE)  |
//! +--------+--------+--------+--------+--------+--------+--------+--------+
//! ```
//!
//! The connection protocol messages (Hello, Acknowledge, Error) are single
//! chunk messages whose body directly follows the header. Secure
//! conversation messages (OPN, MSG, CLO) additionally carry a secure channel
//! id and are handled by [`crate::channel`].

pub mod frame;
pub mod limits;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::encoding::{read_string, read_u32, write_string};
use crate::error::{ChannelError, Result};
use crate::status::StatusCode;

pub use frame::FrameAccumulator;
pub use limits::{ChannelParameters, EncodingLimits};

/// Size of the UACP message header
pub const MESSAGE_HEADER_SIZE: usize = 8;

/// Longest endpoint URL accepted in a Hello
pub const MAX_ENDPOINT_URL_LENGTH: usize = 4096;

/// Longest reason accepted in an Error message
pub const MAX_ERROR_REASON_LENGTH: usize = 4096;

/// Message type tag (first three header bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Hello
    Hello,

    /// Acknowledge
    Acknowledge,

    /// Error
    Error,

    /// ReverseHello
    ReverseHello,

    /// OpenSecureChannel
    OpenSecureChannel,

    /// Secure conversation message
    SecureMessage,

    /// CloseSecureChannel
    CloseSecureChannel,
}

impl MessageType {
    pub fn tag(&self) -> &'static [u8; 3] {
        match self {
            Self::Hello => b"HEL",
            Self::Acknowledge => b"ACK",
            Self::Error => b"ERR",
            Self::ReverseHello => b"RHE",
            Self::OpenSecureChannel => b"OPN",
            Self::SecureMessage => b"MSG",
            Self::CloseSecureChannel => b"CLO",
        }
    }

    pub fn from_tag(tag: &[u8]) -> Option<Self> {
        match tag {
            b"HEL" => Some(Self::Hello),
            b"ACK" => Some(Self::Acknowledge),
            b"ERR" => Some(Self::Error),
            b"RHE" => Some(Self::ReverseHello),
            b"OPN" => Some(Self::OpenSecureChannel),
            b"MSG" => Some(Self::SecureMessage),
            b"CLO" => Some(Self::CloseSecureChannel),
            _ => None,
        }
    }

    /// Message carries a secure channel id after the header
    pub fn is_secure(&self) -> bool {
        matches!(
            self,
            Self::OpenSecureChannel | Self::SecureMessage | Self::CloseSecureChannel
        )
    }
}

/// Chunk type character (fourth header byte)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChunkType {
    /// Last (or only) chunk of a message
    Final = b'F',

    /// More chunks follow
    Intermediate = b'C',

    /// Sender abandoned the message
    Abort = b'A',
}

impl ChunkType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            b'F' => Some(Self::Final),
            b'C' => Some(Self::Intermediate),
            b'A' => Some(Self::Abort),
            _ => None,
        }
    }
}

/// UACP message header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub message_type: MessageType,
    pub chunk_type: ChunkType,
    /// Total message size including this header
    pub message_size: u32,
}

impl MessageHeader {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_slice(self.message_type.tag());
        buf.put_u8(self.chunk_type as u8);
        buf.put_u32_le(self.message_size);
    }

    /// Parse a header from the start of `buf` without consuming it
    pub fn peek(buf: &[u8]) -> Result<Self> {
        if buf.len() < MESSAGE_HEADER_SIZE {
            return Err(ChannelError::decoding("message header truncated"));
        }
        let message_type = MessageType::from_tag(&buf[..3]).ok_or_else(|| {
            ChannelError::protocol(
                StatusCode::BAD_TCP_MESSAGE_TYPE_INVALID,
                format!("unknown message type {:?}", String::from_utf8_lossy(&buf[..3])),
            )
        })?;
        let chunk_type = ChunkType::from_u8(buf[3]).ok_or_else(|| {
            ChannelError::protocol(
                StatusCode::BAD_TCP_MESSAGE_TYPE_INVALID,
                format!("unknown chunk type 0x{:02X}", buf[3]),
            )
        })?;
        let message_size = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
        Ok(Self {
            message_type,
            chunk_type,
            message_size,
        })
    }

    pub fn decode(buf: &mut Bytes) -> Result<Self> {
        let header = Self::peek(&buf[..])?;
        buf.advance(MESSAGE_HEADER_SIZE);
        Ok(header)
    }
}

fn finish_message(message_type: MessageType, body: BytesMut) -> Bytes {
    let mut buf = BytesMut::with_capacity(MESSAGE_HEADER_SIZE + body.len());
    MessageHeader {
        message_type,
        chunk_type: ChunkType::Final,
        message_size: (MESSAGE_HEADER_SIZE + body.len()) as u32,
    }
    .encode(&mut buf);
    buf.put_slice(&body);
    buf.freeze()
}

/// Hello message sent by the client to open the connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelloMessage {
    pub protocol_version: u32,
    pub receive_buffer_size: u32,
    pub send_buffer_size: u32,
    pub max_message_size: u32,
    pub max_chunk_count: u32,
    pub endpoint_url: String,
}

impl HelloMessage {
    pub fn encode(&self) -> Result<Bytes> {
        if self.endpoint_url.len() > MAX_ENDPOINT_URL_LENGTH {
            return Err(ChannelError::protocol(
                StatusCode::BAD_TCP_ENDPOINT_URL_INVALID,
                format!("endpoint URL longer than {} bytes", MAX_ENDPOINT_URL_LENGTH),
            ));
        }
        let mut body = BytesMut::with_capacity(24 + self.endpoint_url.len());
        body.put_u32_le(self.protocol_version);
        body.put_u32_le(self.receive_buffer_size);
        body.put_u32_le(self.send_buffer_size);
        body.put_u32_le(self.max_message_size);
        body.put_u32_le(self.max_chunk_count);
        write_string(&mut body, Some(&self.endpoint_url));
        Ok(finish_message(MessageType::Hello, body))
    }

    /// Decode the body following the message header
    pub fn decode(body: &mut Bytes) -> Result<Self> {
        Ok(Self {
            protocol_version: read_u32(body)?,
            receive_buffer_size: read_u32(body)?,
            send_buffer_size: read_u32(body)?,
            max_message_size: read_u32(body)?,
            max_chunk_count: read_u32(body)?,
            endpoint_url: read_string(body)?.unwrap_or_default(),
        })
    }
}

/// Acknowledge message returned by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcknowledgeMessage {
    pub protocol_version: u32,
    pub receive_buffer_size: u32,
    pub send_buffer_size: u32,
    pub max_message_size: u32,
    pub max_chunk_count: u32,
}

impl AcknowledgeMessage {
    pub fn encode(&self) -> Bytes {
        let mut body = BytesMut::with_capacity(20);
        body.put_u32_le(self.protocol_version);
        body.put_u32_le(self.receive_buffer_size);
        body.put_u32_le(self.send_buffer_size);
        body.put_u32_le(self.max_message_size);
        body.put_u32_le(self.max_chunk_count);
        finish_message(MessageType::Acknowledge, body)
    }

    pub fn decode(body: &mut Bytes) -> Result<Self> {
        Ok(Self {
            protocol_version: read_u32(body)?,
            receive_buffer_size: read_u32(body)?,
            send_buffer_size: read_u32(body)?,
            max_message_size: read_u32(body)?,
            max_chunk_count: read_u32(body)?,
        })
    }
}

/// Error message, sent by either side before closing the socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorMessage {
    pub error: StatusCode,
    pub reason: String,
}

impl ErrorMessage {
    pub fn new(error: StatusCode, reason: impl Into<String>) -> Self {
        Self {
            error,
            reason: reason.into(),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut reason = self.reason.as_str();
        if reason.len() > MAX_ERROR_REASON_LENGTH {
            let mut end = MAX_ERROR_REASON_LENGTH;
            while !reason.is_char_boundary(end) {
                end -= 1;
            }
            reason = &reason[..end];
        }
        let mut body = BytesMut::with_capacity(8 + reason.len());
        body.put_u32_le(self.error.0);
        write_string(&mut body, Some(reason));
        finish_message(MessageType::Error, body)
    }

    pub fn decode(body: &mut Bytes) -> Result<Self> {
        Ok(Self {
            error: StatusCode(read_u32(body)?),
            reason: read_string(body)?.unwrap_or_default(),
        })
    }

    /// Error reported to the caller when the peer sends this message
    pub fn into_error(self) -> ChannelError {
        ChannelError::protocol(self.error, self.reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hello_wire_layout() {
        let hello = HelloMessage {
            protocol_version: 0,
            receive_buffer_size: 65535,
            send_buffer_size: 65535,
            max_message_size: 2_097_152,
            max_chunk_count: 64,
            endpoint_url: "opc.tcp://localhost:4840".into(),
        };
        let encoded = hello.encode().unwrap();
        assert_eq!(&encoded[..4], b"HELF");
        assert_eq!(
            u32::from_le_bytes([encoded[4], encoded[5], encoded[6], encoded[7]]) as usize,
            encoded.len()
        );
        assert_eq!(encoded.len(), 8 + 20 + 4 + 24);

        let mut bytes = encoded;
        let header = MessageHeader::decode(&mut bytes).unwrap();
        assert_eq!(header.message_type, MessageType::Hello);
        assert_eq!(HelloMessage::decode(&mut bytes).unwrap(), hello);
    }

    #[test]
    fn test_hello_rejects_long_url() {
        let hello = HelloMessage {
            protocol_version: 0,
            receive_buffer_size: 8192,
            send_buffer_size: 8192,
            max_message_size: 0,
            max_chunk_count: 0,
            endpoint_url: "x".repeat(MAX_ENDPOINT_URL_LENGTH + 1),
        };
        let err = hello.encode().unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BAD_TCP_ENDPOINT_URL_INVALID);
    }

    #[test]
    fn test_error_message() {
        let message = ErrorMessage::new(StatusCode::BAD_TCP_MESSAGE_TOO_LARGE, "too big");
        let mut bytes = message.encode();
        let header = MessageHeader::decode(&mut bytes).unwrap();
        assert_eq!(header.message_type, MessageType::Error);
        let decoded = ErrorMessage::decode(&mut bytes).unwrap();
        assert_eq!(decoded, message);
        assert_eq!(
            decoded.into_error().status_code(),
            StatusCode::BAD_TCP_MESSAGE_TOO_LARGE
        );
    }

    #[test]
    fn test_unknown_message_type() {
        let err = MessageHeader::peek(b"XYZF\x08\x00\x00\x00").unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BAD_TCP_MESSAGE_TYPE_INVALID);
    }
}
