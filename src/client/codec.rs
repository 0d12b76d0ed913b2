//! Boundary between the transport and the service data model

use bytes::{Bytes, BytesMut};

use crate::encoding::NodeId;
use crate::error::Result;

/// Turns application requests into message bodies and response bodies back
/// into application responses
///
/// A body starts with the NodeId of the message's binary encoding, followed
/// by the encoded structure.
pub trait MessageCodec: Send + Sync + 'static {
    type Request: Send + Sync;
    type Response: Send;

    fn encode_request(&self, request: &Self::Request) -> Result<Bytes>;

    fn decode_response(&self, body: Bytes) -> Result<Self::Response>;
}

/// A pre-encoded service message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    /// Binary encoding id of the message
    pub type_id: NodeId,

    /// Encoded structure following the type id
    pub body: Bytes,
}

impl RawMessage {
    pub fn new(type_id: NodeId, body: impl Into<Bytes>) -> Self {
        Self {
            type_id,
            body: body.into(),
        }
    }
}

/// Codec for callers that do their own service encoding
#[derive(Debug, Clone, Copy, Default)]
pub struct RawCodec;

impl MessageCodec for RawCodec {
    type Request = RawMessage;
    type Response = RawMessage;

    fn encode_request(&self, request: &RawMessage) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(8 + request.body.len());
        request.type_id.encode(&mut buf);
        buf.extend_from_slice(&request.body);
        Ok(buf.freeze())
    }

    fn decode_response(&self, mut body: Bytes) -> Result<RawMessage> {
        let type_id = NodeId::decode(&mut body)?;
        Ok(RawMessage { type_id, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_codec_prefixes_type_id() {
        let request = RawMessage::new(NodeId::ns0(631), &b"read"[..]);
        let encoded = RawCodec.encode_request(&request).unwrap();
        // Four byte numeric encoding: 0x01, namespace, u16 id
        assert_eq!(&encoded[..4], &[0x01, 0x00, 0x77, 0x02]);
        assert_eq!(&encoded[4..], b"read");

        let decoded = RawCodec.decode_response(encoded).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_raw_codec_rejects_empty_body() {
        assert!(RawCodec.decode_response(Bytes::new()).is_err());
    }
}
