//! Security and sequence headers of secure conversation chunks
//!
//! ```text
//! +----------------+-------------------+-------------------+-----------------+
//! | message header | secure channel id | security header   | sequence header |
//! |    8 bytes     |      4 bytes      | asym. / 4 bytes   |     8 bytes     |
//! +----------------+-------------------+-------------------+-----------------+
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use crate::encoding::{
    byte_string_len, read_byte_string, read_string, read_u32, write_byte_string, write_string,
};
use crate::error::{ChannelError, Result};
use crate::status::StatusCode;

/// Message header plus secure channel id
pub const SECURE_MESSAGE_HEADER_SIZE: usize = 12;

/// Token id
pub const SYMMETRIC_SECURITY_HEADER_SIZE: usize = 4;

/// Sequence number plus request id
pub const SEQUENCE_HEADER_SIZE: usize = 8;

/// Security header of OpenSecureChannel chunks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsymmetricSecurityHeader {
    pub security_policy_uri: String,

    /// DER encoded sender certificate chain, leaf first
    pub sender_certificate: Option<Bytes>,

    /// SHA-1 thumbprint of the receiver's certificate
    pub receiver_thumbprint: Option<Bytes>,
}

impl AsymmetricSecurityHeader {
    pub fn new(
        security_policy_uri: impl Into<String>,
        sender_certificate: Option<Bytes>,
        receiver_thumbprint: Option<Bytes>,
    ) -> Self {
        Self {
            security_policy_uri: security_policy_uri.into(),
            sender_certificate,
            receiver_thumbprint,
        }
    }

    pub fn encoded_len(&self) -> usize {
        4 + self.security_policy_uri.len()
            + byte_string_len(self.sender_certificate.as_deref())
            + byte_string_len(self.receiver_thumbprint.as_deref())
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        write_string(buf, Some(&self.security_policy_uri));
        write_byte_string(buf, self.sender_certificate.as_deref());
        write_byte_string(buf, self.receiver_thumbprint.as_deref());
    }

    pub fn decode(buf: &mut Bytes) -> Result<Self> {
        let security_policy_uri = read_string(buf)?.ok_or_else(|| {
            ChannelError::protocol(
                StatusCode::BAD_SECURITY_POLICY_REJECTED,
                "security policy URI missing",
            )
        })?;
        Ok(Self {
            security_policy_uri,
            sender_certificate: read_byte_string(buf)?,
            receiver_thumbprint: read_byte_string(buf)?,
        })
    }
}

/// Security header of MSG and CLO chunks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymmetricSecurityHeader {
    pub token_id: u32,
}

impl SymmetricSecurityHeader {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.token_id);
    }

    pub fn decode(buf: &mut Bytes) -> Result<Self> {
        Ok(Self {
            token_id: read_u32(buf)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceHeader {
    pub sequence_number: u32,
    pub request_id: u32,
}

impl SequenceHeader {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.sequence_number);
        buf.put_u32_le(self.request_id);
    }

    pub fn decode(buf: &mut Bytes) -> Result<Self> {
        Ok(Self {
            sequence_number: read_u32(buf)?,
            request_id: read_u32(buf)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_asymmetric_header_length() {
        let header = AsymmetricSecurityHeader::new(
            crate::security::uris::BASIC256_SHA256,
            Some(Bytes::from_static(&[1; 100])),
            Some(Bytes::from_static(&[2; 20])),
        );
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(buf.len(), header.encoded_len());
        assert_eq!(buf.len(), 12 + header.security_policy_uri.len() + 100 + 20);

        let decoded = AsymmetricSecurityHeader::decode(&mut buf.freeze()).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_none_header_has_null_certificates() {
        let header = AsymmetricSecurityHeader::new(crate::security::uris::NONE, None, None);
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(&buf[buf.len() - 8..], &[0xFF; 8]);
        assert_eq!(buf.len(), header.encoded_len());
    }

    #[test]
    fn test_missing_policy_uri() {
        let mut buf = BytesMut::new();
        write_string(&mut buf, None);
        let err = AsymmetricSecurityHeader::decode(&mut buf.freeze()).unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BAD_SECURITY_POLICY_REJECTED);
    }
}
