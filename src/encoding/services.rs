//! Binary encoding of the secure channel services
//!
//! OpenSecureChannel, CloseSecureChannel and ServiceFault are the only
//! service messages the transport itself produces or interprets. Every
//! message body starts with the NodeId of its binary encoding.

use bytes::{BufMut, Bytes, BytesMut};

use super::{
    read_byte_string, read_i32, read_i64, read_string, read_u32, read_u8, skip_extension_object,
    write_byte_string, write_empty_extension_object, write_string, NodeId,
};
use crate::error::{ChannelError, Result};
use crate::security::MessageSecurityMode;
use crate::status::StatusCode;

/// Binary encoding ids (namespace 0)
pub mod type_ids {
    pub const SERVICE_FAULT: u32 = 397;
    pub const OPEN_SECURE_CHANNEL_REQUEST: u32 = 446;
    pub const OPEN_SECURE_CHANNEL_RESPONSE: u32 = 449;
    pub const CLOSE_SECURE_CHANNEL_REQUEST: u32 = 452;
}

/// Nesting limit for inner DiagnosticInfo structures
const MAX_DIAGNOSTIC_DEPTH: usize = 32;

/// Whether an OpenSecureChannel creates a new token or renews one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SecurityTokenRequestType {
    Issue = 0,
    Renew = 1,
}

impl SecurityTokenRequestType {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Issue),
            1 => Some(Self::Renew),
            _ => None,
        }
    }
}

/// Common request header
#[derive(Debug, Clone, PartialEq)]
pub struct RequestHeader {
    pub authentication_token: NodeId,
    /// DateTime ticks
    pub timestamp: i64,
    pub request_handle: u32,
    pub return_diagnostics: u32,
    pub audit_entry_id: Option<String>,
    /// Milliseconds, 0 for no hint
    pub timeout_hint: u32,
}

impl RequestHeader {
    pub fn new(request_handle: u32, timestamp: i64, timeout_hint: u32) -> Self {
        Self {
            authentication_token: NodeId::NULL,
            timestamp,
            request_handle,
            return_diagnostics: 0,
            audit_entry_id: None,
            timeout_hint,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        self.authentication_token.encode(buf);
        buf.put_i64_le(self.timestamp);
        buf.put_u32_le(self.request_handle);
        buf.put_u32_le(self.return_diagnostics);
        write_string(buf, self.audit_entry_id.as_deref());
        buf.put_u32_le(self.timeout_hint);
        write_empty_extension_object(buf);
    }

    pub fn decode(buf: &mut Bytes) -> Result<Self> {
        let authentication_token = NodeId::decode(buf)?;
        let timestamp = read_i64(buf)?;
        let request_handle = read_u32(buf)?;
        let return_diagnostics = read_u32(buf)?;
        let audit_entry_id = read_string(buf)?;
        let timeout_hint = read_u32(buf)?;
        skip_extension_object(buf)?;
        Ok(Self {
            authentication_token,
            timestamp,
            request_handle,
            return_diagnostics,
            audit_entry_id,
            timeout_hint,
        })
    }
}

/// Diagnostic information attached to a response
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiagnosticInfo {
    pub symbolic_id: Option<i32>,
    pub namespace_uri: Option<i32>,
    pub localized_text: Option<i32>,
    pub locale: Option<i32>,
    pub additional_info: Option<String>,
    pub inner_status_code: Option<StatusCode>,
    pub inner_diagnostic_info: Option<Box<DiagnosticInfo>>,
}

impl DiagnosticInfo {
    pub fn decode(buf: &mut Bytes) -> Result<Self> {
        Self::decode_nested(buf, 0)
    }

    fn decode_nested(buf: &mut Bytes, depth: usize) -> Result<Self> {
        if depth > MAX_DIAGNOSTIC_DEPTH {
            return Err(ChannelError::EncodingLimitsExceeded(
                "DiagnosticInfo nested too deeply".into(),
            ));
        }
        let mask = read_u8(buf)?;
        let mut info = DiagnosticInfo::default();
        if mask & 0x01 != 0 {
            info.symbolic_id = Some(read_i32(buf)?);
        }
        if mask & 0x02 != 0 {
            info.namespace_uri = Some(read_i32(buf)?);
        }
        if mask & 0x04 != 0 {
            info.localized_text = Some(read_i32(buf)?);
        }
        if mask & 0x08 != 0 {
            info.locale = Some(read_i32(buf)?);
        }
        if mask & 0x10 != 0 {
            info.additional_info = read_string(buf)?;
        }
        if mask & 0x20 != 0 {
            info.inner_status_code = Some(StatusCode(read_u32(buf)?));
        }
        if mask & 0x40 != 0 {
            info.inner_diagnostic_info = Some(Box::new(Self::decode_nested(buf, depth + 1)?));
        }
        Ok(info)
    }
}

/// Common response header
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseHeader {
    pub timestamp: i64,
    pub request_handle: u32,
    pub service_result: StatusCode,
    pub service_diagnostics: Option<DiagnosticInfo>,
    pub string_table: Vec<Option<String>>,
}

impl ResponseHeader {
    pub fn new(request_handle: u32, timestamp: i64, service_result: StatusCode) -> Self {
        Self {
            timestamp,
            request_handle,
            service_result,
            service_diagnostics: None,
            string_table: Vec::new(),
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_i64_le(self.timestamp);
        buf.put_u32_le(self.request_handle);
        buf.put_u32_le(self.service_result.0);
        // Diagnostics are never produced locally
        buf.put_u8(0x00);
        if self.string_table.is_empty() {
            buf.put_i32_le(-1);
        } else {
            buf.put_i32_le(self.string_table.len() as i32);
            for s in &self.string_table {
                write_string(buf, s.as_deref());
            }
        }
        write_empty_extension_object(buf);
    }

    pub fn decode(buf: &mut Bytes) -> Result<Self> {
        let timestamp = read_i64(buf)?;
        let request_handle = read_u32(buf)?;
        let service_result = StatusCode(read_u32(buf)?);
        let diagnostics = DiagnosticInfo::decode(buf)?;
        let service_diagnostics = if diagnostics == DiagnosticInfo::default() {
            None
        } else {
            Some(diagnostics)
        };
        let count = read_i32(buf)?;
        let mut string_table = Vec::new();
        if count > 0 {
            // Each entry takes at least its 4-byte length prefix
            if count as usize > buf.len() / 4 {
                return Err(ChannelError::decoding(format!(
                    "string table length {} exceeds message",
                    count
                )));
            }
            for _ in 0..count {
                string_table.push(read_string(buf)?);
            }
        }
        skip_extension_object(buf)?;
        Ok(Self {
            timestamp,
            request_handle,
            service_result,
            service_diagnostics,
            string_table,
        })
    }

    /// Human readable text assembled from the diagnostics and string table
    pub fn diagnostic_text(&self) -> Option<String> {
        let info = self.service_diagnostics.as_ref()?;
        let lookup = |index: Option<i32>| -> Option<String> {
            let index = usize::try_from(index?).ok()?;
            self.string_table.get(index).cloned().flatten()
        };
        let parts: Vec<String> = [
            lookup(info.symbolic_id),
            lookup(info.localized_text),
            info.additional_info.clone(),
        ]
        .into_iter()
        .flatten()
        .filter(|s| !s.is_empty())
        .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("; "))
        }
    }
}

/// Token granted by the server for one secure channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelSecurityToken {
    pub channel_id: u32,
    pub token_id: u32,
    /// DateTime ticks
    pub created_at: i64,
    /// Milliseconds
    pub revised_lifetime: u32,
}

/// OpenSecureChannel request body
#[derive(Debug, Clone, PartialEq)]
pub struct OpenSecureChannelRequest {
    pub request_header: RequestHeader,
    pub client_protocol_version: u32,
    pub request_type: SecurityTokenRequestType,
    pub security_mode: MessageSecurityMode,
    pub client_nonce: Option<Bytes>,
    pub requested_lifetime: u32,
}

impl OpenSecureChannelRequest {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(128);
        NodeId::ns0(type_ids::OPEN_SECURE_CHANNEL_REQUEST).encode(&mut buf);
        self.request_header.encode(&mut buf);
        buf.put_u32_le(self.client_protocol_version);
        buf.put_u32_le(self.request_type as u32);
        buf.put_u32_le(self.security_mode as u32);
        write_byte_string(&mut buf, self.client_nonce.as_deref());
        buf.put_u32_le(self.requested_lifetime);
        buf.freeze()
    }

    pub fn decode(mut body: Bytes) -> Result<Self> {
        expect_type_id(&mut body, type_ids::OPEN_SECURE_CHANNEL_REQUEST)?;
        let request_header = RequestHeader::decode(&mut body)?;
        let client_protocol_version = read_u32(&mut body)?;
        let raw_type = read_u32(&mut body)?;
        let request_type = SecurityTokenRequestType::from_u32(raw_type).ok_or_else(|| {
            ChannelError::protocol(
                StatusCode::BAD_REQUEST_TYPE_INVALID,
                format!("unknown request type {}", raw_type),
            )
        })?;
        let raw_mode = read_u32(&mut body)?;
        let security_mode = MessageSecurityMode::from_u32(raw_mode).ok_or_else(|| {
            ChannelError::protocol(
                StatusCode::BAD_SECURITY_POLICY_REJECTED,
                format!("unknown security mode {}", raw_mode),
            )
        })?;
        let client_nonce = read_byte_string(&mut body)?;
        let requested_lifetime = read_u32(&mut body)?;
        Ok(Self {
            request_header,
            client_protocol_version,
            request_type,
            security_mode,
            client_nonce,
            requested_lifetime,
        })
    }
}

/// OpenSecureChannel response body
#[derive(Debug, Clone, PartialEq)]
pub struct OpenSecureChannelResponse {
    pub response_header: ResponseHeader,
    pub server_protocol_version: u32,
    pub security_token: ChannelSecurityToken,
    pub server_nonce: Option<Bytes>,
}

impl OpenSecureChannelResponse {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(128);
        NodeId::ns0(type_ids::OPEN_SECURE_CHANNEL_RESPONSE).encode(&mut buf);
        self.response_header.encode(&mut buf);
        buf.put_u32_le(self.server_protocol_version);
        buf.put_u32_le(self.security_token.channel_id);
        buf.put_u32_le(self.security_token.token_id);
        buf.put_i64_le(self.security_token.created_at);
        buf.put_u32_le(self.security_token.revised_lifetime);
        write_byte_string(&mut buf, self.server_nonce.as_deref());
        buf.freeze()
    }

    /// Decode a response body, turning a ServiceFault into an error
    pub fn decode(mut body: Bytes) -> Result<Self> {
        if let Some(fault) = ServiceFault::from_message(&body)? {
            return Err(fault.into_error());
        }
        expect_type_id(&mut body, type_ids::OPEN_SECURE_CHANNEL_RESPONSE)?;
        let response_header = ResponseHeader::decode(&mut body)?;
        let server_protocol_version = read_u32(&mut body)?;
        let security_token = ChannelSecurityToken {
            channel_id: read_u32(&mut body)?,
            token_id: read_u32(&mut body)?,
            created_at: read_i64(&mut body)?,
            revised_lifetime: read_u32(&mut body)?,
        };
        let server_nonce = read_byte_string(&mut body)?;
        Ok(Self {
            response_header,
            server_protocol_version,
            security_token,
            server_nonce,
        })
    }
}

/// CloseSecureChannel request body
#[derive(Debug, Clone, PartialEq)]
pub struct CloseSecureChannelRequest {
    pub request_header: RequestHeader,
}

impl CloseSecureChannelRequest {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        NodeId::ns0(type_ids::CLOSE_SECURE_CHANNEL_REQUEST).encode(&mut buf);
        self.request_header.encode(&mut buf);
        buf.freeze()
    }

    pub fn decode(mut body: Bytes) -> Result<Self> {
        expect_type_id(&mut body, type_ids::CLOSE_SECURE_CHANNEL_REQUEST)?;
        Ok(Self {
            request_header: RequestHeader::decode(&mut body)?,
        })
    }
}

/// ServiceFault body
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceFault {
    pub response_header: ResponseHeader,
}

impl ServiceFault {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        NodeId::ns0(type_ids::SERVICE_FAULT).encode(&mut buf);
        self.response_header.encode(&mut buf);
        buf.freeze()
    }

    /// Decode a message body if its type id says it is a ServiceFault
    pub fn from_message(body: &Bytes) -> Result<Option<Self>> {
        let mut peek = body.clone();
        let type_id = match NodeId::decode(&mut peek) {
            Ok(id) => id,
            // Not our concern, the caller's codec reports malformed bodies
            Err(_) => return Ok(None),
        };
        if type_id.as_ns0_numeric() != Some(type_ids::SERVICE_FAULT) {
            return Ok(None);
        }
        let response_header = ResponseHeader::decode(&mut peek)?;
        Ok(Some(Self { response_header }))
    }

    pub fn into_error(self) -> ChannelError {
        ChannelError::ServiceFault {
            status: self.response_header.service_result,
            diagnostics: self.response_header.diagnostic_text(),
        }
    }
}

fn expect_type_id(body: &mut Bytes, expected: u32) -> Result<()> {
    let type_id = NodeId::decode(body)?;
    if type_id.as_ns0_numeric() != Some(expected) {
        return Err(ChannelError::protocol(
            StatusCode::BAD_UNKNOWN_RESPONSE,
            format!("expected type id i={}, got {:?}", expected, type_id),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(token_id: u32) -> OpenSecureChannelResponse {
        OpenSecureChannelResponse {
            response_header: ResponseHeader::new(1, 0, StatusCode::GOOD),
            server_protocol_version: 0,
            security_token: ChannelSecurityToken {
                channel_id: 42,
                token_id,
                created_at: 133_000_000_000_000_000,
                revised_lifetime: 600_000,
            },
            server_nonce: Some(Bytes::from_static(&[9; 32])),
        }
    }

    #[test]
    fn test_open_request_layout() {
        let request = OpenSecureChannelRequest {
            request_header: RequestHeader::new(3, 0, 10_000),
            client_protocol_version: 0,
            request_type: SecurityTokenRequestType::Renew,
            security_mode: MessageSecurityMode::Sign,
            client_nonce: None,
            requested_lifetime: 3_600_000,
        };
        let encoded = request.encode();
        assert_eq!(&encoded[..4], &[0x01, 0x00, 0xBE, 0x01]);
        assert_eq!(OpenSecureChannelRequest::decode(encoded).unwrap(), request);
    }

    #[test]
    fn test_open_response_decode() {
        let decoded = OpenSecureChannelResponse::decode(response(5).encode()).unwrap();
        assert_eq!(decoded.security_token.token_id, 5);
        assert_eq!(decoded.security_token.channel_id, 42);
        assert_eq!(decoded.server_nonce.as_deref(), Some(&[9u8; 32][..]));
    }

    #[test]
    fn test_service_fault_becomes_error() {
        let mut header = ResponseHeader::new(1, 0, StatusCode::BAD_SECURITY_POLICY_REJECTED);
        header.string_table = vec![Some("policy not supported".into())];
        let fault = ServiceFault {
            response_header: header,
        };
        let mut body = BytesMut::from(&fault.encode()[..]);
        // Patch in a DiagnosticInfo pointing at the string table entry
        let diag_offset = 4 + 8 + 4 + 4;
        body[diag_offset] = 0x04;
        let mut patched = BytesMut::new();
        patched.extend_from_slice(&body[..=diag_offset]);
        patched.put_i32_le(0);
        patched.extend_from_slice(&body[diag_offset + 1..]);

        match OpenSecureChannelResponse::decode(patched.freeze()) {
            Err(ChannelError::ServiceFault {
                status,
                diagnostics,
            }) => {
                assert_eq!(status, StatusCode::BAD_SECURITY_POLICY_REJECTED);
                assert_eq!(diagnostics.as_deref(), Some("policy not supported"));
            }
            other => panic!("expected service fault, got {:?}", other),
        }
    }

    #[test]
    fn test_nested_diagnostics_limit() {
        let mut buf = BytesMut::new();
        for _ in 0..=MAX_DIAGNOSTIC_DEPTH + 1 {
            buf.put_u8(0x40);
        }
        buf.put_u8(0x00);
        assert!(matches!(
            DiagnosticInfo::decode(&mut buf.freeze()),
            Err(ChannelError::EncodingLimitsExceeded(_))
        ));
    }
}
