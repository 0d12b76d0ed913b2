//! OPC UA binary encoding of the built-in types used by the channel
//!
//! All integers are little-endian. Strings and ByteStrings are prefixed with
//! an `i32` length where `-1` denotes a null value.
//!
//! Only the subset of the built-in types needed by the secure channel
//! services lives here; application messages are opaque to this crate.

pub mod services;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, TimeZone, Utc};

use crate::error::{ChannelError, Result};

pub use services::{
    ChannelSecurityToken, CloseSecureChannelRequest, DiagnosticInfo, OpenSecureChannelRequest,
    OpenSecureChannelResponse, RequestHeader, ResponseHeader, SecurityTokenRequestType,
    ServiceFault,
};

/// Ticks (100 ns) between 1601-01-01 and the Unix epoch
const EPOCH_OFFSET_TICKS: i64 = 116_444_736_000_000_000;

const TICKS_PER_SECOND: i64 = 10_000_000;

fn ensure(buf: &Bytes, len: usize, what: &str) -> Result<()> {
    if buf.remaining() < len {
        return Err(ChannelError::decoding(format!(
            "buffer underflow reading {}: need {} bytes, have {}",
            what,
            len,
            buf.remaining()
        )));
    }
    Ok(())
}

pub fn read_u8(buf: &mut Bytes) -> Result<u8> {
    ensure(buf, 1, "Byte")?;
    Ok(buf.get_u8())
}

pub fn read_u16(buf: &mut Bytes) -> Result<u16> {
    ensure(buf, 2, "UInt16")?;
    Ok(buf.get_u16_le())
}

pub fn read_u32(buf: &mut Bytes) -> Result<u32> {
    ensure(buf, 4, "UInt32")?;
    Ok(buf.get_u32_le())
}

pub fn read_i32(buf: &mut Bytes) -> Result<i32> {
    ensure(buf, 4, "Int32")?;
    Ok(buf.get_i32_le())
}

pub fn read_i64(buf: &mut Bytes) -> Result<i64> {
    ensure(buf, 8, "Int64")?;
    Ok(buf.get_i64_le())
}

/// Read `len` raw bytes
pub fn read_bytes(buf: &mut Bytes, len: usize) -> Result<Bytes> {
    ensure(buf, len, "raw bytes")?;
    Ok(buf.split_to(len))
}

/// Write a nullable String
pub fn write_string(buf: &mut BytesMut, value: Option<&str>) {
    match value {
        Some(s) => {
            buf.put_i32_le(s.len() as i32);
            buf.put_slice(s.as_bytes());
        }
        None => buf.put_i32_le(-1),
    }
}

/// Read a nullable String
pub fn read_string(buf: &mut Bytes) -> Result<Option<String>> {
    match read_byte_string(buf)? {
        Some(bytes) => String::from_utf8(bytes.to_vec())
            .map(Some)
            .map_err(|e| ChannelError::decoding(format!("invalid UTF-8 in String: {}", e))),
        None => Ok(None),
    }
}

/// Write a nullable ByteString
pub fn write_byte_string(buf: &mut BytesMut, value: Option<&[u8]>) {
    match value {
        Some(b) => {
            buf.put_i32_le(b.len() as i32);
            buf.put_slice(b);
        }
        None => buf.put_i32_le(-1),
    }
}

/// Read a nullable ByteString
pub fn read_byte_string(buf: &mut Bytes) -> Result<Option<Bytes>> {
    let len = read_i32(buf)?;
    if len < 0 {
        return Ok(None);
    }
    let len = len as usize;
    if len > buf.remaining() {
        return Err(ChannelError::decoding(format!(
            "length {} exceeds remaining {} bytes",
            len,
            buf.remaining()
        )));
    }
    Ok(Some(buf.split_to(len)))
}

/// Encoded size of a nullable ByteString
pub fn byte_string_len(value: Option<&[u8]>) -> usize {
    4 + value.map_or(0, <[u8]>::len)
}

/// Convert a timestamp into OPC UA DateTime ticks
pub fn to_ua_ticks(time: DateTime<Utc>) -> i64 {
    let ticks = time.timestamp() * TICKS_PER_SECOND + i64::from(time.timestamp_subsec_nanos() / 100);
    ticks + EPOCH_OFFSET_TICKS
}

/// Convert OPC UA DateTime ticks into a timestamp, `None` for the null DateTime
pub fn from_ua_ticks(ticks: i64) -> Option<DateTime<Utc>> {
    if ticks <= 0 {
        return None;
    }
    let unix = ticks - EPOCH_OFFSET_TICKS;
    let secs = unix.div_euclid(TICKS_PER_SECOND);
    let nanos = (unix.rem_euclid(TICKS_PER_SECOND) * 100) as u32;
    Utc.timestamp_opt(secs, nanos).single()
}

/// NodeId identifier variants
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identifier {
    Numeric(u32),
    String(String),
    Guid([u8; 16]),
    ByteString(Vec<u8>),
}

/// OPC UA NodeId
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeId {
    pub namespace: u16,
    pub identifier: Identifier,
}

impl NodeId {
    /// The null NodeId (ns=0;i=0)
    pub const NULL: NodeId = NodeId {
        namespace: 0,
        identifier: Identifier::Numeric(0),
    };

    /// Numeric NodeId in namespace 0
    pub const fn ns0(id: u32) -> Self {
        Self {
            namespace: 0,
            identifier: Identifier::Numeric(id),
        }
    }

    pub fn is_null(&self) -> bool {
        self == &Self::NULL
    }

    /// Numeric identifier in namespace 0, if this is one
    pub fn as_ns0_numeric(&self) -> Option<u32> {
        match (self.namespace, &self.identifier) {
            (0, Identifier::Numeric(id)) => Some(*id),
            _ => None,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        match &self.identifier {
            Identifier::Numeric(id) if self.namespace == 0 && *id <= 0xFF => {
                buf.put_u8(0x00);
                buf.put_u8(*id as u8);
            }
            Identifier::Numeric(id) if self.namespace <= 0xFF && *id <= 0xFFFF => {
                buf.put_u8(0x01);
                buf.put_u8(self.namespace as u8);
                buf.put_u16_le(*id as u16);
            }
            Identifier::Numeric(id) => {
                buf.put_u8(0x02);
                buf.put_u16_le(self.namespace);
                buf.put_u32_le(*id);
            }
            Identifier::String(s) => {
                buf.put_u8(0x03);
                buf.put_u16_le(self.namespace);
                write_string(buf, Some(s));
            }
            Identifier::Guid(g) => {
                buf.put_u8(0x04);
                buf.put_u16_le(self.namespace);
                buf.put_slice(g);
            }
            Identifier::ByteString(b) => {
                buf.put_u8(0x05);
                buf.put_u16_le(self.namespace);
                write_byte_string(buf, Some(b));
            }
        }
    }

    pub fn decode(buf: &mut Bytes) -> Result<Self> {
        let encoding = read_u8(buf)?;
        if encoding & 0xC0 != 0 {
            return Err(ChannelError::decoding(format!(
                "NodeId encoding 0x{:02X} carries ExpandedNodeId flags",
                encoding
            )));
        }
        let (namespace, identifier) = match encoding {
            0x00 => (0, Identifier::Numeric(u32::from(read_u8(buf)?))),
            0x01 => {
                let ns = u16::from(read_u8(buf)?);
                (ns, Identifier::Numeric(u32::from(read_u16(buf)?)))
            }
            0x02 => (read_u16(buf)?, Identifier::Numeric(read_u32(buf)?)),
            0x03 => {
                let ns = read_u16(buf)?;
                let s = read_string(buf)?.unwrap_or_default();
                (ns, Identifier::String(s))
            }
            0x04 => {
                let ns = read_u16(buf)?;
                let mut guid = [0u8; 16];
                read_bytes(buf, 16)?.copy_to_slice(&mut guid);
                (ns, Identifier::Guid(guid))
            }
            0x05 => {
                let ns = read_u16(buf)?;
                let b = read_byte_string(buf)?.map(|b| b.to_vec()).unwrap_or_default();
                (ns, Identifier::ByteString(b))
            }
            other => {
                return Err(ChannelError::decoding(format!(
                    "unknown NodeId encoding 0x{:02X}",
                    other
                )))
            }
        };
        Ok(Self {
            namespace,
            identifier,
        })
    }
}

/// Write an empty ExtensionObject (null type id, no body)
pub fn write_empty_extension_object(buf: &mut BytesMut) {
    NodeId::NULL.encode(buf);
    buf.put_u8(0x00);
}

/// Skip an ExtensionObject, returning its type id
pub fn skip_extension_object(buf: &mut Bytes) -> Result<NodeId> {
    let type_id = NodeId::decode(buf)?;
    match read_u8(buf)? {
        0x00 => {}
        0x01 | 0x02 => {
            read_byte_string(buf)?;
        }
        other => {
            return Err(ChannelError::decoding(format!(
                "unknown ExtensionObject encoding 0x{:02X}",
                other
            )))
        }
    }
    Ok(type_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_compact_forms() {
        let mut buf = BytesMut::new();
        NodeId::ns0(446).encode(&mut buf);
        assert_eq!(&buf[..], &[0x01, 0x00, 0xBE, 0x01]);

        let mut buf = BytesMut::new();
        NodeId::ns0(42).encode(&mut buf);
        assert_eq!(&buf[..], &[0x00, 42]);

        let id = NodeId {
            namespace: 300,
            identifier: Identifier::Numeric(70_000),
        };
        let mut buf = BytesMut::new();
        id.encode(&mut buf);
        assert_eq!(buf[0], 0x02);
        assert_eq!(NodeId::decode(&mut buf.freeze()).unwrap(), id);
    }

    #[test]
    fn test_node_id_string_and_guid() {
        for id in [
            NodeId {
                namespace: 2,
                identifier: Identifier::String("Demo.Static".into()),
            },
            NodeId {
                namespace: 1,
                identifier: Identifier::Guid([7; 16]),
            },
            NodeId {
                namespace: 1,
                identifier: Identifier::ByteString(vec![1, 2, 3]),
            },
        ] {
            let mut buf = BytesMut::new();
            id.encode(&mut buf);
            assert_eq!(NodeId::decode(&mut buf.freeze()).unwrap(), id);
        }
    }

    #[test]
    fn test_null_string_and_truncated_input() {
        let mut buf = BytesMut::new();
        write_string(&mut buf, None);
        assert_eq!(read_string(&mut buf.freeze()).unwrap(), None);

        let mut truncated = Bytes::from_static(&[10, 0, 0, 0, b'a']);
        assert!(read_string(&mut truncated).is_err());
    }

    #[test]
    fn test_ua_ticks() {
        let time = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let ticks = to_ua_ticks(time);
        assert_eq!(from_ua_ticks(ticks), Some(time));
        assert_eq!(to_ua_ticks(Utc.timestamp_opt(0, 0).unwrap()), EPOCH_OFFSET_TICKS);
        assert_eq!(from_ua_ticks(0), None);
    }
}
