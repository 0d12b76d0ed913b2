//! Splitting a byte stream into UACP messages

use bytes::{Bytes, BytesMut};

use super::{MessageHeader, MESSAGE_HEADER_SIZE};
use crate::error::{ChannelError, Result};
use crate::status::StatusCode;

/// Cuts complete messages off the front of a receive buffer
#[derive(Debug, Clone)]
pub struct FrameAccumulator {
    /// Largest message accepted (header included)
    max_frame_size: usize,
}

impl FrameAccumulator {
    pub fn new(max_frame_size: u32) -> Self {
        Self {
            max_frame_size: max_frame_size as usize,
        }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Take the next complete message from `buf`, if one has fully arrived
    pub fn next_frame(&self, buf: &mut BytesMut) -> Result<Option<Bytes>> {
        if buf.len() < MESSAGE_HEADER_SIZE {
            return Ok(None);
        }
        let header = MessageHeader::peek(&buf[..])?;
        let size = header.message_size as usize;

        if size < MESSAGE_HEADER_SIZE {
            return Err(ChannelError::protocol(
                StatusCode::BAD_TCP_MESSAGE_TYPE_INVALID,
                format!("message size {} smaller than header", size),
            ));
        }
        if size > self.max_frame_size {
            return Err(ChannelError::too_large(
                StatusCode::BAD_TCP_MESSAGE_TOO_LARGE,
                format!(
                    "{:?} message of {} bytes exceeds receive buffer {}",
                    header.message_type, size, self.max_frame_size
                ),
            ));
        }
        if buf.len() < size {
            buf.reserve(size - buf.len());
            return Ok(None);
        }
        Ok(Some(buf.split_to(size).freeze()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::AcknowledgeMessage;

    fn ack() -> Bytes {
        AcknowledgeMessage {
            protocol_version: 0,
            receive_buffer_size: 65_535,
            send_buffer_size: 65_535,
            max_message_size: 0,
            max_chunk_count: 0,
        }
        .encode()
    }

    #[test]
    fn test_partial_then_complete() {
        let framer = FrameAccumulator::new(65_535);
        let message = ack();
        let mut buf = BytesMut::new();

        buf.extend_from_slice(&message[..5]);
        assert!(framer.next_frame(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&message[5..]);
        buf.extend_from_slice(&message[..3]);
        assert_eq!(framer.next_frame(&mut buf).unwrap(), Some(message.clone()));
        assert_eq!(buf.len(), 3);
        assert!(framer.next_frame(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_oversized_frame() {
        let framer = FrameAccumulator::new(16);
        let mut buf = BytesMut::from(&ack()[..]);
        let err = framer.next_frame(&mut buf).unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BAD_TCP_MESSAGE_TOO_LARGE);
    }
}
