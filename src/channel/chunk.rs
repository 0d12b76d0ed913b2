//! Chunk Framer
//!
//! Splits message bodies into signed and encrypted chunks and reassembles
//! received chunks into message bodies.
//!
//! Layout of one chunk, protected regions marked:
//!
//! ```text
//! +--------+------------+-----------------+----------+------+---------+-----------+
//! | header | channel id | security header | sequence | body | padding | signature |
//! +--------+------------+-----------------+----------+------+---------+-----------+
//! |<------------------------ signed ------------------------------->|
//!                                          |<------------ encrypted ------------>|
//! ```
//!
//! Padding consists of `padding_size` bytes followed by the padding size
//! byte, plus a high byte when the cipher block exceeds 256 bytes. All of it
//! carries the low byte of `padding_size`, except the high byte.

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use bytes::{BufMut, Bytes, BytesMut};
use log::{debug, trace, warn};

use super::headers::{
    AsymmetricSecurityHeader, SequenceHeader, SymmetricSecurityHeader, SECURE_MESSAGE_HEADER_SIZE,
    SEQUENCE_HEADER_SIZE, SYMMETRIC_SECURITY_HEADER_SIZE,
};
use super::secure_channel::SecureChannel;
use crate::encoding::{read_string, read_u32};
use crate::error::{ChannelError, Result};
use crate::security::SecretKeys;
use crate::status::StatusCode;
use crate::transport::{ChannelParameters, ChunkType, MessageHeader, MessageType};

/// Last sequence number before wrapping around to 1
pub const MAX_SEQUENCE_NUMBER: u32 = u32::MAX - 1024;

/// Sequence numbers accepted right after a wrap
const SEQUENCE_WRAP_WINDOW: u32 = 1024;

/// Request ids whose remaining chunks are drained, oldest forgotten first
const MAX_DISCARDED_REQUESTS: usize = 256;

/// Sizes that shape one chunk
#[derive(Debug, Clone, Copy)]
struct Protection {
    signed: bool,
    encrypted: bool,
    signature_size: usize,
    plain_block_size: usize,
    cipher_block_size: usize,
}

impl Protection {
    fn plain() -> Self {
        Self {
            signed: false,
            encrypted: false,
            signature_size: 0,
            plain_block_size: 1,
            cipher_block_size: 1,
        }
    }

    /// Padding size byte(s)
    fn padding_overhead(&self) -> usize {
        match (self.encrypted, self.cipher_block_size > 256) {
            (false, _) => 0,
            (true, false) => 1,
            (true, true) => 2,
        }
    }

    /// Largest body that fits a chunk of `max_chunk_size` bytes
    fn max_body_size(&self, header_size: usize, max_chunk_size: usize) -> usize {
        let cipher_blocks = max_chunk_size.saturating_sub(header_size) / self.cipher_block_size;
        (cipher_blocks * self.plain_block_size)
            .saturating_sub(SEQUENCE_HEADER_SIZE + self.signature_size + self.padding_overhead())
    }

    fn padding_size(&self, body_size: usize) -> usize {
        if !self.encrypted {
            return 0;
        }
        let content =
            SEQUENCE_HEADER_SIZE + body_size + self.signature_size + self.padding_overhead();
        (self.plain_block_size - content % self.plain_block_size) % self.plain_block_size
    }

    /// Size on the wire of a chunk carrying `body_size` bytes
    fn chunk_size(&self, header_size: usize, body_size: usize) -> usize {
        let plain = SEQUENCE_HEADER_SIZE
            + body_size
            + self.padding_size(body_size)
            + self.padding_overhead()
            + self.signature_size;
        header_size + plain / self.plain_block_size * self.cipher_block_size
    }
}

fn asymmetric_encode_protection(channel: &SecureChannel) -> Result<Protection> {
    let policy = channel.policy();
    let mut protection = Protection::plain();
    if channel.is_asymmetric_signing_enabled() {
        protection.signed = true;
        protection.signature_size = policy.private_key_size(channel.require_private_key()?)?;
    }
    if channel.is_asymmetric_encryption_enabled() {
        protection.encrypted = true;
        protection.cipher_block_size =
            policy.public_key_size(channel.require_remote_public_key()?)?;
        protection.plain_block_size =
            policy.asymmetric_plain_block_size(protection.cipher_block_size);
    }
    Ok(protection)
}

fn asymmetric_decode_protection(channel: &SecureChannel) -> Result<Protection> {
    let policy = channel.policy();
    let mut protection = Protection::plain();
    if channel.is_asymmetric_signing_enabled() {
        protection.signed = true;
        protection.signature_size = policy.public_key_size(channel.require_remote_public_key()?)?;
    }
    if channel.is_asymmetric_encryption_enabled() {
        protection.encrypted = true;
        protection.cipher_block_size = policy.private_key_size(channel.require_private_key()?)?;
        protection.plain_block_size =
            policy.asymmetric_plain_block_size(protection.cipher_block_size);
    }
    Ok(protection)
}

fn symmetric_protection(channel: &SecureChannel) -> Protection {
    let policy = channel.policy();
    let mut protection = Protection::plain();
    if channel.is_symmetric_signing_enabled() {
        protection.signed = true;
        protection.signature_size = policy.symmetric_signature_size();
    }
    if channel.is_symmetric_encryption_enabled() {
        protection.encrypted = true;
        protection.cipher_block_size = policy.symmetric_block_size();
        protection.plain_block_size = policy.symmetric_block_size();
    }
    protection
}

/// How a chunk is signed and encrypted
enum Seal<'a> {
    Asymmetric,
    Symmetric(&'a SecretKeys),
}

fn security_failure(reason: impl Into<String>) -> ChannelError {
    ChannelError::security(StatusCode::BAD_SECURITY_CHECKS_FAILED, reason)
}

/// Frames outgoing messages into chunks
///
/// One encoder per connection. Sequence numbers are shared by asymmetric
/// and symmetric chunks.
#[derive(Debug)]
pub struct ChunkEncoder {
    parameters: ChannelParameters,
    next_sequence_number: u32,
}

impl ChunkEncoder {
    pub fn new(parameters: ChannelParameters) -> Self {
        Self {
            parameters,
            next_sequence_number: 1,
        }
    }

    pub fn parameters(&self) -> &ChannelParameters {
        &self.parameters
    }

    #[cfg(test)]
    pub(crate) fn set_next_sequence_number(&mut self, sequence_number: u32) {
        self.next_sequence_number = sequence_number;
    }

    fn take_sequence_number(&mut self) -> u32 {
        let sequence_number = self.next_sequence_number;
        self.next_sequence_number = if sequence_number >= MAX_SEQUENCE_NUMBER {
            1
        } else {
            sequence_number + 1
        };
        sequence_number
    }

    /// Frame an OpenSecureChannel message
    pub fn encode_asymmetric(
        &mut self,
        channel: &SecureChannel,
        request_id: u32,
        body: &[u8],
    ) -> Result<Vec<Bytes>> {
        let (sender_certificate, receiver_thumbprint) = if channel.policy().is_none() {
            (None, None)
        } else {
            (
                channel.local_certificate_chain_bytes(),
                channel
                    .remote_certificate()
                    .map(|c| Bytes::copy_from_slice(&c.thumbprint())),
            )
        };
        let header = AsymmetricSecurityHeader::new(
            channel.policy().uri(),
            sender_certificate,
            receiver_thumbprint,
        );
        let mut security_header = BytesMut::with_capacity(header.encoded_len());
        header.encode(&mut security_header);

        let protection = asymmetric_encode_protection(channel)?;
        self.encode_chunks(
            channel,
            MessageType::OpenSecureChannel,
            &security_header,
            protection,
            Seal::Asymmetric,
            request_id,
            body,
        )
    }

    /// Frame a MSG or CLO message with the current token's keys
    pub fn encode_symmetric(
        &mut self,
        channel: &SecureChannel,
        message_type: MessageType,
        request_id: u32,
        body: &[u8],
    ) -> Result<Vec<Bytes>> {
        let security = channel.require_channel_security()?;
        let mut security_header = BytesMut::with_capacity(SYMMETRIC_SECURITY_HEADER_SIZE);
        SymmetricSecurityHeader {
            token_id: security.current_token().token_id,
        }
        .encode(&mut security_header);

        let protection = symmetric_protection(channel);
        self.encode_chunks(
            channel,
            message_type,
            &security_header,
            protection,
            Seal::Symmetric(&security.current_keys().local),
            request_id,
            body,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn encode_chunks(
        &mut self,
        channel: &SecureChannel,
        message_type: MessageType,
        security_header: &[u8],
        protection: Protection,
        seal: Seal<'_>,
        request_id: u32,
        body: &[u8],
    ) -> Result<Vec<Bytes>> {
        let header_size = SECURE_MESSAGE_HEADER_SIZE + security_header.len();
        let max_chunk_size = self.parameters.local_send_buffer_size as usize;
        let max_body_size = protection.max_body_size(header_size, max_chunk_size);
        if max_body_size == 0 {
            return Err(ChannelError::EncodingLimitsExceeded(format!(
                "send buffer of {} bytes leaves no room for a body",
                max_chunk_size
            )));
        }

        let remote_max_message_size = self.parameters.remote_max_message_size as usize;
        if remote_max_message_size > 0 && body.len() > remote_max_message_size {
            return Err(ChannelError::too_large(
                StatusCode::BAD_REQUEST_TOO_LARGE,
                format!(
                    "message size {} exceeds server limit {}",
                    body.len(),
                    remote_max_message_size
                ),
            ));
        }
        let chunk_count = body.len().div_ceil(max_body_size).max(1);
        let remote_max_chunk_count = self.parameters.remote_max_chunk_count as usize;
        if remote_max_chunk_count > 0 && chunk_count > remote_max_chunk_count {
            return Err(ChannelError::too_large(
                StatusCode::BAD_REQUEST_TOO_LARGE,
                format!(
                    "message needs {} chunks, server accepts {}",
                    chunk_count, remote_max_chunk_count
                ),
            ));
        }

        let mut chunks = Vec::with_capacity(chunk_count);
        let mut bodies = body.chunks(max_body_size);
        for index in 0..chunk_count {
            let chunk_body = bodies.next().unwrap_or_default();
            let chunk_type = if index + 1 == chunk_count {
                ChunkType::Final
            } else {
                ChunkType::Intermediate
            };
            let chunk_size = protection.chunk_size(header_size, chunk_body.len());
            let padding_size = protection.padding_size(chunk_body.len());

            let mut buf = BytesMut::with_capacity(chunk_size.max(header_size + chunk_body.len()));
            MessageHeader {
                message_type,
                chunk_type,
                message_size: chunk_size as u32,
            }
            .encode(&mut buf);
            buf.put_u32_le(channel.channel_id());
            buf.put_slice(security_header);
            SequenceHeader {
                sequence_number: self.take_sequence_number(),
                request_id,
            }
            .encode(&mut buf);
            buf.put_slice(chunk_body);

            if protection.encrypted {
                let low = (padding_size & 0xFF) as u8;
                buf.put_bytes(low, padding_size + 1);
                if protection.padding_overhead() > 1 {
                    buf.put_u8((padding_size >> 8) as u8);
                }
            }

            let chunk = seal_chunk(channel, &protection, &seal, buf, header_size)?;
            if chunk.len() != chunk_size {
                return Err(ChannelError::Encoding(format!(
                    "sealed chunk has {} bytes, expected {}",
                    chunk.len(),
                    chunk_size
                )));
            }
            chunks.push(chunk);
        }

        trace!(
            "encoded {:?} request_id={} into {} chunk(s)",
            message_type,
            request_id,
            chunks.len()
        );
        Ok(chunks)
    }
}

/// Sign, then encrypt everything after the security header
fn seal_chunk(
    channel: &SecureChannel,
    protection: &Protection,
    seal: &Seal<'_>,
    mut buf: BytesMut,
    header_size: usize,
) -> Result<Bytes> {
    let policy = channel.policy();

    if protection.signed {
        let signature = match seal {
            Seal::Asymmetric => policy.asymmetric_sign(channel.require_private_key()?, &buf)?,
            Seal::Symmetric(keys) => policy.symmetric_sign(keys, &buf)?,
        };
        if signature.len() != protection.signature_size {
            return Err(ChannelError::Encoding(format!(
                "signature has {} bytes, expected {}",
                signature.len(),
                protection.signature_size
            )));
        }
        buf.put_slice(&signature);
    }

    if protection.encrypted {
        match seal {
            Seal::Asymmetric => {
                let encrypted = policy
                    .asymmetric_encrypt(channel.require_remote_public_key()?, &buf[header_size..])?;
                buf.truncate(header_size);
                buf.put_slice(&encrypted);
            }
            Seal::Symmetric(keys) => policy.symmetric_encrypt(keys, &mut buf[header_size..])?,
        }
    }

    Ok(buf.freeze())
}

/// Decrypt, verify and strip padding, leaving sequence header and body
fn open_chunk(
    channel: &SecureChannel,
    protection: &Protection,
    seal: &Seal<'_>,
    chunk: &Bytes,
    header_size: usize,
) -> Result<Bytes> {
    let policy = channel.policy();

    let plain = if protection.encrypted {
        let cipher_text = &chunk[header_size..];
        if cipher_text.len() % protection.cipher_block_size != 0 {
            return Err(security_failure(format!(
                "cipher text of {} bytes is not a multiple of the block size {}",
                cipher_text.len(),
                protection.cipher_block_size
            )));
        }
        let mut buf = BytesMut::with_capacity(chunk.len());
        buf.put_slice(&chunk[..header_size]);
        match seal {
            Seal::Asymmetric => {
                let decrypted =
                    policy.asymmetric_decrypt(channel.require_private_key()?, cipher_text)?;
                buf.put_slice(&decrypted);
            }
            Seal::Symmetric(keys) => {
                buf.put_slice(cipher_text);
                policy.symmetric_decrypt(keys, &mut buf[header_size..])?;
            }
        }
        buf.freeze()
    } else {
        chunk.clone()
    };

    let mut end = plain.len();
    if protection.signed {
        if end < header_size + protection.signature_size {
            return Err(security_failure("chunk shorter than its signature"));
        }
        end -= protection.signature_size;
        let (data, signature) = (&plain[..end], &plain[end..]);
        match seal {
            Seal::Asymmetric => {
                policy.asymmetric_verify(channel.require_remote_public_key()?, data, signature)?
            }
            Seal::Symmetric(keys) => policy.symmetric_verify(keys, data, signature)?,
        }
    }

    if protection.encrypted {
        let overhead = protection.padding_overhead();
        if end < header_size + SEQUENCE_HEADER_SIZE + overhead {
            return Err(security_failure("chunk shorter than its padding"));
        }
        let padding_size = if overhead > 1 {
            usize::from(plain[end - 1]) << 8 | usize::from(plain[end - 2])
        } else {
            usize::from(plain[end - 1])
        };
        let padding_start = end
            .checked_sub(overhead + padding_size)
            .filter(|start| *start >= header_size + SEQUENCE_HEADER_SIZE)
            .ok_or_else(|| security_failure(format!("padding size {} invalid", padding_size)))?;
        let low = (padding_size & 0xFF) as u8;
        if plain[padding_start..end + 1 - overhead]
            .iter()
            .any(|b| *b != low)
        {
            return Err(security_failure("padding bytes invalid"));
        }
        end = padding_start;
    }

    Ok(plain.slice(header_size..end))
}

/// A fully reassembled message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedMessage {
    pub message_type: MessageType,
    pub request_id: u32,
    pub body: Bytes,

    /// Security header of the first chunk, OpenSecureChannel only
    pub security_header: Option<AsymmetricSecurityHeader>,
}

/// Outcome of decoding one chunk
#[derive(Debug)]
pub enum DecodeOutcome {
    /// Chunk buffered, more to come
    Incomplete,

    /// Final chunk received
    Complete(DecodedMessage),

    /// The message for this request id was aborted by the peer or exceeded
    /// a local limit. Only that request is affected.
    Failed { request_id: u32, error: ChannelError },
}

#[derive(Debug)]
struct PartialMessage {
    message_type: MessageType,
    payloads: Vec<Bytes>,
    size: usize,
    security_header: Option<AsymmetricSecurityHeader>,
}

/// Verifies, decrypts and reassembles incoming chunks
///
/// Chunks of different requests may interleave; each request id has its own
/// reassembly buffer. Sequence numbers are checked across the connection.
#[derive(Debug)]
pub struct ChunkDecoder {
    parameters: ChannelParameters,
    last_sequence_number: Option<u32>,
    partials: HashMap<u32, PartialMessage>,
    discarded: VecDeque<u32>,
}

impl ChunkDecoder {
    pub fn new(parameters: ChannelParameters) -> Self {
        Self {
            parameters,
            last_sequence_number: None,
            partials: HashMap::new(),
            discarded: VecDeque::new(),
        }
    }

    /// Decode a chunk of any secure message type
    pub fn decode(
        &mut self,
        channel: &SecureChannel,
        chunk: Bytes,
        now: Instant,
    ) -> Result<DecodeOutcome> {
        match MessageHeader::peek(&chunk[..])?.message_type {
            MessageType::OpenSecureChannel => self.decode_asymmetric(channel, chunk),
            MessageType::SecureMessage | MessageType::CloseSecureChannel => {
                self.decode_symmetric(channel, chunk, now)
            }
            other => Err(ChannelError::protocol(
                StatusCode::BAD_TCP_MESSAGE_TYPE_INVALID,
                format!("{:?} is not a secure conversation message", other),
            )),
        }
    }

    /// Decode an OpenSecureChannel chunk
    pub fn decode_asymmetric(
        &mut self,
        channel: &SecureChannel,
        chunk: Bytes,
    ) -> Result<DecodeOutcome> {
        let header = self.check_header(channel, &chunk)?;
        if header.message_type != MessageType::OpenSecureChannel {
            return Err(ChannelError::protocol(
                StatusCode::BAD_TCP_MESSAGE_TYPE_INVALID,
                format!("expected OpenSecureChannel chunk, got {:?}", header.message_type),
            ));
        }

        let mut rest = chunk.slice(SECURE_MESSAGE_HEADER_SIZE..);
        let before = rest.len();
        let security_header = AsymmetricSecurityHeader::decode(&mut rest)?;
        let header_size = SECURE_MESSAGE_HEADER_SIZE + (before - rest.len());

        if security_header.security_policy_uri != channel.policy().uri() {
            return Err(ChannelError::protocol(
                StatusCode::BAD_SECURITY_POLICY_REJECTED,
                format!(
                    "peer uses security policy {}, channel uses {}",
                    security_header.security_policy_uri,
                    channel.policy().uri()
                ),
            ));
        }

        let protection = asymmetric_decode_protection(channel)?;
        let payload = open_chunk(channel, &protection, &Seal::Asymmetric, &chunk, header_size)?;
        self.accept(header, payload, Some(security_header))
    }

    /// Decode a MSG or CLO chunk
    ///
    /// The token id must be the current token or the previous one inside its
    /// grace window.
    pub fn decode_symmetric(
        &mut self,
        channel: &SecureChannel,
        chunk: Bytes,
        now: Instant,
    ) -> Result<DecodeOutcome> {
        let header = self.check_header(channel, &chunk)?;
        if !matches!(
            header.message_type,
            MessageType::SecureMessage | MessageType::CloseSecureChannel
        ) {
            return Err(ChannelError::protocol(
                StatusCode::BAD_TCP_MESSAGE_TYPE_INVALID,
                format!("expected symmetric chunk, got {:?}", header.message_type),
            ));
        }

        let mut rest = chunk.slice(SECURE_MESSAGE_HEADER_SIZE..);
        let token_id = SymmetricSecurityHeader::decode(&mut rest)?.token_id;
        let security = channel.require_channel_security()?;
        let keys = security.keys_for_token(token_id, now).ok_or_else(|| {
            ChannelError::security(
                StatusCode::BAD_SECURE_CHANNEL_TOKEN_UNKNOWN,
                format!(
                    "token {} unknown, current token is {}",
                    token_id,
                    security.current_token().token_id
                ),
            )
        })?;

        let header_size = SECURE_MESSAGE_HEADER_SIZE + SYMMETRIC_SECURITY_HEADER_SIZE;
        let protection = symmetric_protection(channel);
        let payload = open_chunk(
            channel,
            &protection,
            &Seal::Symmetric(&keys.remote),
            &chunk,
            header_size,
        )?;
        self.accept(header, payload, None)
    }

    /// Decode a complete OpenSecureChannel message
    pub fn decode_asymmetric_message(
        &mut self,
        channel: &SecureChannel,
        chunks: impl IntoIterator<Item = Bytes>,
    ) -> Result<DecodedMessage> {
        self.decode_message(chunks, |decoder, chunk| {
            decoder.decode_asymmetric(channel, chunk)
        })
    }

    /// Decode a complete MSG or CLO message
    pub fn decode_symmetric_message(
        &mut self,
        channel: &SecureChannel,
        chunks: impl IntoIterator<Item = Bytes>,
        now: Instant,
    ) -> Result<DecodedMessage> {
        self.decode_message(chunks, |decoder, chunk| {
            decoder.decode_symmetric(channel, chunk, now)
        })
    }

    fn decode_message(
        &mut self,
        chunks: impl IntoIterator<Item = Bytes>,
        mut decode: impl FnMut(&mut Self, Bytes) -> Result<DecodeOutcome>,
    ) -> Result<DecodedMessage> {
        for chunk in chunks {
            match decode(self, chunk)? {
                DecodeOutcome::Incomplete => {}
                DecodeOutcome::Complete(message) => return Ok(message),
                DecodeOutcome::Failed { error, .. } => return Err(error),
            }
        }
        Err(ChannelError::decoding("message ended without a final chunk"))
    }

    /// Drop the partial message of `request_id` and ignore its remaining chunks
    ///
    /// Only ids with a partial message are remembered. A response that has not
    /// started yet arrives complete and is dropped by the caller as unknown.
    pub fn discard(&mut self, request_id: u32) {
        if self.partials.remove(&request_id).is_some() {
            debug!("discarding chunks of request_id={}", request_id);
            self.mark_discarded(request_id);
        }
    }

    fn mark_discarded(&mut self, request_id: u32) {
        if self.discarded.contains(&request_id) {
            return;
        }
        if self.discarded.len() >= MAX_DISCARDED_REQUESTS {
            if let Some(oldest) = self.discarded.pop_front() {
                trace!("no longer draining request_id={}", oldest);
            }
        }
        self.discarded.push_back(request_id);
    }

    fn unmark_discarded(&mut self, request_id: u32) {
        self.discarded.retain(|id| *id != request_id);
    }

    /// Requests with a partially received message
    pub fn pending_request_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.partials.keys().copied()
    }

    fn check_header(&self, channel: &SecureChannel, chunk: &Bytes) -> Result<MessageHeader> {
        let header = MessageHeader::peek(&chunk[..])?;
        if header.message_size as usize != chunk.len() {
            return Err(ChannelError::decoding(format!(
                "chunk declares {} bytes, has {}",
                header.message_size,
                chunk.len()
            )));
        }
        let max = self.parameters.local_receive_buffer_size as usize;
        if max > 0 && chunk.len() > max {
            return Err(ChannelError::too_large(
                StatusCode::BAD_TCP_MESSAGE_TOO_LARGE,
                format!("chunk of {} bytes exceeds receive buffer {}", chunk.len(), max),
            ));
        }
        if chunk.len() < SECURE_MESSAGE_HEADER_SIZE {
            return Err(ChannelError::decoding("secure message header truncated"));
        }

        let channel_id = u32::from_le_bytes([chunk[8], chunk[9], chunk[10], chunk[11]]);
        let expected = channel.channel_id();
        // An OpenSecureChannel Issue response assigns the id
        let unassigned =
            expected == 0 && header.message_type == MessageType::OpenSecureChannel;
        if !unassigned && channel_id != expected {
            return Err(ChannelError::security(
                StatusCode::BAD_SECURE_CHANNEL_ID_INVALID,
                format!("secure channel id {} does not match {}", channel_id, expected),
            ));
        }
        Ok(header)
    }

    fn check_sequence_number(&mut self, sequence_number: u32) -> Result<()> {
        let valid = match self.last_sequence_number {
            None => true,
            Some(last) => {
                sequence_number == last.wrapping_add(1)
                    || (last >= MAX_SEQUENCE_NUMBER && sequence_number < SEQUENCE_WRAP_WINDOW)
            }
        };
        if !valid {
            return Err(ChannelError::security(
                StatusCode::BAD_SEQUENCE_NUMBER_INVALID,
                format!(
                    "sequence number {} does not follow {:?}",
                    sequence_number, self.last_sequence_number
                ),
            ));
        }
        self.last_sequence_number = Some(sequence_number);
        Ok(())
    }

    fn accept(
        &mut self,
        header: MessageHeader,
        mut payload: Bytes,
        security_header: Option<AsymmetricSecurityHeader>,
    ) -> Result<DecodeOutcome> {
        let sequence = SequenceHeader::decode(&mut payload)?;
        self.check_sequence_number(sequence.sequence_number)?;
        let request_id = sequence.request_id;

        if header.chunk_type == ChunkType::Abort {
            self.partials.remove(&request_id);
            self.unmark_discarded(request_id);
            let status = StatusCode(read_u32(&mut payload)?);
            let reason = read_string(&mut payload)?.unwrap_or_default();
            warn!(
                "peer aborted message for request_id={}: {} {}",
                request_id, status, reason
            );
            return Ok(DecodeOutcome::Failed {
                request_id,
                error: ChannelError::MessageAbort {
                    request_id,
                    status,
                    reason,
                },
            });
        }

        if self.discarded.contains(&request_id) {
            if header.chunk_type == ChunkType::Final {
                self.unmark_discarded(request_id);
            }
            trace!("dropped chunk of discarded request_id={}", request_id);
            return Ok(DecodeOutcome::Incomplete);
        }

        let partial = self
            .partials
            .entry(request_id)
            .or_insert_with(|| PartialMessage {
                message_type: header.message_type,
                payloads: Vec::new(),
                size: 0,
                security_header: security_header.clone(),
            });
        if partial.message_type != header.message_type {
            return Err(ChannelError::protocol(
                StatusCode::BAD_TCP_MESSAGE_TYPE_INVALID,
                format!(
                    "request_id={} mixes {:?} and {:?} chunks",
                    request_id, partial.message_type, header.message_type
                ),
            ));
        }
        if partial.security_header != security_header {
            return Err(security_failure(format!(
                "security header changed within message for request_id={}",
                request_id
            )));
        }
        partial.size += payload.len();
        partial.payloads.push(payload);

        let max_chunk_count = self.parameters.local_max_chunk_count as usize;
        let max_message_size = self.parameters.local_max_message_size as usize;
        let limit_error = if max_chunk_count > 0 && partial.payloads.len() > max_chunk_count {
            Some(format!(
                "more than {} chunks for request_id={}",
                max_chunk_count, request_id
            ))
        } else if max_message_size > 0 && partial.size > max_message_size {
            Some(format!(
                "message for request_id={} exceeds {} bytes",
                request_id, max_message_size
            ))
        } else {
            None
        };
        if let Some(reason) = limit_error {
            self.partials.remove(&request_id);
            if header.chunk_type != ChunkType::Final {
                self.mark_discarded(request_id);
            }
            return Ok(DecodeOutcome::Failed {
                request_id,
                error: ChannelError::too_large(StatusCode::BAD_RESPONSE_TOO_LARGE, reason),
            });
        }

        if header.chunk_type == ChunkType::Intermediate {
            return Ok(DecodeOutcome::Incomplete);
        }

        let Some(partial) = self.partials.remove(&request_id) else {
            return Ok(DecodeOutcome::Incomplete);
        };
        let body = if partial.payloads.len() == 1 {
            partial.payloads.into_iter().next().unwrap_or_default()
        } else {
            let mut body = BytesMut::with_capacity(partial.size);
            for payload in &partial.payloads {
                body.put_slice(payload);
            }
            body.freeze()
        };
        Ok(DecodeOutcome::Complete(DecodedMessage {
            message_type: partial.message_type,
            request_id,
            body,
            security_header: partial.security_header,
        }))
    }
}

/// Build an Abort chunk body: status code and reason
pub fn abort_body(status: StatusCode, reason: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(8 + reason.len());
    buf.put_u32_le(status.0);
    crate::encoding::write_string(&mut buf, Some(reason));
    buf.freeze()
}
