//! Hello / Acknowledge and OpenSecureChannel exchanges
//!
//! ```text
//! Connecting --HEL--> HelloSent --ACK--> Acknowledged --OPN Issue--> OpenChannelPending
//!                                                                          |
//!                                         +--------- OPN response ---------+
//!                                         v
//!            Closed <--- Closing <--CLO-- Open <---> Renewing (OPN Renew)
//! ```
//!
//! The controller only holds state and builds or consumes message bodies.
//! Sockets, chunk framing and timers belong to the connection task.

use std::fmt;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::Utc;
use log::{debug, warn};

use crate::certificate::Certificate;
use crate::channel::{AsymmetricSecurityHeader, SecureChannel};
use crate::encoding::{
    to_ua_ticks, CloseSecureChannelRequest, OpenSecureChannelRequest, OpenSecureChannelResponse,
    RequestHeader, SecurityTokenRequestType,
};
use crate::error::{ChannelError, Result};
use crate::security::nonce::{generate_nonce, validate_nonce};
use crate::status::StatusCode;
use crate::transport::{AcknowledgeMessage, ChannelParameters, EncodingLimits, HelloMessage};
use crate::PROTOCOL_VERSION;

/// Lifecycle of one client connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    /// TCP connection being established
    Connecting,
    HelloSent,
    Acknowledged,
    /// OpenSecureChannel (Issue) outstanding
    OpenChannelPending,
    Open,
    /// OpenSecureChannel (Renew) outstanding, traffic continues
    Renewing,
    Closing,
    Closed,
}

impl ChannelState {
    /// Application requests can be framed in this state
    pub fn accepts_traffic(&self) -> bool {
        matches!(self, ChannelState::Open | ChannelState::Renewing)
    }

    /// Handshake started but the channel is not open yet
    pub fn is_handshaking(&self) -> bool {
        matches!(
            self,
            ChannelState::Connecting
                | ChannelState::HelloSent
                | ChannelState::Acknowledged
                | ChannelState::OpenChannelPending
        )
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// OpenSecureChannel request waiting for its response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingOpen {
    pub request_id: u32,
    pub request_type: SecurityTokenRequestType,
}

/// Drives the handshake and token lifecycle of one secure channel
#[derive(Debug)]
pub struct HandshakeController {
    channel: SecureChannel,
    state: ChannelState,
    endpoint_url: String,
    limits: EncodingLimits,
    requested_lifetime: u32,
    parameters: Option<ChannelParameters>,
    pending_open: Option<PendingOpen>,

    /// Security header of the first OpenSecureChannel response
    server_security_header: Option<AsymmetricSecurityHeader>,
}

fn timeout_hint(timeout: Duration) -> u32 {
    u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX)
}

impl HandshakeController {
    pub fn new(
        channel: SecureChannel,
        endpoint_url: impl Into<String>,
        limits: EncodingLimits,
        requested_lifetime: u32,
    ) -> Self {
        Self {
            channel,
            state: ChannelState::Connecting,
            endpoint_url: endpoint_url.into(),
            limits,
            requested_lifetime,
            parameters: None,
            pending_open: None,
            server_security_header: None,
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn channel(&self) -> &SecureChannel {
        &self.channel
    }

    /// Negotiated parameters, once the Acknowledge arrived
    pub fn parameters(&self) -> Option<&ChannelParameters> {
        self.parameters.as_ref()
    }

    pub fn pending_open(&self) -> Option<PendingOpen> {
        self.pending_open
    }

    /// Build the Hello message announcing our limits
    pub fn hello(&mut self) -> Result<Bytes> {
        if self.state != ChannelState::Connecting {
            return Err(self.unexpected("Hello"));
        }
        let hello = HelloMessage {
            protocol_version: PROTOCOL_VERSION,
            receive_buffer_size: self.limits.max_chunk_size,
            send_buffer_size: self.limits.max_chunk_size,
            max_message_size: self.limits.max_message_size,
            max_chunk_count: self.limits.max_chunk_count,
            endpoint_url: self.endpoint_url.clone(),
        }
        .encode()?;
        debug!(
            "sending Hello to {} (buffers {}, max message {}, max chunks {})",
            self.endpoint_url,
            self.limits.max_chunk_size,
            self.limits.max_message_size,
            self.limits.max_chunk_count
        );
        self.state = ChannelState::HelloSent;
        Ok(hello)
    }

    /// Negotiate channel parameters from the server's Acknowledge
    pub fn on_acknowledge(&mut self, ack: &AcknowledgeMessage) -> Result<ChannelParameters> {
        if self.state != ChannelState::HelloSent {
            return Err(ChannelError::protocol(
                StatusCode::BAD_TCP_MESSAGE_TYPE_INVALID,
                format!("unexpected Acknowledge in state {}", self.state),
            ));
        }
        if ack.protocol_version != PROTOCOL_VERSION {
            debug!(
                "server protocol version {}, client version {}",
                ack.protocol_version, PROTOCOL_VERSION
            );
        }
        let parameters = ChannelParameters::negotiate(&self.limits, ack)?;
        debug!("received Acknowledge: {:?}", parameters);
        self.parameters = Some(parameters);
        self.state = ChannelState::Acknowledged;
        Ok(parameters)
    }

    /// Build an OpenSecureChannel request body
    ///
    /// Issue is only valid right after the Acknowledge, Renew only on an open
    /// channel with no other OpenSecureChannel outstanding.
    pub fn open_request(
        &mut self,
        request_type: SecurityTokenRequestType,
        request_id: u32,
        timeout: Duration,
    ) -> Result<Bytes> {
        let next_state = match (request_type, self.state) {
            (SecurityTokenRequestType::Issue, ChannelState::Acknowledged) => {
                ChannelState::OpenChannelPending
            }
            (SecurityTokenRequestType::Renew, ChannelState::Open) => ChannelState::Renewing,
            _ => return Err(self.unexpected("OpenSecureChannel")),
        };

        let client_nonce = if self.channel.is_symmetric_signing_enabled() {
            let nonce = generate_nonce(self.channel.policy().nonce_length());
            self.channel.set_local_nonce(nonce.clone());
            Some(nonce)
        } else {
            None
        };

        let request = OpenSecureChannelRequest {
            request_header: RequestHeader::new(
                request_id,
                to_ua_ticks(Utc::now()),
                timeout_hint(timeout),
            ),
            client_protocol_version: PROTOCOL_VERSION,
            request_type,
            security_mode: self.channel.mode(),
            client_nonce,
            requested_lifetime: self.requested_lifetime,
        };
        debug!(
            "sending OpenSecureChannel {:?} request_id={} channel_id={}",
            request_type,
            request_id,
            self.channel.channel_id()
        );
        self.pending_open = Some(PendingOpen {
            request_id,
            request_type,
        });
        self.state = next_state;
        Ok(request.encode())
    }

    /// Check the asymmetric security header of an OpenSecureChannel response
    ///
    /// Returns the server chain when it still has to go through the
    /// certificate validator, i.e. on the first response only. Later
    /// responses must carry the same header.
    pub fn check_security_header(
        &mut self,
        header: &AsymmetricSecurityHeader,
    ) -> Result<Option<Vec<Certificate>>> {
        if self.channel.policy().is_none() {
            return Ok(None);
        }
        if let Some(first) = &self.server_security_header {
            if first != header {
                return Err(ChannelError::security(
                    StatusCode::BAD_SECURITY_CHECKS_FAILED,
                    "security header differs from the first OpenSecureChannel response",
                ));
            }
            return Ok(None);
        }

        let chain_der = header.sender_certificate.as_ref().ok_or_else(|| {
            ChannelError::security(
                StatusCode::BAD_CERTIFICATE_INVALID,
                "server sent no certificate",
            )
        })?;
        let chain = Certificate::decode_chain(chain_der)?;
        let leaf_matches = match (chain.first(), self.channel.remote_certificate()) {
            (Some(leaf), Some(expected)) => leaf.der() == expected.der(),
            _ => false,
        };
        if !leaf_matches {
            return Err(ChannelError::security(
                StatusCode::BAD_CERTIFICATE_INVALID,
                "server certificate does not match the endpoint certificate",
            ));
        }

        let thumbprint_matches = match (
            header.receiver_thumbprint.as_deref(),
            self.channel.local_certificate(),
        ) {
            (Some(received), Some(ours)) => received == &ours.thumbprint()[..],
            _ => false,
        };
        if !thumbprint_matches {
            return Err(ChannelError::security(
                StatusCode::BAD_SECURITY_CHECKS_FAILED,
                "receiver thumbprint does not match the client certificate",
            ));
        }

        self.server_security_header = Some(header.clone());
        Ok(Some(chain))
    }

    /// Install the token from an OpenSecureChannel response
    ///
    /// Returns how long to wait before renewing, `None` when the server
    /// granted a zero lifetime. A failed renewal leaves the channel open on
    /// its current token.
    pub fn on_open_response(&mut self, body: Bytes, now: Instant) -> Result<Option<Duration>> {
        let pending = self.pending_open.take().ok_or_else(|| {
            ChannelError::protocol(
                StatusCode::BAD_UNKNOWN_RESPONSE,
                "OpenSecureChannel response without a request",
            )
        })?;

        match self.install_response(pending.request_type, body, now) {
            Ok(renew_after) => {
                self.state = ChannelState::Open;
                Ok(renew_after)
            }
            Err(e) => {
                if pending.request_type == SecurityTokenRequestType::Renew {
                    self.state = ChannelState::Open;
                }
                Err(e)
            }
        }
    }

    fn install_response(
        &mut self,
        request_type: SecurityTokenRequestType,
        body: Bytes,
        now: Instant,
    ) -> Result<Option<Duration>> {
        let response = OpenSecureChannelResponse::decode(body)?;
        let service_result = response.response_header.service_result;
        if service_result.is_bad() {
            return Err(ChannelError::ServiceFault {
                status: service_result,
                diagnostics: response.response_header.diagnostic_text(),
            });
        }
        if response.server_protocol_version != PROTOCOL_VERSION {
            debug!(
                "server reports protocol version {} in OpenSecureChannel",
                response.server_protocol_version
            );
        }

        if self.channel.is_symmetric_signing_enabled() {
            validate_nonce(
                response.server_nonce.as_deref(),
                self.channel.policy().nonce_length(),
            )?;
        }

        let token = response.security_token;
        match request_type {
            SecurityTokenRequestType::Issue => {
                if token.channel_id == 0 {
                    return Err(ChannelError::protocol(
                        StatusCode::BAD_SECURE_CHANNEL_ID_INVALID,
                        "server assigned channel id 0",
                    ));
                }
                self.channel.set_channel_id(token.channel_id);
            }
            SecurityTokenRequestType::Renew => {
                if token.channel_id != self.channel.channel_id() {
                    return Err(ChannelError::protocol(
                        StatusCode::BAD_SECURE_CHANNEL_ID_INVALID,
                        format!(
                            "renewed token for channel {}, expected {}",
                            token.channel_id,
                            self.channel.channel_id()
                        ),
                    ));
                }
            }
        }

        self.channel
            .set_remote_nonce(response.server_nonce.unwrap_or_default());
        let keys = self.channel.derive_keys()?;
        self.channel.install_token(token, keys, now);

        if token.revised_lifetime == 0 {
            warn!(
                "server granted token {} of channel {} a zero lifetime, it will not be renewed",
                token.token_id, token.channel_id
            );
            return Ok(None);
        }
        Ok(Some(Duration::from_millis(
            u64::from(token.revised_lifetime) * 3 / 4,
        )))
    }

    /// Give up on the outstanding OpenSecureChannel request
    pub fn on_open_timeout(&mut self) -> Option<PendingOpen> {
        let pending = self.pending_open.take()?;
        if pending.request_type == SecurityTokenRequestType::Renew {
            self.state = ChannelState::Open;
        }
        Some(pending)
    }

    /// Drop the previous token once its grace window is over
    pub fn expire_previous_token(&mut self, now: Instant) {
        if let Some(security) = self.channel.channel_security_mut() {
            security.expire_previous(now);
        }
    }

    /// Build the CloseSecureChannel request body
    pub fn close_request(&mut self, request_id: u32, timeout: Duration) -> Result<Bytes> {
        if !self.state.accepts_traffic() {
            return Err(self.unexpected("CloseSecureChannel"));
        }
        self.state = ChannelState::Closing;
        debug!(
            "sending CloseSecureChannel request_id={} channel_id={}",
            request_id,
            self.channel.channel_id()
        );
        Ok(CloseSecureChannelRequest {
            request_header: RequestHeader::new(
                request_id,
                to_ua_ticks(Utc::now()),
                timeout_hint(timeout),
            ),
        }
        .encode())
    }

    pub fn set_closed(&mut self) {
        self.state = ChannelState::Closed;
        self.pending_open = None;
    }

    fn unexpected(&self, message: &str) -> ChannelError {
        ChannelError::protocol(
            StatusCode::BAD_INTERNAL_ERROR,
            format!("cannot send {} in state {}", message, self.state),
        )
    }
}
