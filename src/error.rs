//! Error types for the secure conversation transport

use thiserror::Error;

use crate::certificate::CertificateError;
use crate::status::StatusCode;

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, ChannelError>;

/// Errors raised by the handshake, the chunk framer and the dispatcher
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Handshake step or request did not complete in time
    #[error("timed out: {0}")]
    Timeout(String),

    /// Malformed or unexpected message, version mismatch, or an Error message from the peer
    #[error("protocol error {status}: {reason}")]
    Protocol { status: StatusCode, reason: String },

    /// Message or chunk exceeds a negotiated size or count limit
    #[error("message too large {status}: {reason}")]
    MessageTooLarge { status: StatusCode, reason: String },

    /// A value exceeds a limit of the binary encoding
    #[error("encoding limits exceeded: {0}")]
    EncodingLimitsExceeded(String),

    /// Peer aborted a chunked message
    #[error("message for request {request_id} aborted by peer {status}: {reason}")]
    MessageAbort {
        request_id: u32,
        status: StatusCode,
        reason: String,
    },

    /// Signature, decryption, token, nonce or sequence number check failed
    #[error("security checks failed {status}: {reason}")]
    SecurityChecksFailed { status: StatusCode, reason: String },

    /// Certificate validation failed
    #[error(transparent)]
    Certificate(#[from] CertificateError),

    /// Server answered with a ServiceFault
    #[error("service fault {status}{}", diagnostics_suffix(.diagnostics))]
    ServiceFault {
        status: StatusCode,
        diagnostics: Option<String>,
    },

    /// Connection or channel is gone
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// Socket level failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid client configuration
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Outbound value could not be encoded
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Inbound bytes could not be decoded
    #[error("decoding error: {0}")]
    Decoding(String),
}

fn diagnostics_suffix(diagnostics: &Option<String>) -> String {
    match diagnostics {
        Some(text) if !text.is_empty() => format!(": {}", text),
        _ => String::new(),
    }
}

impl ChannelError {
    pub fn protocol(status: StatusCode, reason: impl Into<String>) -> Self {
        Self::Protocol {
            status,
            reason: reason.into(),
        }
    }

    pub fn security(status: StatusCode, reason: impl Into<String>) -> Self {
        Self::SecurityChecksFailed {
            status,
            reason: reason.into(),
        }
    }

    pub fn too_large(status: StatusCode, reason: impl Into<String>) -> Self {
        Self::MessageTooLarge {
            status,
            reason: reason.into(),
        }
    }

    pub fn decoding(reason: impl Into<String>) -> Self {
        Self::Decoding(reason.into())
    }

    /// Status code reported for this error, e.g. in an Error message or upstream
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Timeout(_) => StatusCode::BAD_TIMEOUT,
            Self::Protocol { status, .. }
            | Self::MessageTooLarge { status, .. }
            | Self::MessageAbort { status, .. }
            | Self::SecurityChecksFailed { status, .. }
            | Self::ServiceFault { status, .. } => *status,
            Self::EncodingLimitsExceeded(_) => StatusCode::BAD_ENCODING_LIMITS_EXCEEDED,
            Self::Certificate(e) => e.status_code(),
            Self::ConnectionClosed(_) => StatusCode::BAD_CONNECTION_CLOSED,
            Self::Io(_) => StatusCode::BAD_COMMUNICATION_ERROR,
            Self::Configuration(_) => StatusCode::BAD_CONFIGURATION_ERROR,
            Self::Encoding(_) => StatusCode::BAD_ENCODING_ERROR,
            Self::Decoding(_) => StatusCode::BAD_DECODING_ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_code_mapping() {
        assert_eq!(
            ChannelError::Timeout("ack".into()).status_code(),
            StatusCode::BAD_TIMEOUT
        );
        assert_eq!(
            ChannelError::from(CertificateError::Untrusted("leaf".into())).status_code(),
            StatusCode::BAD_CERTIFICATE_UNTRUSTED
        );
        let abort = ChannelError::MessageAbort {
            request_id: 7,
            status: StatusCode::BAD_REQUEST_TOO_LARGE,
            reason: "too big".into(),
        };
        assert_eq!(abort.status_code(), StatusCode::BAD_REQUEST_TOO_LARGE);
    }

    #[test]
    fn test_service_fault_display() {
        let fault = ChannelError::ServiceFault {
            status: StatusCode::BAD_SERVICE_UNSUPPORTED,
            diagnostics: Some("no such service".into()),
        };
        assert_eq!(
            fault.to_string(),
            "service fault BAD_SERVICE_UNSUPPORTED (0x800B0000): no such service"
        );
    }
}
