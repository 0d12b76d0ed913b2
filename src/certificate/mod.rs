//! Certificate Trust Validation
//!
//! Validation of a presented certificate chain happens in two phases:
//!
//! 1. [`build_trusted_path`] finds a path from the leaf to a trust anchor
//!    (a self-signed CA among the trusted and issuer certificates) and
//!    requires that at least one certificate on it is explicitly trusted.
//! 2. [`validate_trusted_path`] checks validity periods, key usages,
//!    CA constraints and revocation status along that path.
//!
//! Optional checks are selected with a set of [`ValidationCheck`]s. A check
//! that is not selected is only logged, unless the certificate marks the
//! corresponding extension critical.
//!
//! [`CertificateValidator`] wraps both phases behind a single call and is
//! what the handshake uses.

pub mod cert;
pub mod path;
pub mod revocation;
pub mod validation;
pub mod validator;

use std::collections::HashSet;

use thiserror::Error;

use crate::status::StatusCode;

pub use cert::{Certificate, Crl, KeyUsage, SubjectAltName};
pub use path::{build_trusted_path, TrustPath};
pub use revocation::{CrlRevocationChecker, RevocationChecker, RevocationStatus};
pub use validation::{
    check_application_uri, check_hostname_or_ip, validate_trusted_path, validate_trusted_path_with,
};
pub use validator::{
    rejected_file_name, CertificateValidator, DefaultCertificateValidator,
    InsecureCertificateValidator, TrustList,
};

fn role(issuer: &bool) -> &'static str {
    if *issuer {
        "issuer certificate"
    } else {
        "certificate"
    }
}

/// Certificate validation failures
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CertificateError {
    /// No certificate of the path is explicitly trusted
    #[error("certificate chain untrusted: {0}")]
    Untrusted(String),

    /// Outside its validity period
    #[error("{} time invalid: {reason}", role(.issuer))]
    TimeInvalid { issuer: bool, reason: String },

    /// Listed in a revocation list
    #[error("{} revoked: {reason}", role(.issuer))]
    Revoked { issuer: bool, reason: String },

    /// Revocation status could not be determined
    #[error("{} revocation unknown: {reason}", role(.issuer))]
    RevocationUnknown { issuer: bool, reason: String },

    /// KeyUsage or ExtendedKeyUsage does not allow this use
    #[error("{} use not allowed: {reason}", role(.issuer))]
    UseNotAllowed { issuer: bool, reason: String },

    /// No SubjectAltName DNSName or IPAddress matches
    #[error("certificate host name invalid: {0}")]
    HostNameInvalid(String),

    /// SubjectAltName URI does not match the application URI
    #[error("certificate URI invalid: {0}")]
    UriInvalid(String),

    /// Certificate could not be parsed
    #[error("certificate invalid: {0}")]
    Invalid(String),

    /// Path could not be built or failed a generic check
    #[error("certificate security checks failed: {0}")]
    SecurityChecksFailed(String),
}

impl CertificateError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Untrusted(_) => StatusCode::BAD_CERTIFICATE_UNTRUSTED,
            Self::TimeInvalid { issuer: false, .. } => StatusCode::BAD_CERTIFICATE_TIME_INVALID,
            Self::TimeInvalid { issuer: true, .. } => {
                StatusCode::BAD_CERTIFICATE_ISSUER_TIME_INVALID
            }
            Self::Revoked { issuer: false, .. } => StatusCode::BAD_CERTIFICATE_REVOKED,
            Self::Revoked { issuer: true, .. } => StatusCode::BAD_CERTIFICATE_ISSUER_REVOKED,
            Self::RevocationUnknown { issuer: false, .. } => {
                StatusCode::BAD_CERTIFICATE_REVOCATION_UNKNOWN
            }
            Self::RevocationUnknown { issuer: true, .. } => {
                StatusCode::BAD_CERTIFICATE_ISSUER_REVOCATION_UNKNOWN
            }
            Self::UseNotAllowed { issuer: false, .. } => {
                StatusCode::BAD_CERTIFICATE_USE_NOT_ALLOWED
            }
            Self::UseNotAllowed { issuer: true, .. } => {
                StatusCode::BAD_CERTIFICATE_ISSUER_USE_NOT_ALLOWED
            }
            Self::HostNameInvalid(_) => StatusCode::BAD_CERTIFICATE_HOST_NAME_INVALID,
            Self::UriInvalid(_) => StatusCode::BAD_CERTIFICATE_URI_INVALID,
            Self::Invalid(_) => StatusCode::BAD_CERTIFICATE_INVALID,
            Self::SecurityChecksFailed(_) => StatusCode::BAD_SECURITY_CHECKS_FAILED,
        }
    }
}

/// Optional validation checks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ValidationCheck {
    /// SubjectAltName must match the endpoint host
    Hostname,

    /// Validity period of every certificate in the path
    Validity,

    /// KeyUsage of the end entity
    KeyUsageEndEntity,

    /// ExtendedKeyUsage of the end entity
    ExtendedKeyUsageEndEntity,

    /// KeyUsage of the issuers
    KeyUsageIssuer,

    /// Revoked certificates fail instead of being logged
    Revocation,

    /// Missing revocation lists fail instead of being logged
    RevocationLists,

    /// SubjectAltName URI must match the application URI
    ApplicationUri,
}

impl ValidationCheck {
    /// Every optional check
    pub fn all_optional_checks() -> HashSet<ValidationCheck> {
        [
            Self::Hostname,
            Self::Validity,
            Self::KeyUsageEndEntity,
            Self::ExtendedKeyUsageEndEntity,
            Self::KeyUsageIssuer,
            Self::Revocation,
            Self::RevocationLists,
            Self::ApplicationUri,
        ]
        .into_iter()
        .collect()
    }

    /// No optional check
    pub fn no_optional_checks() -> HashSet<ValidationCheck> {
        HashSet::new()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_distinguish_issuer() {
        let leaf = CertificateError::Revoked {
            issuer: false,
            reason: "serial 1".into(),
        };
        let issuer = CertificateError::Revoked {
            issuer: true,
            reason: "serial 2".into(),
        };
        assert_eq!(leaf.status_code(), StatusCode::BAD_CERTIFICATE_REVOKED);
        assert_eq!(issuer.status_code(), StatusCode::BAD_CERTIFICATE_ISSUER_REVOKED);
        assert_eq!(issuer.to_string(), "issuer certificate revoked: serial 2");
    }

    #[test]
    fn test_all_optional_checks() {
        let checks = ValidationCheck::all_optional_checks();
        assert_eq!(checks.len(), 8);
        assert!(checks.contains(&ValidationCheck::RevocationLists));
        assert!(ValidationCheck::no_optional_checks().is_empty());
    }
}
