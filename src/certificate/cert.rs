//! X.509 certificates and revocation lists
//!
//! Certificates are parsed once with `x509-parser` into an owned
//! representation holding only what validation needs. The DER is kept for
//! signature checks, thumbprints and re-encoding into security headers.

use std::fmt;
use std::fs;
use std::net::IpAddr;
use std::path::Path;

use chrono::{DateTime, Utc};
use sha1::{Digest, Sha1};
use x509_parser::extensions::{GeneralName, ParsedExtension};
use x509_parser::prelude::{parse_x509_certificate, parse_x509_crl, X509Certificate};

use super::CertificateError;

/// KeyUsage bits (RFC 5280 order)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyUsage(u16);

impl KeyUsage {
    pub const DIGITAL_SIGNATURE: u16 = 1 << 0;
    pub const NON_REPUDIATION: u16 = 1 << 1;
    pub const KEY_ENCIPHERMENT: u16 = 1 << 2;
    pub const DATA_ENCIPHERMENT: u16 = 1 << 3;
    pub const KEY_AGREEMENT: u16 = 1 << 4;
    pub const KEY_CERT_SIGN: u16 = 1 << 5;
    pub const CRL_SIGN: u16 = 1 << 6;

    pub fn contains(&self, bits: u16) -> bool {
        self.0 & bits == bits
    }
}

/// SubjectAltName entries relevant to OPC UA
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubjectAltName {
    Uri(String),
    DnsName(String),
    IpAddress(IpAddr),
}

/// A parsed X.509 certificate
#[derive(Clone)]
pub struct Certificate {
    der: Vec<u8>,
    subject: Vec<u8>,
    issuer: Vec<u8>,
    subject_name: String,
    common_name: Option<String>,
    serial: Vec<u8>,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
    is_ca: bool,
    key_usage: Option<KeyUsage>,
    key_usage_critical: bool,
    extended_key_usage: Option<(bool, bool)>,
    extended_key_usage_critical: bool,
    subject_alt_names: Vec<SubjectAltName>,
    public_key: Vec<u8>,
}

fn timestamp(secs: i64) -> Result<DateTime<Utc>, CertificateError> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| CertificateError::Invalid(format!("validity timestamp {} out of range", secs)))
}

fn strip_leading_zeros(bytes: &[u8]) -> &[u8] {
    let first = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    &bytes[first..]
}

impl Certificate {
    /// Parse a single DER encoded certificate
    pub fn from_der(der: &[u8]) -> Result<Self, CertificateError> {
        let (rest, x509) = parse_x509_certificate(der)
            .map_err(|e| CertificateError::Invalid(format!("failed to parse certificate: {}", e)))?;
        if !rest.is_empty() {
            return Err(CertificateError::Invalid(format!(
                "{} trailing bytes after certificate",
                rest.len()
            )));
        }
        Self::from_parsed(der, &x509)
    }

    fn from_parsed(der: &[u8], x509: &X509Certificate<'_>) -> Result<Self, CertificateError> {
        let mut cert = Self {
            der: der.to_vec(),
            subject: x509.subject().as_raw().to_vec(),
            issuer: x509.issuer().as_raw().to_vec(),
            subject_name: x509.subject().to_string(),
            common_name: x509
                .subject()
                .iter_common_name()
                .next()
                .and_then(|cn| cn.as_str().ok())
                .map(str::to_string),
            serial: x509.raw_serial().to_vec(),
            not_before: timestamp(x509.validity().not_before.timestamp())?,
            not_after: timestamp(x509.validity().not_after.timestamp())?,
            is_ca: false,
            key_usage: None,
            key_usage_critical: false,
            extended_key_usage: None,
            extended_key_usage_critical: false,
            subject_alt_names: Vec::new(),
            public_key: x509.public_key().raw.to_vec(),
        };

        for extension in x509.extensions() {
            match extension.parsed_extension() {
                ParsedExtension::BasicConstraints(bc) => cert.is_ca = bc.ca,
                ParsedExtension::KeyUsage(ku) => {
                    let mut bits = 0u16;
                    for (set, bit) in [
                        (ku.digital_signature(), KeyUsage::DIGITAL_SIGNATURE),
                        (ku.non_repudiation(), KeyUsage::NON_REPUDIATION),
                        (ku.key_encipherment(), KeyUsage::KEY_ENCIPHERMENT),
                        (ku.data_encipherment(), KeyUsage::DATA_ENCIPHERMENT),
                        (ku.key_agreement(), KeyUsage::KEY_AGREEMENT),
                        (ku.key_cert_sign(), KeyUsage::KEY_CERT_SIGN),
                        (ku.crl_sign(), KeyUsage::CRL_SIGN),
                    ] {
                        if set {
                            bits |= bit;
                        }
                    }
                    cert.key_usage = Some(KeyUsage(bits));
                    cert.key_usage_critical = extension.critical;
                }
                ParsedExtension::ExtendedKeyUsage(eku) => {
                    cert.extended_key_usage =
                        Some((eku.server_auth || eku.any, eku.client_auth || eku.any));
                    cert.extended_key_usage_critical = extension.critical;
                }
                ParsedExtension::SubjectAlternativeName(san) => {
                    for name in &san.general_names {
                        match name {
                            GeneralName::URI(uri) => {
                                cert.subject_alt_names.push(SubjectAltName::Uri(uri.to_string()))
                            }
                            GeneralName::DNSName(dns) => cert
                                .subject_alt_names
                                .push(SubjectAltName::DnsName(dns.to_string())),
                            GeneralName::IPAddress(ip) => {
                                let addr = match ip.len() {
                                    4 => <[u8; 4]>::try_from(*ip).ok().map(IpAddr::from),
                                    16 => <[u8; 16]>::try_from(*ip).ok().map(IpAddr::from),
                                    _ => None,
                                };
                                if let Some(addr) = addr {
                                    cert.subject_alt_names.push(SubjectAltName::IpAddress(addr));
                                }
                            }
                            _ => {}
                        }
                    }
                }
                _ => {}
            }
        }

        Ok(cert)
    }

    /// Split a ByteString holding one or more concatenated DER certificates
    pub fn decode_chain(der: &[u8]) -> Result<Vec<Certificate>, CertificateError> {
        let mut chain = Vec::new();
        let mut remaining = der;
        while !remaining.is_empty() {
            let (rest, x509) = parse_x509_certificate(remaining).map_err(|e| {
                CertificateError::Invalid(format!(
                    "failed to parse certificate {} of chain: {}",
                    chain.len(),
                    e
                ))
            })?;
            let consumed = remaining.len() - rest.len();
            chain.push(Self::from_parsed(&remaining[..consumed], &x509)?);
            remaining = rest;
        }
        if chain.is_empty() {
            return Err(CertificateError::Invalid("empty certificate chain".into()));
        }
        Ok(chain)
    }

    /// Concatenate the DER of a chain
    pub fn encode_chain(chain: &[Certificate]) -> Vec<u8> {
        chain.iter().flat_map(|c| c.der.iter().copied()).collect()
    }

    /// Load a DER or PEM encoded certificate file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, CertificateError> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(|e| {
            CertificateError::Invalid(format!("failed to read {}: {}", path.display(), e))
        })?;
        if bytes.starts_with(b"-----BEGIN") {
            let (_, pem) = x509_parser::pem::parse_x509_pem(&bytes).map_err(|e| {
                CertificateError::Invalid(format!("failed to parse PEM {}: {}", path.display(), e))
            })?;
            Self::from_der(&pem.contents)
        } else {
            Self::from_der(&bytes)
        }
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }

    pub fn subject_name(&self) -> &str {
        &self.subject_name
    }

    /// First CN attribute of the subject
    pub fn common_name(&self) -> Option<&str> {
        self.common_name.as_deref()
    }

    pub fn serial(&self) -> &[u8] {
        &self.serial
    }

    pub fn not_before(&self) -> DateTime<Utc> {
        self.not_before
    }

    pub fn not_after(&self) -> DateTime<Utc> {
        self.not_after
    }

    /// BasicConstraints marks this certificate as a CA
    pub fn is_ca(&self) -> bool {
        self.is_ca
    }

    pub fn key_usage(&self) -> Option<KeyUsage> {
        self.key_usage
    }

    pub fn key_usage_critical(&self) -> bool {
        self.key_usage_critical
    }

    /// `(serverAuth, clientAuth)` when the extension is present
    pub fn extended_key_usage(&self) -> Option<(bool, bool)> {
        self.extended_key_usage
    }

    pub fn extended_key_usage_critical(&self) -> bool {
        self.extended_key_usage_critical
    }

    pub fn subject_alt_names(&self) -> &[SubjectAltName] {
        &self.subject_alt_names
    }

    /// DER encoded SubjectPublicKeyInfo
    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    /// SHA-1 over the DER encoding, as used in security headers
    pub fn thumbprint(&self) -> [u8; 20] {
        let digest = Sha1::digest(&self.der);
        let mut thumbprint = [0u8; 20];
        thumbprint.copy_from_slice(&digest);
        thumbprint
    }

    pub fn is_valid_at(&self, time: DateTime<Utc>) -> bool {
        self.not_before <= time && time <= self.not_after
    }

    /// Subject and issuer names are equal
    pub fn is_self_issued(&self) -> bool {
        self.subject == self.issuer
    }

    /// Self-issued and verifiable with its own public key
    pub fn is_self_signed(&self) -> bool {
        self.is_self_issued() && self.issued_by(self)
    }

    /// `issuer`'s subject matches our issuer name and its key verifies our signature
    pub fn issued_by(&self, issuer: &Certificate) -> bool {
        if self.issuer != issuer.subject {
            return false;
        }
        let (Ok((_, child)), Ok((_, parent))) =
            (parse_x509_certificate(&self.der), parse_x509_certificate(&issuer.der))
        else {
            return false;
        };
        child.verify_signature(Some(parent.public_key())).is_ok()
    }

    pub(crate) fn issuer_raw(&self) -> &[u8] {
        &self.issuer
    }

    pub(crate) fn subject_raw(&self) -> &[u8] {
        &self.subject
    }

    pub(crate) fn serial_matches(&self, serial: &[u8]) -> bool {
        strip_leading_zeros(&self.serial) == strip_leading_zeros(serial)
    }
}

impl PartialEq for Certificate {
    fn eq(&self, other: &Self) -> bool {
        self.der == other.der
    }
}

impl Eq for Certificate {}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("subject", &self.subject_name)
            .field("not_after", &self.not_after)
            .field("is_ca", &self.is_ca)
            .finish_non_exhaustive()
    }
}

/// A parsed certificate revocation list
///
/// CRLs are matched to issuers by name. They come from the operator's trust
/// list, which is trusted as a whole.
#[derive(Debug, Clone)]
pub struct Crl {
    der: Vec<u8>,
    issuer: Vec<u8>,
    issuer_name: String,
    next_update: Option<DateTime<Utc>>,
    revoked_serials: Vec<Vec<u8>>,
}

impl Crl {
    pub fn from_der(der: &[u8]) -> Result<Self, CertificateError> {
        let (_, crl) = parse_x509_crl(der)
            .map_err(|e| CertificateError::Invalid(format!("failed to parse CRL: {}", e)))?;
        let next_update = match crl.next_update() {
            Some(time) => Some(timestamp(time.timestamp())?),
            None => None,
        };
        Ok(Self {
            der: der.to_vec(),
            issuer: crl.issuer().as_raw().to_vec(),
            issuer_name: crl.issuer().to_string(),
            next_update,
            revoked_serials: crl
                .iter_revoked_certificates()
                .map(|revoked| revoked.raw_serial().to_vec())
                .collect(),
        })
    }

    /// Load a DER or PEM encoded CRL file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, CertificateError> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(|e| {
            CertificateError::Invalid(format!("failed to read {}: {}", path.display(), e))
        })?;
        if bytes.starts_with(b"-----BEGIN") {
            let (_, pem) = x509_parser::pem::parse_x509_pem(&bytes).map_err(|e| {
                CertificateError::Invalid(format!("failed to parse PEM {}: {}", path.display(), e))
            })?;
            Self::from_der(&pem.contents)
        } else {
            Self::from_der(&bytes)
        }
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }

    pub fn issuer_name(&self) -> &str {
        &self.issuer_name
    }

    pub fn next_update(&self) -> Option<DateTime<Utc>> {
        self.next_update
    }

    /// CRL was published by `issuer`
    pub fn is_issued_by(&self, issuer: &Certificate) -> bool {
        self.issuer == issuer.subject_raw()
    }

    pub fn is_revoked(&self, certificate: &Certificate) -> bool {
        certificate.issuer_raw() == self.issuer.as_slice()
            && self
                .revoked_serials
                .iter()
                .any(|serial| certificate.serial_matches(serial))
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;

    #[test]
    fn test_parse_leaf_extensions() {
        let pki = pki();
        let leaf = pki.leaf.certificate();

        assert!(!leaf.is_ca());
        assert!(!leaf.is_self_issued());
        assert_eq!(leaf.common_name(), Some("Test Server"));
        let usage = leaf.key_usage().unwrap();
        assert!(usage.contains(
            KeyUsage::DIGITAL_SIGNATURE
                | KeyUsage::NON_REPUDIATION
                | KeyUsage::KEY_ENCIPHERMENT
                | KeyUsage::DATA_ENCIPHERMENT
        ));
        assert!(!usage.contains(KeyUsage::KEY_CERT_SIGN));
        assert_eq!(leaf.extended_key_usage(), Some((true, true)));
        assert!(leaf
            .subject_alt_names()
            .contains(&SubjectAltName::Uri("urn:example:server".into())));
        assert!(leaf
            .subject_alt_names()
            .contains(&SubjectAltName::IpAddress("10.0.0.7".parse().unwrap())));
    }

    #[test]
    fn test_issued_by_checks_signature() {
        let pki = pki();
        let root = pki.root.certificate();
        let intermediate = pki.intermediate.certificate();
        let leaf = pki.leaf.certificate();

        assert!(root.is_self_signed());
        assert!(root.is_ca());
        assert!(intermediate.issued_by(&root));
        assert!(leaf.issued_by(&intermediate));
        assert!(!leaf.issued_by(&root));

        // Same subject name, different key
        let impostor = self_signed(ca_params("Test Intermediate CA")).certificate();
        assert!(!leaf.issued_by(&impostor));
    }

    #[test]
    fn test_decode_chain() {
        let pki = pki();
        let chain = vec![pki.leaf.certificate(), pki.intermediate.certificate()];
        let encoded = Certificate::encode_chain(&chain);
        let decoded = Certificate::decode_chain(&encoded).unwrap();
        assert_eq!(decoded, chain);
        assert_eq!(decoded[0].thumbprint().len(), 20);

        assert!(Certificate::decode_chain(&encoded[..encoded.len() - 1]).is_err());
        assert!(Certificate::decode_chain(&[]).is_err());
    }
}
