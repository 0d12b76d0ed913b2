//! Building a certificate path to a trust anchor

use log::{trace, warn};

use super::cert::KeyUsage;
use super::{Certificate, CertificateError};

/// Longest chain of intermediates followed while building a path
const MAX_PATH_DEPTH: usize = 8;

/// A path from the end entity up to a trust anchor
///
/// `certificates` starts with the end entity and excludes the anchor. It is
/// empty when the end entity is the anchor itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustPath {
    pub certificates: Vec<Certificate>,
    pub anchor: Certificate,
}

impl TrustPath {
    /// The end entity is itself the trust anchor
    pub fn anchor_is_end_entity(&self) -> bool {
        self.certificates.is_empty()
    }

    pub fn end_entity(&self) -> &Certificate {
        self.certificates.first().unwrap_or(&self.anchor)
    }

    /// Every certificate of the path, anchor last
    pub fn iter(&self) -> impl Iterator<Item = &Certificate> {
        self.certificates.iter().chain(std::iter::once(&self.anchor))
    }
}

/// BasicConstraints cA, or KeyUsage keyCertSign
pub(crate) fn certificate_is_ca(certificate: &Certificate) -> bool {
    let key_cert_sign = certificate
        .key_usage()
        .is_some_and(|ku| ku.contains(KeyUsage::KEY_CERT_SIGN));
    if key_cert_sign && !certificate.is_ca() {
        warn!(
            "'{}' violates RFC 5280: KeyUsage keyCertSign set without BasicConstraints cA",
            certificate.subject_name()
        );
    }
    key_cert_sign || certificate.is_ca()
}

/// Build a path from `chain[0]` to a trust anchor
///
/// Trust anchors are the self-signed CA certificates among `trusted` and
/// `issuers`; a self-signed end entity found in either set anchors itself.
/// Intermediates are taken from the rest of `chain` and from the non
/// self-signed CA certificates of both sets. The path must contain at least
/// one certificate of `trusted`.
pub fn build_trusted_path(
    chain: &[Certificate],
    trusted: &[Certificate],
    issuers: &[Certificate],
) -> Result<TrustPath, CertificateError> {
    let leaf = chain
        .first()
        .ok_or_else(|| CertificateError::Invalid("certificate chain is empty".into()))?;

    trace!(
        "building path for '{}' ({} chain, {} trusted, {} issuers)",
        leaf.subject_name(),
        chain.len(),
        trusted.len(),
        issuers.len()
    );

    let candidates = || trusted.iter().chain(issuers.iter());

    let anchors: Vec<&Certificate> = candidates()
        .filter(|c| c.is_self_signed() && (certificate_is_ca(c) || *c == leaf))
        .collect();

    let mut intermediates: Vec<&Certificate> = chain[1..].iter().collect();
    intermediates.extend(candidates().filter(|c| certificate_is_ca(c) && !c.is_self_signed()));

    let path = if anchors.contains(&leaf) {
        TrustPath {
            certificates: Vec::new(),
            anchor: leaf.clone(),
        }
    } else {
        let mut path = vec![leaf];
        let anchor = extend_path(&mut path, &anchors, &intermediates).ok_or_else(|| {
            CertificateError::SecurityChecksFailed(format!(
                "no certificate path from '{}' to a trust anchor",
                leaf.subject_name()
            ))
        })?;
        TrustPath {
            certificates: path.into_iter().cloned().collect(),
            anchor: anchor.clone(),
        }
    };

    trace!(
        "certificate path: {:?}",
        path.iter().map(Certificate::subject_name).collect::<Vec<_>>()
    );

    if !path.iter().any(|c| trusted.contains(c)) {
        return Err(CertificateError::Untrusted(
            "certificate chain did not contain a trusted certificate".into(),
        ));
    }

    Ok(path)
}

fn extend_path<'a>(
    path: &mut Vec<&'a Certificate>,
    anchors: &[&'a Certificate],
    intermediates: &[&'a Certificate],
) -> Option<&'a Certificate> {
    let current = *path.last()?;

    if let Some(anchor) = anchors.iter().find(|a| current.issued_by(a)) {
        return Some(*anchor);
    }
    if path.len() > MAX_PATH_DEPTH {
        return None;
    }

    for candidate in intermediates {
        if path.contains(candidate) || !current.issued_by(candidate) {
            continue;
        }
        path.push(*candidate);
        if let Some(anchor) = extend_path(path, anchors, intermediates) {
            return Some(anchor);
        }
        path.pop();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;

    #[test]
    fn test_path_through_intermediate() {
        let pki = pki();
        let root = pki.root.certificate();
        let intermediate = pki.intermediate.certificate();
        let leaf = pki.leaf.certificate();

        let path = build_trusted_path(
            &[leaf.clone(), intermediate.clone()],
            &[root.clone()],
            &[],
        )
        .unwrap();
        assert_eq!(path.certificates, vec![leaf.clone(), intermediate.clone()]);
        assert_eq!(path.anchor, root);
        assert!(!path.anchor_is_end_entity());

        // Intermediate supplied through the issuer list instead of the chain
        let path = build_trusted_path(&[leaf.clone()], &[root.clone()], &[intermediate]).unwrap();
        assert_eq!(path.certificates.len(), 2);
    }

    #[test]
    fn test_trusted_leaf_with_untrusted_issuers() {
        let pki = pki();
        let leaf = pki.leaf.certificate();
        let path = build_trusted_path(
            &[leaf.clone()],
            &[leaf.clone()],
            &[pki.root.certificate(), pki.intermediate.certificate()],
        )
        .unwrap();
        assert_eq!(path.end_entity(), &leaf);
    }

    #[test]
    fn test_root_only_in_issuers_is_untrusted() {
        let pki = pki();
        let err = build_trusted_path(
            &[pki.leaf.certificate(), pki.intermediate.certificate()],
            &[],
            &[pki.root.certificate()],
        )
        .unwrap_err();
        assert!(matches!(err, CertificateError::Untrusted(_)));
    }

    #[test]
    fn test_self_signed_leaf_trusted() {
        let issued = self_signed(leaf_params("Self Signed Server"));
        let leaf = issued.certificate();
        let path = build_trusted_path(&[leaf.clone()], &[leaf.clone()], &[]).unwrap();
        assert!(path.anchor_is_end_entity());
        assert_eq!(path.anchor, leaf);

        let err = build_trusted_path(&[leaf.clone()], &[], &[leaf]).unwrap_err();
        assert!(matches!(err, CertificateError::Untrusted(_)));
    }

    #[test]
    fn test_unknown_issuer_fails() {
        let pki = pki();
        let other = self_signed(ca_params("Other Root"));
        let err = build_trusted_path(
            &[pki.leaf.certificate(), pki.intermediate.certificate()],
            &[other.certificate()],
            &[],
        )
        .unwrap_err();
        assert!(matches!(err, CertificateError::SecurityChecksFailed(_)));
    }
}
