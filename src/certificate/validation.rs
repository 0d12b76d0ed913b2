//! Validation of a built trust path and the standalone certificate checks

use std::collections::HashSet;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use log::{debug, warn};

use super::cert::KeyUsage;
use super::path::certificate_is_ca;
use super::revocation::{CrlRevocationChecker, RevocationChecker, RevocationStatus};
use super::{Certificate, CertificateError, Crl, SubjectAltName, TrustPath, ValidationCheck};

const END_ENTITY_KEY_USAGE: [(u16, &str); 4] = [
    (KeyUsage::DIGITAL_SIGNATURE, "digitalSignature"),
    (KeyUsage::NON_REPUDIATION, "nonRepudiation"),
    (KeyUsage::KEY_ENCIPHERMENT, "keyEncipherment"),
    (KeyUsage::DATA_ENCIPHERMENT, "dataEncipherment"),
];

const ISSUER_KEY_USAGE: [(u16, &str); 3] = [
    (KeyUsage::DIGITAL_SIGNATURE, "digitalSignature"),
    (KeyUsage::KEY_CERT_SIGN, "keyCertSign"),
    (KeyUsage::CRL_SIGN, "cRLSign"),
];

/// Validate a trust path against the supplied CRLs
///
/// `end_entity_is_client` selects whether the end entity needs the
/// `clientAuth` or the `serverAuth` extended key usage.
pub fn validate_trusted_path(
    path: &TrustPath,
    crls: &[Crl],
    checks: &HashSet<ValidationCheck>,
    end_entity_is_client: bool,
) -> Result<(), CertificateError> {
    let checker = CrlRevocationChecker::new(crls.to_vec());
    validate_trusted_path_with(path, &checker, checks, end_entity_is_client, Utc::now())
}

/// Validate a trust path with an arbitrary revocation checker at a given time
pub fn validate_trusted_path_with(
    path: &TrustPath,
    revocation: &dyn RevocationChecker,
    checks: &HashSet<ValidationCheck>,
    end_entity_is_client: bool,
    now: DateTime<Utc>,
) -> Result<(), CertificateError> {
    let anchor_is_end_entity = path.anchor_is_end_entity();
    check_anchor(
        &path.anchor,
        checks,
        anchor_is_end_entity,
        end_entity_is_client,
        now,
    )?;

    if anchor_is_end_entity {
        return Ok(());
    }

    for (index, certificate) in path.certificates.iter().enumerate() {
        let issuer = path.certificates.get(index + 1).unwrap_or(&path.anchor);
        let is_issuer = index > 0;

        debug!(
            "validating path index={} certificate='{}'",
            index,
            certificate.subject_name()
        );

        if !certificate.issued_by(issuer) {
            return Err(CertificateError::SecurityChecksFailed(format!(
                "'{}' is not signed by '{}'",
                certificate.subject_name(),
                issuer.subject_name()
            )));
        }
        if !certificate_is_ca(issuer) {
            return Err(CertificateError::SecurityChecksFailed(format!(
                "issuer '{}' is not a CA",
                issuer.subject_name()
            )));
        }

        enforce(
            check_validity(certificate, !is_issuer, now),
            checks.contains(&ValidationCheck::Validity),
        )?;

        if is_issuer {
            enforce(
                check_issuer_key_usage(certificate),
                checks.contains(&ValidationCheck::KeyUsageIssuer) || certificate.key_usage_critical(),
            )?;
        } else {
            check_end_entity_usage(certificate, checks, end_entity_is_client)?;
        }

        check_revocation(certificate, issuer, is_issuer, revocation, checks, now)?;
    }

    Ok(())
}

fn check_anchor(
    anchor: &Certificate,
    checks: &HashSet<ValidationCheck>,
    anchor_is_end_entity: bool,
    end_entity_is_client: bool,
    now: DateTime<Utc>,
) -> Result<(), CertificateError> {
    enforce(
        check_validity(anchor, anchor_is_end_entity, now),
        checks.contains(&ValidationCheck::Validity),
    )?;

    if anchor_is_end_entity {
        check_end_entity_usage(anchor, checks, end_entity_is_client)
    } else {
        enforce(
            check_issuer_key_usage(anchor),
            checks.contains(&ValidationCheck::KeyUsageIssuer) || anchor.key_usage_critical(),
        )
    }
}

fn check_end_entity_usage(
    certificate: &Certificate,
    checks: &HashSet<ValidationCheck>,
    end_entity_is_client: bool,
) -> Result<(), CertificateError> {
    enforce(
        check_end_entity_key_usage(certificate),
        checks.contains(&ValidationCheck::KeyUsageEndEntity) || certificate.key_usage_critical(),
    )?;
    enforce(
        check_end_entity_extended_key_usage(certificate, end_entity_is_client),
        checks.contains(&ValidationCheck::ExtendedKeyUsageEndEntity)
            || certificate.extended_key_usage_critical(),
    )
}

fn check_revocation(
    certificate: &Certificate,
    issuer: &Certificate,
    is_issuer: bool,
    revocation: &dyn RevocationChecker,
    checks: &HashSet<ValidationCheck>,
    now: DateTime<Utc>,
) -> Result<(), CertificateError> {
    match revocation.status(certificate, issuer, now) {
        RevocationStatus::Good => Ok(()),
        RevocationStatus::Revoked => enforce(
            Err(CertificateError::Revoked {
                issuer: is_issuer,
                reason: format!("'{}' is revoked", certificate.subject_name()),
            }),
            checks.contains(&ValidationCheck::Revocation),
        ),
        RevocationStatus::Unknown => enforce(
            Err(CertificateError::RevocationUnknown {
                issuer: is_issuer,
                reason: format!(
                    "no revocation list found for issuer '{}'",
                    issuer.subject_name()
                ),
            }),
            checks.contains(&ValidationCheck::RevocationLists) && !revocation.soft_fail(),
        ),
    }
}

/// Fail with `result` when the check is enforced, otherwise log and continue
fn enforce(result: Result<(), CertificateError>, enforced: bool) -> Result<(), CertificateError> {
    match result {
        Err(e) if enforced => Err(e),
        Err(e) => {
            warn!("check suppressed for certificate: {}", e);
            Ok(())
        }
        Ok(()) => Ok(()),
    }
}

/// Check that `now` lies within the validity period
pub fn check_validity(
    certificate: &Certificate,
    end_entity: bool,
    now: DateTime<Utc>,
) -> Result<(), CertificateError> {
    if certificate.is_valid_at(now) {
        return Ok(());
    }
    Err(CertificateError::TimeInvalid {
        issuer: !end_entity,
        reason: format!(
            "'{}' valid from {} until {}",
            certificate.subject_name(),
            certificate.not_before(),
            certificate.not_after()
        ),
    })
}

pub fn check_end_entity_key_usage(certificate: &Certificate) -> Result<(), CertificateError> {
    let usage = certificate
        .key_usage()
        .ok_or_else(|| CertificateError::UseNotAllowed {
            issuer: false,
            reason: "KeyUsage extension not found".into(),
        })?;
    for (bit, name) in END_ENTITY_KEY_USAGE {
        if !usage.contains(bit) {
            return Err(CertificateError::UseNotAllowed {
                issuer: false,
                reason: format!("required KeyUsage '{}' not found", name),
            });
        }
    }
    Ok(())
}

/// Require `clientAuth` for client certificates and `serverAuth` for server certificates
pub fn check_end_entity_extended_key_usage(
    certificate: &Certificate,
    end_entity_is_client: bool,
) -> Result<(), CertificateError> {
    let (server_auth, client_auth) =
        certificate
            .extended_key_usage()
            .ok_or_else(|| CertificateError::UseNotAllowed {
                issuer: false,
                reason: "ExtendedKeyUsage extension not found".into(),
            })?;
    let (present, name) = if end_entity_is_client {
        (client_auth, "clientAuth")
    } else {
        (server_auth, "serverAuth")
    };
    if !present {
        return Err(CertificateError::UseNotAllowed {
            issuer: false,
            reason: format!("required ExtendedKeyUsage '{}' not found", name),
        });
    }
    Ok(())
}

pub fn check_issuer_key_usage(certificate: &Certificate) -> Result<(), CertificateError> {
    let usage = certificate
        .key_usage()
        .ok_or_else(|| CertificateError::UseNotAllowed {
            issuer: true,
            reason: format!(
                "KeyUsage extension not found on '{}'",
                certificate.subject_name()
            ),
        })?;
    for (bit, name) in ISSUER_KEY_USAGE {
        if !usage.contains(bit) {
            return Err(CertificateError::UseNotAllowed {
                issuer: true,
                reason: format!(
                    "required KeyUsage '{}' not found on '{}'",
                    name,
                    certificate.subject_name()
                ),
            });
        }
    }
    Ok(())
}

/// Match any of `hostnames` against the SubjectAltName DNSName and IPAddress entries
pub fn check_hostname_or_ip(
    certificate: &Certificate,
    hostnames: &[&str],
) -> Result<(), CertificateError> {
    let matches = |hostname: &str| {
        let ip = hostname
            .trim_start_matches('[')
            .trim_end_matches(']')
            .parse::<IpAddr>()
            .ok();
        certificate.subject_alt_names().iter().any(|name| match name {
            SubjectAltName::DnsName(dns) => dns.eq_ignore_ascii_case(hostname),
            SubjectAltName::IpAddress(addr) => Some(*addr) == ip,
            SubjectAltName::Uri(_) => false,
        })
    };

    if hostnames.iter().any(|h| matches(h)) {
        Ok(())
    } else {
        Err(CertificateError::HostNameInvalid(format!(
            "no SubjectAltName of '{}' matches {:?}",
            certificate.subject_name(),
            hostnames
        )))
    }
}

/// Match the application URI against the SubjectAltName URI entries
pub fn check_application_uri(
    certificate: &Certificate,
    application_uri: &str,
) -> Result<(), CertificateError> {
    let found = certificate
        .subject_alt_names()
        .iter()
        .any(|name| matches!(name, SubjectAltName::Uri(uri) if uri == application_uri));
    if found {
        Ok(())
    } else {
        Err(CertificateError::UriInvalid(format!(
            "'{}' does not carry application URI {}",
            certificate.subject_name(),
            application_uri
        )))
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use rcgen::{date_time_ymd, KeyUsagePurpose, SerialNumber};

    use super::super::revocation::tests::crl;
    use super::super::testing::*;
    use super::super::build_trusted_path;
    use super::*;

    fn all() -> HashSet<ValidationCheck> {
        ValidationCheck::all_optional_checks()
    }

    fn path_of(pki: &Pki) -> TrustPath {
        build_trusted_path(
            &[pki.leaf.certificate(), pki.intermediate.certificate()],
            &[pki.root.certificate()],
            &[],
        )
        .unwrap()
    }

    fn crls_for(pki: &Pki) -> Vec<Crl> {
        vec![crl(&pki.root, &[]), crl(&pki.intermediate, &[])]
    }

    #[test]
    fn test_valid_path_with_all_checks() {
        let pki = pki();
        validate_trusted_path(&path_of(&pki), &crls_for(&pki), &all(), false).unwrap();
        validate_trusted_path(&path_of(&pki), &crls_for(&pki), &all(), true).unwrap();
    }

    #[test]
    fn test_expired_end_entity() {
        let pki = pki();
        let mut params = leaf_params("Expired Server");
        params.not_before = date_time_ymd(2000, 1, 1);
        params.not_after = date_time_ymd(2001, 1, 1);
        let expired = signed_by(params, &pki.intermediate);
        let path = build_trusted_path(
            &[expired.certificate(), pki.intermediate.certificate()],
            &[pki.root.certificate()],
            &[],
        )
        .unwrap();

        let err = validate_trusted_path(&path, &crls_for(&pki), &all(), false).unwrap_err();
        assert!(matches!(err, CertificateError::TimeInvalid { issuer: false, .. }));

        let mut checks = all();
        checks.remove(&ValidationCheck::Validity);
        validate_trusted_path(&path, &crls_for(&pki), &checks, false).unwrap();
    }

    #[test]
    fn test_expired_issuer_maps_to_issuer_error() {
        let pki = pki();
        let path = path_of(&pki);
        let later = Utc.with_ymd_and_hms(2095, 1, 1, 0, 0, 0).unwrap();
        let checker = CrlRevocationChecker::new(crls_for(&pki));
        // The anchor is checked first and is expired as well
        let err = validate_trusted_path_with(&path, &checker, &all(), false, later).unwrap_err();
        assert!(matches!(err, CertificateError::TimeInvalid { issuer: true, .. }));
    }

    #[test]
    fn test_revoked_end_entity_and_issuer() {
        let root = self_signed(ca_params("Revoking Root"));
        let mut params = ca_params("Revoked Intermediate");
        params.serial_number = Some(SerialNumber::from(77u64));
        let intermediate = signed_by(params, &root);
        let mut params = leaf_params("Revoked Server");
        params.serial_number = Some(SerialNumber::from(99u64));
        let leaf = signed_by(params, &intermediate);

        let path = build_trusted_path(
            &[leaf.certificate(), intermediate.certificate()],
            &[root.certificate()],
            &[],
        )
        .unwrap();

        let crls = vec![crl(&root, &[]), crl(&intermediate, &[99])];
        let err = validate_trusted_path(&path, &crls, &all(), false).unwrap_err();
        assert!(matches!(err, CertificateError::Revoked { issuer: false, .. }));
        assert!(err.to_string().contains("Revoked Server"));

        let crls = vec![crl(&root, &[77]), crl(&intermediate, &[])];
        let err = validate_trusted_path(&path, &crls, &all(), false).unwrap_err();
        assert!(matches!(err, CertificateError::Revoked { issuer: true, .. }));

        // Revocation not enforced: logged only
        let mut checks = all();
        checks.remove(&ValidationCheck::Revocation);
        validate_trusted_path(&path, &crls, &checks, false).unwrap();
    }

    #[test]
    fn test_missing_crl() {
        let pki = pki();
        let path = path_of(&pki);

        let err = validate_trusted_path(&path, &[], &all(), false).unwrap_err();
        assert!(matches!(
            err,
            CertificateError::RevocationUnknown { issuer: false, .. }
        ));

        let checker = CrlRevocationChecker::default().with_soft_fail(true);
        validate_trusted_path_with(&path, &checker, &all(), false, Utc::now()).unwrap();

        let mut checks = all();
        checks.remove(&ValidationCheck::RevocationLists);
        validate_trusted_path(&path, &[], &checks, false).unwrap();
    }

    #[test]
    fn test_key_usage_suppression_and_critical() {
        let pki = pki();
        let mut params = leaf_params("Signing Only");
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        let leaf = signed_by(params, &pki.intermediate);
        let path = build_trusted_path(
            &[leaf.certificate(), pki.intermediate.certificate()],
            &[pki.root.certificate()],
            &[],
        )
        .unwrap();

        let err = validate_trusted_path(&path, &crls_for(&pki), &all(), false).unwrap_err();
        assert_eq!(err.status_code(), crate::StatusCode::BAD_CERTIFICATE_USE_NOT_ALLOWED);

        let mut checks = all();
        checks.remove(&ValidationCheck::KeyUsageEndEntity);
        // rcgen marks KeyUsage critical, so it cannot be suppressed
        assert!(leaf.certificate().key_usage_critical());
        assert!(validate_trusted_path(&path, &crls_for(&pki), &checks, false).is_err());
    }

    #[test]
    fn test_extended_key_usage_role() {
        let pki = pki();
        let mut params = leaf_params("Client Only");
        params.extended_key_usages = vec![rcgen::ExtendedKeyUsagePurpose::ClientAuth];
        let leaf = signed_by(params, &pki.intermediate);
        let path = build_trusted_path(
            &[leaf.certificate(), pki.intermediate.certificate()],
            &[pki.root.certificate()],
            &[],
        )
        .unwrap();

        validate_trusted_path(&path, &crls_for(&pki), &all(), true).unwrap();
        let err = validate_trusted_path(&path, &crls_for(&pki), &all(), false).unwrap_err();
        assert!(matches!(err, CertificateError::UseNotAllowed { issuer: false, .. }));

        let mut checks = all();
        checks.remove(&ValidationCheck::ExtendedKeyUsageEndEntity);
        validate_trusted_path(&path, &crls_for(&pki), &checks, false).unwrap();
    }

    #[test]
    fn test_hostname_and_uri() {
        let leaf = pki().leaf.certificate();
        check_hostname_or_ip(&leaf, &["SERVER.example.com"]).unwrap();
        check_hostname_or_ip(&leaf, &["other", "10.0.0.7"]).unwrap();
        let err = check_hostname_or_ip(&leaf, &["plc.example.com"]).unwrap_err();
        assert_eq!(err.status_code(), crate::StatusCode::BAD_CERTIFICATE_HOST_NAME_INVALID);

        check_application_uri(&leaf, "urn:example:server").unwrap();
        let err = check_application_uri(&leaf, "urn:example:client").unwrap_err();
        assert_eq!(err.status_code(), crate::StatusCode::BAD_CERTIFICATE_URI_INVALID);
    }
}
