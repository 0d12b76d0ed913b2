//! Revocation checking

use std::fmt;

use chrono::{DateTime, Utc};

use super::{Certificate, Crl};

/// Outcome of a revocation lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevocationStatus {
    /// A current revocation list of the issuer does not list the certificate
    Good,

    /// The certificate is listed as revoked
    Revoked,

    /// No usable revocation information for the issuer
    Unknown,
}

/// Source of revocation information for certificates on a trust path
pub trait RevocationChecker: Send + Sync + fmt::Debug {
    fn status(
        &self,
        certificate: &Certificate,
        issuer: &Certificate,
        now: DateTime<Utc>,
    ) -> RevocationStatus;

    /// Unknown status is logged instead of failing, even when revocation lists are required
    fn soft_fail(&self) -> bool {
        false
    }
}

/// Revocation checker backed by a fixed set of CRLs
#[derive(Debug, Clone, Default)]
pub struct CrlRevocationChecker {
    crls: Vec<Crl>,
    soft_fail: bool,
}

impl CrlRevocationChecker {
    pub fn new(crls: Vec<Crl>) -> Self {
        Self {
            crls,
            soft_fail: false,
        }
    }

    pub fn with_soft_fail(mut self, soft_fail: bool) -> Self {
        self.soft_fail = soft_fail;
        self
    }

    pub fn crls(&self) -> &[Crl] {
        &self.crls
    }
}

impl RevocationChecker for CrlRevocationChecker {
    fn status(
        &self,
        certificate: &Certificate,
        issuer: &Certificate,
        now: DateTime<Utc>,
    ) -> RevocationStatus {
        let mut current_list_found = false;
        for crl in self.crls.iter().filter(|crl| crl.is_issued_by(issuer)) {
            if crl.is_revoked(certificate) {
                return RevocationStatus::Revoked;
            }
            if crl.next_update().map_or(true, |next| next >= now) {
                current_list_found = true;
            }
        }
        if current_list_found {
            RevocationStatus::Good
        } else {
            RevocationStatus::Unknown
        }
    }

    fn soft_fail(&self) -> bool {
        self.soft_fail
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use rcgen::{
        date_time_ymd, CertificateRevocationListParams, KeyIdMethod, RevokedCertParams,
        SerialNumber,
    };

    use super::super::testing::*;
    use super::*;

    /// CRL issued by `issuer` revoking the given serial numbers
    pub(crate) fn crl(issuer: &Issued, revoked: &[u64]) -> Crl {
        let params = CertificateRevocationListParams {
            this_update: date_time_ymd(2024, 1, 1),
            next_update: date_time_ymd(2089, 1, 1),
            crl_number: SerialNumber::from(1u64),
            issuing_distribution_point: None,
            revoked_certs: revoked
                .iter()
                .map(|serial| RevokedCertParams {
                    serial_number: SerialNumber::from(*serial),
                    revocation_time: date_time_ymd(2024, 1, 1),
                    reason_code: None,
                    invalidity_date: None,
                })
                .collect(),
            key_identifier_method: KeyIdMethod::Sha256,
        };
        let list = params.signed_by(&issuer.cert, &issuer.key).unwrap();
        Crl::from_der(list.der()).unwrap()
    }

    #[test]
    fn test_crl_status() {
        let root = self_signed(ca_params("CRL Root"));
        let mut params = leaf_params("Revoked Leaf");
        params.serial_number = Some(SerialNumber::from(0x1234u64));
        let revoked = signed_by(params, &root).certificate();
        let mut params = leaf_params("Good Leaf");
        params.serial_number = Some(SerialNumber::from(0x5678u64));
        let good = signed_by(params, &root).certificate();
        let now = Utc::now();

        let checker = CrlRevocationChecker::new(vec![crl(&root, &[0x1234])]);
        let root_cert = root.certificate();
        assert_eq!(checker.status(&revoked, &root_cert, now), RevocationStatus::Revoked);
        assert_eq!(checker.status(&good, &root_cert, now), RevocationStatus::Good);

        let empty = CrlRevocationChecker::default();
        assert_eq!(empty.status(&good, &root_cert, now), RevocationStatus::Unknown);
        assert!(!empty.soft_fail());
        assert!(empty.with_soft_fail(true).soft_fail());
    }
}
