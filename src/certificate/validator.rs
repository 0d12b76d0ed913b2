//! Certificate validators used by the handshake

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::SystemTime;

use chrono::Utc;
use log::{debug, info, warn};

use super::validation::validate_trusted_path_with;
use super::{
    build_trusted_path, check_application_uri, check_hostname_or_ip, Certificate,
    CertificateError, Crl, CrlRevocationChecker, RevocationChecker, ValidationCheck,
};

/// Validates the certificate chain presented by the peer
pub trait CertificateValidator: Send + Sync + fmt::Debug {
    /// `chain[0]` is the peer's own certificate, followed by its issuers
    fn validate_certificate_chain(&self, chain: &[Certificate]) -> Result<(), CertificateError>;
}

/// Trusted and issuer certificates with their revocation lists
#[derive(Debug, Clone, Default)]
pub struct TrustList {
    /// Explicitly trusted certificates
    pub trusted: Vec<Certificate>,

    /// CA certificates usable to build a path, not trusted by themselves
    pub issuers: Vec<Certificate>,

    pub trusted_crls: Vec<Crl>,

    pub issuer_crls: Vec<Crl>,
}

impl TrustList {
    /// Load a trust list from a directory tree
    ///
    /// ```text
    /// <root>/trusted/certs   <root>/trusted/crl
    /// <root>/issuers/certs   <root>/issuers/crl
    /// ```
    ///
    /// Missing directories are treated as empty; files that fail to parse
    /// are skipped with a warning.
    pub fn load_from_dir(root: impl AsRef<Path>) -> Result<Self, CertificateError> {
        let root = root.as_ref();
        let trust_list = Self {
            trusted: load_dir(&root.join("trusted").join("certs"), |p| Certificate::from_file(p))?,
            trusted_crls: load_dir(&root.join("trusted").join("crl"), |p| Crl::from_file(p))?,
            issuers: load_dir(&root.join("issuers").join("certs"), |p| Certificate::from_file(p))?,
            issuer_crls: load_dir(&root.join("issuers").join("crl"), |p| Crl::from_file(p))?,
        };
        debug!(
            "loaded trust list from {}: {} trusted, {} issuers, {} CRLs",
            root.display(),
            trust_list.trusted.len(),
            trust_list.issuers.len(),
            trust_list.trusted_crls.len() + trust_list.issuer_crls.len()
        );
        Ok(trust_list)
    }

    /// Every revocation list, trusted and issuer
    pub fn crls(&self) -> Vec<Crl> {
        self.trusted_crls
            .iter()
            .chain(self.issuer_crls.iter())
            .cloned()
            .collect()
    }
}

fn load_dir<T>(
    dir: &Path,
    load: impl Fn(&Path) -> Result<T, CertificateError>,
) -> Result<Vec<T>, CertificateError> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let entries = fs::read_dir(dir).map_err(|e| {
        CertificateError::Invalid(format!("failed to read {}: {}", dir.display(), e))
    })?;

    let mut paths: Vec<_> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file())
        .collect();
    paths.sort();

    let mut items = Vec::with_capacity(paths.len());
    for path in paths {
        match load(&path) {
            Ok(item) => items.push(item),
            Err(e) => warn!("skipping {}: {}", path.display(), e),
        }
    }
    Ok(items)
}

/// Rejected certificates kept on disk before the oldest are deleted
const MAX_REJECTED_CERTIFICATES: usize = 128;

/// Path building and validation against a [`TrustList`]
///
/// Clones share the trust list, a [`reload`](Self::reload) is seen by all of
/// them.
#[derive(Clone)]
pub struct DefaultCertificateValidator {
    trust_list: Arc<RwLock<TrustList>>,
    pki_dir: Option<PathBuf>,
    rejected_dir: Option<PathBuf>,
    checks: HashSet<ValidationCheck>,
    hostnames: Vec<String>,
    application_uri: Option<String>,
    revocation: Option<Arc<dyn RevocationChecker>>,
    end_entity_is_client: bool,
}

impl DefaultCertificateValidator {
    /// Validator with every optional check enabled, validating server certificates
    pub fn new(trust_list: TrustList) -> Self {
        Self {
            trust_list: Arc::new(RwLock::new(trust_list)),
            pki_dir: None,
            rejected_dir: None,
            checks: ValidationCheck::all_optional_checks(),
            hostnames: Vec::new(),
            application_uri: None,
            revocation: None,
            end_entity_is_client: false,
        }
    }

    /// Validator over the trust list stored under `root`
    ///
    /// See [`TrustList::load_from_dir`] for the layout. Certificates of
    /// rejected chains are written to `<root>/rejected`.
    pub fn from_dir(root: impl AsRef<Path>) -> Result<Self, CertificateError> {
        let root = root.as_ref();
        let mut validator = Self::new(TrustList::load_from_dir(root)?);
        validator.pki_dir = Some(root.to_path_buf());
        validator.rejected_dir = Some(root.join("rejected"));
        Ok(validator)
    }

    /// Write the end entity of every rejected chain to `dir`
    pub fn with_rejected_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.rejected_dir = Some(dir.into());
        self
    }

    pub fn with_checks(mut self, checks: HashSet<ValidationCheck>) -> Self {
        self.checks = checks;
        self
    }

    /// Host names or IP addresses the end entity must carry as SubjectAltName
    pub fn with_hostnames<I, S>(mut self, hostnames: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.hostnames = hostnames.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_application_uri(mut self, uri: impl Into<String>) -> Self {
        self.application_uri = Some(uri.into());
        self
    }

    /// Replace the CRL based revocation checker built from the trust list
    pub fn with_revocation_checker(mut self, checker: Arc<dyn RevocationChecker>) -> Self {
        self.revocation = Some(checker);
        self
    }

    /// Validate client certificates (`clientAuth`) instead of server certificates
    pub fn with_end_entity_is_client(mut self, is_client: bool) -> Self {
        self.end_entity_is_client = is_client;
        self
    }

    /// Re-read the trust list from the directory given to [`from_dir`](Self::from_dir)
    ///
    /// Does nothing for a validator built from an in-memory trust list. On
    /// error the current trust list stays in place.
    pub fn reload(&self) -> Result<(), CertificateError> {
        let Some(root) = &self.pki_dir else {
            debug!("trust list is not backed by a directory, nothing to reload");
            return Ok(());
        };
        let trust_list = TrustList::load_from_dir(root)?;
        *self
            .trust_list
            .write()
            .unwrap_or_else(PoisonError::into_inner) = trust_list;
        Ok(())
    }

    /// Snapshot of the current trust list
    pub fn trust_list(&self) -> TrustList {
        self.trust_list
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn rejected_dir(&self) -> Option<&Path> {
        self.rejected_dir.as_deref()
    }

    pub fn checks(&self) -> &HashSet<ValidationCheck> {
        &self.checks
    }

    fn validate(&self, chain: &[Certificate]) -> Result<(), CertificateError> {
        let trust_list = self
            .trust_list
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let path = build_trusted_path(chain, &trust_list.trusted, &trust_list.issuers)?;

        match &self.revocation {
            Some(checker) => validate_trusted_path_with(
                &path,
                checker.as_ref(),
                &self.checks,
                self.end_entity_is_client,
                Utc::now(),
            )?,
            None => {
                let checker = CrlRevocationChecker::new(trust_list.crls());
                validate_trusted_path_with(
                    &path,
                    &checker,
                    &self.checks,
                    self.end_entity_is_client,
                    Utc::now(),
                )?
            }
        }

        self.check_identity(path.end_entity())?;

        debug!(
            "certificate chain of '{}' validated",
            path.end_entity().subject_name()
        );
        Ok(())
    }

    fn check_identity(&self, end_entity: &Certificate) -> Result<(), CertificateError> {
        if !self.hostnames.is_empty() {
            let names: Vec<&str> = self.hostnames.iter().map(String::as_str).collect();
            if let Err(e) = check_hostname_or_ip(end_entity, &names) {
                if self.checks.contains(&ValidationCheck::Hostname) {
                    return Err(e);
                }
                warn!("hostname check suppressed: {}", e);
            }
        }
        if let Some(uri) = &self.application_uri {
            if let Err(e) = check_application_uri(end_entity, uri) {
                if self.checks.contains(&ValidationCheck::ApplicationUri) {
                    return Err(e);
                }
                warn!("application URI check suppressed: {}", e);
            }
        }
        Ok(())
    }

    fn reject(&self, certificate: &Certificate) {
        let Some(dir) = &self.rejected_dir else {
            return;
        };
        match store_rejected(dir, certificate) {
            Ok(path) => info!("added rejected certificate {}", path.display()),
            Err(e) => warn!(
                "failed to store rejected certificate '{}' in {}: {}",
                certificate.subject_name(),
                dir.display(),
                e
            ),
        }
    }
}

impl CertificateValidator for DefaultCertificateValidator {
    fn validate_certificate_chain(&self, chain: &[Certificate]) -> Result<(), CertificateError> {
        let result = self.validate(chain);
        if result.is_err() {
            if let Some(end_entity) = chain.first() {
                self.reject(end_entity);
            }
        }
        result
    }
}

impl fmt::Debug for DefaultCertificateValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let trust_list = self
            .trust_list
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("DefaultCertificateValidator")
            .field("trusted", &trust_list.trusted.len())
            .field("issuers", &trust_list.issuers.len())
            .field("pki_dir", &self.pki_dir)
            .field("rejected_dir", &self.rejected_dir)
            .field("checks", &self.checks)
            .field("hostnames", &self.hostnames)
            .field("application_uri", &self.application_uri)
            .field("end_entity_is_client", &self.end_entity_is_client)
            .finish()
    }
}

/// File name of a rejected certificate: `<sha1 thumbprint> [<CN>].der`
pub fn rejected_file_name(certificate: &Certificate) -> String {
    let thumbprint: String = certificate
        .thumbprint()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect();
    let name: String = certificate
        .common_name()
        .unwrap_or_else(|| certificate.subject_name())
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, ' ' | '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{} [{}].der", thumbprint, name)
}

fn store_rejected(dir: &Path, certificate: &Certificate) -> io::Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let path = dir.join(rejected_file_name(certificate));
    if !path.exists() {
        prune_rejected(dir)?;
    }
    fs::write(&path, certificate.der())?;
    Ok(path)
}

/// Delete the oldest files until one more fits under the limit
fn prune_rejected(dir: &Path) -> io::Result<()> {
    let mut files: Vec<(SystemTime, PathBuf)> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let metadata = entry.metadata().ok()?;
            metadata.is_file().then(|| {
                (
                    metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                    entry.path(),
                )
            })
        })
        .collect();
    if files.len() < MAX_REJECTED_CERTIFICATES {
        return Ok(());
    }

    files.sort();
    let excess = files.len() + 1 - MAX_REJECTED_CERTIFICATES;
    for (_, path) in files.into_iter().take(excess) {
        debug!("pruning rejected certificate {}", path.display());
        if let Err(e) = fs::remove_file(&path) {
            warn!("failed to delete {}: {}", path.display(), e);
        }
    }
    Ok(())
}

/// Accepts every certificate chain
///
/// Only for testing against servers with throwaway certificates.
#[derive(Debug, Clone, Copy, Default)]
pub struct InsecureCertificateValidator;

impl CertificateValidator for InsecureCertificateValidator {
    fn validate_certificate_chain(&self, chain: &[Certificate]) -> Result<(), CertificateError> {
        if let Some(leaf) = chain.first() {
            warn!(
                "accepting certificate '{}' without validation",
                leaf.subject_name()
            );
        }
        Ok(())
    }
}
