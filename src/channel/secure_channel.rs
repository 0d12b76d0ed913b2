//! Secure channel state and the security tokens installed on it

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use log::debug;

use crate::certificate::Certificate;
use crate::encoding::ChannelSecurityToken;
use crate::error::{ChannelError, Result};
use crate::security::{KeySet, MessageSecurityMode, PrivateKey, SecretKeys, SecurityPolicy};
use crate::status::StatusCode;

/// Token and keys installed by one OpenSecureChannel exchange
#[derive(Debug, Clone)]
struct InstalledToken {
    token: ChannelSecurityToken,
    keys: KeySet,
    installed_at: Instant,
}

impl InstalledToken {
    /// Instant the token's revised lifetime runs out, measured from local installation
    fn expires_at(&self) -> Instant {
        self.installed_at + Duration::from_millis(u64::from(self.token.revised_lifetime))
    }
}

/// Current security token of a channel plus the one it replaced
///
/// After a renewal the previous token stays usable for decoding until its own
/// revised lifetime has elapsed, so responses the server protected with the
/// old keys are still accepted.
#[derive(Debug, Clone)]
pub struct ChannelSecurity {
    current: InstalledToken,
    previous: Option<InstalledToken>,
}

impl ChannelSecurity {
    pub fn new(token: ChannelSecurityToken, keys: KeySet, now: Instant) -> Self {
        Self {
            current: InstalledToken {
                token,
                keys,
                installed_at: now,
            },
            previous: None,
        }
    }

    /// Install a renewed token, keeping the current one as grace fallback
    pub fn renew(self, token: ChannelSecurityToken, keys: KeySet, now: Instant) -> Self {
        Self {
            current: InstalledToken {
                token,
                keys,
                installed_at: now,
            },
            previous: Some(self.current),
        }
    }

    pub fn current_token(&self) -> &ChannelSecurityToken {
        &self.current.token
    }

    pub fn current_keys(&self) -> &KeySet {
        &self.current.keys
    }

    pub fn previous_token(&self) -> Option<&ChannelSecurityToken> {
        self.previous.as_ref().map(|p| &p.token)
    }

    /// Keys to decode a message protected with `token_id`
    ///
    /// The previous token is only accepted inside its grace window.
    pub fn keys_for_token(&self, token_id: u32, now: Instant) -> Option<&KeySet> {
        if token_id == self.current.token.token_id {
            return Some(&self.current.keys);
        }
        self.previous
            .as_ref()
            .filter(|p| p.token.token_id == token_id && now < p.expires_at())
            .map(|p| &p.keys)
    }

    /// Drop the previous token once its grace window has closed
    pub fn expire_previous(&mut self, now: Instant) {
        if let Some(previous) = &self.previous {
            if now >= previous.expires_at() {
                debug!(
                    "token {} of channel {} expired",
                    previous.token.token_id, previous.token.channel_id
                );
                self.previous = None;
            }
        }
    }
}

/// Local view of one secure channel
///
/// The channel id is 0 until the first OpenSecureChannel response assigns
/// one. Nonces are only generated when symmetric signing is enabled.
#[derive(Debug)]
pub struct SecureChannel {
    channel_id: u32,
    policy: Arc<dyn SecurityPolicy>,
    mode: MessageSecurityMode,
    local_certificate_chain: Vec<Certificate>,
    private_key: Option<PrivateKey>,
    remote_certificate: Option<Certificate>,
    local_nonce: Bytes,
    remote_nonce: Bytes,
    channel_security: Option<ChannelSecurity>,
}

impl SecureChannel {
    pub fn new(policy: Arc<dyn SecurityPolicy>, mode: MessageSecurityMode) -> Self {
        Self {
            channel_id: 0,
            policy,
            mode,
            local_certificate_chain: Vec::new(),
            private_key: None,
            remote_certificate: None,
            local_nonce: Bytes::new(),
            remote_nonce: Bytes::new(),
            channel_security: None,
        }
    }

    /// Our certificate chain, leaf first, and the matching private key
    pub fn with_local_certificate(mut self, chain: Vec<Certificate>, key: PrivateKey) -> Self {
        self.local_certificate_chain = chain;
        self.private_key = Some(key);
        self
    }

    pub fn with_remote_certificate(mut self, certificate: Certificate) -> Self {
        self.remote_certificate = Some(certificate);
        self
    }

    /// Check that the policy, mode and certificates fit together
    pub fn check_configuration(&self) -> Result<()> {
        if self.policy.is_none() {
            if self.mode != MessageSecurityMode::None {
                return Err(ChannelError::Configuration(format!(
                    "security mode {:?} requires a security policy",
                    self.mode
                )));
            }
            return Ok(());
        }
        if self.mode == MessageSecurityMode::None {
            return Err(ChannelError::Configuration(format!(
                "security policy {} requires mode Sign or SignAndEncrypt",
                self.policy.uri()
            )));
        }
        if self.local_certificate().is_none() || self.private_key.is_none() {
            return Err(ChannelError::Configuration(
                "client certificate and private key required".into(),
            ));
        }
        if self.remote_certificate.is_none() {
            return Err(ChannelError::Configuration(
                "server certificate required".into(),
            ));
        }
        Ok(())
    }

    pub fn channel_id(&self) -> u32 {
        self.channel_id
    }

    pub(crate) fn set_channel_id(&mut self, channel_id: u32) {
        self.channel_id = channel_id;
    }

    pub fn policy(&self) -> &dyn SecurityPolicy {
        self.policy.as_ref()
    }

    pub fn mode(&self) -> MessageSecurityMode {
        self.mode
    }

    pub fn local_certificate(&self) -> Option<&Certificate> {
        self.local_certificate_chain.first()
    }

    pub fn local_certificate_chain(&self) -> &[Certificate] {
        &self.local_certificate_chain
    }

    pub fn private_key(&self) -> Option<&PrivateKey> {
        self.private_key.as_ref()
    }

    pub fn remote_certificate(&self) -> Option<&Certificate> {
        self.remote_certificate.as_ref()
    }

    pub(crate) fn require_private_key(&self) -> Result<&PrivateKey> {
        self.private_key.as_ref().ok_or_else(|| {
            ChannelError::Configuration("private key required for asymmetric security".into())
        })
    }

    /// SubjectPublicKeyInfo of the server certificate
    pub(crate) fn require_remote_public_key(&self) -> Result<&[u8]> {
        self.remote_certificate
            .as_ref()
            .map(Certificate::public_key)
            .ok_or_else(|| {
                ChannelError::Configuration(
                    "server certificate required for asymmetric security".into(),
                )
            })
    }

    pub fn local_nonce(&self) -> &Bytes {
        &self.local_nonce
    }

    pub(crate) fn set_local_nonce(&mut self, nonce: Bytes) {
        self.local_nonce = nonce;
    }

    pub fn remote_nonce(&self) -> &Bytes {
        &self.remote_nonce
    }

    pub(crate) fn set_remote_nonce(&mut self, nonce: Bytes) {
        self.remote_nonce = nonce;
    }

    pub fn channel_security(&self) -> Option<&ChannelSecurity> {
        self.channel_security.as_ref()
    }

    pub(crate) fn channel_security_mut(&mut self) -> Option<&mut ChannelSecurity> {
        self.channel_security.as_mut()
    }

    pub(crate) fn require_channel_security(&self) -> Result<&ChannelSecurity> {
        self.channel_security.as_ref().ok_or_else(|| {
            ChannelError::protocol(
                StatusCode::BAD_SECURE_CHANNEL_TOKEN_UNKNOWN,
                "no security token installed",
            )
        })
    }

    /// Install a token, retaining the current one for the grace window
    pub fn install_token(&mut self, token: ChannelSecurityToken, keys: KeySet, now: Instant) {
        let security = match self.channel_security.take() {
            Some(current) => current.renew(token, keys, now),
            None => ChannelSecurity::new(token, keys, now),
        };
        debug!(
            "channel {} installed token {} (previous {:?}, lifetime {} ms)",
            token.channel_id,
            token.token_id,
            security.previous_token().map(|t| t.token_id),
            token.revised_lifetime
        );
        self.channel_security = Some(security);
    }

    /// Derive both directions' keys from the exchanged nonces
    ///
    /// We sign and encrypt with keys seeded by our own nonce and keyed by the
    /// server's, and verify with the mirror image.
    pub fn derive_keys(&self) -> Result<KeySet> {
        if !self.is_symmetric_signing_enabled() {
            return Ok(KeySet {
                local: SecretKeys::empty(),
                remote: SecretKeys::empty(),
            });
        }
        Ok(KeySet {
            local: self.policy.derive_keys(&self.remote_nonce, &self.local_nonce)?,
            remote: self.policy.derive_keys(&self.local_nonce, &self.remote_nonce)?,
        })
    }

    pub fn is_asymmetric_signing_enabled(&self) -> bool {
        !self.policy.is_none()
            && self.local_certificate().is_some()
            && self.remote_certificate.is_some()
    }

    pub fn is_asymmetric_encryption_enabled(&self) -> bool {
        self.is_asymmetric_signing_enabled()
    }

    pub fn is_symmetric_signing_enabled(&self) -> bool {
        !self.policy.is_none()
            && matches!(
                self.mode,
                MessageSecurityMode::Sign | MessageSecurityMode::SignAndEncrypt
            )
    }

    pub fn is_symmetric_encryption_enabled(&self) -> bool {
        !self.policy.is_none() && self.mode == MessageSecurityMode::SignAndEncrypt
    }

    /// Concatenated DER chain sent as sender certificate
    pub(crate) fn local_certificate_chain_bytes(&self) -> Option<Bytes> {
        if self.local_certificate_chain.is_empty() {
            None
        } else {
            Some(Bytes::from(Certificate::encode_chain(&self.local_certificate_chain)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::testing::ToyPolicy;
    use crate::security::NonePolicy;

    fn token(token_id: u32, revised_lifetime: u32) -> ChannelSecurityToken {
        ChannelSecurityToken {
            channel_id: 7,
            token_id,
            created_at: 0,
            revised_lifetime,
        }
    }

    fn keys(tag: u8) -> KeySet {
        KeySet {
            local: SecretKeys::new(vec![tag; 32], vec![tag; 32], vec![tag; 16]),
            remote: SecretKeys::new(vec![tag + 1; 32], vec![tag + 1; 32], vec![tag + 1; 16]),
        }
    }

    #[test]
    fn test_grace_window() {
        let start = Instant::now();
        let security = ChannelSecurity::new(token(1, 10_000), keys(1), start);
        let renewed_at = start + Duration::from_millis(7_500);
        let security = security.renew(token(2, 10_000), keys(3), renewed_at);

        assert_eq!(security.current_token().token_id, 2);
        assert_eq!(security.previous_token().map(|t| t.token_id), Some(1));
        assert_eq!(security.keys_for_token(2, renewed_at), Some(&keys(3)));
        assert_eq!(security.keys_for_token(1, renewed_at), Some(&keys(1)));

        // Previous token expires 10 s after its own installation
        let expiry = start + Duration::from_millis(10_000);
        assert!(security.keys_for_token(1, expiry - Duration::from_millis(1)).is_some());
        assert!(security.keys_for_token(1, expiry).is_none());
        assert!(security.keys_for_token(2, expiry).is_some());
        assert!(security.keys_for_token(9, renewed_at).is_none());
    }

    #[test]
    fn test_second_renewal_drops_oldest() {
        let now = Instant::now();
        let mut channel = SecureChannel::new(Arc::new(NonePolicy), MessageSecurityMode::None);
        channel.install_token(token(1, 1000), keys(1), now);
        channel.install_token(token(2, 1000), keys(3), now);
        channel.install_token(token(3, 1000), keys(5), now);

        let security = channel.channel_security().unwrap();
        assert_eq!(security.current_token().token_id, 3);
        assert_eq!(security.previous_token().map(|t| t.token_id), Some(2));
        assert!(security.keys_for_token(1, now).is_none());
    }

    #[test]
    fn test_expire_previous() {
        let now = Instant::now();
        let mut security = ChannelSecurity::new(token(1, 100), keys(1), now).renew(
            token(2, 100),
            keys(3),
            now,
        );
        security.expire_previous(now + Duration::from_millis(50));
        assert!(security.previous_token().is_some());
        security.expire_previous(now + Duration::from_millis(100));
        assert!(security.previous_token().is_none());
    }

    #[test]
    fn test_security_predicates() {
        let none = SecureChannel::new(Arc::new(NonePolicy), MessageSecurityMode::None);
        assert!(!none.is_symmetric_signing_enabled());
        assert!(!none.is_asymmetric_signing_enabled());
        none.check_configuration().unwrap();

        let sign = SecureChannel::new(
            Arc::new(ToyPolicy { key_size: 64 }),
            MessageSecurityMode::Sign,
        );
        assert!(sign.is_symmetric_signing_enabled());
        assert!(!sign.is_symmetric_encryption_enabled());
        // No certificates configured
        assert!(!sign.is_asymmetric_signing_enabled());
        assert!(sign.check_configuration().is_err());

        let encrypt = SecureChannel::new(
            Arc::new(ToyPolicy { key_size: 64 }),
            MessageSecurityMode::SignAndEncrypt,
        );
        assert!(encrypt.is_symmetric_encryption_enabled());

        let mismatched = SecureChannel::new(Arc::new(NonePolicy), MessageSecurityMode::Sign);
        assert!(mismatched.check_configuration().is_err());
    }

    #[test]
    fn test_unsigned_channel_derives_empty_keys() {
        let channel = SecureChannel::new(Arc::new(NonePolicy), MessageSecurityMode::None);
        let keys = channel.derive_keys().unwrap();
        assert_eq!(keys.local, SecretKeys::empty());
        assert_eq!(keys.remote, SecretKeys::empty());
    }

    #[test]
    fn test_derived_keys_mirror() {
        let policy: Arc<dyn SecurityPolicy> = Arc::new(ToyPolicy { key_size: 64 });
        let mut client = SecureChannel::new(policy.clone(), MessageSecurityMode::Sign);
        client.set_local_nonce(Bytes::from_static(&[1; 32]));
        client.set_remote_nonce(Bytes::from_static(&[2; 32]));
        let mut server = SecureChannel::new(policy, MessageSecurityMode::Sign);
        server.set_local_nonce(Bytes::from_static(&[2; 32]));
        server.set_remote_nonce(Bytes::from_static(&[1; 32]));

        let client_keys = client.derive_keys().unwrap();
        let server_keys = server.derive_keys().unwrap();
        assert_eq!(client_keys.local, server_keys.remote);
        assert_eq!(client_keys.remote, server_keys.local);
        assert_ne!(client_keys.local, client_keys.remote);
    }
}
