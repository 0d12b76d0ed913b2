//! Client configuration

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::certificate::{
    Certificate, CertificateValidator, DefaultCertificateValidator, TrustList,
};
use crate::channel::SecureChannel;
use crate::error::{ChannelError, Result};
use crate::security::{security_policy_from_uri, uris, MessageSecurityMode, PrivateKey};
use crate::transport::EncodingLimits;

/// Default TCP connect timeout (5 seconds)
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default time to wait for the server's Acknowledge (5 seconds)
pub const DEFAULT_ACKNOWLEDGE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default request timeout (60 seconds)
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Default requested security token lifetime (1 hour, in milliseconds)
pub const DEFAULT_CHANNEL_LIFETIME: u32 = 3_600_000;

/// Port used when the endpoint URL carries none
pub const DEFAULT_PORT: u16 = 4840;

/// Called with the cause whenever a connecting or open channel goes down
pub type ChannelInactiveListener = Arc<dyn Fn(&ChannelError) + Send + Sync>;

/// Secure conversation client configuration
#[derive(Clone)]
pub struct UascClientConfig {
    /// Server endpoint (e.g., "opc.tcp://localhost:4840/UA/Server")
    pub endpoint_url: String,

    /// Security policy URI, see [`crate::security::uris`]
    pub security_policy_uri: String,

    pub security_mode: MessageSecurityMode,

    /// Client certificate chain, leaf first
    pub certificate_chain: Vec<Certificate>,

    /// Private key of the client certificate
    pub private_key: Option<PrivateKey>,

    /// Certificate of the server endpoint
    pub server_certificate: Option<Certificate>,

    /// Validates the certificate chain presented by the server
    pub certificate_validator: Arc<dyn CertificateValidator>,

    /// Chunk and message limits announced in Hello
    pub encoding_limits: EncodingLimits,

    /// TCP connect timeout
    pub connect_timeout: Duration,

    /// Hello / Acknowledge timeout
    pub acknowledge_timeout: Duration,

    /// Default per-request timeout, also used for OpenSecureChannel
    pub request_timeout: Duration,

    /// Requested security token lifetime in milliseconds
    pub channel_lifetime: u32,

    pub channel_inactive_listener: Option<ChannelInactiveListener>,
}

impl Default for UascClientConfig {
    fn default() -> Self {
        Self {
            endpoint_url: String::new(),
            security_policy_uri: uris::NONE.to_string(),
            security_mode: MessageSecurityMode::None,
            certificate_chain: Vec::new(),
            private_key: None,
            server_certificate: None,
            // Empty trust list: every server certificate is rejected until one is trusted
            certificate_validator: Arc::new(DefaultCertificateValidator::new(TrustList::default())),
            encoding_limits: EncodingLimits::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            acknowledge_timeout: DEFAULT_ACKNOWLEDGE_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            channel_lifetime: DEFAULT_CHANNEL_LIFETIME,
            channel_inactive_listener: None,
        }
    }
}

impl fmt::Debug for UascClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UascClientConfig")
            .field("endpoint_url", &self.endpoint_url)
            .field("security_policy_uri", &self.security_policy_uri)
            .field("security_mode", &self.security_mode)
            .field(
                "certificate",
                &self.certificate_chain.first().map(Certificate::subject_name),
            )
            .field(
                "server_certificate",
                &self.server_certificate.as_ref().map(Certificate::subject_name),
            )
            .field("certificate_validator", &self.certificate_validator)
            .field("encoding_limits", &self.encoding_limits)
            .field("connect_timeout", &self.connect_timeout)
            .field("acknowledge_timeout", &self.acknowledge_timeout)
            .field("request_timeout", &self.request_timeout)
            .field("channel_lifetime", &self.channel_lifetime)
            .finish_non_exhaustive()
    }
}

impl UascClientConfig {
    pub fn builder(endpoint_url: impl Into<String>) -> UascClientConfigBuilder {
        UascClientConfigBuilder {
            config: Self {
                endpoint_url: endpoint_url.into(),
                ..Default::default()
            },
        }
    }

    /// Check the configuration before any socket is opened
    pub fn validate(&self) -> Result<()> {
        if self.endpoint_url.is_empty() {
            return Err(ChannelError::Configuration("endpoint URL required".into()));
        }
        if self.request_timeout.is_zero() || self.acknowledge_timeout.is_zero() {
            return Err(ChannelError::Configuration(
                "timeouts must be greater than zero".into(),
            ));
        }
        self.secure_channel()?.check_configuration()
    }

    /// Fresh channel state for one connection attempt
    pub(crate) fn secure_channel(&self) -> Result<SecureChannel> {
        let policy = security_policy_from_uri(&self.security_policy_uri)
            .map_err(|e| ChannelError::Configuration(e.to_string()))?;
        let mut channel = SecureChannel::new(policy, self.security_mode);
        if let Some(key) = &self.private_key {
            channel = channel.with_local_certificate(self.certificate_chain.clone(), key.clone());
        }
        if let Some(certificate) = &self.server_certificate {
            channel = channel.with_remote_certificate(certificate.clone());
        }
        Ok(channel)
    }
}

/// Builder for [`UascClientConfig`]
#[derive(Debug)]
pub struct UascClientConfigBuilder {
    config: UascClientConfig,
}

impl UascClientConfigBuilder {
    pub fn security(mut self, policy_uri: impl Into<String>, mode: MessageSecurityMode) -> Self {
        self.config.security_policy_uri = policy_uri.into();
        self.config.security_mode = mode;
        self
    }

    /// Client certificate chain (leaf first) and its private key
    pub fn certificate(mut self, chain: Vec<Certificate>, private_key: PrivateKey) -> Self {
        self.config.certificate_chain = chain;
        self.config.private_key = Some(private_key);
        self
    }

    pub fn server_certificate(mut self, certificate: Certificate) -> Self {
        self.config.server_certificate = Some(certificate);
        self
    }

    pub fn certificate_validator(mut self, validator: Arc<dyn CertificateValidator>) -> Self {
        self.config.certificate_validator = validator;
        self
    }

    pub fn encoding_limits(mut self, limits: EncodingLimits) -> Self {
        self.config.encoding_limits = limits;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn acknowledge_timeout(mut self, timeout: Duration) -> Self {
        self.config.acknowledge_timeout = timeout;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// Requested token lifetime in milliseconds
    pub fn channel_lifetime(mut self, lifetime: u32) -> Self {
        self.config.channel_lifetime = lifetime;
        self
    }

    pub fn on_channel_inactive<F>(mut self, listener: F) -> Self
    where
        F: Fn(&ChannelError) + Send + Sync + 'static,
    {
        self.config.channel_inactive_listener = Some(Arc::new(listener));
        self
    }

    pub fn build(self) -> Result<UascClientConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certificate::InsecureCertificateValidator;
    use crate::security::basic256sha256::tests::{test_certificate, test_key_pair};

    #[test]
    fn test_default_config() {
        let config = UascClientConfig::default();
        assert_eq!(config.security_policy_uri, uris::NONE);
        assert_eq!(config.security_mode, MessageSecurityMode::None);
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
        assert_eq!(config.acknowledge_timeout, Duration::from_secs(5));
        assert_eq!(config.request_timeout, Duration::from_secs(60));
        assert_eq!(config.channel_lifetime, 3_600_000);
        assert_eq!(config.encoding_limits, EncodingLimits::default());
    }

    #[test]
    fn test_builder_none_policy() {
        let config = UascClientConfig::builder("opc.tcp://localhost:4840")
            .request_timeout(Duration::from_secs(10))
            .channel_lifetime(60_000)
            .build()
            .unwrap();
        assert_eq!(config.endpoint_url, "opc.tcp://localhost:4840");
        assert_eq!(config.request_timeout, Duration::from_secs(10));
        assert_eq!(config.channel_lifetime, 60_000);
    }

    #[test]
    fn test_missing_endpoint_rejected() {
        let result = UascClientConfig::default().validate();
        assert!(matches!(result, Err(ChannelError::Configuration(_))));
    }

    #[test]
    fn test_secure_policy_requires_certificates() {
        let result = UascClientConfig::builder("opc.tcp://localhost:4840")
            .security(uris::BASIC256_SHA256, MessageSecurityMode::SignAndEncrypt)
            .build();
        assert!(matches!(result, Err(ChannelError::Configuration(_))));

        let config = UascClientConfig::builder("opc.tcp://localhost:4840")
            .security(uris::BASIC256_SHA256, MessageSecurityMode::Sign)
            .certificate(vec![test_certificate().clone()], test_key_pair().0.clone())
            .server_certificate(test_certificate().clone())
            .certificate_validator(Arc::new(InsecureCertificateValidator))
            .build()
            .unwrap();
        let channel = config.secure_channel().unwrap();
        assert!(channel.is_symmetric_signing_enabled());
        assert!(!channel.is_symmetric_encryption_enabled());
    }

    #[test]
    fn test_unknown_policy_rejected() {
        let result = UascClientConfig::builder("opc.tcp://localhost:4840")
            .security("http://example.com/NoSuchPolicy", MessageSecurityMode::Sign)
            .build();
        assert!(matches!(result, Err(ChannelError::Configuration(_))));
    }
}
