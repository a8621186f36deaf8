//! gRPC channel configuration

use gun_proto::{ServicePaths, DEFAULT_SERVICE_NAME};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::backoff::BackoffConfig;
use crate::error::{TransportError, TransportResult};

/// ALPN protocol negotiated for gRPC
const ALPN_H2: &[u8] = b"h2";

/// TLS settings shared by both ends
#[derive(Debug, Clone, Default)]
pub struct SecurityConfig {
    /// Run HTTP/2 without TLS
    pub cleartext: bool,

    /// SNI / authority override (client)
    pub server_name: Option<String>,

    /// Extra trusted roots (client). Bundled webpki roots are always trusted.
    pub root_certs: Vec<CertificateDer<'static>>,
}

/// Server certificate chain and private key
pub struct ServerIdentity {
    pub certs: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

impl std::fmt::Debug for ServerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerIdentity")
            .field("certs", &self.certs.len())
            .finish()
    }
}

/// Configuration for both the dialer and the listener
#[derive(Debug, Clone)]
pub struct GrpcConfig {
    /// Security configuration
    security: SecurityConfig,

    /// Server credentials, `None` on clients and cleartext servers
    identity: Option<Arc<ServerIdentity>>,

    /// gRPC service name
    pub service_name: String,

    /// Reconnect backoff (client)
    pub backoff: BackoffConfig,

    /// Upper bound for one connection attempt including the TLS handshake
    pub min_connect_timeout: Duration,

    /// Initial stream window size
    pub initial_window_size: u32,

    /// Initial connection window size
    pub initial_connection_window_size: u32,

    /// Maximum concurrent streams (server)
    pub max_concurrent_streams: u32,

    /// Maximum frame size
    pub max_frame_size: u32,
}

impl GrpcConfig {
    fn base(security: SecurityConfig, identity: Option<Arc<ServerIdentity>>) -> Self {
        Self {
            security,
            identity,
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            backoff: BackoffConfig::default(),
            min_connect_timeout: Duration::from_secs(5),
            initial_window_size: 1024 * 1024, // 1MB
            initial_connection_window_size: 4 * 1024 * 1024,
            max_concurrent_streams: 1000,
            max_frame_size: 16 * 1024, // 16KB (HTTP/2 default)
        }
    }

    /// Create a client configuration with defaults (TLS, webpki roots)
    pub fn client_default() -> Self {
        Self::base(SecurityConfig::default(), None)
    }

    /// Create a TLS server configuration from PEM files
    pub fn server_from_pem(cert_path: &Path, key_path: &Path) -> TransportResult<Self> {
        let certs = load_certs(cert_path)?;
        let key = load_private_key(key_path)?;
        Ok(Self::server_with_identity(certs, key))
    }

    /// Create a TLS server configuration from an in-memory certificate chain and key
    pub fn server_with_identity(
        certs: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> Self {
        Self::base(
            SecurityConfig::default(),
            Some(Arc::new(ServerIdentity { certs, key })),
        )
    }

    /// Create a server configuration without TLS
    pub fn server_cleartext() -> Self {
        Self::base(SecurityConfig::default(), None).with_cleartext()
    }

    /// Disable TLS (HTTP/2 prior knowledge)
    pub fn with_cleartext(mut self) -> Self {
        self.security.cleartext = true;
        self
    }

    /// Override the TLS server name and `:authority`
    pub fn with_server_name(mut self, server_name: impl Into<String>) -> Self {
        let server_name = server_name.into();
        self.security.server_name = if server_name.is_empty() {
            None
        } else {
            Some(server_name)
        };
        self
    }

    /// Trust an additional root certificate
    pub fn with_root_cert(mut self, cert: CertificateDer<'static>) -> Self {
        self.security.root_certs.push(cert);
        self
    }

    /// Trust every certificate in a PEM bundle
    pub fn with_root_certs_pem(mut self, path: &Path) -> TransportResult<Self> {
        let certs = load_certs(path)?;
        if certs.is_empty() {
            return Err(TransportError::TlsError(format!(
                "No certificates found in {}",
                path.display()
            )));
        }
        self.security.root_certs.extend(certs);
        Ok(self)
    }

    pub fn with_service_name(mut self, service_name: impl Into<String>) -> Self {
        self.service_name = service_name.into();
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.min_connect_timeout = timeout;
        self
    }

    pub fn security(&self) -> &SecurityConfig {
        &self.security
    }

    pub fn is_cleartext(&self) -> bool {
        self.security.cleartext
    }

    pub fn service_paths(&self) -> ServicePaths {
        ServicePaths::new(&self.service_name)
    }

    pub fn validate(&self) -> TransportResult<()> {
        if self.initial_window_size == 0 {
            return Err(TransportError::ConfigurationError(
                "Initial window size must be > 0".to_string(),
            ));
        }
        if !(16 * 1024..=16 * 1024 * 1024 - 1).contains(&self.max_frame_size) {
            return Err(TransportError::ConfigurationError(format!(
                "Max frame size {} outside the HTTP/2 range",
                self.max_frame_size
            )));
        }
        if self.backoff.multiplier < 1.0 {
            return Err(TransportError::ConfigurationError(
                "Backoff multiplier must be >= 1.0".to_string(),
            ));
        }
        Ok(())
    }

    /// Build rustls TlsConnector for the client
    pub(crate) fn build_tls_connector(&self) -> TransportResult<tokio_rustls::TlsConnector> {
        ensure_crypto_provider();

        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        for cert in &self.security.root_certs {
            roots.add(cert.clone()).map_err(|e| {
                TransportError::ConfigurationError(format!("Invalid root cert: {}", e))
            })?;
        }

        let mut client_crypto = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        client_crypto.alpn_protocols = vec![ALPN_H2.to_vec()];

        Ok(tokio_rustls::TlsConnector::from(Arc::new(client_crypto)))
    }

    /// Build rustls TlsAcceptor for the server
    pub(crate) fn build_tls_acceptor(&self) -> TransportResult<tokio_rustls::TlsAcceptor> {
        ensure_crypto_provider();

        let identity = self.identity.as_ref().ok_or_else(|| {
            TransportError::ConfigurationError(
                "Server certificate and key required unless cleartext".to_string(),
            )
        })?;

        let mut server_crypto = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(identity.certs.clone(), identity.key.clone_key())
            .map_err(|e| TransportError::TlsError(format!("Invalid cert/key: {}", e)))?;
        server_crypto.alpn_protocols = vec![ALPN_H2.to_vec()];

        Ok(tokio_rustls::TlsAcceptor::from(Arc::new(server_crypto)))
    }
}

// Initialize rustls crypto provider
static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("Rustls crypto provider already installed");
        }
    });
}

fn load_certs(path: &Path) -> TransportResult<Vec<CertificateDer<'static>>> {
    let file = File::open(path).map_err(|e| {
        TransportError::TlsError(format!(
            "Failed to open cert file {}: {}",
            path.display(),
            e
        ))
    })?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::TlsError(format!("Failed to parse certs: {}", e)))
}

fn load_private_key(path: &Path) -> TransportResult<PrivateKeyDer<'static>> {
    let file = File::open(path).map_err(|e| {
        TransportError::TlsError(format!(
            "Failed to open key file {}: {}",
            path.display(),
            e
        ))
    })?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TransportError::TlsError(format!("Failed to parse key: {}", e)))?
        .ok_or_else(|| TransportError::TlsError("No private key found".to_string()))
}
