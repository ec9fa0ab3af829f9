//! Crypto suites and the secure-context builder.
//!
//! A node runs under exactly one of two certificate families. The SDK holds
//! a bundle for each ([`CryptoSuite::Ecdsa`] and [`CryptoSuite::Sm`]) and
//! builds a single [`SecureContext`] for whichever suite is active. Both the
//! bulk connect and the reconnect pass dial through the same context.
//!
//! Node certificates are validated against the suite's trust anchor but not
//! against the dialed host name: nodes are addressed by IP and their
//! certificates do not carry matching subject names.

use {
    crate::{
        endpoint::PeerEndpoint,
        error::{HandshakeFailureKind, Result, SdkNetError},
    },
    log::debug,
    rustls::{
        client::{
            danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
            WebPkiServerVerifier,
        },
        crypto::{ring, CryptoProvider},
        pki_types::{pem::PemObject, CertificateDer, PrivateKeyDer, ServerName, UnixTime},
        AlertDescription, CertificateError, ClientConfig, DigitallySignedStruct, RootCertStore,
        SignatureScheme,
    },
    serde::Deserialize,
    std::{
        fmt, io,
        path::{Path, PathBuf},
        sync::Arc,
        time::Duration,
    },
    tokio::io::{AsyncRead, AsyncWrite},
    tokio_rustls::{client::TlsStream, TlsConnector},
};

/// One of the two mutually exclusive certificate families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CryptoSuite {
    /// Standard certificates (Suite-A). Tried first.
    Ecdsa,
    /// National-standard certificates (Suite-B).
    Sm,
}

impl CryptoSuite {
    pub fn name(self) -> &'static str {
        match self {
            Self::Ecdsa => "ecdsa",
            Self::Sm => "sm",
        }
    }

    /// The suite to try when this one fails with a handshake error.
    pub fn fallback(self) -> Option<Self> {
        match self {
            Self::Ecdsa => Some(Self::Sm),
            Self::Sm => None,
        }
    }
}

impl fmt::Display for CryptoSuite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Resolved file locations of one suite's certificate bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuiteMaterial {
    pub suite: CryptoSuite,
    pub ca_cert: PathBuf,
    pub sdk_cert: PathBuf,
    pub sdk_key: PathBuf,
}

impl SuiteMaterial {
    /// Every file of the bundle that does not exist.
    pub fn missing_files(&self) -> Vec<PathBuf> {
        [&self.ca_cert, &self.sdk_cert, &self.sdk_key]
            .into_iter()
            .filter(|path| !path.is_file())
            .cloned()
            .collect()
    }
}

/// TLS client context for one crypto suite.
pub struct SecureContext {
    suite: CryptoSuite,
    connector: TlsConnector,
    handshake_timeout: Duration,
}

impl SecureContext {
    /// Load `material` and build a client context.
    ///
    /// Fails with [`SdkNetError::MissingCertificates`] before touching any
    /// file content if part of the bundle is absent.
    pub fn build(material: &SuiteMaterial, handshake_timeout: Duration) -> Result<Self> {
        let missing = material.missing_files();
        if !missing.is_empty() {
            return Err(SdkNetError::MissingCertificates {
                suite: material.suite,
                files: missing,
            });
        }

        let provider = crypto_provider();

        let mut roots = RootCertStore::empty();
        for ca in load_certs(&material.ca_cert)? {
            roots.add(ca).map_err(|e| invalid(&material.ca_cert, e))?;
        }
        let verifier =
            WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider.clone())
                .build()
                .map_err(|e| invalid(&material.ca_cert, e))?;

        let certs = load_certs(&material.sdk_cert)?;
        let key = PrivateKeyDer::from_pem_file(&material.sdk_key)
            .map_err(|e| invalid(&material.sdk_key, e))?;

        let config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| invalid(&material.sdk_cert, e))?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(TrustAnchorVerifier { inner: verifier }))
            .with_client_auth_cert(certs, key)
            .map_err(|e| invalid(&material.sdk_key, e))?;

        debug!(
            "built {} secure context from {}",
            material.suite,
            material.ca_cert.display()
        );
        Ok(Self {
            suite: material.suite,
            connector: TlsConnector::from(Arc::new(config)),
            handshake_timeout,
        })
    }

    pub fn suite(&self) -> CryptoSuite {
        self.suite
    }

    /// Run the TLS client handshake over `stream`, bounded by the handshake
    /// timeout.
    pub async fn handshake<S>(&self, endpoint: &PeerEndpoint, stream: S) -> Result<TlsStream<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let server_name = ServerName::try_from(endpoint.host())
            .map_err(|_| SdkNetError::InvalidEndpoint(endpoint.to_string()))?
            .to_owned();
        match tokio::time::timeout(
            self.handshake_timeout,
            self.connector.connect(server_name, stream),
        )
        .await
        {
            Ok(Ok(tls)) => Ok(tls),
            Ok(Err(e)) => Err(SdkNetError::SecureHandshakeFailed {
                endpoint: endpoint.clone(),
                kind: tls_failure_kind(&e).unwrap_or(HandshakeFailureKind::PeerClosed),
                detail: e.to_string(),
            }),
            Err(_) => Err(SdkNetError::SecureHandshakeFailed {
                endpoint: endpoint.clone(),
                kind: HandshakeFailureKind::TimedOut,
                detail: format!(
                    "no handshake completion within {}ms",
                    self.handshake_timeout.as_millis()
                ),
            }),
        }
    }
}

impl fmt::Debug for SecureContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureContext")
            .field("suite", &self.suite)
            .field("handshake_timeout", &self.handshake_timeout)
            .finish()
    }
}

/// Classify an I/O error raised by a TLS stream.
///
/// Returns `None` when the error does not come from the TLS layer, and a
/// [`HandshakeFailureKind::PeerClosed`] for streams cut mid-handshake.
pub fn tls_failure_kind(err: &io::Error) -> Option<HandshakeFailureKind> {
    if let Some(kind) = tls_alert_kind(err) {
        return Some(kind);
    }
    match err.kind() {
        io::ErrorKind::UnexpectedEof
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe => Some(HandshakeFailureKind::PeerClosed),
        _ => None,
    }
}

/// Classify an I/O error only if it carries a TLS protocol error.
///
/// Used after the handshake, where a plain reset is a lost connection but
/// a received alert still means the node rejected our credentials.
pub fn tls_alert_kind(err: &io::Error) -> Option<HandshakeFailureKind> {
    err.get_ref()
        .and_then(|e| e.downcast_ref::<rustls::Error>())
        .map(rustls_failure_kind)
}

fn rustls_failure_kind(err: &rustls::Error) -> HandshakeFailureKind {
    match err {
        rustls::Error::InvalidCertificate(_) | rustls::Error::NoCertificatesPresented => {
            HandshakeFailureKind::CertificateMismatch
        }
        rustls::Error::AlertReceived(alert) => match alert {
            AlertDescription::BadCertificate
            | AlertDescription::UnsupportedCertificate
            | AlertDescription::CertificateRevoked
            | AlertDescription::CertificateExpired
            | AlertDescription::CertificateUnknown
            | AlertDescription::UnknownCA
            | AlertDescription::CertificateRequired
            | AlertDescription::AccessDenied
            | AlertDescription::DecryptError => HandshakeFailureKind::CertificateMismatch,
            AlertDescription::CloseNotify => HandshakeFailureKind::PeerClosed,
            _ => HandshakeFailureKind::AlgorithmUnsupported,
        },
        _ => HandshakeFailureKind::AlgorithmUnsupported,
    }
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let certs = CertificateDer::pem_file_iter(path)
        .map_err(|e| invalid(path, e))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| invalid(path, e))?;
    if certs.is_empty() {
        return Err(invalid(path, "no certificates found"));
    }
    Ok(certs)
}

fn invalid(path: &Path, reason: impl fmt::Display) -> SdkNetError {
    SdkNetError::InvalidCertificate {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

/// Chain validation against the trust anchor, without host-name matching.
#[derive(Debug)]
struct TrustAnchorVerifier {
    inner: Arc<WebPkiServerVerifier>,
}

impl ServerCertVerifier for TrustAnchorVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        match self.inner.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        ) {
            Err(rustls::Error::InvalidCertificate(
                CertificateError::NotValidForName | CertificateError::NotValidForNameContext { .. },
            )) => Ok(ServerCertVerified::assertion()),
            other => other,
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// Default crypto provider shared by the client and test servers.
pub fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(ring::default_provider())
}

// ── Tests ───────────────────────────────────────────────────────────────────
