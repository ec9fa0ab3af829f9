//! Configuration for the SDK connection layer.

use {
    crate::{
        endpoint::PeerEndpoint,
        error::{Result, SdkNetError},
        tls::{CryptoSuite, SuiteMaterial},
    },
    serde::Deserialize,
    std::{
        path::{Path, PathBuf},
        time::Duration,
    },
};

/// Per-suite overrides for certificate and key locations.
///
/// Unset paths default to the suite's standard file name inside
/// [`SdkNetConfig::cert_dir`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CryptoSuiteFiles {
    /// Trust anchor used to validate node certificates.
    pub ca_cert: Option<PathBuf>,
    /// Certificate the SDK presents to nodes.
    pub sdk_cert: Option<PathBuf>,
    /// Private key of `sdk_cert`.
    pub sdk_key: Option<PathBuf>,
}

/// Network section of the SDK configuration.
///
/// Everything the connection layer needs to reach a set of ledger nodes:
/// where they are, which certificates to present, and how long to wait
/// at each stage.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SdkNetConfig {
    /// Configured peers as `"host:port"` strings.
    pub peers: Vec<String>,

    /// Directory holding both suites' certificate files.
    /// Default: `conf`
    pub cert_dir: PathBuf,

    /// Pin a single crypto suite and disable fallback.
    /// `None` tries ECDSA first and falls back to SM.
    pub crypto_suite: Option<CryptoSuite>,

    /// Overrides for the ECDSA suite's files.
    pub ecdsa_files: CryptoSuiteFiles,

    /// Overrides for the SM suite's files.
    pub sm_files: CryptoSuiteFiles,

    /// TCP connect timeout (ms).
    pub connect_timeout_ms: u64,

    /// TLS handshake timeout (ms). Also bounds each protocol negotiation
    /// request.
    pub handshake_timeout_ms: u64,

    /// Default timeout for correlated requests (ms).
    pub request_timeout_ms: u64,

    /// How long a connection may stay silent before a heartbeat is sent (ms).
    pub idle_timeout_ms: u64,

    /// Interval between reconnect passes over dead peers (ms).
    pub reconnect_interval_ms: u64,

    /// Maximum size of a single frame in bytes.
    pub max_frame_size: usize,

    /// Worker threads of the I/O runtime.
    pub io_threads: usize,

    /// Client type announced during protocol negotiation.
    pub client_type: String,
}

impl Default for SdkNetConfig {
    fn default() -> Self {
        Self {
            peers: Vec::new(),
            cert_dir: PathBuf::from("conf"),
            crypto_suite: None,
            ecdsa_files: CryptoSuiteFiles::default(),
            sm_files: CryptoSuiteFiles::default(),
            connect_timeout_ms: 10_000,
            handshake_timeout_ms: 10_000,
            request_timeout_ms: 10_000,
            idle_timeout_ms: 30_000,
            reconnect_interval_ms: 3_000,
            max_frame_size: 10 * 1024 * 1024, // 10 MiB
            io_threads: 4,
            client_type: format!("trv1-sdk-net/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl SdkNetConfig {
    /// Create a config suitable for local testing with shorter timeouts.
    #[cfg(any(test, feature = "dev-context-only-utils"))]
    pub fn dev_default() -> Self {
        Self {
            connect_timeout_ms: 1_000,
            handshake_timeout_ms: 1_000,
            request_timeout_ms: 1_000,
            idle_timeout_ms: 5_000,
            reconnect_interval_ms: 200,
            max_frame_size: 1_048_576,
            io_threads: 2,
            ..Self::default()
        }
    }

    /// Parse a config from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| SdkNetError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML config file.
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            SdkNetError::InvalidConfig(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&text)
    }

    /// Check that the config can be used to start a network.
    pub fn validate(&self) -> Result<()> {
        if self.peers.is_empty() {
            return Err(SdkNetError::InvalidConfig("no peers configured".to_string()));
        }
        self.peer_endpoints()?;
        let timeouts = [
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("handshake_timeout_ms", self.handshake_timeout_ms),
            ("request_timeout_ms", self.request_timeout_ms),
            ("idle_timeout_ms", self.idle_timeout_ms),
            ("reconnect_interval_ms", self.reconnect_interval_ms),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, ms)| *ms == 0) {
            return Err(SdkNetError::InvalidConfig(format!("{name} must be non-zero")));
        }
        if self.max_frame_size < crate::frame::HEADER_LEN {
            return Err(SdkNetError::InvalidConfig(format!(
                "max_frame_size must be at least {} bytes",
                crate::frame::HEADER_LEN
            )));
        }
        if self.io_threads == 0 {
            return Err(SdkNetError::InvalidConfig(
                "io_threads must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Parsed, de-duplicated peer endpoints in configuration order.
    pub fn peer_endpoints(&self) -> Result<Vec<PeerEndpoint>> {
        let mut endpoints: Vec<PeerEndpoint> = Vec::with_capacity(self.peers.len());
        for peer in &self.peers {
            let endpoint: PeerEndpoint = peer.parse()?;
            if !endpoints.contains(&endpoint) {
                endpoints.push(endpoint);
            }
        }
        Ok(endpoints)
    }

    /// Resolve the certificate file set for `suite`.
    pub fn suite_material(&self, suite: CryptoSuite) -> SuiteMaterial {
        let (files, [ca, cert, key]) = match suite {
            CryptoSuite::Ecdsa => (&self.ecdsa_files, ["ca.crt", "sdk.crt", "sdk.key"]),
            CryptoSuite::Sm => (&self.sm_files, ["sm_ca.crt", "sm_sdk.crt", "sm_sdk.key"]),
        };
        let resolve = |over: &Option<PathBuf>, name: &str| {
            over.clone().unwrap_or_else(|| self.cert_dir.join(name))
        };
        SuiteMaterial {
            suite,
            ca_cert: resolve(&files.ca_cert, ca),
            sdk_cert: resolve(&files.sdk_cert, cert),
            sdk_key: resolve(&files.sdk_key, key),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
