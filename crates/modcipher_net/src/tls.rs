use crate::transport::BoxedStream;
use anyhow::{Context as _, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_rustls::rustls::{ClientConfig, OwnedTrustAnchor, RootCertStore, ServerName};
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

/// Where the TLS client takes its trust anchors from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RootSource {
    /// The Mozilla root program, compiled in via `webpki-roots`.
    #[default]
    Bundled,
    /// The operating system's certificate store.
    Native,
}

/// Runs a TLS client handshake over an already decorated stream.
#[async_trait]
pub trait TlsProvider: Send + Sync {
    async fn handshake(&self, domain: &str, stream: BoxedStream) -> Result<BoxedStream>;
}

/// rustls-backed provider. Its ClientHello is what the decorator underneath
/// rewrites on the way out.
pub struct NativeProvider {
    config: Arc<ClientConfig>,
    handshake_timeout: Duration,
}

impl NativeProvider {
    pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

    pub fn new(roots: RootSource) -> Result<Self> {
        let root_store = match roots {
            RootSource::Bundled => bundled_roots(),
            RootSource::Native => native_roots()?,
        };

        let mut config = ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(root_store)
            .with_no_client_auth();
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(Self {
            config: Arc::new(config),
            handshake_timeout: Self::DEFAULT_HANDSHAKE_TIMEOUT,
        })
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }
}

#[async_trait]
impl TlsProvider for NativeProvider {
    async fn handshake(&self, domain: &str, stream: BoxedStream) -> Result<BoxedStream> {
        let connector = TlsConnector::from(self.config.clone());
        let server_name = ServerName::try_from(domain)
            .with_context(|| format!("invalid TLS server name {:?}", domain))?;

        let tls_stream = tokio::time::timeout(
            self.handshake_timeout,
            connector.connect(server_name, stream),
        )
        .await
        .with_context(|| {
            format!("TLS handshake with {} timed out after {:?}", domain, self.handshake_timeout)
        })?
        .with_context(|| format!("TLS handshake with {}", domain))?;

        let (_, session) = tls_stream.get_ref();
        debug!(
            domain,
            cipher_suite = ?session.negotiated_cipher_suite().map(|s| s.suite()),
            version = ?session.protocol_version(),
            "TLS established"
        );
        Ok(Box::new(tls_stream))
    }
}

fn bundled_roots() -> RootCertStore {
    let mut root_store = RootCertStore::empty();
    root_store.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
        OwnedTrustAnchor::from_subject_spki_name_constraints(
            ta.subject,
            ta.spki,
            ta.name_constraints,
        )
    }));
    root_store
}

fn native_roots() -> Result<RootCertStore> {
    let certs = rustls_native_certs::load_native_certs()
        .context("failed to load the platform certificate store")?;
    let ders: Vec<Vec<u8>> = certs.into_iter().map(|cert| cert.0).collect();

    let mut root_store = RootCertStore::empty();
    let (added, ignored) = root_store.add_parsable_certificates(&ders);
    if ignored > 0 {
        warn!(ignored, "skipped unparsable platform certificates");
    }
    debug!(added, "loaded platform certificates");
    Ok(root_store)
}
