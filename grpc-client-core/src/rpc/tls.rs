use hyper_util::rt::TokioIo;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::pem::{self, PemObject};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::{fs, io};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint, Identity, Uri};
use tower::service_fn;

#[derive(Debug, thiserror::Error)]
pub(crate) enum TlsError {
    #[error("Client certificate and key must be provided together")]
    CertKeyMismatch,

    #[error("Failed to read '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Invalid PEM file '{path}': {source}")]
    Pem {
        path: PathBuf,
        #[source]
        source: pem::Error,
    },

    #[error("Invalid TLS server name '{0}'")]
    ServerName(String),

    #[error(transparent)]
    Rustls(#[from] rustls::Error),
}

/// Credentials of a TLS connection.
///
/// `ca_cert` replaces the native root store for server verification, `cert` and `cert_key`
/// enable mutual TLS and must be set together. `insecure` accepts any server certificate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsSettings {
    pub insecure: bool,
    pub ca_cert: Option<PathBuf>,
    pub cert: Option<PathBuf>,
    pub cert_key: Option<PathBuf>,
}

impl TlsSettings {
    fn identity_paths(&self) -> Result<Option<(&Path, &Path)>, TlsError> {
        match (&self.cert, &self.cert_key) {
            (Some(cert), Some(key)) => Ok(Some((cert, key))),
            (None, None) => Ok(None),
            _ => Err(TlsError::CertKeyMismatch),
        }
    }

    /// Verified TLS. `domain` overrides the name the server certificate is checked against.
    pub(crate) fn client_config(&self, domain: Option<&str>) -> Result<ClientTlsConfig, TlsError> {
        let identity = self.identity_paths()?;

        let mut config = match &self.ca_cert {
            Some(path) => ClientTlsConfig::new().ca_certificate(Certificate::from_pem(read(path)?)),
            None => ClientTlsConfig::new().with_native_roots(),
        };

        if let Some((cert, key)) = identity {
            config = config.identity(Identity::from_pem(read(cert)?, read(key)?));
        }

        if let Some(domain) = domain {
            config = config.domain_name(domain);
        }

        Ok(config)
    }

    /// TLS without server verification, negotiating HTTP/2 through ALPN.
    pub(crate) fn insecure_config(&self) -> Result<Arc<ClientConfig>, TlsError> {
        let identity = self.identity_paths()?;
        let provider = Arc::new(rustls::crypto::ring::default_provider());

        let builder = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SkipServerVerification(provider)));

        let mut config = match identity {
            Some((cert, key)) => {
                let certs = CertificateDer::pem_file_iter(cert)
                    .and_then(|iter| iter.collect::<Result<Vec<_>, _>>())
                    .map_err(|source| TlsError::Pem {
                        path: cert.to_path_buf(),
                        source,
                    })?;
                let key = PrivateKeyDer::from_pem_file(key).map_err(|source| TlsError::Pem {
                    path: key.to_path_buf(),
                    source,
                })?;
                builder.with_client_auth_cert(certs, key)?
            }
            None => builder.with_no_client_auth(),
        };

        config.alpn_protocols = vec![b"h2".to_vec()];
        Ok(Arc::new(config))
    }
}

fn read(path: &Path) -> Result<Vec<u8>, TlsError> {
    fs::read(path).map_err(|source| TlsError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Builds a lazy channel dialing the endpoint address over TCP and wrapping the stream in a
/// TLS session presenting `server_name`.
pub(crate) fn connect_insecure(
    endpoint: Endpoint,
    config: Arc<ClientConfig>,
    server_name: &str,
) -> Result<Channel, TlsError> {
    let server_name = ServerName::try_from(server_name.to_string())
        .map_err(|_| TlsError::ServerName(server_name.to_string()))?;
    let connector = TlsConnector::from(config);

    Ok(endpoint.connect_with_connector_lazy(service_fn(move |uri: Uri| {
        let connector = connector.clone();
        let server_name = server_name.clone();
        async move {
            let host = uri
                .host()
                .map(|h| h.trim_start_matches('[').trim_end_matches(']').to_string())
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "missing host"))?;
            let port = uri.port_u16().unwrap_or(443);

            let tcp = TcpStream::connect((host.as_str(), port)).await?;
            let stream = connector.connect(server_name, tcp).await?;
            Ok::<_, io::Error>(TokioIo::new(stream))
        }
    })))
}

#[derive(Debug)]
struct SkipServerVerification(Arc<CryptoProvider>);

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
