use super::metadata::{MetadataError, MetadataInjector};
use super::stats::StatsService;
use super::target::{ConnectionOptions, TargetError};
use super::tls::{self, TlsError, TlsSettings};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::OnceCell;
use tonic::client::Grpc;
use tonic::service::interceptor::InterceptedService;
use tonic::transport::{Channel, Endpoint, Uri};

const DEFAULT_KEEPALIVE_TIME: Duration = Duration::from_secs(60);

/// The service every call goes through: metadata injection on top of statistics recording.
pub type ConnService = InterceptedService<StatsService<Channel>, MetadataInjector>;

type Entry = Arc<OnceCell<Result<Arc<Connection>, ConnectionError>>>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    #[error(transparent)]
    Target(#[from] TargetError),

    #[error("Invalid URI '{uri}': {reason}")]
    InvalidUri { uri: String, reason: String },

    #[error("TLS configuration error: {0}")]
    Tls(String),

    #[error("{0}")]
    Metadata(String),
}

impl From<TlsError> for ConnectionError {
    fn from(err: TlsError) -> Self {
        Self::Tls(err.to_string())
    }
}

impl From<MetadataError> for ConnectionError {
    fn from(err: MetadataError) -> Self {
        Self::Metadata(err.to_string())
    }
}

/// Policies applied to every connection the factory opens.
#[derive(Debug, Clone, Default)]
pub struct ConnFactorySettings {
    /// Plaintext when `None`.
    pub tls: Option<TlsSettings>,
    /// Takes precedence over an `authority` given inline in the target.
    pub authority: Option<String>,
    /// Sent with every call, before the inline metadata of the target.
    pub headers: Vec<(String, String)>,
    pub keepalive: bool,
    pub keepalive_time: Option<Duration>,
    pub max_recv_msg_size: Option<usize>,
}

/// A multiplexed transport to a single host.
pub struct Connection {
    host: String,
    service: ConnService,
    max_recv_msg_size: Option<usize>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("host", &self.host)
            .field("max_recv_msg_size", &self.max_recv_msg_size)
            .finish_non_exhaustive()
    }
}

impl Connection {
    pub fn host(&self) -> &str {
        &self.host
    }

    /// A handle to the underlying service. Handles are cheap and share the transport.
    pub fn service(&self) -> ConnService {
        self.service.clone()
    }

    /// Largest message accepted from the server, tonic's default when `None`.
    pub fn max_recv_msg_size(&self) -> Option<usize> {
        self.max_recv_msg_size
    }

    /// A generic gRPC client over this connection, with the receive limit applied.
    pub fn grpc(&self) -> Grpc<ConnService> {
        let grpc = Grpc::new(self.service());
        match self.max_recv_msg_size {
            Some(limit) => grpc.max_decoding_message_size(limit),
            None => grpc,
        }
    }
}

/// Opens and caches one [`Connection`] per host.
///
/// The first caller for a host builds the connection while concurrent callers wait for it.
/// The outcome, failure included, is kept until the connection is closed.
#[derive(Debug, Default)]
pub struct ConnFactory {
    settings: ConnFactorySettings,
    conns: Mutex<HashMap<String, Entry>>,
}

impl ConnFactory {
    pub fn new(settings: ConnFactorySettings) -> Self {
        Self {
            settings,
            conns: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &ConnFactorySettings {
        &self.settings
    }

    /// Returns the connection to the host named by `target`, opening it on first use.
    ///
    /// Inline options of `target` only matter when the connection is opened.
    pub async fn get_conn(&self, target: &str) -> Result<Arc<Connection>, ConnectionError> {
        let opts: ConnectionOptions = target.parse()?;

        let entry = self.lock().entry(opts.host.clone()).or_default().clone();

        entry
            .get_or_init(|| async {
                self.open(&opts).map(Arc::new).inspect_err(|err| {
                    tracing::warn!(host = %opts.host, error = %err, "failed to open connection");
                })
            })
            .await
            .clone()
    }

    /// Drops the cached connection to the host named by `target`.
    pub fn close_conn(&self, target: &str) {
        if let Ok(opts) = target.parse::<ConnectionOptions>()
            && self.lock().remove(&opts.host).is_some()
        {
            tracing::debug!(host = %opts.host, "connection closed");
        }
    }

    /// Drops every cached connection.
    pub fn close(&self) {
        self.lock().clear();
    }

    fn open(&self, opts: &ConnectionOptions) -> Result<Connection, ConnectionError> {
        let host = opts.host.as_str();
        let authority = self.settings.authority.as_deref().or(opts.authority.as_deref());

        let mut headers = self.settings.headers.clone();
        headers.extend(opts.metadata.iter().cloned());
        let injector = MetadataInjector::new(&headers)?;

        tracing::debug!(
            host,
            authority,
            tls = self.settings.tls.is_some(),
            headers = headers.len(),
            "opening connection"
        );

        let channel = match &self.settings.tls {
            None => self.endpoint("http", host, authority)?.connect_lazy(),
            Some(settings) if settings.insecure => {
                let endpoint = self.endpoint("http", host, None)?;
                let endpoint = endpoint.origin(parse_uri("https", authority.unwrap_or(host))?);
                let config = settings.insecure_config()?;
                tls::connect_insecure(endpoint, config, &server_name(authority.unwrap_or(host)))?
            }
            Some(settings) => {
                let config = settings.client_config(authority.map(server_name).as_deref())?;
                self.endpoint("https", host, authority)?
                    .tls_config(config)
                    .map_err(|err| ConnectionError::Tls(err.to_string()))?
                    .connect_lazy()
            }
        };

        Ok(Connection {
            host: host.to_string(),
            service: InterceptedService::new(StatsService::new(channel), injector),
            max_recv_msg_size: self.settings.max_recv_msg_size,
        })
    }

    fn endpoint(
        &self,
        scheme: &str,
        host: &str,
        authority: Option<&str>,
    ) -> Result<Endpoint, ConnectionError> {
        let mut endpoint = Endpoint::from(parse_uri(scheme, host)?);

        if let Some(authority) = authority {
            endpoint = endpoint.origin(parse_uri(scheme, authority)?);
        }

        if self.settings.keepalive {
            endpoint = endpoint
                .http2_keep_alive_interval(
                    self.settings.keepalive_time.unwrap_or(DEFAULT_KEEPALIVE_TIME),
                )
                .keep_alive_while_idle(true);
        }

        Ok(endpoint)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.conns.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn parse_uri(scheme: &str, host: &str) -> Result<Uri, ConnectionError> {
    let uri = format!("{scheme}://{host}");
    uri.parse().map_err(|err: http::uri::InvalidUri| ConnectionError::InvalidUri {
        reason: err.to_string(),
        uri,
    })
}

// The host part of an authority, as presented in the TLS handshake.
fn server_name(authority: &str) -> String {
    authority
        .parse::<http::uri::Authority>()
        .map(|a| a.host().to_string())
        .unwrap_or_else(|_| authority.to_string())
}
