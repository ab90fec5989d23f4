//! # Reflection Client
//!
//! A client for the gRPC Server Reflection Protocol, speaking either `grpc.reflection.v1alpha`
//! or `grpc.reflection.v1`.
//!
//! The client accumulates every `FileDescriptorProto` it receives into a session-wide
//! [`FileDescriptorCache`]. Resolving a symbol inspects the imports of each received file and
//! requests the missing ones until the whole dependency tree is known.
//!
//! ## References
//!
//! * [gRPC Server Reflection Protocol](https://github.com/grpc/grpc/blob/master/doc/server-reflection.md)
use super::cache::FileDescriptorCache;
use super::meta::{AcquireError, ServiceMetaList, ServiceMetaProvider};
use super::protos::additional_files;
use super::registry::TypeRegistry;
use crate::BoxError;
use crate::rpc::ConnFactory;
use http_body::Body as HttpBody;
use prost::Message;
use prost_types::FileDescriptorProto;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::client::GrpcService;
use tonic::{Code, Streaming};
use tonic_reflection::pb::{v1, v1alpha};

#[derive(Debug, thiserror::Error)]
pub enum ReflectionResolveError {
    #[error(
        "Failed to start a stream request with the reflection server, reflection might not be supported: '{0}'"
    )]
    ServerStreamInitFailed(#[source] tonic::Status),

    #[error("The server stream returned an error status: '{0}'")]
    ServerStreamFailure(#[source] tonic::Status),

    #[error("Reflection stream closed unexpectedly")]
    StreamClosed,

    #[error("Internal error: Failed to send request to stream")]
    SendFailed,

    #[error("Server returned reflection error code {code}: {message}")]
    ServerError { code: i32, message: String },

    #[error("Protocol error: Received unexpected response type: {0}")]
    UnexpectedResponseType(String),

    #[error("Failed to decode FileDescriptorProto: {0}")]
    DecodeError(#[from] prost::DecodeError),
}

/// Which reflection protocol the client speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReflectionVersion {
    /// `grpc.reflection.v1alpha`, understood by most servers.
    #[default]
    V1Alpha,
    /// `grpc.reflection.v1`.
    V1,
    /// Try `v1` first and fall back to `v1alpha` when the server does not implement it.
    Auto,
}

// The host field of reflection requests is not interpreted by servers.
const EMPTY_HOST: &str = "";

enum Query {
    ListServices,
    FileContainingSymbol(String),
    FileByFilename(String),
}

impl Query {
    fn into_v1(self) -> v1::ServerReflectionRequest {
        use v1::server_reflection_request::MessageRequest;

        let message_request = match self {
            Query::ListServices => MessageRequest::ListServices(String::new()),
            Query::FileContainingSymbol(symbol) => MessageRequest::FileContainingSymbol(symbol),
            Query::FileByFilename(name) => MessageRequest::FileByFilename(name),
        };

        v1::ServerReflectionRequest {
            host: EMPTY_HOST.to_string(),
            message_request: Some(message_request),
        }
    }

    fn into_v1alpha(self) -> v1alpha::ServerReflectionRequest {
        use v1alpha::server_reflection_request::MessageRequest;

        let message_request = match self {
            Query::ListServices => MessageRequest::ListServices(String::new()),
            Query::FileContainingSymbol(symbol) => MessageRequest::FileContainingSymbol(symbol),
            Query::FileByFilename(name) => MessageRequest::FileByFilename(name),
        };

        v1alpha::ServerReflectionRequest {
            host: EMPTY_HOST.to_string(),
            message_request: Some(message_request),
        }
    }
}

enum Reply {
    Files(Vec<Vec<u8>>),
    Services(Vec<String>),
}

impl TryFrom<v1::ServerReflectionResponse> for Reply {
    type Error = ReflectionResolveError;

    fn try_from(response: v1::ServerReflectionResponse) -> Result<Self, Self::Error> {
        use v1::server_reflection_response::MessageResponse;

        match response.message_response {
            Some(MessageResponse::FileDescriptorResponse(res)) => {
                Ok(Reply::Files(res.file_descriptor_proto))
            }
            Some(MessageResponse::ListServicesResponse(res)) => Ok(Reply::Services(
                res.service.into_iter().map(|s| s.name).collect(),
            )),
            Some(MessageResponse::ErrorResponse(e)) => Err(ReflectionResolveError::ServerError {
                code: e.error_code,
                message: e.error_message,
            }),
            Some(other) => Err(ReflectionResolveError::UnexpectedResponseType(format!(
                "{other:?}"
            ))),
            None => Err(ReflectionResolveError::UnexpectedResponseType(
                "Empty Message".into(),
            )),
        }
    }
}

impl TryFrom<v1alpha::ServerReflectionResponse> for Reply {
    type Error = ReflectionResolveError;

    fn try_from(response: v1alpha::ServerReflectionResponse) -> Result<Self, Self::Error> {
        use v1alpha::server_reflection_response::MessageResponse;

        match response.message_response {
            Some(MessageResponse::FileDescriptorResponse(res)) => {
                Ok(Reply::Files(res.file_descriptor_proto))
            }
            Some(MessageResponse::ListServicesResponse(res)) => Ok(Reply::Services(
                res.service.into_iter().map(|s| s.name).collect(),
            )),
            Some(MessageResponse::ErrorResponse(e)) => Err(ReflectionResolveError::ServerError {
                code: e.error_code,
                message: e.error_message,
            }),
            Some(other) => Err(ReflectionResolveError::UnexpectedResponseType(format!(
                "{other:?}"
            ))),
            None => Err(ReflectionResolveError::UnexpectedResponseType(
                "Empty Message".into(),
            )),
        }
    }
}

// An open `ServerReflectionInfo` stream for one of the protocol versions.
enum ReflectionStream {
    V1 {
        tx: mpsc::Sender<v1::ServerReflectionRequest>,
        rx: Streaming<v1::ServerReflectionResponse>,
    },
    V1Alpha {
        tx: mpsc::Sender<v1alpha::ServerReflectionRequest>,
        rx: Streaming<v1alpha::ServerReflectionResponse>,
    },
}

impl ReflectionStream {
    async fn send(&self, query: Query) -> Result<(), ReflectionResolveError> {
        let sent = match self {
            Self::V1 { tx, .. } => tx.send(query.into_v1()).await.is_ok(),
            Self::V1Alpha { tx, .. } => tx.send(query.into_v1alpha()).await.is_ok(),
        };

        if sent {
            Ok(())
        } else {
            Err(ReflectionResolveError::SendFailed)
        }
    }

    async fn next(&mut self) -> Result<Reply, ReflectionResolveError> {
        match self {
            Self::V1 { rx, .. } => rx
                .message()
                .await
                .map_err(ReflectionResolveError::ServerStreamFailure)?
                .ok_or(ReflectionResolveError::StreamClosed)?
                .try_into(),
            Self::V1Alpha { rx, .. } => rx
                .message()
                .await
                .map_err(ReflectionResolveError::ServerStreamFailure)?
                .ok_or(ReflectionResolveError::StreamClosed)?
                .try_into(),
        }
    }
}

/// A generic client for the gRPC Server Reflection Protocol.
pub struct ReflectionClient<S> {
    service: S,
    version: ReflectionVersion,
    max_decoding_message_size: Option<usize>,
    cache: FileDescriptorCache,
}

impl<S> ReflectionClient<S>
where
    S: GrpcService<tonic::body::Body> + Clone,
    S::Error: Into<BoxError>,
    S::ResponseBody: HttpBody<Data = tonic::codegen::Bytes> + Send + 'static,
    <S::ResponseBody as HttpBody>::Error: Into<BoxError> + Send,
{
    pub fn new(service: S, version: ReflectionVersion) -> Self {
        Self {
            service,
            version,
            max_decoding_message_size: None,
            cache: FileDescriptorCache::default(),
        }
    }

    /// Limits the size of reflection responses, tonic's default when `None`.
    pub fn with_max_decoding_message_size(mut self, limit: Option<usize>) -> Self {
        self.max_decoding_message_size = limit;
        self
    }

    /// The protocol version in use. After a successful call in [`ReflectionVersion::Auto`] mode
    /// this is the version the server answered to.
    pub fn version(&self) -> ReflectionVersion {
        self.version
    }

    /// Every file received so far.
    pub fn files(&self) -> &[FileDescriptorProto] {
        self.cache.files()
    }

    /// Discards every file received so far.
    pub fn reset(&mut self) {
        self.cache = FileDescriptorCache::default();
    }

    /// Lists all services exposed by the server.
    pub async fn list_services(&mut self) -> Result<Vec<String>, ReflectionResolveError> {
        let mut stream = self.open().await?;
        stream.send(Query::ListServices).await?;

        match stream.next().await? {
            Reply::Services(services) => Ok(services),
            Reply::Files(_) => Err(ReflectionResolveError::UnexpectedResponseType(
                "FileDescriptorResponse".into(),
            )),
        }
    }

    /// Asks the reflection service for the file containing `symbol` (e.g. `my.package.MyService`).
    ///
    /// **Recursive Resolution**:
    ///    - The server returns a `FileDescriptorProto`.
    ///    - The client inspects the imports (dependencies) of that file.
    ///    - It requests any dependency missing from the cache until the tree is complete.
    pub async fn resolve_symbol(&mut self, symbol: &str) -> Result<(), ReflectionResolveError> {
        tracing::debug!(symbol, "resolving symbol through reflection");

        let mut stream = self.open().await?;
        stream
            .send(Query::FileContainingSymbol(symbol.to_string()))
            .await?;

        collect_descriptors(&mut stream, &mut self.cache).await
    }

    async fn open(&mut self) -> Result<ReflectionStream, ReflectionResolveError> {
        match self.version {
            ReflectionVersion::V1 => self.open_v1().await,
            ReflectionVersion::V1Alpha => self.open_v1alpha().await,
            ReflectionVersion::Auto => match self.open_v1().await {
                Ok(stream) => {
                    self.version = ReflectionVersion::V1;
                    Ok(stream)
                }
                Err(ReflectionResolveError::ServerStreamInitFailed(status))
                    if status.code() == Code::Unimplemented =>
                {
                    tracing::debug!("reflection v1 not implemented, falling back to v1alpha");
                    self.version = ReflectionVersion::V1Alpha;
                    self.open_v1alpha().await
                }
                Err(err) => Err(err),
            },
        }
    }

    async fn open_v1(&self) -> Result<ReflectionStream, ReflectionResolveError> {
        let (tx, rx) = mpsc::channel(100);

        let mut client =
            v1::server_reflection_client::ServerReflectionClient::new(self.service.clone());
        if let Some(limit) = self.max_decoding_message_size {
            client = client.max_decoding_message_size(limit);
        }

        let rx = client
            .server_reflection_info(ReceiverStream::new(rx))
            .await
            .map_err(ReflectionResolveError::ServerStreamInitFailed)?
            .into_inner();

        Ok(ReflectionStream::V1 { tx, rx })
    }

    async fn open_v1alpha(&self) -> Result<ReflectionStream, ReflectionResolveError> {
        let (tx, rx) = mpsc::channel(100);

        let mut client =
            v1alpha::server_reflection_client::ServerReflectionClient::new(self.service.clone());
        if let Some(limit) = self.max_decoding_message_size {
            client = client.max_decoding_message_size(limit);
        }

        let rx = client
            .server_reflection_info(ReceiverStream::new(rx))
            .await
            .map_err(ReflectionResolveError::ServerStreamInitFailed)?
            .into_inner();

        Ok(ReflectionStream::V1Alpha { tx, rx })
    }
}

async fn collect_descriptors(
    stream: &mut ReflectionStream,
    cache: &mut FileDescriptorCache,
) -> Result<(), ReflectionResolveError> {
    let mut inflight = 1;
    let mut requested = HashSet::new();

    while inflight > 0 {
        let reply = stream.next().await?;
        inflight -= 1;

        match reply {
            Reply::Files(raw_protos) => {
                inflight += process_descriptor_batch(raw_protos, cache, &mut requested, stream)
                    .await?;
            }
            Reply::Services(_) => {
                return Err(ReflectionResolveError::UnexpectedResponseType(
                    "ListServiceResponse".into(),
                ));
            }
        }
    }

    Ok(())
}

async fn process_descriptor_batch(
    raw_protos: Vec<Vec<u8>>,
    cache: &mut FileDescriptorCache,
    requested: &mut HashSet<String>,
    stream: &ReflectionStream,
) -> Result<usize, ReflectionResolveError> {
    let mut sent_count = 0;

    for raw in raw_protos {
        let fd = FileDescriptorProto::decode(raw.as_ref())?;

        if fd.name.is_some() && !cache.contains(fd.name()) {
            sent_count += queue_dependencies(&fd, cache, requested, stream).await?;
            cache.add(fd);
        }
    }

    Ok(sent_count)
}

async fn queue_dependencies(
    fd: &FileDescriptorProto,
    cache: &FileDescriptorCache,
    requested: &mut HashSet<String>,
    stream: &ReflectionStream,
) -> Result<usize, ReflectionResolveError> {
    let mut count = 0;

    for dep in &fd.dependency {
        if !cache.contains(dep) && requested.insert(dep.clone()) {
            stream.send(Query::FileByFilename(dep.clone())).await?;
            count += 1;
        }
    }

    Ok(count)
}

/// Reads service descriptors from the target server through reflection.
pub struct ReflectionSource {
    factory: Arc<ConnFactory>,
    target: String,
    version: ReflectionVersion,
    deadline: Duration,
    imports: Vec<PathBuf>,
}

impl ReflectionSource {
    pub fn new(factory: Arc<ConnFactory>, target: impl Into<String>) -> Self {
        Self {
            factory,
            target: target.into(),
            version: ReflectionVersion::default(),
            deadline: Duration::from_secs(15),
            imports: Vec::new(),
        }
    }

    pub fn with_version(mut self, version: ReflectionVersion) -> Self {
        self.version = version;
        self
    }

    /// Upper bound for the whole acquisition.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Directories whose proto files are added to the registry, so `Any` payloads of types
    /// the server does not expose can still be resolved.
    pub fn with_imports(mut self, imports: Vec<PathBuf>) -> Self {
        self.imports = imports;
        self
    }
}

impl ServiceMetaProvider for ReflectionSource {
    async fn service_meta_list(&mut self) -> Result<ServiceMetaList, AcquireError> {
        let conn = self.factory.get_conn(&self.target).await?;
        let client = ReflectionClient::new(conn.service(), self.version)
            .with_max_decoding_message_size(conn.max_recv_msg_size());
        let extra = additional_files(&self.imports)?;

        tokio::time::timeout(self.deadline, acquire_services(client, extra.files))
            .await
            .map_err(|_| AcquireError::Timeout)?
    }
}

/// Lists and resolves every service of the server.
///
/// A service whose files fail to resolve, or do not form a consistent pool together with the
/// files already cached, is retried once on an emptied cache. Files of services resolved
/// earlier are kept aside so a reset does not lose them.
pub async fn acquire_services<S>(
    mut client: ReflectionClient<S>,
    extra: Vec<FileDescriptorProto>,
) -> Result<ServiceMetaList, AcquireError>
where
    S: GrpcService<tonic::body::Body> + Clone,
    S::Error: Into<BoxError>,
    S::ResponseBody: HttpBody<Data = tonic::codegen::Bytes> + Send + 'static,
    <S::ResponseBody as HttpBody>::Error: Into<BoxError> + Send,
{
    let services = client.list_services().await?;
    let mut resolved = FileDescriptorCache::default();

    for service in &services {
        if let Err(err) = resolve_service(&mut client, service).await {
            tracing::warn!(
                service,
                error = %err,
                "resolving service failed, retrying with a fresh cache"
            );
            client.reset();
            resolve_service(&mut client, service).await?;
        }
        resolved.extend(client.files().iter().cloned());
    }

    let registry = TypeRegistry::new(resolved.files().iter().cloned().chain(extra))?;
    ServiceMetaList::new(Arc::new(registry), &services)
}

async fn resolve_service<S>(
    client: &mut ReflectionClient<S>,
    service: &str,
) -> Result<(), AcquireError>
where
    S: GrpcService<tonic::body::Body> + Clone,
    S::Error: Into<BoxError>,
    S::ResponseBody: HttpBody<Data = tonic::codegen::Bytes> + Send + 'static,
    <S::ResponseBody as HttpBody>::Error: Into<BoxError> + Send,
{
    client.resolve_symbol(service).await?;
    TypeRegistry::new(client.files().iter().cloned())?;
    Ok(())
}
