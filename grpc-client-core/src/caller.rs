//! # Generic Invocation Engine
//!
//! [`ServiceCaller`] invokes any method as a bidirectional stream, whatever its declared
//! cardinality. A unary call is a stream carrying exactly one message each way.
//!
//! ## Contract
//!
//! [`ServiceCaller::call_stream`] returns a [`CallStream`]: a result channel delivering every
//! response (already rendered in the output format) in the order the server sent it, and an
//! error channel. The call is over when the result channel closes. At that point the error
//! channel either holds the failure, or is closed without a value when the stream ended cleanly.
//!
//! [`ServiceCaller::call_client_stream`] is the single-result wrapper used for unary and client
//! streaming methods: it keeps the last response only.
use crate::BoxError;
use crate::codec::{DynamicCodec, FormatError, MessageFormat, MessageFormatter};
use crate::rpc::{CallStats, ConnFactory, ConnService, ConnectionError, StatsEvent};
use prost_reflect::{DynamicMessage, MethodDescriptor};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tonic::client::Grpc;
use tonic::{Code, Status};

#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error("Empty requests are not allowed")]
    NoRequests,

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("Invalid input {format}: {source}")]
    InvalidInput {
        format: MessageFormat,
        #[source]
        source: FormatError,
    },

    #[error("Failed to render response: {0}")]
    InvalidOutput(#[source] FormatError),

    #[error("Invalid method path '{0}'")]
    InvalidPath(String),

    #[error("Internal error, the client was not ready: '{0}'")]
    ClientNotReady(#[source] BoxError),

    #[error("rpc error: code = DeadlineExceeded desc = context deadline exceeded")]
    DeadlineExceeded,

    #[error("rpc error: code = {:?} desc = {}", .0.code(), .0.message())]
    Status(#[from] Status),
}

impl CallError {
    /// The gRPC status code this error maps to.
    pub fn code(&self) -> Code {
        match self {
            Self::NoRequests | Self::InvalidInput { .. } | Self::InvalidPath(_) => {
                Code::InvalidArgument
            }
            Self::Connection(_) | Self::ClientNotReady(_) => Code::Unavailable,
            Self::InvalidOutput(_) => Code::Internal,
            Self::DeadlineExceeded => Code::DeadlineExceeded,
            Self::Status(status) => status.code(),
        }
    }

    /// Anything but an unavailable server is worth another attempt.
    pub fn is_transient(&self) -> bool {
        self.code() != Code::Unavailable
    }
}

/// Per-call settings and the statistics collected while the call runs.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    pub deadline: Option<Duration>,
    pub stats: CallStats,
}

impl CallContext {
    pub fn new(deadline: Duration) -> Self {
        Self {
            deadline: Some(deadline),
            stats: CallStats::new(),
        }
    }
}

/// The two channels of an in-flight call.
#[derive(Debug)]
pub struct CallStream {
    pub results: mpsc::Receiver<Vec<u8>>,
    pub errors: oneshot::Receiver<CallError>,
}

impl CallStream {
    fn failed(err: CallError) -> Self {
        let (_, results) = mpsc::channel(1);
        let (tx, errors) = oneshot::channel();
        let _ = tx.send(err);
        Self { results, errors }
    }

    /// The next response, or `None` once the call is over.
    pub async fn next(&mut self) -> Option<Vec<u8>> {
        self.results.recv().await
    }

    /// Waits for the end of the call, discarding responses not consumed yet.
    pub async fn outcome(self) -> Result<(), CallError> {
        let Self { results, errors } = self;
        drop(results);

        match errors.await {
            Ok(err) => Err(err),
            Err(_) => Ok(()),
        }
    }
}

/// Invokes methods on the connections handed out by a [`ConnFactory`].
#[derive(Debug, Clone)]
pub struct ServiceCaller {
    factory: Arc<ConnFactory>,
    formatter: MessageFormatter,
}

impl ServiceCaller {
    pub fn new(factory: Arc<ConnFactory>, formatter: MessageFormatter) -> Self {
        Self { factory, formatter }
    }

    pub fn formatter(&self) -> &MessageFormatter {
        &self.formatter
    }

    /// Opens a stream to `method` on `target`, sends every request and returns the channels
    /// the responses and the outcome are delivered on.
    ///
    /// Requests are parsed before anything is sent. Responses are read by a background task
    /// for as long as the server keeps the stream open.
    pub async fn call_stream(
        &self,
        ctx: &CallContext,
        target: &str,
        method: &MethodDescriptor,
        messages: &[Vec<u8>],
    ) -> CallStream {
        match self.prepare(ctx, target, method, messages).await {
            Ok(call) => call.spawn(self.formatter.clone()),
            Err(err) => CallStream::failed(err),
        }
    }

    /// Calls a method answering with a single message, returning the last response received.
    pub async fn call_client_stream(
        &self,
        ctx: &CallContext,
        target: &str,
        method: &MethodDescriptor,
        messages: &[Vec<u8>],
    ) -> Result<Option<Vec<u8>>, CallError> {
        if messages.is_empty() {
            return Err(CallError::NoRequests);
        }

        let mut stream = self.call_stream(ctx, target, method, messages).await;

        let mut result = None;
        while let Some(msg) = stream.next().await {
            result = Some(msg);
        }

        stream.outcome().await?;
        Ok(result)
    }

    async fn prepare(
        &self,
        ctx: &CallContext,
        target: &str,
        method: &MethodDescriptor,
        messages: &[Vec<u8>],
    ) -> Result<PreparedCall, CallError> {
        let input = method.input();
        let requests = messages
            .iter()
            .map(|msg| {
                self.formatter
                    .unmarshal(msg, &input)
                    .map_err(|source| CallError::InvalidInput {
                        format: self.formatter.in_format(),
                        source,
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let path = format!("/{}/{}", method.parent_service().full_name(), method.name());
        let path = http::uri::PathAndQuery::try_from(path.as_str())
            .map_err(|_| CallError::InvalidPath(path.clone()))?;

        let conn = self.factory.get_conn(target).await?;

        Ok(PreparedCall {
            grpc: conn.grpc(),
            path,
            method: method.clone(),
            requests,
            deadline: ctx.deadline,
            stats: ctx.stats.clone(),
        })
    }
}

struct PreparedCall {
    grpc: Grpc<ConnService>,
    path: http::uri::PathAndQuery,
    method: MethodDescriptor,
    requests: Vec<DynamicMessage>,
    deadline: Option<Duration>,
    stats: CallStats,
}

impl PreparedCall {
    fn spawn(self, formatter: MessageFormatter) -> CallStream {
        let (results_tx, results) = mpsc::channel(1);
        let (errors_tx, errors) = oneshot::channel();

        tokio::spawn(async move {
            let started = Instant::now();
            let stats = self.stats.clone();
            let method = self.method.full_name().to_string();

            tracing::debug!(method = %method, "stream opened");
            let outcome = self.run(&formatter, &results_tx).await;
            stats.record(StatsEvent::End {
                duration: started.elapsed(),
            });

            match outcome {
                Ok(()) => tracing::debug!(method = %method, "stream completed"),
                Err(err) => {
                    tracing::debug!(method = %method, error = %err, "stream failed");
                    let _ = errors_tx.send(err);
                }
            }
        });

        CallStream { results, errors }
    }

    async fn run(
        self,
        formatter: &MessageFormatter,
        results: &mpsc::Sender<Vec<u8>>,
    ) -> Result<(), CallError> {
        let Self {
            mut grpc,
            path,
            method,
            requests,
            deadline,
            stats,
        } = self;
        let deadline = deadline.map(|d| Instant::now() + d);

        within(deadline, grpc.ready())
            .await?
            .map_err(|err| CallError::ClientNotReady(err.into()))?;

        let mut request = tonic::Request::new(tokio_stream::iter(requests));
        request.extensions_mut().insert(stats);
        if let Some(deadline) = deadline {
            request.set_timeout(deadline.saturating_duration_since(Instant::now()));
        }

        let codec = DynamicCodec::new(method.output());
        let mut response = within(deadline, grpc.streaming(request, path, codec))
            .await?
            .map_err(|status| from_status(deadline, status))?
            .into_inner();

        while let Some(msg) = within(deadline, response.message())
            .await?
            .map_err(|status| from_status(deadline, status))?
        {
            let rendered = formatter.marshal(&msg).map_err(CallError::InvalidOutput)?;
            if results.send(rendered).await.is_err() {
                break;
            }
        }

        Ok(())
    }
}

async fn within<F: Future>(deadline: Option<Instant>, fut: F) -> Result<F::Output, CallError> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, fut)
            .await
            .map_err(|_| CallError::DeadlineExceeded),
        None => Ok(fut.await),
    }
}

// The transport enforces the `grpc-timeout` header itself and reports its expiry as
// `Cancelled`.
fn from_status(deadline: Option<Instant>, status: Status) -> CallError {
    match deadline {
        Some(deadline) if status.code() == Code::Cancelled && Instant::now() >= deadline => {
            CallError::DeadlineExceeded
        }
        _ => CallError::Status(status),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let internal = CallError::Status(Status::internal("error"));
        assert_eq!(internal.code(), Code::Internal);
        assert!(internal.is_transient());

        let unavailable = CallError::Status(Status::unavailable("down"));
        assert!(!unavailable.is_transient());

        assert!(CallError::DeadlineExceeded.is_transient());
        assert!(!CallError::Connection(ConnectionError::Tls("bad".into())).is_transient());
        assert_eq!(CallError::NoRequests.code(), Code::InvalidArgument);
    }

    #[test]
    fn test_status_display() {
        let err = CallError::Status(Status::internal("error"));
        assert_eq!(err.to_string(), "rpc error: code = Internal desc = error");
    }

    #[test]
    fn test_cancelled_after_deadline_is_deadline_exceeded() {
        let expired = Some(Instant::now());
        let err = from_status(expired, Status::cancelled("Timeout expired"));
        assert_eq!(err.code(), Code::DeadlineExceeded);

        let pending = Some(Instant::now() + Duration::from_secs(60));
        let err = from_status(pending, Status::cancelled("Timeout expired"));
        assert_eq!(err.code(), Code::Cancelled);

        let err = from_status(expired, Status::internal("error"));
        assert_eq!(err.code(), Code::Internal);
    }

    #[tokio::test]
    async fn test_failed_stream_reports_error() {
        let mut stream = CallStream::failed(CallError::NoRequests);
        assert!(stream.next().await.is_none());
        assert!(matches!(stream.outcome().await, Err(CallError::NoRequests)));
    }
}
