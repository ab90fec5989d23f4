//! # Call Statistics
//!
//! [`StatsService`] sits directly above the transport and observes every call carrying a
//! [`CallStats`] handle in its request extensions: outgoing headers and the full method name,
//! incoming headers, the size of every body frame in both directions and the trailers.
//! The call duration is recorded by the caller once the call is over.
use crate::BoxError;
use http::HeaderMap;
use http_body::{Body as HttpBody, Frame, SizeHint};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, ready};
use std::time::Duration;
use tonic::body::Body;
use tonic::codegen::Bytes;
use tower::Service;

/// One observation made while a call is in flight.
#[derive(Debug, Clone)]
pub enum StatsEvent {
    InHeader { wire_len: usize, headers: HeaderMap },
    InPayload { wire_len: usize },
    InTrailer { wire_len: usize, trailers: HeaderMap },
    OutHeader { headers: HeaderMap, full_method: String },
    OutPayload { wire_len: usize },
    OutTrailer { wire_len: usize },
    End { duration: Duration },
}

#[derive(Debug, Default)]
struct Record {
    full_method: String,
    req_size: usize,
    resp_size: usize,
    duration: Duration,
    req_headers: HeaderMap,
    resp_headers: HeaderMap,
    resp_trailers: HeaderMap,
}

/// Diagnostics of a single call, shared between the transport hook and the caller.
#[derive(Debug, Clone, Default)]
pub struct CallStats(Arc<Mutex<Record>>);

impl CallStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, event: StatsEvent) {
        let mut record = self.lock();
        match event {
            StatsEvent::InHeader { wire_len, headers } => {
                record.resp_size += wire_len;
                record.resp_headers = headers;
            }
            StatsEvent::InPayload { wire_len } => record.resp_size += wire_len,
            StatsEvent::InTrailer { wire_len, trailers } => {
                record.resp_size += wire_len;
                record.resp_trailers = trailers;
            }
            StatsEvent::OutHeader {
                headers,
                full_method,
            } => {
                record.req_headers = headers;
                record.full_method = full_method;
            }
            StatsEvent::OutPayload { wire_len } | StatsEvent::OutTrailer { wire_len } => {
                record.req_size += wire_len;
            }
            StatsEvent::End { duration } => record.duration = duration,
        }
    }

    pub fn full_method(&self) -> String {
        self.lock().full_method.clone()
    }

    /// Bytes sent, headers excluded.
    pub fn req_size(&self) -> usize {
        self.lock().req_size
    }

    /// Bytes received, headers and trailers included.
    pub fn resp_size(&self) -> usize {
        self.lock().resp_size
    }

    pub fn duration(&self) -> Duration {
        self.lock().duration
    }

    pub fn req_headers(&self) -> HeaderMap {
        self.lock().req_headers.clone()
    }

    pub fn resp_headers(&self) -> HeaderMap {
        self.lock().resp_headers.clone()
    }

    pub fn resp_trailers(&self) -> HeaderMap {
        self.lock().resp_trailers.clone()
    }

    fn lock(&self) -> MutexGuard<'_, Record> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Wire length of a header block, as the sum of its names and values.
fn headers_len(headers: &HeaderMap) -> usize {
    headers
        .iter()
        .map(|(name, value)| name.as_str().len() + value.len())
        .sum()
}

/// A `tower` layer recording [`CallStats`] for requests that carry them.
#[derive(Debug, Clone)]
pub struct StatsService<S> {
    inner: S,
}

impl<S> StatsService<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

impl<S, ResBody> Service<http::Request<Body>> for StatsService<S>
where
    S: Service<http::Request<Body>, Response = http::Response<ResBody>>,
    S::Future: Send + 'static,
    ResBody: HttpBody<Data = Bytes> + Send + Unpin + 'static,
    ResBody::Error: Into<BoxError>,
{
    type Response = http::Response<Body>;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: http::Request<Body>) -> Self::Future {
        let Some(stats) = request.extensions().get::<CallStats>().cloned() else {
            let fut = self.inner.call(request);
            return Box::pin(async move { Ok(fut.await?.map(Body::new)) });
        };

        stats.record(StatsEvent::OutHeader {
            headers: request.headers().clone(),
            full_method: request.uri().path().to_string(),
        });

        let out_stats = stats.clone();
        let request = request.map(|body| {
            Body::new(CountingBody {
                inner: body,
                stats: out_stats,
                direction: Direction::Out,
            })
        });

        let fut = self.inner.call(request);
        Box::pin(async move {
            let response = fut.await?;
            stats.record(StatsEvent::InHeader {
                wire_len: headers_len(response.headers()),
                headers: response.headers().clone(),
            });

            Ok(response.map(|body| {
                Body::new(CountingBody {
                    inner: body,
                    stats,
                    direction: Direction::In,
                })
            }))
        })
    }
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    In,
    Out,
}

// Reports the size of every frame passing through to the call statistics.
struct CountingBody<B> {
    inner: B,
    stats: CallStats,
    direction: Direction,
}

impl<B> HttpBody for CountingBody<B>
where
    B: HttpBody<Data = Bytes> + Unpin,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        let frame = ready!(Pin::new(&mut this.inner).poll_frame(cx));

        if let Some(Ok(frame)) = &frame {
            let event = match (frame.data_ref(), frame.trailers_ref(), this.direction) {
                (Some(data), _, Direction::In) => Some(StatsEvent::InPayload {
                    wire_len: data.len(),
                }),
                (Some(data), _, Direction::Out) => Some(StatsEvent::OutPayload {
                    wire_len: data.len(),
                }),
                (None, Some(trailers), Direction::In) => Some(StatsEvent::InTrailer {
                    wire_len: headers_len(trailers),
                    trailers: trailers.clone(),
                }),
                (None, Some(trailers), Direction::Out) => Some(StatsEvent::OutTrailer {
                    wire_len: headers_len(trailers),
                }),
                _ => None,
            };

            if let Some(event) = event {
                this.stats.record(event);
            }
        }

        Poll::Ready(frame)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
