//! # Testing Service
//!
//! **INTERNAL USE ONLY**: This crate exists solely to provide gRPC server implementations
//! (`grpc.testing.TestService` and `grpc.health.v1.Health`) and their descriptor set for
//! integration testing `grpc-client-core` and `grpc-client-cli`.
//! It is not intended for production use.
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tonic::metadata::MetadataMap;
use tonic::service::Routes;
use tonic::transport::Server;
use tonic::{Code, Request, Response, Status, Streaming};

pub mod pb {
    pub mod testing {
        include!(concat!(env!("OUT_DIR"), "/grpc.testing.rs"));
    }

    pub mod health {
        include!(concat!(env!("OUT_DIR"), "/grpc.health.v1.rs"));
    }
}

use pb::health::health_check_response::ServingStatus;
use pb::health::{HealthCheckRequest, HealthCheckResponse};
use pb::testing::{
    Empty, Payload, SimpleRequest, SimpleResponse, StreamingInputCallRequest,
    StreamingInputCallResponse, StreamingOutputCallRequest, StreamingOutputCallResponse,
};

pub use pb::health::health_server::{Health, HealthServer};
pub use pb::testing::test_service_server::{TestService, TestServiceServer};

pub const FILE_DESCRIPTOR_SET: &[u8] = tonic::include_file_descriptor_set!("descriptors");

/// Metadata key carrying the status code a streaming method must fail with.
pub const EXIT_CODE_HEADER: &str = "exit-code";

/// Metadata key carrying `key=value` pairs `UnaryCall` validates against the request headers.
pub const CHECK_HEADER: &str = "check-header";

/// Which server reflection protocol versions the spawned server exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reflection {
    None,
    V1,
    V1Alpha,
    Both,
}

/// Starts a `TestService` + `Health` server on a random loopback port and returns its address.
pub async fn spawn_server(reflection: Reflection) -> std::io::Result<SocketAddr> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    let mut routes = Routes::new(TestServiceServer::new(TestServiceImpl))
        .add_service(HealthServer::new(HealthServiceImpl));

    if matches!(reflection, Reflection::V1 | Reflection::Both) {
        let v1 = tonic_reflection::server::Builder::configure()
            .register_encoded_file_descriptor_set(FILE_DESCRIPTOR_SET)
            .build_v1()
            .map_err(std::io::Error::other)?;
        routes = routes.add_service(v1);
    }

    if matches!(reflection, Reflection::V1Alpha | Reflection::Both) {
        let v1alpha = tonic_reflection::server::Builder::configure()
            .register_encoded_file_descriptor_set(FILE_DESCRIPTOR_SET)
            .build_v1alpha()
            .map_err(std::io::Error::other)?;
        routes = routes.add_service(v1alpha);
    }

    let incoming = TcpListenerStream::new(listener);
    tokio::spawn(async move {
        let _ = Server::builder()
            .add_routes(routes)
            .serve_with_incoming(incoming)
            .await;
    });

    Ok(addr)
}

pub struct TestServiceImpl;

#[tonic::async_trait]
impl TestService for TestServiceImpl {
    type StreamingOutputCallStream = ReceiverStream<Result<StreamingOutputCallResponse, Status>>;
    type FullDuplexCallStream = ReceiverStream<Result<StreamingOutputCallResponse, Status>>;
    type HalfDuplexCallStream = ReceiverStream<Result<StreamingOutputCallResponse, Status>>;

    async fn empty_call(&self, req: Request<Empty>) -> Result<Response<Empty>, Status> {
        Ok(Response::new(req.into_inner()))
    }

    async fn unary_call(
        &self,
        req: Request<SimpleRequest>,
    ) -> Result<Response<SimpleResponse>, Status> {
        for (key, expected) in check_headers(req.metadata()) {
            let actual = req.metadata().get(key.as_str()).and_then(|v| v.to_str().ok());
            if let Some(actual) = actual
                && actual != expected
            {
                return Err(Status::invalid_argument(format!(
                    "header '{key}' validation failed"
                )));
            }
        }

        let req = req.into_inner();
        if let Some(status) = req.response_status
            && status.code != Code::Ok as i32
        {
            return Err(Status::new(Code::from(status.code), "error"));
        }

        Ok(Response::new(SimpleResponse {
            payload: req.payload,
            ..Default::default()
        }))
    }

    async fn streaming_output_call(
        &self,
        req: Request<StreamingOutputCallRequest>,
    ) -> Result<Response<Self::StreamingOutputCallStream>, Status> {
        let req = req.into_inner();
        if let Some(status) = &req.response_status
            && status.code != Code::Ok as i32
        {
            return Err(Status::new(Code::from(status.code), "error"));
        }

        let (tx, rx) = mpsc::channel(4);
        tokio::spawn(async move {
            let intervals = req
                .response_parameters
                .iter()
                .map(|param| Duration::from_micros(param.interval_us.max(0) as u64));

            for (interval, resp) in intervals.zip(output_responses(&req)) {
                tokio::time::sleep(interval).await;
                if tx.send(Ok(resp)).await.is_err() {
                    break;
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn streaming_input_call(
        &self,
        req: Request<Streaming<StreamingInputCallRequest>>,
    ) -> Result<Response<StreamingInputCallResponse>, Status> {
        let exit_code = exit_code(req.metadata());
        if exit_code != Code::Ok {
            return Err(Status::new(exit_code, "error"));
        }

        let mut stream = req.into_inner();
        let mut size = 0;
        while let Some(msg) = stream.message().await? {
            size += msg.payload.map(|p| p.body.len()).unwrap_or_default();
        }

        Ok(Response::new(StreamingInputCallResponse {
            aggregated_payload_size: size as i32,
        }))
    }

    async fn full_duplex_call(
        &self,
        req: Request<Streaming<StreamingOutputCallRequest>>,
    ) -> Result<Response<Self::FullDuplexCallStream>, Status> {
        let exit_code = exit_code(req.metadata());
        if exit_code != Code::Ok {
            return Err(Status::new(exit_code, "error"));
        }

        let mut stream = req.into_inner();
        let (tx, rx) = mpsc::channel(4);
        tokio::spawn(async move {
            loop {
                let req = match stream.message().await {
                    Ok(Some(req)) => req,
                    Ok(None) => break,
                    Err(status) => {
                        let _ = tx.send(Err(Status::internal(status.message()))).await;
                        break;
                    }
                };

                if let Some(status) = &req.response_status
                    && status.code != Code::Ok as i32
                {
                    let _ = tx
                        .send(Err(Status::new(Code::from(status.code), "error")))
                        .await;
                    break;
                }

                for resp in output_responses(&req) {
                    if tx.send(Ok(resp)).await.is_err() {
                        return;
                    }
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn half_duplex_call(
        &self,
        req: Request<Streaming<StreamingOutputCallRequest>>,
    ) -> Result<Response<Self::HalfDuplexCallStream>, Status> {
        let mut stream = req.into_inner();
        let mut requests = Vec::new();
        while let Some(req) = stream
            .message()
            .await
            .map_err(|status| Status::internal(status.message()))?
        {
            requests.push(req);
        }

        let (tx, rx) = mpsc::channel(4);
        tokio::spawn(async move {
            for resp in requests.iter().flat_map(output_responses) {
                if tx.send(Ok(resp)).await.is_err() {
                    break;
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

pub struct HealthServiceImpl;

#[tonic::async_trait]
impl Health for HealthServiceImpl {
    type WatchStream = ReceiverStream<Result<HealthCheckResponse, Status>>;

    async fn check(
        &self,
        req: Request<HealthCheckRequest>,
    ) -> Result<Response<HealthCheckResponse>, Status> {
        let status = match req.into_inner().service.as_str() {
            "error" => return Err(Status::internal("error")),
            "unhealthy" => ServingStatus::NotServing,
            _ => ServingStatus::Serving,
        };

        Ok(Response::new(HealthCheckResponse {
            status: status as i32,
        }))
    }

    async fn watch(
        &self,
        _req: Request<HealthCheckRequest>,
    ) -> Result<Response<Self::WatchStream>, Status> {
        Err(Status::unimplemented("Watching is not supported"))
    }
}

// One response per requested size, each body being the request body repeated `size` times.
fn output_responses(req: &StreamingOutputCallRequest) -> Vec<StreamingOutputCallResponse> {
    let body = req
        .payload
        .as_ref()
        .map(|p| p.body.as_slice())
        .unwrap_or_default();

    req.response_parameters
        .iter()
        .map(|param| StreamingOutputCallResponse {
            payload: Some(Payload {
                r#type: req.response_type,
                body: body.repeat(param.size.max(0) as usize),
            }),
        })
        .collect()
}

fn check_headers(metadata: &MetadataMap) -> Vec<(String, String)> {
    metadata
        .get_all(CHECK_HEADER)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .map(|h| match h.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (h.to_string(), String::new()),
        })
        .collect()
}

fn exit_code(metadata: &MetadataMap) -> Code {
    metadata
        .get_all(EXIT_CODE_HEADER)
        .iter()
        .last()
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<i32>().ok())
        .map(Code::from)
        .unwrap_or(Code::Ok)
}
