use grpc_client_core::caller::{CallContext, CallError, ServiceCaller};
use grpc_client_core::codec::{FormatError, MessageFormatter};
use grpc_client_core::descriptor::{ServiceMetaList, TypeRegistry};
use grpc_client_core::prost::Message;
use grpc_client_core::prost_reflect::MethodDescriptor;
use grpc_client_core::rpc::{ConnFactory, ConnFactorySettings};
use prost_types::FileDescriptorSet;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use testing_service::{CHECK_HEADER, EXIT_CODE_HEADER, FILE_DESCRIPTOR_SET, Reflection};
use tonic::Code;

const TEST_SERVICE: &str = "grpc.testing.TestService";

struct Setup {
    caller: ServiceCaller,
    services: ServiceMetaList,
    target: String,
}

impl Setup {
    fn method(&self, name: &str) -> MethodDescriptor {
        self.services.services()[0]
            .method(name)
            .cloned()
            .expect("method not found")
    }
}

async fn setup_with(settings: ConnFactorySettings) -> Setup {
    let addr = testing_service::spawn_server(Reflection::None)
        .await
        .expect("failed to start server");

    let fds = FileDescriptorSet::decode(FILE_DESCRIPTOR_SET).unwrap();
    let registry = Arc::new(TypeRegistry::new(fds.file).unwrap());
    let services = ServiceMetaList::new(registry.clone(), [TEST_SERVICE]).unwrap();

    let caller = ServiceCaller::new(
        Arc::new(ConnFactory::new(settings)),
        MessageFormatter::new(registry),
    );

    Setup {
        caller,
        services,
        target: addr.to_string(),
    }
}

async fn setup() -> Setup {
    setup_with(ConnFactorySettings::default()).await
}

fn ctx() -> CallContext {
    CallContext::new(Duration::from_secs(15))
}

fn json(bytes: &[u8]) -> Value {
    serde_json::from_slice(bytes).expect("response is not valid JSON")
}

#[tokio::test]
async fn test_unary_call_echoes_payload() {
    let setup = setup().await;
    let method = setup.method("UnaryCall");

    let request = br#"{"payload":{"type":"UNCOMPRESSABLE","body":"dGVzdEJvZHk="}}"#.to_vec();
    let response = setup
        .caller
        .call_client_stream(&ctx(), &setup.target, &method, &[request])
        .await
        .unwrap()
        .expect("unary call returned nothing");

    let response = json(&response);
    assert_eq!(response["payload"]["type"], "UNCOMPRESSABLE");
    assert_eq!(response["payload"]["body"], "dGVzdEJvZHk=");
}

#[tokio::test]
async fn test_error_status_is_transient() {
    let setup = setup().await;
    let method = setup.method("UnaryCall");

    let request = br#"{"response_status":{"code":13}}"#.to_vec();
    let err = setup
        .caller
        .call_client_stream(&ctx(), &setup.target, &method, &[request])
        .await
        .unwrap_err();

    assert!(matches!(&err, CallError::Status(status) if status.code() == Code::Internal));
    assert_eq!(err.code(), Code::Internal);
    assert!(err.is_transient());
}

#[tokio::test]
async fn test_client_stream_aggregates_payloads() {
    let setup = setup().await;
    let method = setup.method("StreamingInputCall");

    let request = br#"{"payload":{"body":"dGVzdEJvZHk="}}"#.to_vec();
    let response = setup
        .caller
        .call_client_stream(
            &ctx(),
            &setup.target,
            &method,
            &[request.clone(), request],
        )
        .await
        .unwrap()
        .unwrap();

    assert_eq!(json(&response)["aggregated_payload_size"], 16);
}

#[tokio::test]
async fn test_server_stream_keeps_order() {
    let setup = setup().await;
    let method = setup.method("StreamingOutputCall");

    let request = br#"{
        "response_parameters": [{"size": 3}, {"size": 5}],
        "payload": {"body": "dGVzdEJvZHk="}
    }"#
    .to_vec();

    let mut stream = setup
        .caller
        .call_stream(&ctx(), &setup.target, &method, &[request])
        .await;

    let mut bodies = Vec::new();
    while let Some(msg) = stream.next().await {
        bodies.push(json(&msg)["payload"]["body"].as_str().unwrap().to_string());
    }
    stream.outcome().await.unwrap();

    assert_eq!(
        bodies,
        vec![
            "dGVzdEJvZHl0ZXN0Qm9keXRlc3RCb2R5",
            "dGVzdEJvZHl0ZXN0Qm9keXRlc3RCb2R5dGVzdEJvZHl0ZXN0Qm9keQ==",
        ]
    );
}

#[tokio::test]
async fn test_bidi_stream_answers_every_request() {
    let setup = setup().await;
    let method = setup.method("FullDuplexCall");

    let request = br#"{"response_parameters":[{"size":1}],"payload":{"body":"dGVzdEJvZHk="}}"#;
    let mut stream = setup
        .caller
        .call_stream(
            &ctx(),
            &setup.target,
            &method,
            &[request.to_vec(), request.to_vec(), request.to_vec()],
        )
        .await;

    let mut count = 0;
    while let Some(msg) = stream.next().await {
        assert_eq!(json(&msg)["payload"]["body"], "dGVzdEJvZHk=");
        count += 1;
    }

    assert!(stream.outcome().await.is_ok());
    assert_eq!(count, 3);
}

#[tokio::test]
async fn test_stream_error_from_headers() {
    let setup = setup_with(ConnFactorySettings {
        headers: vec![(EXIT_CODE_HEADER.to_string(), "13".to_string())],
        ..Default::default()
    })
    .await;
    let method = setup.method("FullDuplexCall");

    let mut stream = setup
        .caller
        .call_stream(&ctx(), &setup.target, &method, &[b"{}".to_vec()])
        .await;

    assert!(stream.next().await.is_none());
    let err = stream.outcome().await.unwrap_err();
    assert_eq!(err.code(), Code::Internal);
}

#[tokio::test]
async fn test_inline_metadata_reaches_server() {
    let setup = setup_with(ConnFactorySettings {
        headers: vec![(CHECK_HEADER.to_string(), "x-user=alice".to_string())],
        ..Default::default()
    })
    .await;
    let method = setup.method("UnaryCall");

    let ok_target = format!("host={},metadata=x-user:alice", setup.target);
    let result = setup
        .caller
        .call_client_stream(&ctx(), &ok_target, &method, &[b"{}".to_vec()])
        .await;
    assert!(result.is_ok());

    // Same host, so the connection opened above with its headers is reused.
    let other_target = format!("host={},metadata=x-user:bob", setup.target);
    let result = setup
        .caller
        .call_client_stream(&ctx(), &other_target, &method, &[b"{}".to_vec()])
        .await;
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_mismatched_header_is_rejected() {
    let setup = setup_with(ConnFactorySettings {
        headers: vec![
            (CHECK_HEADER.to_string(), "x-user=alice".to_string()),
            ("x-user".to_string(), "bob".to_string()),
        ],
        ..Default::default()
    })
    .await;
    let method = setup.method("UnaryCall");

    let err = setup
        .caller
        .call_client_stream(&ctx(), &setup.target, &method, &[b"{}".to_vec()])
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
}

#[tokio::test]
async fn test_empty_request_list_is_rejected() {
    let setup = setup().await;
    let method = setup.method("UnaryCall");

    let result = setup
        .caller
        .call_client_stream(&ctx(), &setup.target, &method, &[])
        .await;
    assert!(matches!(result, Err(CallError::NoRequests)));
}

#[tokio::test]
async fn test_invalid_input_is_reported() {
    let setup = setup().await;
    let method = setup.method("UnaryCall");

    let truncated = setup
        .caller
        .call_client_stream(&ctx(), &setup.target, &method, &[br#"{"payload":"#.to_vec()])
        .await;
    assert!(matches!(
        truncated,
        Err(CallError::InvalidInput {
            source: FormatError::Syntax(_),
            ..
        })
    ));

    let unknown_field = setup
        .caller
        .call_client_stream(&ctx(), &setup.target, &method, &[br#"{"nope":1}"#.to_vec()])
        .await;
    assert!(matches!(
        unknown_field,
        Err(CallError::InvalidInput {
            source: FormatError::Invalid(_),
            ..
        })
    ));
}

#[tokio::test]
async fn test_call_statistics_are_recorded() {
    let setup = setup().await;
    let method = setup.method("UnaryCall");
    let ctx = ctx();

    setup
        .caller
        .call_client_stream(
            &ctx,
            &setup.target,
            &method,
            &[br#"{"payload":{"body":"dGVzdEJvZHk="}}"#.to_vec()],
        )
        .await
        .unwrap();

    let stats = &ctx.stats;
    assert_eq!(stats.full_method(), "/grpc.testing.TestService/UnaryCall");
    assert!(stats.req_size() > 0);
    assert!(stats.resp_size() > 0);
    assert!(stats.duration() > Duration::ZERO);
    assert!(stats.resp_trailers().contains_key("grpc-status"));
    assert!(
        stats
            .req_headers()
            .get("content-type")
            .is_some_and(|v| v.as_bytes().starts_with(b"application/grpc"))
    );
}

#[tokio::test]
async fn test_unreachable_server_is_not_transient() {
    let setup = setup().await;
    let method = setup.method("UnaryCall");

    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let target = listener.local_addr().unwrap().to_string();
    drop(listener);

    let err = setup
        .caller
        .call_client_stream(&ctx(), &target, &method, &[b"{}".to_vec()])
        .await
        .unwrap_err();

    assert_eq!(err.code(), Code::Unavailable);
    assert!(!err.is_transient());
}

#[tokio::test]
async fn test_deadline_expires_mid_stream() {
    let setup = setup().await;
    let method = setup.method("StreamingOutputCall");

    let request = br#"{"payload":{"body":"dGVzdEJvZHk="},"response_parameters":[{"size":1},{"size":1,"interval_us":5000000}]}"#.to_vec();
    let started = std::time::Instant::now();
    let mut stream = setup
        .caller
        .call_stream(
            &CallContext::new(Duration::from_millis(300)),
            &setup.target,
            &method,
            &[request],
        )
        .await;

    assert!(stream.next().await.is_some());
    assert!(stream.next().await.is_none());

    let err = stream.outcome().await.unwrap_err();
    assert_eq!(err.code(), Code::DeadlineExceeded);
    assert!(err.is_transient());
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_deadline_on_silent_server() {
    let setup = setup().await;
    let method = setup.method("UnaryCall");

    // Accepts connections but never speaks HTTP/2.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target = listener.local_addr().unwrap().to_string();

    let err = setup
        .caller
        .call_client_stream(
            &CallContext::new(Duration::from_millis(300)),
            &target,
            &method,
            &[b"{}".to_vec()],
        )
        .await
        .unwrap_err();
    drop(listener);

    assert_eq!(err.code(), Code::DeadlineExceeded);
    assert_eq!(
        err.to_string(),
        "rpc error: code = DeadlineExceeded desc = context deadline exceeded"
    );
}
