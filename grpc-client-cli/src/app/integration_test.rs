use super::{App, StartOpts};
use crate::line_reader::ScriptedReader;
use grpc_client_core::caller::CallError;
use grpc_client_core::codec::MessageFormat;
use grpc_client_core::descriptor::ReflectionVersion;
use grpc_client_core::tonic::Code;
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;
use testing_service::Reflection;

const BODY: &str = "dGVzdEJvZHk=";

async fn start_opts(reflection: Reflection) -> StartOpts {
    colored::control::set_override(false);

    let addr = testing_service::spawn_server(reflection)
        .await
        .expect("failed to start server");

    StartOpts {
        target: addr.to_string(),
        service: Some("TestService".to_string()),
        deadline: Duration::from_secs(15),
        reflect_version: ReflectionVersion::V1Alpha,
        ..Default::default()
    }
}

async fn app(opts: StartOpts, lines: &[&str]) -> App<ScriptedReader, Vec<u8>> {
    App::new(opts, ScriptedReader::new(lines), Vec::new())
        .await
        .expect("failed to load services")
}

async fn run_once(opts: StartOpts, method: &str, message: &str) -> (anyhow::Result<()>, String) {
    let mut app = app(
        StartOpts {
            method: Some(method.to_string()),
            ..opts
        },
        &[],
    )
    .await;

    let result = app.start(message.as_bytes()).await;
    (result, String::from_utf8(app.out).unwrap())
}

fn json(out: &str) -> Value {
    serde_json::from_str(out).unwrap_or_else(|e| panic!("invalid JSON output ({e}): {out}"))
}

#[tokio::test]
async fn test_unary_call() {
    let opts = start_opts(Reflection::V1Alpha).await;
    let message = format!(r#"{{"payload":{{"type":"UNCOMPRESSABLE","body":"{BODY}"}}}}"#);

    let (result, out) = run_once(opts, "unarycall", &message).await;

    result.unwrap();
    let out = json(&out);
    assert_eq!(out["payload"]["type"], "UNCOMPRESSABLE");
    assert_eq!(out["payload"]["body"], BODY);
}

#[tokio::test]
async fn test_server_stream_is_printed_as_array() {
    let opts = start_opts(Reflection::V1Alpha).await;
    let message = format!(
        r#"{{"payload":{{"body":"{BODY}"}},"response_parameters":[{{"size":3}},{{"size":5}}]}}"#
    );

    let (result, out) = run_once(opts, "StreamingOutputCall", &message).await;

    result.unwrap();
    let out = json(&out);
    let items = out.as_array().unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(items[0]["payload"]["body"], "dGVzdEJvZHl0ZXN0Qm9keXRlc3RCb2R5");
}

#[tokio::test]
async fn test_client_stream_from_json_array() {
    let opts = start_opts(Reflection::V1Alpha).await;
    let message = format!(r#"[{{"payload":{{"body":"{BODY}"}}}}, {{"payload":{{"body":"{BODY}"}}}}]"#);

    let (result, out) = run_once(opts, "StreamingInputCall", &message).await;

    result.unwrap();
    assert_eq!(json(&out)["aggregated_payload_size"], 16);
}

#[tokio::test]
async fn test_server_error_ends_scripted_run() {
    let opts = start_opts(Reflection::V1Alpha).await;

    let (result, _) = run_once(opts, "UnaryCall", r#"{"response_status":{"code":13}}"#).await;

    let err = result.unwrap_err();
    let err = err.downcast_ref::<CallError>().expect("not a call error");
    assert_eq!(err.code(), Code::Internal);
}

#[tokio::test]
async fn test_unknown_names_in_scripted_run() {
    let opts = start_opts(Reflection::V1Alpha).await;

    let (result, _) = run_once(
        StartOpts {
            service: Some("NoSuchService".to_string()),
            ..opts.clone()
        },
        "UnaryCall",
        "{}",
    )
    .await;
    assert_eq!(
        result.unwrap_err().to_string(),
        "service name not found or invalid"
    );

    let (result, _) = run_once(opts, "NoSuchMethod", "{}").await;
    assert_eq!(
        result.unwrap_err().to_string(),
        "method name not found or invalid"
    );
}

#[tokio::test]
async fn test_text_formats() {
    let opts = start_opts(Reflection::V1Alpha).await;

    let (result, out) = run_once(
        StartOpts {
            in_format: MessageFormat::Text,
            out_format: MessageFormat::Text,
            ..opts
        },
        "UnaryCall",
        r#"payload { type: UNCOMPRESSABLE body: "testBody" }"#,
    )
    .await;

    result.unwrap();
    assert!(out.contains("UNCOMPRESSABLE"), "{out}");
    assert!(out.contains(r#""testBody""#), "{out}");
}

#[tokio::test]
async fn test_verbose_prints_call_details() {
    let opts = start_opts(Reflection::V1Alpha).await;

    let (result, out) = run_once(
        StartOpts {
            verbose: true,
            ..opts
        },
        "UnaryCall",
        "{}",
    )
    .await;

    result.unwrap();
    assert!(out.contains("Method: /grpc.testing.TestService/UnaryCall"), "{out}");
    assert!(out.contains("Status: 0 Ok"), "{out}");
    assert!(out.contains("Request size: "), "{out}");
}

#[tokio::test]
async fn test_discover_prints_service_file() {
    let opts = start_opts(Reflection::V1Alpha).await;
    let mut app = app(
        StartOpts {
            discover: true,
            ..opts
        },
        &[],
    )
    .await;

    app.start(b"{}").await.unwrap();

    let out = String::from_utf8(app.out).unwrap();
    assert!(out.contains("service TestService"), "{out}");
    for method in [
        "EmptyCall",
        "UnaryCall",
        "StreamingOutputCall",
        "StreamingInputCall",
        "FullDuplexCall",
        "HalfDuplexCall",
    ] {
        assert!(out.contains(&format!("rpc {method}(")), "{method}: {out}");
    }
}

#[tokio::test]
async fn test_interactive_session() {
    let opts = start_opts(Reflection::V1Alpha).await;
    let request = format!(r#"{{"payload":{{"body":"{BODY}"}}}}"#);

    let mut app = app(
        StartOpts {
            service: None,
            interactive: true,
            ..opts
        },
        &["grpc.testing.testservice", "UnaryCall", "?", &request],
    )
    .await;

    // Input runs out at the next message prompt, then at each menu on the way back.
    app.start(b"").await.unwrap();

    let out = String::from_utf8(app.out).unwrap();
    assert!(out.contains("Choose a service:"), "{out}");
    assert!(out.contains("Choose a method:"), "{out}");
    assert!(out.contains("0) [..]"), "{out}");
    assert!(out.contains(r#""response_size": 0"#), "{out}");
    assert!(out.contains(&format!(r#""body": "{BODY}""#)), "{out}");
    assert_eq!(out.matches("Choose a service:").count(), 2, "{out}");
}

#[tokio::test]
async fn test_transient_error_prompts_again() {
    let opts = start_opts(Reflection::V1Alpha).await;
    let request = format!(r#"{{"payload":{{"body":"{BODY}"}}}}"#);

    let mut app = app(
        StartOpts {
            method: Some("UnaryCall".to_string()),
            interactive: true,
            ..opts
        },
        &[r#"{"response_status":{"code":13}}"#, &request],
    )
    .await;

    app.start(b"").await.unwrap();

    let out = String::from_utf8(app.out).unwrap();
    assert!(out.contains("Error: rpc error: code = Internal"), "{out}");
    assert!(out.contains(&format!(r#""body": "{BODY}""#)), "{out}");
}

#[tokio::test]
async fn test_back_to_service_selection() {
    let opts = start_opts(Reflection::V1Alpha).await;

    let mut app = app(
        StartOpts {
            interactive: true,
            ..opts
        },
        &["[..]", "grpc.health.v1.Health", "check", "{}"],
    )
    .await;

    app.start(b"").await.unwrap();

    let out = String::from_utf8(app.out).unwrap();
    assert!(out.contains(r#""status": "SERVING""#), "{out}");
}

#[tokio::test]
async fn test_invalid_menu_choice() {
    let opts = start_opts(Reflection::V1Alpha).await;

    let mut app = app(
        StartOpts {
            interactive: true,
            ..opts
        },
        &["99", "nope", "0"],
    )
    .await;

    app.start(b"").await.unwrap();

    let out = String::from_utf8(app.out).unwrap();
    assert!(out.contains("invalid choice '99'"), "{out}");
    assert!(out.contains("invalid choice 'nope'"), "{out}");
}

#[tokio::test]
async fn test_proto_files_without_reflection() {
    let opts = start_opts(Reflection::None).await;
    let proto_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../testing-service/proto");

    let (result, out) = run_once(
        StartOpts {
            protos: vec![proto_dir],
            ..opts
        },
        "UnaryCall",
        &format!(r#"{{"payload":{{"body":"{BODY}"}}}}"#),
    )
    .await;

    result.unwrap();
    assert_eq!(json(&out)["payload"]["body"], BODY);
}

#[tokio::test]
async fn test_reflection_unavailable() {
    let opts = start_opts(Reflection::None).await;

    let result = App::new(opts, ScriptedReader::new(&[]), Vec::new()).await;

    assert!(result.is_err());
}
