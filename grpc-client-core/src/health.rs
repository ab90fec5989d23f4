//! # Health Checks
//!
//! Runs `grpc.health.v1.Health/Check` through the generic [`ServiceCaller`], with the health
//! schema compiled at runtime from an embedded definition.
use crate::caller::{CallContext, CallError, ServiceCaller};
use crate::codec::MessageFormatter;
use crate::descriptor::{RegistryError, TypeRegistry};
use crate::rpc::ConnFactory;
use prost_reflect::MethodDescriptor;
use protox::file::{File, FileResolver};
use std::sync::Arc;

const HEALTH_FILE: &str = "grpc/health/v1/health.proto";
const HEALTH_SERVICE: &str = "grpc.health.v1.Health";
const HEALTH_PROTO: &str = r#"
syntax = "proto3";

package grpc.health.v1;

message HealthCheckRequest {
  string service = 1;
}

message HealthCheckResponse {
  enum ServingStatus {
    UNKNOWN = 0;
    SERVING = 1;
    NOT_SERVING = 2;
    SERVICE_UNKNOWN = 3;
  }
  ServingStatus status = 1;
}

service Health {
  rpc Check(HealthCheckRequest) returns (HealthCheckResponse);
  rpc Watch(HealthCheckRequest) returns (stream HealthCheckResponse);
}
"#;

#[derive(Debug, thiserror::Error)]
pub enum HealthError {
    #[error("Failed to compile the health schema: {0}")]
    Schema(#[from] Box<protox::Error>),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("Method '{0}' is missing from the health schema")]
    MissingMethod(&'static str),

    #[error(transparent)]
    Call(#[from] CallError),

    #[error("Health check returned no response")]
    NoResponse,

    #[error("Invalid health check response: {0}")]
    Json(#[from] serde_json::Error),
}

/// The answer of a health check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthReport {
    /// Serving status name, such as `SERVING` or `NOT_SERVING`.
    pub status: String,
    /// The full response rendered as JSON.
    pub response: Vec<u8>,
}

impl HealthReport {
    pub fn is_serving(&self) -> bool {
        self.status == "SERVING"
    }
}

#[derive(Debug, Clone)]
pub struct HealthChecker {
    caller: ServiceCaller,
    method: MethodDescriptor,
}

impl HealthChecker {
    pub fn new(factory: Arc<ConnFactory>) -> Result<Self, HealthError> {
        let files = protox::Compiler::with_file_resolver(EmbeddedHealth)
            .include_imports(true)
            .open_file(HEALTH_FILE)
            .map_err(Box::new)?
            .file_descriptor_set()
            .file;

        let registry = Arc::new(TypeRegistry::new(files)?);
        let method = registry
            .pool()
            .get_service_by_name(HEALTH_SERVICE)
            .and_then(|svc| svc.methods().find(|m| m.name() == "Check"))
            .ok_or(HealthError::MissingMethod("Check"))?;

        Ok(Self {
            caller: ServiceCaller::new(factory, MessageFormatter::new(registry)),
            method,
        })
    }

    /// Checks `service` on `target`. An empty name asks about the server as a whole.
    pub async fn check(
        &self,
        ctx: &CallContext,
        target: &str,
        service: &str,
    ) -> Result<HealthReport, HealthError> {
        let request = serde_json::to_vec(&serde_json::json!({ "service": service }))?;

        let response = self
            .caller
            .call_client_stream(ctx, target, &self.method, &[request])
            .await?
            .ok_or(HealthError::NoResponse)?;

        let value: serde_json::Value = serde_json::from_slice(&response)?;
        let status = value
            .get("status")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("UNKNOWN")
            .to_string();

        tracing::debug!(addr = target, service, status = %status, "health check answered");
        Ok(HealthReport { status, response })
    }
}

struct EmbeddedHealth;

impl FileResolver for EmbeddedHealth {
    fn open_file(&self, name: &str) -> Result<File, protox::Error> {
        if name == HEALTH_FILE {
            File::from_source(name, HEALTH_PROTO)
        } else {
            Err(protox::Error::file_not_found(name))
        }
    }
}
