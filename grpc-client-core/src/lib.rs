//! # gRPC Client Core
//!
//! `grpc-client-core` is the library powering the `grpc-client-cli` binary. It invokes
//! any method of any gRPC server without compile-time knowledge of the Protobuf schema.
//!
//! ## Key Components
//!
//! * **[`descriptor`]:** Acquires service descriptors, either through the server reflection
//!   protocol or by compiling `.proto` files, and builds the [`descriptor::TypeRegistry`]
//!   used to resolve `google.protobuf.Any` payloads.
//! * **[`codec`]:** Marshals dynamic messages to and from JSON or protobuf text format and
//!   bridges them to `tonic` through a custom codec.
//! * **[`rpc`]:** Connection management. One lazily dialed, multiplexed channel per target
//!   host, with TLS policies, metadata injection and per-call statistics.
//! * **[`caller::ServiceCaller`]:** The generic invocation engine. Every method, whatever its
//!   cardinality, is driven as a bidirectional stream.
//! * **[`health`]:** A `grpc.health.v1.Health/Check` helper built on top of the engine.
//!
//! ## Re-exports
//!
//! This crate re-exports `prost`, `prost-reflect`, and `tonic` to ensure that consumers
//! use compatible versions of these underlying dependencies.
pub mod caller;
pub mod codec;
pub mod descriptor;
pub mod health;
pub mod rpc;

// Re-exports
pub use prost;
pub use prost_reflect;
pub use tonic;

/// Type alias for the standard boxed error used in generic bounds.
type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;
