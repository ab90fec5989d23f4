//! # Connection Management
//!
//! Everything between a target string and a ready-to-use `tonic` service:
//!
//! * [`ConnectionOptions`] parses targets carrying inline options
//!   (`host=localhost:8080,authority=svc.local,metadata=key:value`).
//! * [`ConnFactory`] dials each distinct host exactly once and hands out the shared
//!   [`Connection`], with TLS, authority override, keepalive and message size policies applied.
//! * [`StatsService`] records per-call [`CallStats`] at the HTTP layer, while
//!   [`MetadataInjector`] adds the configured headers to every outgoing call.
mod factory;
mod metadata;
mod stats;
mod target;
mod tls;

pub use factory::{ConnFactory, ConnFactorySettings, ConnService, Connection, ConnectionError};
pub use metadata::{MetadataError, MetadataInjector};
pub use stats::{CallStats, StatsEvent, StatsService};
pub use target::{ConnectionOptions, TargetError};
pub use tls::TlsSettings;
