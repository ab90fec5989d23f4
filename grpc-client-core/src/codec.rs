//! # Dynamic Message Engine
//!
//! * [`format`] turns user text (JSON or protobuf text format) into [`prost_reflect::DynamicMessage`]s
//!   and back, keeping unknown `google.protobuf.Any` payloads printable.
//! * [`dynamic`] implements `tonic::codec::Codec` for dynamic messages so they can travel
//!   over a `tonic` stream without generated types.
mod dynamic;
mod format;

pub use dynamic::{DynamicCodec, DynamicDecoder, DynamicEncoder};
pub use format::{FormatError, MessageFormat, MessageFormatter, UnknownFormat};
