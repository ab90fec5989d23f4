//! # Descriptor Acquisition
//!
//! Everything needed to learn the shape of a server's services at runtime.
//!
//! Two strategies produce the same [`ServiceMetaList`]:
//!
//! * [`ReflectionSource`] asks the server itself through the reflection protocol.
//! * [`ProtoSource`] compiles `.proto` files found on disk.
//!
//! Both funnel the collected `FileDescriptorProto`s through a [`FileDescriptorCache`],
//! fill in missing JSON names and build a single [`TypeRegistry`] from which the
//! service descriptors are taken.
mod cache;
mod json_names;
mod meta;
mod protos;
mod reflection;
mod registry;
mod walker;

pub use cache::FileDescriptorCache;
pub use json_names::{fill_json_names, to_lower_camel_case};
pub use meta::{AcquireError, ServiceMeta, ServiceMetaList, ServiceMetaProvider};
pub use protos::{ProtoFiles, ProtoSource, ProtoSourceError, additional_files, parse_proto_files};
pub use reflection::{
    ReflectionClient, ReflectionResolveError, ReflectionSource, ReflectionVersion,
    acquire_services,
};
pub use registry::{RegistryError, TypeRegistry, UNRESOLVED_ANY_ERR, UNRESOLVED_ANY_NAME};
pub use walker::{FieldWalker, field_names};
