use super::json_names::fill_json_names;
use prost::Message;
use prost_reflect::{DescriptorError, DescriptorPool, DynamicMessage, MessageDescriptor, Value};
use prost_types::{
    DescriptorProto, FieldDescriptorProto, FileDescriptorProto, FileDescriptorSet,
    field_descriptor_proto::{Label, Type},
};
use protox::file::GoogleFileResolver;

/// Fully-qualified name of the message used in place of `Any` payloads whose type is unknown.
pub const UNRESOLVED_ANY_NAME: &str = "grpc_client_cli.UnresolvedAny";

/// Value written to the `err` field of an [`UNRESOLVED_ANY_NAME`] message.
pub const UNRESOLVED_ANY_ERR: &str = "type not found";

const UNRESOLVED_ANY_FILE: &str = "grpc_client_cli/unresolved_any.proto";

const WELL_KNOWN_FILES: &[&str] = &[
    "google/protobuf/any.proto",
    "google/protobuf/api.proto",
    "google/protobuf/descriptor.proto",
    "google/protobuf/duration.proto",
    "google/protobuf/empty.proto",
    "google/protobuf/field_mask.proto",
    "google/protobuf/source_context.proto",
    "google/protobuf/struct.proto",
    "google/protobuf/timestamp.proto",
    "google/protobuf/type.proto",
    "google/protobuf/wrappers.proto",
];

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Failed to build descriptor pool: '{0}'")]
    Descriptor(#[from] DescriptorError),
    #[error("Failed to load well-known types: '{0}'")]
    WellKnown(#[from] Box<protox::Error>),
    #[error("Placeholder type '{UNRESOLVED_ANY_NAME}' is missing from the pool")]
    MissingPlaceholder,
}

/// Resolves message types by name for the lifetime of a session.
///
/// The underlying pool starts from the global pool plus the well-known types, then gets the
/// placeholder type and every file discovered while acquiring descriptors. Lookups never
/// fail from the caller's perspective: unknown names resolve to the placeholder.
#[derive(Debug, Clone)]
pub struct TypeRegistry {
    pool: DescriptorPool,
    unresolved: MessageDescriptor,
}

impl TypeRegistry {
    /// Builds a registry over `files`. Files already present in the pool (by name) are skipped
    /// and every field is given a JSON name before insertion.
    pub fn new(
        files: impl IntoIterator<Item = FileDescriptorProto>,
    ) -> Result<Self, RegistryError> {
        let mut pool = DescriptorPool::global();

        let well_known = protox::Compiler::with_file_resolver(GoogleFileResolver::new())
            .include_imports(true)
            .open_files(WELL_KNOWN_FILES)
            .map_err(Box::new)?
            .file_descriptor_set();
        let missing: Vec<_> = well_known
            .file
            .into_iter()
            .filter(|f| pool.get_file_by_name(f.name()).is_none())
            .collect();
        if !missing.is_empty() {
            pool.add_file_descriptor_set(FileDescriptorSet { file: missing })?;
        }

        if pool.get_file_by_name(UNRESOLVED_ANY_FILE).is_none() {
            pool.add_file_descriptor_proto(unresolved_any_file())?;
        }

        let mut batch: Vec<FileDescriptorProto> = Vec::new();
        for mut file in files {
            if pool.get_file_by_name(file.name()).is_some()
                || batch.iter().any(|f| f.name() == file.name())
            {
                continue;
            }
            fill_json_names(&mut file);
            batch.push(file);
        }

        if !batch.is_empty() {
            pool.add_file_descriptor_set(FileDescriptorSet { file: batch })?;
        }

        let unresolved = pool
            .get_message_by_name(UNRESOLVED_ANY_NAME)
            .ok_or(RegistryError::MissingPlaceholder)?;

        Ok(Self { pool, unresolved })
    }

    pub fn pool(&self) -> &DescriptorPool {
        &self.pool
    }

    /// The placeholder message type.
    pub fn unresolved_any(&self) -> &MessageDescriptor {
        &self.unresolved
    }

    /// Finds the message named by a type URL (`type.googleapis.com/pkg.Msg`) or a plain
    /// fully-qualified name.
    pub fn lookup(&self, type_url: &str) -> Option<MessageDescriptor> {
        let name = type_url.rsplit('/').next().unwrap_or(type_url);
        self.pool.get_message_by_name(name)
    }

    /// Like [`TypeRegistry::lookup`] but falls back to the placeholder type.
    pub fn resolve(&self, type_url: &str) -> MessageDescriptor {
        self.lookup(type_url).unwrap_or_else(|| self.unresolved.clone())
    }

    /// Builds a placeholder message holding `value` and the error text `err`.
    pub fn placeholder(&self, value: &[u8], err: &str) -> DynamicMessage {
        let mut msg = DynamicMessage::new(self.unresolved.clone());
        msg.set_field_by_name("value", Value::Bytes(value.to_vec().into()));
        msg.set_field_by_name("err", Value::String(err.to_string()));
        msg
    }

    /// Encodes a placeholder message, as found in an `Any` value after fallback.
    pub fn encode_placeholder(&self, value: &[u8], err: &str) -> Vec<u8> {
        self.placeholder(value, err).encode_to_vec()
    }
}

fn unresolved_any_file() -> FileDescriptorProto {
    let field = |name: &str, number: i32, ty: Type| FieldDescriptorProto {
        name: Some(name.to_string()),
        number: Some(number),
        label: Some(Label::Optional as i32),
        r#type: Some(ty as i32),
        json_name: Some(name.to_string()),
        ..Default::default()
    };

    FileDescriptorProto {
        name: Some(UNRESOLVED_ANY_FILE.to_string()),
        package: Some("grpc_client_cli".to_string()),
        syntax: Some("proto3".to_string()),
        message_type: vec![DescriptorProto {
            name: Some("UnresolvedAny".to_string()),
            field: vec![field("value", 1, Type::Bytes), field("err", 2, Type::String)],
            ..Default::default()
        }],
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost_reflect::ReflectMessage;

    fn sample_file() -> FileDescriptorProto {
        FileDescriptorProto {
            name: Some("sample.proto".to_string()),
            package: Some("sample".to_string()),
            syntax: Some("proto3".to_string()),
            message_type: vec![DescriptorProto {
                name: Some("Item".to_string()),
                field: vec![FieldDescriptorProto {
                    name: Some("item_name".to_string()),
                    number: Some(1),
                    label: Some(Label::Optional as i32),
                    r#type: Some(Type::String as i32),
                    ..Default::default()
                }],
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_lookup_by_url_and_name() {
        let registry = TypeRegistry::new([sample_file()]).unwrap();

        let by_url = registry.lookup("type.googleapis.com/sample.Item").unwrap();
        let by_name = registry.lookup("sample.Item").unwrap();
        assert_eq!(by_url.full_name(), "sample.Item");
        assert_eq!(by_url, by_name);

        let field = by_url.get_field_by_name("item_name").unwrap();
        assert_eq!(field.json_name(), "itemName");
    }

    #[test]
    fn test_well_known_types_resolve() {
        let registry = TypeRegistry::new([]).unwrap();

        assert!(registry.lookup("type.googleapis.com/google.protobuf.Any").is_some());
        assert!(registry.lookup("google.protobuf.Empty").is_some());
    }

    #[test]
    fn test_resolve_unknown_falls_back_to_placeholder() {
        let registry = TypeRegistry::new([]).unwrap();

        let desc = registry.resolve("type.googleapis.com/does.not.Exist");
        assert_eq!(desc.full_name(), UNRESOLVED_ANY_NAME);
    }

    #[test]
    fn test_placeholder_keeps_bytes() {
        let registry = TypeRegistry::new([]).unwrap();

        let msg = registry.placeholder(b"\x0a\x01x", UNRESOLVED_ANY_ERR);
        assert_eq!(msg.descriptor().full_name(), UNRESOLVED_ANY_NAME);

        let err = msg.get_field_by_name("err").unwrap();
        assert_eq!(err.as_str(), Some(UNRESOLVED_ANY_ERR));

        let value = msg.get_field_by_name("value").unwrap();
        assert_eq!(value.as_bytes().map(|b| b.as_ref()), Some(&b"\x0a\x01x"[..]));
    }

    #[test]
    fn test_files_are_added_once() {
        let registry = TypeRegistry::new([sample_file(), sample_file()]).unwrap();
        let again = TypeRegistry::new(
            registry
                .pool()
                .files()
                .map(|f| f.file_descriptor_proto().clone()),
        );

        assert!(again.is_ok());
    }
}
