use colored::*;
use grpc_client_core::caller::CallError;
use grpc_client_core::descriptor::AcquireError;
use grpc_client_core::health::HealthError;
use grpc_client_core::prost_reflect::{
    EnumDescriptor, FieldDescriptor, FileDescriptor, Kind, MessageDescriptor, MethodDescriptor,
    ServiceDescriptor,
};

/// A wrapper struct for a formatted, colored string.
///
/// Implements `Display` so it can be printed directly.
pub struct FormattedString(pub String);

/// A numbered list of choices, the first entry being `0`.
pub struct Menu<'a>(pub &'a str, pub &'a [String]);

/// A whole proto file: header, messages, enums and services.
pub struct ProtoFile(pub FileDescriptor);

impl std::fmt::Display for FormattedString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f)?;
        writeln!(f, "{}", self.0)?;
        Ok(())
    }
}

impl From<anyhow::Error> for FormattedString {
    fn from(err: anyhow::Error) -> Self {
        let title = if err.is::<CallError>() {
            "Call Failed:"
        } else if err.is::<AcquireError>() {
            "Failed to load service descriptors:"
        } else if err.is::<HealthError>() {
            "Health Check Failed:"
        } else {
            "Error:"
        };

        FormattedString(format!("{}\n\n'{:#}'", title.red().bold(), err))
    }
}

impl From<Menu<'_>> for FormattedString {
    fn from(Menu(title, options): Menu<'_>) -> Self {
        let mut out = format!("{}\n", title.bold());
        for (i, option) in options.iter().enumerate() {
            out.push_str(&format!("  {:>3}) {}\n", i.to_string().yellow(), option.green()));
        }
        FormattedString(out.trim_end().to_string())
    }
}

impl From<ProtoFile> for FormattedString {
    fn from(ProtoFile(file): ProtoFile) -> Self {
        let proto = file.file_descriptor_proto();
        let mut out = String::new();

        out.push_str(&format!(
            "{} = \"{}\";\n\n",
            "syntax".cyan(),
            proto.syntax.as_deref().unwrap_or("proto2")
        ));

        if !file.package_name().is_empty() {
            out.push_str(&format!("{} {};\n\n", "package".cyan(), file.package_name()));
        }

        if !proto.dependency.is_empty() {
            for dep in &proto.dependency {
                out.push_str(&format!("{} \"{}\";\n", "import".cyan(), dep));
            }
            out.push('\n');
        }

        let blocks = file
            .messages()
            .map(|m| FormattedString::from(m).0)
            .chain(file.enums().map(|e| FormattedString::from(e).0))
            .chain(file.services().map(|s| FormattedString::from(s).0));

        for block in blocks {
            out.push_str(&block);
            out.push_str("\n\n");
        }

        FormattedString(out.trim_end().to_string())
    }
}

impl From<ServiceDescriptor> for FormattedString {
    fn from(service: ServiceDescriptor) -> Self {
        let mut out = String::new();
        out.push_str(&format!(
            "{} {} {{\n",
            "service".cyan(),
            service.name().green()
        ));

        for method in service.methods() {
            out.push_str("  ");
            // Reuse the From<MethodDescriptor> implementation
            let method_fmt = FormattedString::from(method);
            out.push_str(&method_fmt.0);
            out.push('\n');
        }
        out.push('}');
        FormattedString(out)
    }
}

impl From<MethodDescriptor> for FormattedString {
    fn from(method: MethodDescriptor) -> Self {
        let input_stream = if method.is_client_streaming() {
            format!("{} ", "stream".cyan())
        } else {
            "".to_string()
        };
        let output_stream = if method.is_server_streaming() {
            format!("{} ", "stream".cyan())
        } else {
            "".to_string()
        };

        FormattedString(format!(
            "{} {}({}{}) {} ({}{});",
            "rpc".cyan(),
            method.name().green(),
            input_stream,
            method.input().full_name().yellow(),
            "returns".cyan(),
            output_stream,
            method.output().full_name().yellow()
        ))
    }
}

impl From<MessageDescriptor> for FormattedString {
    fn from(message: MessageDescriptor) -> Self {
        let mut out = String::new();
        out.push_str(&format!(
            "{} {} {{\n",
            "message".cyan(),
            message.name().green()
        ));

        for field in message.fields() {
            out.push_str(&format!("  {}\n", field_line(&field)));
        }

        let nested = message
            .child_messages()
            .filter(|m| !m.is_map_entry())
            .map(|m| FormattedString::from(m).0)
            .chain(message.child_enums().map(|e| FormattedString::from(e).0));

        for block in nested {
            out.push('\n');
            for line in block.lines() {
                out.push_str(&format!("  {line}\n"));
            }
        }

        out.push('}');
        FormattedString(out)
    }
}

impl From<EnumDescriptor> for FormattedString {
    fn from(enum_desc: EnumDescriptor) -> Self {
        let mut out = String::new();
        out.push_str(&format!(
            "{} {} {{\n",
            "enum".cyan(),
            enum_desc.name().green()
        ));

        for val in enum_desc.values() {
            out.push_str(&format!(
                "  {} = {};\n",
                val.name(),
                val.number().to_string().purple()
            ));
        }
        out.push('}');

        FormattedString(out)
    }
}

fn field_line(field: &FieldDescriptor) -> String {
    if field.is_map() {
        if let Kind::Message(entry) = field.kind() {
            return format!(
                "{}<{}, {}> {} = {};",
                "map".cyan(),
                kind_name(&entry.map_entry_key_field().kind()),
                kind_name(&entry.map_entry_value_field().kind()),
                field.name(),
                field.number()
            );
        }
    }

    let label = if field.is_list() {
        format!("{} ", "repeated".cyan())
    } else {
        "".to_string()
    };

    format!(
        "{}{} {} = {};",
        label,
        kind_name(&field.kind()),
        field.name(),
        field.number()
    )
}

fn kind_name(kind: &Kind) -> ColoredString {
    match kind {
        Kind::Double => "double".yellow(),
        Kind::Float => "float".yellow(),
        Kind::Int32 => "int32".yellow(),
        Kind::Int64 => "int64".yellow(),
        Kind::Uint32 => "uint32".yellow(),
        Kind::Uint64 => "uint64".yellow(),
        Kind::Sint32 => "sint32".yellow(),
        Kind::Sint64 => "sint64".yellow(),
        Kind::Fixed32 => "fixed32".yellow(),
        Kind::Fixed64 => "fixed64".yellow(),
        Kind::Sfixed32 => "sfixed32".yellow(),
        Kind::Sfixed64 => "sfixed64".yellow(),
        Kind::Bool => "bool".yellow(),
        Kind::String => "string".yellow(),
        Kind::Bytes => "bytes".yellow(),
        Kind::Message(m) => m.full_name().yellow(),
        Kind::Enum(e) => e.full_name().yellow(),
    }
}
