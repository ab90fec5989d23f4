use prost_types::{DescriptorProto, FileDescriptorProto};

/// Converts a `snake_case` (or `kebab-case`, or space separated) name into `lowerCamelCase`.
///
/// Upper case letters and digits are copied as is, a lower case letter following `_`, `-`
/// or a space is upper-cased and every other character is dropped.
pub fn to_lower_camel_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut cap_next = false;

    for b in name.bytes() {
        match b {
            b'A'..=b'Z' | b'0'..=b'9' => out.push(b as char),
            b'a'..=b'z' if cap_next => out.push(b.to_ascii_uppercase() as char),
            b'a'..=b'z' => out.push(b as char),
            _ => {}
        }

        cap_next = matches!(b, b'_' | b'-' | b' ');
    }

    out
}

/// Sets `json_name` on every field of every message (nested ones included) that lacks it.
///
/// Descriptors obtained through reflection do not always carry the JSON name, while JSON
/// marshaling with `--out-json-names` depends on it.
pub fn fill_json_names(file: &mut FileDescriptorProto) {
    for message in &mut file.message_type {
        fill_message(message);
    }
}

fn fill_message(message: &mut DescriptorProto) {
    for field in &mut message.field {
        if field.json_name().is_empty() {
            field.json_name = Some(to_lower_camel_case(field.name()));
        }
    }

    for nested in &mut message.nested_type {
        fill_message(nested);
    }
}
