use crate::descriptor::{TypeRegistry, UNRESOLVED_ANY_ERR, UNRESOLVED_ANY_NAME};
use prost::Message;
use prost_reflect::text_format::FormatOptions;
use prost_reflect::{DynamicMessage, MessageDescriptor, ReflectMessage, SerializeOptions, Value};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

const ANY_TYPE_NAME: &str = "google.protobuf.Any";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FormatError {
    /// Empty or truncated input, the user most likely has not finished typing.
    #[error("syntax error: {0}")]
    Syntax(String),

    /// Well-formed input that does not match the message schema.
    #[error("invalid message: {0}")]
    Invalid(String),

    #[error("failed to marshal message: {0}")]
    Marshal(String),
}

/// Text representation of messages exchanged with the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessageFormat {
    #[default]
    Json,
    Text,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown message format '{0}', expected 'json' or 'text'")]
pub struct UnknownFormat(pub String);

impl FromStr for MessageFormat {
    type Err = UnknownFormat;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "text" => Ok(Self::Text),
            _ => Err(UnknownFormat(s.to_string())),
        }
    }
}

impl fmt::Display for MessageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json => f.write_str("json"),
            Self::Text => f.write_str("text"),
        }
    }
}

/// Converts between user text and dynamic messages.
///
/// Input and output formats are independent. JSON output always includes fields holding
/// default values and, unless `out_json_names` is set, uses the original proto field names.
///
/// `Any` payloads whose type is unknown to the registry never make marshaling fail: they are
/// printed as a message with an `err` field next to the original `@type`.
#[derive(Debug, Clone)]
pub struct MessageFormatter {
    in_format: MessageFormat,
    out_format: MessageFormat,
    out_json_names: bool,
    registry: Arc<TypeRegistry>,
}

impl MessageFormatter {
    pub fn new(registry: Arc<TypeRegistry>) -> Self {
        Self {
            in_format: MessageFormat::Json,
            out_format: MessageFormat::Json,
            out_json_names: false,
            registry,
        }
    }

    pub fn with_formats(mut self, in_format: MessageFormat, out_format: MessageFormat) -> Self {
        self.in_format = in_format;
        self.out_format = out_format;
        self
    }

    /// Emit canonical `lowerCamelCase` JSON names instead of proto field names.
    pub fn with_json_names(mut self, out_json_names: bool) -> Self {
        self.out_json_names = out_json_names;
        self
    }

    pub fn in_format(&self) -> MessageFormat {
        self.in_format
    }

    pub fn out_format(&self) -> MessageFormat {
        self.out_format
    }

    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    /// Parses `data`, written in the input format, into a message of type `desc`.
    pub fn unmarshal(
        &self,
        data: &[u8],
        desc: &MessageDescriptor,
    ) -> Result<DynamicMessage, FormatError> {
        let data = data.trim_ascii();
        if data.is_empty() {
            return Err(FormatError::Syntax(format!(
                "please provide a valid {} message",
                self.in_format
            )));
        }

        match self.in_format {
            MessageFormat::Json => unmarshal_json(data, desc),
            MessageFormat::Text => unmarshal_text(data, desc),
        }
    }

    /// Renders `msg` in the output format.
    pub fn marshal(&self, msg: &DynamicMessage) -> Result<Vec<u8>, FormatError> {
        let mut msg = msg.clone();
        self.resolve_any(&mut msg);

        match self.out_format {
            MessageFormat::Json => self.marshal_json(&msg, !self.out_json_names),
            MessageFormat::Text => Ok(marshal_text(&msg)),
        }
    }

    /// Renders an empty message of type `desc` as JSON, every scalar, repeated and map field
    /// present with its default value, using proto field names. Message fields are unset and
    /// left out.
    pub fn defaults(&self, desc: &MessageDescriptor) -> Result<Vec<u8>, FormatError> {
        self.marshal_json(&DynamicMessage::new(desc.clone()), true)
    }

    fn marshal_json(
        &self,
        msg: &DynamicMessage,
        use_proto_field_name: bool,
    ) -> Result<Vec<u8>, FormatError> {
        let options = SerializeOptions::new()
            .skip_default_fields(false)
            .use_proto_field_name(use_proto_field_name);

        let mut value = msg
            .serialize_with_options(serde_json::value::Serializer, &options)
            .map_err(|e| FormatError::Marshal(e.to_string()))?;
        restore_type_urls(&mut value, &format!("/{UNRESOLVED_ANY_NAME}"));

        serde_json::to_vec_pretty(&value).map_err(|e| FormatError::Marshal(e.to_string()))
    }

    // Rewrites, recursively, every `Any` whose payload cannot be decoded so that it holds an
    // encoded placeholder instead. The placeholder name is appended to the type URL and
    // removed again from the `@type` (JSON) or the `[...]` header (text) of the rendered
    // output. Returns whether `msg` was modified.
    fn resolve_any(&self, msg: &mut DynamicMessage) -> bool {
        if msg.descriptor().full_name() == ANY_TYPE_NAME {
            return self.resolve_any_payload(msg);
        }

        let mut changed = false;
        for (_, value) in msg.fields_mut() {
            changed |= self.resolve_value(value);
        }
        changed
    }

    fn resolve_value(&self, value: &mut Value) -> bool {
        match value {
            Value::Message(msg) => self.resolve_any(msg),
            Value::List(items) => items
                .iter_mut()
                .fold(false, |changed, item| self.resolve_value(item) | changed),
            Value::Map(map) => map
                .values_mut()
                .fold(false, |changed, item| self.resolve_value(item) | changed),
            _ => false,
        }
    }

    fn resolve_any_payload(&self, any: &mut DynamicMessage) -> bool {
        let type_url = any
            .get_field_by_name("type_url")
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        if type_url.is_empty() {
            return false;
        }

        let payload = any
            .get_field_by_name("value")
            .and_then(|v| v.as_bytes().cloned())
            .unwrap_or_default();

        let err = match self.registry.lookup(&type_url) {
            Some(desc) => match DynamicMessage::decode(desc, payload.clone()) {
                Ok(mut inner) => {
                    if !self.resolve_any(&mut inner) {
                        return false;
                    }
                    any.set_field_by_name("value", Value::Bytes(inner.encode_to_vec().into()));
                    return true;
                }
                Err(err) => err.to_string(),
            },
            None => UNRESOLVED_ANY_ERR.to_string(),
        };

        let placeholder = self.registry.encode_placeholder(&payload, &err);
        any.set_field_by_name(
            "type_url",
            Value::String(format!("{type_url}/{UNRESOLVED_ANY_NAME}")),
        );
        any.set_field_by_name("value", Value::Bytes(placeholder.into()));
        true
    }
}

fn unmarshal_json(data: &[u8], desc: &MessageDescriptor) -> Result<DynamicMessage, FormatError> {
    let classify = |err: serde_json::Error| {
        if err.is_eof() {
            FormatError::Syntax(err.to_string())
        } else {
            FormatError::Invalid(err.to_string())
        }
    };

    let mut deserializer = serde_json::Deserializer::from_slice(data);
    let msg = DynamicMessage::deserialize(desc.clone(), &mut deserializer).map_err(classify)?;
    deserializer.end().map_err(classify)?;

    Ok(msg)
}

fn unmarshal_text(data: &[u8], desc: &MessageDescriptor) -> Result<DynamicMessage, FormatError> {
    let text = std::str::from_utf8(data).map_err(|e| FormatError::Invalid(e.to_string()))?;

    DynamicMessage::parse_text_format(desc.clone(), text).map_err(|err| {
        if is_truncated_text(text) {
            FormatError::Syntax(err.to_string())
        } else {
            FormatError::Invalid(err.to_string())
        }
    })
}

fn marshal_text(msg: &DynamicMessage) -> Vec<u8> {
    let options = FormatOptions::new().pretty(true).expand_any(true);
    let text = msg.to_text_format_with_options(&options);

    let suffix = format!("/{UNRESOLVED_ANY_NAME}]");
    let mut out = String::with_capacity(text.len());
    let mut scanner = TextScanner::default();
    let mut rest = text.as_str();

    while let Some(c) = rest.chars().next() {
        if scanner.in_code() && rest.starts_with(&suffix) {
            out.push(']');
            rest = &rest[suffix.len()..];
            continue;
        }
        scanner.is_code(c);
        out.push(c);
        rest = &rest[c.len_utf8()..];
    }

    out.into_bytes()
}

fn restore_type_urls(value: &mut serde_json::Value, suffix: &str) {
    match value {
        serde_json::Value::Object(map) => {
            if let Some(serde_json::Value::String(type_url)) = map.get_mut("@type")
                && let Some(len) = type_url.strip_suffix(suffix).map(str::len)
            {
                type_url.truncate(len);
            }
            for item in map.values_mut() {
                restore_type_urls(item, suffix);
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                restore_type_urls(item, suffix);
            }
        }
        _ => {}
    }
}

// Text input ends inside a string literal or with unclosed `{`, `<` or `[`.
fn is_truncated_text(text: &str) -> bool {
    let mut scanner = TextScanner::default();
    let mut depth = 0i32;

    for c in text.chars() {
        if scanner.is_code(c) {
            match c {
                '{' | '<' | '[' => depth += 1,
                '}' | '>' | ']' => depth -= 1,
                _ => {}
            }
        }
    }

    scanner.in_string() || depth > 0
}

/// Tells code apart from string literals and `#` comments in protobuf text, one character
/// at a time.
#[derive(Debug, Default)]
struct TextScanner {
    quote: Option<char>,
    escaped: bool,
    comment: bool,
}

impl TextScanner {
    /// Whether the next character starts outside any string or comment.
    fn in_code(&self) -> bool {
        self.quote.is_none() && !self.comment
    }

    fn in_string(&self) -> bool {
        self.quote.is_some()
    }

    /// Consumes `c` and returns whether it is code. Quotes and `#` are not.
    fn is_code(&mut self, c: char) -> bool {
        if self.comment {
            self.comment = c != '\n';
            return false;
        }

        if let Some(q) = self.quote {
            match c {
                _ if self.escaped => self.escaped = false,
                '\\' => self.escaped = true,
                c if c == q => self.quote = None,
                _ => {}
            }
            return false;
        }

        match c {
            '"' | '\'' => self.quote = Some(c),
            '#' => self.comment = true,
            _ => return true,
        }
        false
    }
}
