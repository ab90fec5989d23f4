use crate::formatter::FormattedString;
use crate::line_reader::LineReader;
use grpc_client_core::codec::MessageFormatter;
use grpc_client_core::descriptor::field_names;
use grpc_client_core::prost_reflect::MessageDescriptor;
use std::io::{self, Write};

const NEXT_PROMPT: &str = "Next message (press Ctrl-D to finish): ";

/// Reads request messages typed by the user.
///
/// Each line is validated against the request type before being accepted. `?` prints the
/// request with every field set to its default value, `??` or `proto` prints its definition.
/// The names of every field reachable from the request type are offered as completions.
pub struct MsgBuffer<'a, R, W> {
    reader: &'a mut R,
    out: &'a mut W,
    formatter: &'a MessageFormatter,
    field_names: Vec<String>,
    desc: MessageDescriptor,
}

impl<'a, R: LineReader, W: Write> MsgBuffer<'a, R, W> {
    pub fn new(
        reader: &'a mut R,
        out: &'a mut W,
        formatter: &'a MessageFormatter,
        desc: MessageDescriptor,
    ) -> Self {
        Self {
            reader,
            out,
            formatter,
            field_names: field_names(&desc),
            desc,
        }
    }

    /// One valid message, or `None` once the input is exhausted.
    pub fn read_message(&mut self) -> io::Result<Option<Vec<u8>>> {
        self.read(None)
    }

    /// Messages until the input is exhausted. `None` when not even one was entered.
    pub fn read_messages(&mut self) -> io::Result<Option<Vec<Vec<u8>>>> {
        let Some(first) = self.read(None)? else {
            return Ok(None);
        };

        let mut messages = vec![first];
        while let Some(msg) = self.read(Some(NEXT_PROMPT))? {
            messages.push(msg);
        }

        writeln!(self.out)?;
        Ok(Some(messages))
    }

    fn read(&mut self, prompt: Option<&str>) -> io::Result<Option<Vec<u8>>> {
        loop {
            let Some(line) = self.reader.read_line(prompt, &self.field_names)? else {
                return Ok(None);
            };

            let msg = line.trim();
            match msg.to_lowercase().as_str() {
                "?" => {
                    self.print_defaults()?;
                    continue;
                }
                "??" | "proto" => {
                    writeln!(self.out, "{}", FormattedString::from(self.desc.clone()).0)?;
                    continue;
                }
                _ => {}
            }

            match self.formatter.unmarshal(msg.as_bytes(), &self.desc) {
                Ok(_) => return Ok(Some(msg.as_bytes().to_vec())),
                Err(err) => writeln!(self.out, "{err}")?,
            }
        }
    }

    fn print_defaults(&mut self) -> io::Result<()> {
        match self.formatter.defaults(&self.desc) {
            Ok(json) => {
                self.out.write_all(&json)?;
                writeln!(self.out)
            }
            Err(err) => writeln!(self.out, "{err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::line_reader::ScriptedReader;
    use grpc_client_core::codec::MessageFormat;
    use grpc_client_core::descriptor::TypeRegistry;
    use grpc_client_core::prost::Message;
    use prost_types::FileDescriptorSet;
    use std::sync::Arc;

    fn formatter(format: MessageFormat) -> (MessageFormatter, MessageDescriptor) {
        colored::control::set_override(false);
        let fds = FileDescriptorSet::decode(testing_service::FILE_DESCRIPTOR_SET).unwrap();
        let registry = Arc::new(TypeRegistry::new(fds.file).unwrap());
        let desc = registry.lookup("grpc.testing.SimpleRequest").unwrap();
        let formatter = MessageFormatter::new(registry).with_formats(format, MessageFormat::Json);
        (formatter, desc)
    }

    #[test]
    fn test_proto_command() {
        let (formatter, desc) = formatter(MessageFormat::Json);
        let mut reader = ScriptedReader::new(&["??", "PROTO"]);
        let mut out = Vec::new();

        let msg = MsgBuffer::new(&mut reader, &mut out, &formatter, desc)
            .read_message()
            .unwrap();

        assert_eq!(msg, None);
        let out = String::from_utf8(out).unwrap();
        assert_eq!(out.matches("message SimpleRequest {").count(), 2, "{out}");
    }

    #[test]
    fn test_help_command_prints_defaults() {
        let (formatter, desc) = formatter(MessageFormat::Json);
        let mut reader = ScriptedReader::new(&[" ? "]);
        let mut out = Vec::new();

        MsgBuffer::new(&mut reader, &mut out, &formatter, desc)
            .read_message()
            .unwrap();

        let defaults: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(defaults["response_size"], 0);
        assert_eq!(defaults["fill_username"], false);
        // Unset message fields have no default value to show.
        assert!(defaults.get("payload").is_none());
    }

    #[test]
    fn test_invalid_lines_are_reported_and_skipped() {
        let (formatter, desc) = formatter(MessageFormat::Json);
        let mut reader = ScriptedReader::new(&["", r#"{"payload":"#, r#"{"nope":1}"#, r#" {"response_size": 3} "#]);
        let mut out = Vec::new();

        let msg = MsgBuffer::new(&mut reader, &mut out, &formatter, desc)
            .read_message()
            .unwrap();

        assert_eq!(msg.as_deref(), Some(br#"{"response_size": 3}"#.as_slice()));
        let out = String::from_utf8(out).unwrap();
        assert_eq!(out.matches("syntax error").count(), 2, "{out}");
        assert_eq!(out.matches("invalid message").count(), 1, "{out}");
    }

    #[test]
    fn test_read_messages_until_eof() {
        let (formatter, desc) = formatter(MessageFormat::Text);
        let mut reader = ScriptedReader::new(&["response_size: 1", "?", "response_size: 2"]);
        let mut out = Vec::new();

        let messages = MsgBuffer::new(&mut reader, &mut out, &formatter, desc)
            .read_messages()
            .unwrap()
            .unwrap();

        assert_eq!(
            messages,
            vec![b"response_size: 1".to_vec(), b"response_size: 2".to_vec()]
        );
        assert_eq!(reader.prompts[0], None);
        assert!(reader.prompts[1..].iter().all(|p| p.as_deref() == Some(NEXT_PROMPT)));
    }

    #[test]
    fn test_field_names_are_offered_as_hints() {
        let (formatter, desc) = formatter(MessageFormat::Json);
        let mut reader = ScriptedReader::new(&[]);
        let mut out = Vec::new();

        MsgBuffer::new(&mut reader, &mut out, &formatter, desc)
            .read_message()
            .unwrap();

        let hints = &reader.hints[0];
        assert!(hints.contains(&"response_size".to_string()), "{hints:?}");
        // nested in `payload`
        assert!(hints.contains(&"body".to_string()), "{hints:?}");
        assert!(hints.is_sorted());
    }

    #[test]
    fn test_read_messages_without_input() {
        let (formatter, desc) = formatter(MessageFormat::Json);
        let mut reader = ScriptedReader::new(&[]);
        let mut out = Vec::new();

        let messages = MsgBuffer::new(&mut reader, &mut out, &formatter, desc)
            .read_messages()
            .unwrap();

        assert_eq!(messages, None);
        assert!(out.is_empty());
    }
}
