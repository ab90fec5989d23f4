//! # Session Driver
//!
//! An [`App`] owns everything a session needs: the connection factory, the services acquired
//! at startup (through server reflection or from `.proto` files) and the invocation engine.
//!
//! [`App::start`] walks the user through three nested loops:
//!
//! 1. **Service selection**: a case-insensitive substring match of `--service`, or a menu.
//! 2. **Method selection**: a case-insensitive match of `--method`, or a menu whose `[..]`
//!    entry goes back to service selection.
//! 3. **Message entry**: requests are read and sent until the input is exhausted, which goes
//!    back to method selection. A failed call worth retrying only prints the error.
//!
//! When the request was given upfront (stdin pipe or `--input` file) the session is not
//! interactive: names must match, a single call is made and any error ends the run.
use crate::formatter::{FormattedString, Menu, ProtoFile};
use crate::line_reader::LineReader;
use crate::msg_buffer::MsgBuffer;
use crate::printer::{ResultPrinter, print_verbose};
use anyhow::{Context, bail};
use colored::*;
use grpc_client_core::caller::{CallContext, CallError, ServiceCaller};
use grpc_client_core::codec::{MessageFormat, MessageFormatter};
use grpc_client_core::descriptor::{
    AcquireError, ProtoSource, ReflectionSource, ReflectionVersion, ServiceMeta, ServiceMetaList,
    ServiceMetaProvider,
};
use grpc_client_core::prost_reflect::MethodDescriptor;
use grpc_client_core::rpc::{ConnFactory, ConnFactorySettings};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[cfg(test)]
mod integration_test;

const NO_METHOD: &str = "[..]";
const CHOICE_PROMPT: &str = "> ";

/// Settings of a session.
#[derive(Debug, Clone, Default)]
pub struct StartOpts {
    pub target: String,
    pub service: Option<String>,
    pub method: Option<String>,
    pub discover: bool,
    pub deadline: Duration,
    pub verbose: bool,
    pub interactive: bool,
    pub in_format: MessageFormat,
    pub out_format: MessageFormat,
    pub out_json_names: bool,
    pub protos: Vec<PathBuf>,
    pub proto_imports: Vec<PathBuf>,
    pub reflect_version: ReflectionVersion,
    pub conn: ConnFactorySettings,
}

/// Where the session goes once a method is done with.
enum Flow {
    Done,
    MethodSelection,
}

pub struct App<R, W> {
    factory: Arc<ConnFactory>,
    services: ServiceMetaList,
    caller: ServiceCaller,
    opts: StartOpts,
    reader: R,
    out: W,
}

impl<R: LineReader, W: Write> App<R, W> {
    /// Acquires the service descriptors of the session.
    pub async fn new(opts: StartOpts, reader: R, out: W) -> anyhow::Result<Self> {
        let factory = Arc::new(ConnFactory::new(opts.conn.clone()));
        let services = load_services(&opts, factory.clone()).await?;

        tracing::debug!(
            services = services.len(),
            from_protos = !opts.protos.is_empty(),
            "service descriptors loaded"
        );

        let formatter = MessageFormatter::new(services.registry().clone())
            .with_formats(opts.in_format, opts.out_format)
            .with_json_names(opts.out_json_names);

        Ok(Self {
            caller: ServiceCaller::new(factory.clone(), formatter),
            factory,
            services,
            opts,
            reader,
            out,
        })
    }

    /// Runs the session. `message` holds the request given upfront, empty when interactive.
    ///
    /// `--service` and `--method` only apply to the first selection, so going back from a
    /// method shows the menus.
    pub async fn start(&mut self, message: &[u8]) -> anyhow::Result<()> {
        let mut service_name = self.opts.service.take();
        let mut method_name = self.opts.method.take();

        loop {
            let Some(service) = self.select_service(service_name.take())? else {
                return Ok(());
            };

            if self.opts.discover {
                write!(self.out, "{}", FormattedString::from(ProtoFile(service.file)))?;
                return Ok(());
            }

            while let Some(method) = self.select_method(&service, method_name.take())? {
                match self.call_service(&method, message).await? {
                    Flow::Done => return Ok(()),
                    Flow::MethodSelection => {}
                }
            }
        }
    }

    /// Drops every connection of the session.
    pub fn close(&self) {
        self.factory.close();
    }

    fn select_service(&mut self, name: Option<String>) -> anyhow::Result<Option<ServiceMeta>> {
        let services = self.services.services().to_vec();

        if let Some(name) = name.map(|n| n.to_lowercase()).filter(|n| !n.is_empty())
            && let Some(svc) = services
                .iter()
                .find(|s| s.name.to_lowercase().contains(&name))
        {
            return Ok(Some(svc.clone()));
        }

        if !self.opts.interactive {
            bail!("service name not found or invalid");
        }

        let mut names: Vec<String> = services.iter().map(|s| s.name.clone()).collect();
        names.sort_by_key(|n| n.to_lowercase());

        let Some(choice) = self.choose("Choose a service:", &names)? else {
            return Ok(None);
        };

        Ok(services.iter().find(|s| s.name == names[choice]).cloned())
    }

    /// `None` when the user goes back to service selection.
    fn select_method(
        &mut self,
        service: &ServiceMeta,
        name: Option<String>,
    ) -> anyhow::Result<Option<MethodDescriptor>> {
        if let Some(method) = name.as_deref().and_then(|n| service.method(n)) {
            return Ok(Some(method.clone()));
        }

        if !self.opts.interactive {
            bail!("method name not found or invalid");
        }

        let mut names: Vec<String> = service.methods.iter().map(|m| m.name().to_string()).collect();
        names.sort_by_key(|n| n.to_lowercase());
        names.insert(0, NO_METHOD.to_string());

        match self.choose("Choose a method:", &names)? {
            None | Some(0) => Ok(None),
            Some(choice) => Ok(service.method(&names[choice]).cloned()),
        }
    }

    /// Index of the option picked by number or by name, `None` once the input is exhausted.
    fn choose(&mut self, title: &str, options: &[String]) -> anyhow::Result<Option<usize>> {
        write!(self.out, "{}", FormattedString::from(Menu(title, options)))?;

        loop {
            let Some(line) = self.reader.read_line(Some(CHOICE_PROMPT), options)? else {
                return Ok(None);
            };

            let line = line.trim();
            let choice = line
                .parse::<usize>()
                .ok()
                .filter(|i| *i < options.len())
                .or_else(|| options.iter().position(|o| o.eq_ignore_ascii_case(line)));

            match choice {
                Some(i) => return Ok(Some(i)),
                None => writeln!(self.out, "invalid choice '{line}'")?,
            }
        }
    }

    async fn call_service(&mut self, method: &MethodDescriptor, message: &[u8]) -> anyhow::Result<Flow> {
        loop {
            let messages = if message.is_empty() {
                let mut buffer = MsgBuffer::new(
                    &mut self.reader,
                    &mut self.out,
                    self.caller.formatter(),
                    method.input(),
                );

                let read = if method.is_client_streaming() {
                    buffer.read_messages()?
                } else {
                    buffer.read_message()?.map(|msg| vec![msg])
                };

                match read {
                    Some(messages) => messages,
                    None => return Ok(Flow::MethodSelection),
                }
            } else if method.is_client_streaming() && self.opts.in_format == MessageFormat::Json {
                to_json_array(message)?
            } else {
                vec![message.to_vec()]
            };

            tracing::debug!(
                method = %method.full_name(),
                requests = messages.len(),
                "calling method"
            );

            let ctx = CallContext::new(self.opts.deadline);
            let result = if method.is_server_streaming() {
                self.call_stream(&ctx, method, &messages).await?
            } else {
                self.call_client_stream(&ctx, method, &messages).await?
            };

            let recoverable = self.opts.interactive
                && result.as_ref().err().is_none_or(CallError::is_transient);

            if let (Err(err), true) = (&result, recoverable) {
                writeln!(self.out, "{} {err}", "Error:".red().bold())?;
            }

            if self.opts.verbose {
                print_verbose(&mut self.out, &ctx.stats, result.as_ref().err())?;
            }

            if !recoverable {
                result?;
            }

            if !message.is_empty() {
                return Ok(Flow::Done);
            }
        }
    }

    /// Server and bidirectional streams: every response is printed as it arrives.
    async fn call_stream(
        &mut self,
        ctx: &CallContext,
        method: &MethodDescriptor,
        messages: &[Vec<u8>],
    ) -> anyhow::Result<Result<(), CallError>> {
        let mut stream = self
            .caller
            .call_stream(ctx, &self.opts.target, method, messages)
            .await;

        let mut printer = ResultPrinter::new(&mut self.out, self.opts.out_format);
        printer.begin_array()?;

        let mut first = true;
        while let Some(msg) = stream.next().await {
            if !first {
                printer.array_delim()?;
            }
            printer.write_message(&msg)?;
            first = false;
        }

        printer.end_array()?;
        Ok(stream.outcome().await)
    }

    /// Unary and client streaming calls.
    async fn call_client_stream(
        &mut self,
        ctx: &CallContext,
        method: &MethodDescriptor,
        messages: &[Vec<u8>],
    ) -> anyhow::Result<Result<(), CallError>> {
        let result = self
            .caller
            .call_client_stream(ctx, &self.opts.target, method, messages)
            .await;

        match result {
            Ok(Some(msg)) => {
                ResultPrinter::new(&mut self.out, self.opts.out_format).write_message(&msg)?;
                writeln!(self.out)?;
                Ok(Ok(()))
            }
            Ok(None) => Ok(Ok(())),
            Err(err) => Ok(Err(err)),
        }
    }
}

async fn load_services(
    opts: &StartOpts,
    factory: Arc<ConnFactory>,
) -> Result<ServiceMetaList, AcquireError> {
    if opts.protos.is_empty() {
        let mut source = ReflectionSource::new(factory, opts.target.clone())
            .with_version(opts.reflect_version)
            .with_deadline(opts.deadline)
            .with_imports(opts.proto_imports.clone());
        source.service_meta_list().await
    } else {
        let mut source = ProtoSource::new(opts.protos.clone(), opts.proto_imports.clone());
        source.service_meta_list().await
    }
}

/// Splits client streaming JSON input given upfront: an array holds one request per element,
/// a single object is one request.
fn to_json_array(message: &[u8]) -> anyhow::Result<Vec<Vec<u8>>> {
    let value: serde_json::Value =
        serde_json::from_slice(message.trim_ascii()).context("invalid JSON input")?;

    let items = match value {
        serde_json::Value::Array(items) => items,
        obj @ serde_json::Value::Object(_) => vec![obj],
        _ => bail!("client streaming input must be a JSON object or an array of objects"),
    };

    Ok(items
        .iter()
        .map(serde_json::to_vec)
        .collect::<Result<_, _>>()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_json_array() {
        let messages = to_json_array(br#" [{"a": 1}, {"b": [2, 3]}] "#).unwrap();
        assert_eq!(
            messages,
            vec![br#"{"a":1}"#.to_vec(), br#"{"b":[2,3]}"#.to_vec()]
        );

        let single = to_json_array(br#"{"a": 1}"#).unwrap();
        assert_eq!(single, vec![br#"{"a":1}"#.to_vec()]);

        assert!(to_json_array(b"[]").unwrap().is_empty());
        assert!(to_json_array(b"42").is_err());
        assert!(to_json_array(br#"{"a": "#).is_err());
    }
}
