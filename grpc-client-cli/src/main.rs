//! # grpc-client-cli Entry Point
//!
//! The main executable. This file drives the application lifecycle:
//!
//! 1. **Initialization**: Installs the log subscriber and parses command-line arguments using
//!    [`cli::Cli`].
//! 2. **Input**: Reads the request given upfront, from a stdin pipe or the `--input` file. Its
//!    absence makes the session interactive.
//! 3. **Execution**: Runs an [`app::App`] session, or a health check.
//! 4. **Presentation**: Errors are printed to standard error and the process exits with
//!    status 1.
mod app;
mod cli;
mod formatter;
mod line_reader;
mod msg_buffer;
mod printer;

use anyhow::{Context, bail};
use app::{App, StartOpts};
use clap::Parser;
use cli::{Cli, Commands};
use formatter::FormattedString;
use grpc_client_core::caller::CallContext;
use grpc_client_core::health::HealthChecker;
use grpc_client_core::rpc::ConnFactory;
use line_reader::PromptReader;
use std::io::{self, IsTerminal, Read};
use std::path::Path;
use std::process;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();

    let result = match cli.command {
        Some(Commands::Health) => check_health(&cli).await,
        Some(Commands::Discover) => run_app(&cli, true).await,
        None => run_app(&cli, false).await,
    };

    if let Err(err) = result {
        eprintln!("{}", FormattedString::from(err));
        process::exit(1);
    }
}

// Logs go to stderr so stdout only carries responses.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

async fn run_app(cli: &Cli, discover: bool) -> anyhow::Result<()> {
    let target = cli.target().context("please provide service host:port")?;
    let message = read_message(cli.opts.input.as_deref())?;
    let opts = &cli.opts;

    let start_opts = StartOpts {
        target,
        service: opts.service.clone(),
        method: opts.method.clone(),
        discover,
        deadline: opts.deadline,
        verbose: opts.verbose,
        interactive: message.is_empty(),
        in_format: opts.informat,
        out_format: opts.outformat,
        out_json_names: opts.out_json_names,
        protos: opts.proto.clone(),
        proto_imports: opts.protoimports.clone(),
        reflect_version: opts.reflect_version.into(),
        conn: opts.conn_settings(),
    };

    let reader = PromptReader::stdin(format!(
        "Message {} (type ? to see defaults): ",
        opts.informat
    ));

    let mut app = App::new(start_opts, reader, io::stdout()).await?;
    let result = app.start(&message).await;
    app.close();
    result
}

async fn check_health(cli: &Cli) -> anyhow::Result<()> {
    let target = cli.target().context("please provide service host:port")?;
    let service = cli.opts.service.as_deref().unwrap_or_default();

    let factory = Arc::new(ConnFactory::new(cli.opts.conn_settings()));
    let checker = HealthChecker::new(factory.clone())?;

    let report = checker
        .check(&CallContext::new(cli.opts.deadline), &target, service)
        .await;
    factory.close();
    let report = report?;

    println!("{}", String::from_utf8_lossy(&report.response));

    if !report.is_serving() {
        process::exit(1);
    }

    Ok(())
}

/// The request piped through stdin, else the content of `input`. Empty when neither is given.
fn read_message(input: Option<&Path>) -> anyhow::Result<Vec<u8>> {
    let stdin = io::stdin();
    if !stdin.is_terminal() {
        let mut message = Vec::new();
        stdin
            .lock()
            .read_to_end(&mut message)
            .context("failed to read message from stdin")?;

        if !message.trim_ascii().is_empty() {
            return Ok(message);
        }
    }

    let Some(path) = input else {
        return Ok(Vec::new());
    };

    let message = std::fs::read(path)
        .with_context(|| format!("failed to read message file {}", path.display()))?;

    if message.is_empty() {
        bail!("message file is empty");
    }

    Ok(message)
}
