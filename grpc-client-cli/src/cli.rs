//! # CLI
//!
//! This module defines the command-line interface of `grpc-client-cli` using `clap`.
//!
//! It is responsible for parsing user input and performing validation (e.g., ensuring headers
//! are `key: value` and deadlines are valid durations).
use clap::{Args, Parser, Subcommand, ValueEnum};
use grpc_client_core::codec::MessageFormat;
use grpc_client_core::descriptor::ReflectionVersion;
use grpc_client_core::rpc::{ConnFactorySettings, TlsSettings};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(
    name = "grpc-client-cli",
    version,
    about = "Generic gRPC client",
    disable_version_flag = true
)]
pub struct Cli {
    /// Print version
    #[arg(short = 'v', long, action = clap::ArgAction::Version)]
    version: Option<bool>,

    /// host:port of the service, used when --address is not set
    pub target: Option<String>,

    #[command(flatten)]
    pub opts: Opts,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Print the proto file declaring the selected service
    Discover,

    /// Call grpc.health.v1.Health/Check for --service, or the whole server when unset.
    /// Exits with status 1 unless the answer is SERVING
    Health,
}

#[derive(Args)]
pub struct Opts {
    /// host:port of the service
    #[arg(
        short = 'a',
        long,
        visible_alias = "addr",
        global = true,
        env = "GRPC_CLIENT_CLI_ADDRESS"
    )]
    pub address: Option<String>,

    /// gRPC full or partial service name
    #[arg(short, long, global = true, env = "GRPC_CLIENT_CLI_SERVICE")]
    pub service: Option<String>,

    /// gRPC service method name
    #[arg(short, long, global = true, env = "GRPC_CLIENT_CLI_METHOD")]
    pub method: Option<String>,

    /// File holding the message, ignored when a message is piped through stdin
    #[arg(short, long, global = true)]
    pub input: Option<PathBuf>,

    /// Call deadline, e.g. 15s, 3m, 1h. Bare numbers are seconds
    #[arg(short, long, global = true, default_value = "15s", value_parser = parse_duration)]
    pub deadline: Duration,

    /// Print call details: headers, trailers, duration and message sizes
    #[arg(short = 'V', long, global = true)]
    pub verbose: bool,

    /// Use TLS when connecting to the server
    #[arg(long, global = true)]
    pub tls: bool,

    /// Skip verification of the server certificate chain and host name. Testing only
    #[arg(long, global = true)]
    pub insecure: bool,

    /// CA certificate verifying the server, ignored with --insecure
    #[arg(long, global = true)]
    pub cacert: Option<PathBuf>,

    /// Client certificate presented to the server, requires --certkey
    #[arg(long, global = true)]
    pub cert: Option<PathBuf>,

    /// Client private key, requires --cert
    #[arg(long, global = true)]
    pub certkey: Option<PathBuf>,

    /// Proto files or directories of proto files. Server reflection is not used when set
    #[arg(long, global = true, value_delimiter = ',')]
    pub proto: Vec<PathBuf>,

    /// Extra directories searched for imports and for types packed in Any fields
    #[arg(long, global = true, value_delimiter = ',')]
    pub protoimports: Vec<PathBuf>,

    /// Extra header sent with every request, in "key: value" format
    #[arg(short = 'H', long = "header", global = true, value_parser = parse_header)]
    pub headers: Vec<(String, String)>,

    /// Override the :authority header
    #[arg(long, global = true)]
    pub authority: Option<String>,

    /// Input message format
    #[arg(long, visible_alias = "if", global = true, default_value = "json")]
    pub informat: MessageFormat,

    /// Output message format
    #[arg(long, visible_alias = "of", global = true, default_value = "json")]
    pub outformat: MessageFormat,

    /// Send keepalive pings even without active calls
    #[arg(long, global = true)]
    pub keepalive: bool,

    /// Interval between keepalive pings
    #[arg(long, global = true, value_parser = parse_duration)]
    pub keepalive_time: Option<Duration>,

    /// Max size in bytes of a received message, tonic's default (4 MB) when 0
    #[arg(
        long,
        visible_aliases = ["mrms", "max-recv-msg-size"],
        global = true,
        default_value_t = 0
    )]
    pub max_receive_message_size: usize,

    /// Use json_name properties (camel case) in JSON output
    #[arg(long, global = true)]
    pub out_json_names: bool,

    /// Server reflection protocol. "auto" tries v1 first and falls back to v1alpha
    #[arg(long, global = true, value_enum, default_value_t = ReflectVersion::V1alpha)]
    pub reflect_version: ReflectVersion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ReflectVersion {
    V1alpha,
    Auto,
}

impl From<ReflectVersion> for ReflectionVersion {
    fn from(value: ReflectVersion) -> Self {
        match value {
            ReflectVersion::V1alpha => ReflectionVersion::V1Alpha,
            ReflectVersion::Auto => ReflectionVersion::Auto,
        }
    }
}

impl Opts {
    /// Connection policies shared by every command.
    pub fn conn_settings(&self) -> ConnFactorySettings {
        let tls = self.tls.then(|| TlsSettings {
            insecure: self.insecure,
            ca_cert: self.cacert.clone(),
            cert: self.cert.clone(),
            cert_key: self.certkey.clone(),
        });

        ConnFactorySettings {
            tls,
            authority: self.authority.clone(),
            headers: self.headers.clone(),
            keepalive: self.keepalive,
            keepalive_time: self.keepalive_time,
            max_recv_msg_size: (self.max_receive_message_size > 0)
                .then_some(self.max_receive_message_size),
        }
    }
}

impl Cli {
    /// `--address` wins over the positional target.
    pub fn target(&self) -> Option<String> {
        self.opts
            .address
            .clone()
            .or_else(|| self.target.clone())
            .filter(|t| !t.trim().is_empty())
    }
}

fn parse_header(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once(':')
        .ok_or_else(|| "please use \"key: value\" format".to_string())?;

    let (key, value) = (key.trim(), value.trim());
    if key.is_empty() {
        return Err("key cannot be empty".to_string());
    }
    if value.is_empty() {
        return Err("value cannot be empty".to_string());
    }

    Ok((key.to_string(), value.to_string()))
}

/// Bare numbers are seconds, anything else is a `humantime` duration such as `15s`,
/// `1m 30s` or `300ms`.
fn parse_duration(s: &str) -> Result<Duration, humantime::DurationError> {
    match s.trim().parse::<u64>() {
        Ok(secs) => Ok(Duration::from_secs(secs)),
        Err(_) => humantime::parse_duration(s),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("15").unwrap(), Duration::from_secs(15));
        assert_eq!(parse_duration("15s").unwrap(), Duration::from_secs(15));
        assert_eq!(parse_duration("300ms").unwrap(), Duration::from_millis(300));
        assert_eq!(parse_duration("1m 30s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));

        for input in ["", "s", "15x", "-5s"] {
            assert!(parse_duration(input).is_err(), "{input}");
        }
    }

    #[test]
    fn test_parse_header() {
        assert_eq!(
            parse_header("x-user: alice"),
            Ok(("x-user".to_string(), "alice".to_string()))
        );
        assert_eq!(
            parse_header("url:http://host:80"),
            Ok(("url".to_string(), "http://host:80".to_string()))
        );
        assert!(parse_header("no-separator").is_err());
        assert!(parse_header(" : value").is_err());
        assert!(parse_header("key: ").is_err());
    }

    #[test]
    fn test_target_precedence() {
        let cli = Cli::parse_from(["grpc-client-cli", "localhost:5000"]);
        assert_eq!(cli.target().as_deref(), Some("localhost:5000"));

        let cli = Cli::parse_from(["grpc-client-cli", "localhost:5000", "-a", "other:6000"]);
        assert_eq!(cli.target().as_deref(), Some("other:6000"));
    }

    #[test]
    fn test_subcommands_accept_global_flags() {
        let cli = Cli::parse_from([
            "grpc-client-cli",
            "health",
            "--service",
            "grpc.testing.TestService",
            "-a",
            "localhost:5000",
            "-d",
            "3",
        ]);

        assert!(matches!(cli.command, Some(Commands::Health)));
        assert_eq!(cli.opts.service.as_deref(), Some("grpc.testing.TestService"));
        assert_eq!(cli.opts.deadline, Duration::from_secs(3));
        assert_eq!(cli.target().as_deref(), Some("localhost:5000"));
    }

    #[test]
    fn test_conn_settings() {
        let cli = Cli::parse_from([
            "grpc-client-cli",
            "--tls",
            "--insecure",
            "-H",
            "a: 1",
            "-H",
            "b: 2",
            "--mrms",
            "1024",
            "--proto",
            "a.proto,b.proto",
            "--reflect-version",
            "auto",
            "localhost:5000",
        ]);

        let settings = cli.opts.conn_settings();
        assert!(settings.tls.as_ref().is_some_and(|tls| tls.insecure));
        assert_eq!(settings.headers.len(), 2);
        assert_eq!(settings.max_recv_msg_size, Some(1024));
        assert_eq!(cli.opts.proto.len(), 2);
        assert_eq!(
            ReflectionVersion::from(cli.opts.reflect_version),
            ReflectionVersion::Auto
        );

        let plain = Cli::parse_from(["grpc-client-cli", "localhost:5000"]);
        let settings = plain.opts.conn_settings();
        assert!(settings.tls.is_none());
        assert_eq!(settings.max_recv_msg_size, None);
    }
}
