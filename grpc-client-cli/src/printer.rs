use colored::*;
use grpc_client_core::caller::CallError;
use grpc_client_core::codec::MessageFormat;
use grpc_client_core::rpc::CallStats;
use grpc_client_core::tonic::Code;
use grpc_client_core::tonic::codegen::http::HeaderMap;
use std::io::{self, Write};

/// Writes call results: JSON streams as an array, text streams as blocks separated by a blank
/// line.
pub struct ResultPrinter<'a, W> {
    out: &'a mut W,
    format: MessageFormat,
}

impl<'a, W: Write> ResultPrinter<'a, W> {
    pub fn new(out: &'a mut W, format: MessageFormat) -> Self {
        Self { out, format }
    }

    pub fn begin_array(&mut self) -> io::Result<()> {
        match self.format {
            MessageFormat::Json => write!(self.out, "["),
            MessageFormat::Text => Ok(()),
        }
    }

    pub fn array_delim(&mut self) -> io::Result<()> {
        match self.format {
            MessageFormat::Json => writeln!(self.out, ","),
            MessageFormat::Text => write!(self.out, "\n\n"),
        }
    }

    pub fn end_array(&mut self) -> io::Result<()> {
        match self.format {
            MessageFormat::Json => writeln!(self.out, "]"),
            MessageFormat::Text => writeln!(self.out),
        }
    }

    pub fn write_message(&mut self, msg: &[u8]) -> io::Result<()> {
        match self.format {
            MessageFormat::Json => self.out.write_all(&collapse_empty_arrays(msg)),
            MessageFormat::Text => self.out.write_all(msg),
        }
    }
}

// Pretty JSON spreads `[]` over several lines.
fn collapse_empty_arrays(msg: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(msg.len());
    let mut i = 0;

    while i < msg.len() {
        if msg[i] == b'[' {
            let ws = msg[i + 1..]
                .iter()
                .take_while(|b| b.is_ascii_whitespace())
                .count();
            if msg.get(i + 1 + ws) == Some(&b']') {
                out.extend_from_slice(b"[]");
                i += ws + 2;
                continue;
            }
        }
        out.push(msg[i]);
        i += 1;
    }

    out
}

/// Prints the diagnostics record of a finished call.
pub fn print_verbose<W: Write>(
    out: &mut W,
    stats: &CallStats,
    err: Option<&CallError>,
) -> io::Result<()> {
    let code = err.map_or(Code::Ok, CallError::code);

    writeln!(out)?;
    writeln!(out, "{}{}", "Method: ".bold(), stats.full_method())?;
    writeln!(
        out,
        "{}{} {}",
        "Status: ".bold(),
        (code as i32).to_string().bright_yellow(),
        format!("{code:?}").italic()
    )?;

    writeln!(out, "{}", "\nRequest Headers:".italic())?;
    write_headers(out, &stats.req_headers())?;

    let resp_headers = stats.resp_headers();
    if !resp_headers.is_empty() {
        writeln!(out, "{}", "\nResponse Headers:".italic())?;
        write_headers(out, &resp_headers)?;
    }

    let trailers = stats.resp_trailers();
    if !trailers.is_empty() {
        writeln!(out, "{}", "\nResponse Trailers:".italic())?;
        write_headers(out, &trailers)?;
    }

    writeln!(out)?;
    writeln!(
        out,
        "{}{}",
        "Request duration: ".bold(),
        format!("{:?}", stats.duration()).bright_yellow()
    )?;
    writeln!(
        out,
        "{}{}",
        "Request size: ".bold(),
        format!("{} bytes", stats.req_size()).bright_yellow()
    )?;
    writeln!(
        out,
        "{}{}",
        "Response size: ".bold(),
        format!("{} bytes", stats.resp_size()).bright_yellow()
    )?;
    writeln!(out)
}

fn write_headers<W: Write>(out: &mut W, headers: &HeaderMap) -> io::Result<()> {
    for (name, value) in headers {
        let value = value.to_str().unwrap_or("<binary>");
        writeln!(out, "{}{}", format!("{name}: ").bold(), value.bright_green())?;
    }
    Ok(())
}
