//! Purpose: `restmock` CLI entry point: parse args, dispatch, map errors to exit codes.
//! Role: Binary crate root; the mock server, admin client, and invoker live in the library.
//! Invariants: Commands emit JSON on stdout (pretty on a tty, compact otherwise).
//! Invariants: Non-interactive errors are emitted as JSON on stderr.
//! Invariants: Process exit code is derived from `api::to_exit_code`.
#![allow(clippy::result_large_err)]
use std::io::{self, IsTerminal, Read};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use clap::{
    CommandFactory, Parser, Subcommand, ValueEnum, ValueHint, error::ErrorKind as ClapErrorKind,
};
use clap_complete::aot::Shell;
use serde_json::{Map, Value, json};
use std::error::Error as StdError;

mod command_dispatch;
mod serve;

use restmock::api::{Error, ErrorKind, ExpectedRequest, HarnessArgs, to_exit_code};

#[derive(Copy, Clone, Debug)]
struct RunOutcome {
    exit_code: i32,
}

impl RunOutcome {
    fn ok() -> Self {
        Self { exit_code: 0 }
    }

    fn with_code(exit_code: i32) -> Self {
        Self { exit_code }
    }
}

fn main() {
    let exit_code = match run() {
        Ok(outcome) => outcome.exit_code,
        Err((err, color_mode)) => {
            emit_error(&err, color_mode);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn run() -> Result<RunOutcome, (Error, ColorMode)> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp
            | ClapErrorKind::DisplayVersion
            | ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                err.print().map_err(|io_err| {
                    (
                        Error::new(ErrorKind::Io)
                            .with_message("failed to write help")
                            .with_source(io_err),
                        ColorMode::Auto,
                    )
                })?;
                let exit_code = if matches!(
                    err.kind(),
                    ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
                ) {
                    2
                } else {
                    0
                };
                return Ok(RunOutcome::with_code(exit_code));
            }
            _ => {
                return Err((
                    Error::new(ErrorKind::Usage)
                        .with_message(clap_error_summary(&err))
                        .with_hint(clap_error_hint(&err)),
                    ColorMode::Auto,
                ));
            }
        },
    };

    let color_mode = cli.color;
    command_dispatch::dispatch_command(cli.command).map_err(|err| (err, color_mode))
}

#[derive(Parser)]
#[command(
    name = "restmock",
    version,
    about = "Ordered-expectation REST mock for control-plane integration tests",
    long_about = None,
    before_help = r#"The mock answers requests strictly in the order they were queued.
Anything out of order gets HTTP 500 and is recorded as a mismatch.

Mental model:
  - `serve` runs the mock
  - `expect` primes, inspects, and clears its queue
  - `run` does one full step: queue, run a command, verify the queue drained
"#,
    after_help = r#"EXAMPLES
  $ restmock serve --bind 127.0.0.1:12345
  $ echo '[{"method":"GET","path":"/stream_manager/","response":[]}]' \
      | restmock expect set --url http://127.0.0.1:12345
  $ restmock request GET /stream_manager/ --url http://127.0.0.1:12345
  $ restmock expect get --url http://127.0.0.1:12345      # -> []"#,
    arg_required_else_help = true
)]
struct Cli {
    #[arg(
        long,
        default_value = "auto",
        value_enum,
        help = "Colorize stderr diagnostics: auto|always|never"
    )]
    color: ColorMode,

    #[command(subcommand)]
    command: Command,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum ColorMode {
    Auto,
    Always,
    Never,
}

impl ColorMode {
    fn use_color(self, is_tty: bool) -> bool {
        match self {
            ColorMode::Auto => is_tty,
            ColorMode::Always => true,
            ColorMode::Never => false,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    #[command(
        about = "Run the mock server until SIGTERM or ctrl-c",
        after_help = r#"EXAMPLES
  $ restmock serve --bind 127.0.0.1:0
  {"listening":"http://127.0.0.1:43817"}
  $ restmock serve --bind 127.4.5.6:12345 --expect handshake.json"#
    )]
    Serve {
        #[arg(
            long,
            default_value = "127.0.0.1:0",
            help = "Address to listen on (port 0 picks a free port)"
        )]
        bind: SocketAddr,
        #[arg(
            long,
            value_hint = ValueHint::FilePath,
            help = "Expectation list (JSON array) to queue at startup"
        )]
        expect: Option<PathBuf>,
    },
    #[command(
        arg_required_else_help = true,
        about = "Prime, inspect, or clear a running mock's queue"
    )]
    Expect {
        #[command(subcommand)]
        command: ExpectCommand,
    },
    #[command(
        about = "Send one request to the mock, as a process under test would",
        after_help = r#"EXAMPLES
  $ restmock request GET /column_family/ --url http://127.0.0.1:12345
  $ restmock request POST '/storage_service/keyspace_compaction/ks?cf=t' --data '{"split":true}'"#
    )]
    Request {
        #[arg(help = "HTTP method")]
        method: String,
        #[arg(help = "Path, optionally with a query string")]
        path: String,
        #[arg(long, help = "Inline JSON request body")]
        data: Option<String>,
        #[arg(long, env = "RESTMOCK_URL", help = "Mock server base URL")]
        url: String,
    },
    #[command(
        about = "Run one step: start a mock, queue expectations, run the command, verify",
        after_help = r#"EXAMPLES
  $ restmock run --binary ./build/dev/scylla --expect compact.json compact ks1
  $ restmock run --backend bridged --bridge tools/jmx/scripts/scylla-jmx status"#
    )]
    Run {
        #[command(flatten)]
        harness: HarnessArgs,
        #[arg(
            long,
            value_hint = ValueHint::FilePath,
            help = "Expectation list (JSON array) for this step"
        )]
        expect: Option<PathBuf>,
        #[arg(help = "Method (subcommand) passed to the command under test")]
        method: String,
        #[arg(
            trailing_var_arg = true,
            allow_hyphen_values = true,
            help = "Extra arguments for the command under test"
        )]
        args: Vec<String>,
    },
    #[command(about = "Generate shell completion scripts")]
    Completion {
        #[arg(value_enum)]
        shell: Shell,
    },
    #[command(about = "Print version info")]
    Version,
}

#[derive(Subcommand)]
enum ExpectCommand {
    #[command(about = "Replace the queue (refused while entries are still pending)")]
    Set {
        #[arg(
            default_value = "-",
            value_hint = ValueHint::FilePath,
            help = "JSON array of expectations, or - for stdin"
        )]
        file: PathBuf,
        #[arg(long, env = "RESTMOCK_URL", help = "Mock server base URL")]
        url: String,
    },
    #[command(about = "List entries that still need a request")]
    Get {
        #[arg(long, env = "RESTMOCK_URL", help = "Mock server base URL")]
        url: String,
    },
    #[command(about = "Empty the queue and the mismatch record")]
    Clear {
        #[arg(long, env = "RESTMOCK_URL", help = "Mock server base URL")]
        url: String,
    },
    #[command(about = "List requests rejected since the queue was last set")]
    Mismatches {
        #[arg(long, env = "RESTMOCK_URL", help = "Mock server base URL")]
        url: String,
    },
}

fn read_expectations(path: &Path) -> Result<Vec<ExpectedRequest>, Error> {
    let mut text = String::new();
    if path == Path::new("-") {
        io::stdin().read_to_string(&mut text).map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to read expectations from stdin")
                .with_source(err)
        })?;
    } else {
        text = std::fs::read_to_string(path).map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to read expectations")
                .with_path(path)
                .with_source(err)
        })?;
    }
    serde_json::from_str(&text).map_err(|err| {
        Error::new(ErrorKind::Usage)
            .with_message(format!("invalid expectation list: {err}"))
            .with_path(path)
            .with_hint("Expected a JSON array of {\"method\",\"path\",...} objects.")
    })
}

fn emit_version_output() {
    if io::stdout().is_terminal() {
        println!("restmock {}", env!("CARGO_PKG_VERSION"));
    } else {
        emit_json(json!({
            "name": "restmock",
            "version": env!("CARGO_PKG_VERSION"),
        }));
    }
}

fn emit_json(value: Value) {
    let json = if io::stdout().is_terminal() {
        serde_json::to_string_pretty(&value)
    } else {
        serde_json::to_string(&value)
    }
    .unwrap_or_else(|_| "{\"error\":\"json encode failed\"}".to_string());
    println!("{json}");
}

#[derive(Copy, Clone, Debug)]
enum AnsiColor {
    Red,
    Yellow,
}

fn colorize_label(label: &str, enabled: bool, color: AnsiColor) -> String {
    if !enabled {
        return label.to_string();
    }
    let code = match color {
        AnsiColor::Red => "31",
        AnsiColor::Yellow => "33",
    };
    format!("\u{1b}[{code}m{label}\u{1b}[0m")
}

fn emit_error(err: &Error, color_mode: ColorMode) {
    let is_tty = io::stderr().is_terminal();
    if is_tty {
        eprintln!("{}", error_text(err, color_mode.use_color(is_tty)));
        return;
    }

    let value = error_json(err);
    let json = serde_json::to_string(&value).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn error_message(err: &Error) -> String {
    if let Some(message) = err.message() {
        return message.to_string();
    }
    match err.kind() {
        ErrorKind::Internal => "internal error".to_string(),
        ErrorKind::Usage => "usage error".to_string(),
        ErrorKind::Io => "i/o error".to_string(),
        ErrorKind::ExpectationMismatch => "request did not match the expected one".to_string(),
        ErrorKind::UnconsumedExpectations => "expected requests were never made".to_string(),
        ErrorKind::PendingExpectations => "previous expectations still pending".to_string(),
        ErrorKind::StartupTimeout => "process did not become ready".to_string(),
        ErrorKind::ExitedEarly => "process exited before it was ready".to_string(),
        ErrorKind::CommandFailed => "command failed".to_string(),
        ErrorKind::Timeout => "timed out".to_string(),
        ErrorKind::LogPatternTimeout => "log line never appeared".to_string(),
        ErrorKind::Exhausted => "no free address".to_string(),
    }
}

fn error_causes(err: &Error) -> Vec<String> {
    let mut causes = Vec::new();
    let mut cur = err.source();
    while let Some(source) = cur {
        causes.push(source.to_string());
        cur = source.source();
    }
    causes
}

fn error_json(err: &Error) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(format!("{:?}", err.kind())));
    inner.insert("message".to_string(), json!(error_message(err)));
    if let Some(hint) = err.hint() {
        inner.insert("hint".to_string(), json!(hint));
    }
    if let Some(path) = err.path() {
        inner.insert("path".to_string(), json!(path.display().to_string()));
    }
    if let Some(code) = err.exit_code() {
        inner.insert("exit_code".to_string(), json!(code));
    }
    if let Some(detail) = err.detail() {
        inner.insert("detail".to_string(), json!(detail));
    }
    let causes = error_causes(err);
    if !causes.is_empty() {
        inner.insert("causes".to_string(), json!(causes));
    }

    let mut outer = Map::new();
    outer.insert("error".to_string(), Value::Object(inner));
    Value::Object(outer)
}

fn error_text(err: &Error, use_color: bool) -> String {
    let mut lines = Vec::new();
    lines.push(format!(
        "{} {}",
        colorize_label("error:", use_color, AnsiColor::Red),
        error_message(err)
    ));

    if let Some(hint) = err.hint() {
        lines.push(format!(
            "{} {hint}",
            colorize_label("hint:", use_color, AnsiColor::Yellow)
        ));
    }
    if let Some(path) = err.path() {
        lines.push(format!(
            "{} {}",
            colorize_label("path:", use_color, AnsiColor::Yellow),
            path.display()
        ));
    }
    if let Some(code) = err.exit_code() {
        lines.push(format!(
            "{} {code}",
            colorize_label("exit code:", use_color, AnsiColor::Yellow)
        ));
    }
    if let Some(detail) = err.detail() {
        lines.push(detail.to_string());
    }

    let causes = error_causes(err);
    if let Some(cause) = causes.first() {
        lines.push(format!(
            "{} {cause}",
            colorize_label("caused by:", use_color, AnsiColor::Yellow)
        ));
    }

    lines.join("\n")
}

fn clap_error_summary(err: &clap::Error) -> String {
    for line in err.to_string().lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix("error:") {
            return rest.trim().to_string();
        }
        return trimmed.to_string();
    }
    "invalid arguments".to_string()
}

fn clap_error_hint(err: &clap::Error) -> String {
    let rendered = err.to_string();
    let usage = rendered
        .lines()
        .find_map(|line| line.trim().strip_prefix("Usage: "))
        .map(str::trim);
    let Some(usage) = usage else {
        return "Try `restmock --help`.".to_string();
    };

    let tokens: Vec<&str> = usage.split_whitespace().collect();
    let Some(pos) = tokens.iter().position(|t| *t == "restmock") else {
        return "Try `restmock --help`.".to_string();
    };
    let parts: Vec<&str> = tokens
        .iter()
        .skip(pos + 1)
        .take_while(|token| {
            !(token.starts_with('-') || token.starts_with('<') || token.starts_with('['))
        })
        .copied()
        .collect();
    if parts.is_empty() {
        return "Try `restmock --help`.".to_string();
    }
    format!("Try `restmock {} --help`.", parts.join(" "))
}
