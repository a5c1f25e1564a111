//! Purpose: Single error type shared by the harness library, the mock server and the CLI.
//! Exports: `Error`, `ErrorKind`, `to_exit_code`.
//! Role: Builder-style error carrying the precise detail a failed test step needs.
//! Invariants: Kinds are stable; their `Debug` names appear on the wire and in CLI output.
//! Invariants: Exit codes per kind never change once published.
use std::error::Error as StdError;
use std::fmt;
use std::path::{Path, PathBuf};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    Internal,
    Usage,
    Io,
    /// Inbound request did not match the head of the expectation queue.
    ExpectationMismatch,
    /// Queue still held unsatisfied entries at the end of a step.
    UnconsumedExpectations,
    /// A new queue was pushed while the previous one was still pending.
    PendingExpectations,
    StartupTimeout,
    ExitedEarly,
    CommandFailed,
    Timeout,
    LogPatternTimeout,
    Exhausted,
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
    hint: Option<String>,
    path: Option<PathBuf>,
    exit_code: Option<i32>,
    detail: Option<String>,
    source: Option<Box<dyn StdError + Send + Sync>>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            hint: None,
            path: None,
            exit_code: None,
            detail: None,
            source: None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn hint(&self) -> Option<&str> {
        self.hint.as_deref()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Exit code of the child process this error is about, when one exited.
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    /// Multi-line diagnostic payload (expected vs received, captured stderr tail).
    pub fn detail(&self) -> Option<&str> {
        self.detail.as_deref()
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_exit_code(mut self, code: i32) -> Self {
        self.exit_code = Some(code);
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_source(mut self, source: impl StdError + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(message) = &self.message {
            write!(f, ": {message}")?;
        }
        if let Some(path) = &self.path {
            write!(f, " (path: {})", path.display())?;
        }
        if let Some(code) = self.exit_code {
            write!(f, " (exit code: {code})")?;
        }
        if let Some(detail) = &self.detail {
            write!(f, "\n{detail}")?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|source| source.as_ref() as &(dyn StdError + 'static))
    }
}

pub fn to_exit_code(kind: ErrorKind) -> i32 {
    match kind {
        ErrorKind::Internal => 1,
        ErrorKind::Usage => 2,
        ErrorKind::Io => 3,
        ErrorKind::ExpectationMismatch => 4,
        ErrorKind::UnconsumedExpectations => 5,
        ErrorKind::PendingExpectations => 6,
        ErrorKind::StartupTimeout => 7,
        ErrorKind::ExitedEarly => 8,
        ErrorKind::CommandFailed => 9,
        ErrorKind::Timeout => 10,
        ErrorKind::LogPatternTimeout => 11,
        ErrorKind::Exhausted => 12,
    }
}

/// Parse a kind name as emitted by `{:?}`; unknown names map to `Internal`.
pub fn parse_error_kind(kind: &str) -> ErrorKind {
    match kind {
        "Usage" => ErrorKind::Usage,
        "Io" => ErrorKind::Io,
        "ExpectationMismatch" => ErrorKind::ExpectationMismatch,
        "UnconsumedExpectations" => ErrorKind::UnconsumedExpectations,
        "PendingExpectations" => ErrorKind::PendingExpectations,
        "StartupTimeout" => ErrorKind::StartupTimeout,
        "ExitedEarly" => ErrorKind::ExitedEarly,
        "CommandFailed" => ErrorKind::CommandFailed,
        "Timeout" => ErrorKind::Timeout,
        "LogPatternTimeout" => ErrorKind::LogPatternTimeout,
        "Exhausted" => ErrorKind::Exhausted,
        _ => ErrorKind::Internal,
    }
}
