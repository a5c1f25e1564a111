//! Purpose: Block until a checkpoint line shows up in a process log after a mark.
//! Exports: `LogWatcher`, `LogCursor`, `LogPattern`, `LogMatch`.
//! Role: Poll-based tail over an append-only log file; no inotify, no random seeks.
//! Invariants: Content before the mark is never returned, even if it matches.
//! Invariants: Only complete lines are matched while the writer may still append.
//! Invariants: A file that shrinks below the read position is re-read from offset 0.
use std::collections::hash_map::DefaultHasher;
use std::fs::File;
use std::hash::{Hash, Hasher};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::thread::sleep;
use std::time::{Duration, Instant};

use bstr::ByteSlice;
use regex::Regex;

use crate::core::error::{Error, ErrorKind};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Clone, Debug)]
pub enum LogPattern {
    Substring(String),
    Regex(Regex),
}

impl LogPattern {
    pub fn substring(text: impl Into<String>) -> Self {
        LogPattern::Substring(text.into())
    }

    pub fn regex(expr: &str) -> Result<Self, Error> {
        Regex::new(expr).map(LogPattern::Regex).map_err(|err| {
            Error::new(ErrorKind::Usage)
                .with_message(format!("invalid log pattern `{expr}`"))
                .with_source(err)
        })
    }

    fn is_match(&self, line: &[u8]) -> bool {
        match self {
            LogPattern::Substring(text) => line.find(text.as_bytes()).is_some(),
            LogPattern::Regex(regex) => regex.is_match(&line.to_str_lossy()),
        }
    }
}

impl From<&str> for LogPattern {
    fn from(text: &str) -> Self {
        LogPattern::substring(text)
    }
}

impl std::fmt::Display for LogPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogPattern::Substring(text) => write!(f, "`{text}`"),
            LogPattern::Regex(regex) => write!(f, "/{}/", regex.as_str()),
        }
    }
}

/// Opaque position in one specific log.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LogCursor {
    log_id: u64,
    offset: u64,
}

impl LogCursor {
    pub fn offset(&self) -> u64 {
        self.offset
    }
}

#[derive(Clone, Debug)]
pub struct LogMatch {
    pub line: String,
    /// Position just past the matched line; usable as the next mark.
    pub cursor: LogCursor,
}

#[derive(Clone, Debug)]
pub struct LogWatcher {
    path: PathBuf,
    log_id: u64,
    poll_interval: Duration,
}

struct Tail {
    read_pos: u64,
    pending: Vec<u8>,
}

impl LogWatcher {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut hasher = DefaultHasher::new();
        path.hash(&mut hasher);
        Self {
            log_id: hasher.finish(),
            path,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval.max(Duration::from_millis(1));
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current end of the log; a missing file marks offset 0.
    pub fn mark(&self) -> Result<LogCursor, Error> {
        let offset = match std::fs::metadata(&self.path) {
            Ok(meta) => meta.len(),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => 0,
            Err(err) => return Err(self.io_error("failed to stat log", err)),
        };
        Ok(LogCursor {
            log_id: self.log_id,
            offset,
        })
    }

    pub fn wait_for(
        &self,
        pattern: &LogPattern,
        from: LogCursor,
        timeout: Duration,
    ) -> Result<LogMatch, Error> {
        self.wait_for_while(pattern, from, timeout, || true)
    }

    /// Like `wait_for`, but gives up early once `alive` reports the writer has gone.
    pub(crate) fn wait_for_while(
        &self,
        pattern: &LogPattern,
        from: LogCursor,
        timeout: Duration,
        mut alive: impl FnMut() -> bool,
    ) -> Result<LogMatch, Error> {
        self.check_cursor(from)?;
        let start = Instant::now();
        let mut tail = Tail {
            read_pos: from.offset,
            pending: Vec::new(),
        };
        loop {
            let writer_alive = alive();
            if let Some(found) = self.scan(&mut tail, pattern, !writer_alive)? {
                tracing::debug!(
                    pattern = %pattern,
                    offset = found.cursor.offset,
                    "log checkpoint reached"
                );
                return Ok(found);
            }
            if !writer_alive {
                return Err(Error::new(ErrorKind::ExitedEarly)
                    .with_message(format!("writer exited before {pattern} appeared in log"))
                    .with_path(&self.path));
            }
            let elapsed = start.elapsed();
            if elapsed >= timeout {
                return Err(Error::new(ErrorKind::LogPatternTimeout)
                    .with_message(format!(
                        "{pattern} not found after offset {} within {timeout:?}",
                        from.offset
                    ))
                    .with_path(&self.path));
            }
            sleep(self.poll_interval.min(timeout - elapsed));
        }
    }

    /// Every line after `from` that matches, including a trailing partial line.
    pub fn grep(&self, pattern: &LogPattern, from: LogCursor) -> Result<Vec<LogMatch>, Error> {
        self.check_cursor(from)?;
        let mut tail = Tail {
            read_pos: from.offset,
            pending: Vec::new(),
        };
        let mut matches = Vec::new();
        while let Some(found) = self.scan(&mut tail, pattern, true)? {
            matches.push(found);
        }
        Ok(matches)
    }

    fn check_cursor(&self, cursor: LogCursor) -> Result<(), Error> {
        if cursor.log_id != self.log_id {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("log cursor was taken from a different log")
                .with_path(&self.path));
        }
        Ok(())
    }

    /// Read what was appended since the last call and return the first matching line.
    /// Lines already scanned are dropped from `pending`.
    fn scan(
        &self,
        tail: &mut Tail,
        pattern: &LogPattern,
        include_partial: bool,
    ) -> Result<Option<LogMatch>, Error> {
        self.read_appended(tail)?;

        let base = tail.read_pos - tail.pending.len() as u64;
        let mut consumed = 0usize;
        let mut found = None;
        while let Some(newline) = tail.pending[consumed..].find_byte(b'\n') {
            let end = consumed + newline;
            let line = tail.pending[consumed..end].trim_end_with(|c| c == '\r');
            consumed = end + 1;
            if pattern.is_match(line) {
                found = Some(self.found(line, base + consumed as u64));
                break;
            }
        }
        if found.is_none() && include_partial && consumed < tail.pending.len() {
            let line = &tail.pending[consumed..];
            if pattern.is_match(line) {
                found = Some(self.found(line, tail.read_pos));
            }
            consumed = tail.pending.len();
        }
        tail.pending.drain(..consumed);
        Ok(found)
    }

    fn found(&self, line: &[u8], offset: u64) -> LogMatch {
        LogMatch {
            line: line.to_str_lossy().into_owned(),
            cursor: LogCursor {
                log_id: self.log_id,
                offset,
            },
        }
    }

    fn read_appended(&self, tail: &mut Tail) -> Result<(), Error> {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(self.io_error("failed to open log", err)),
        };
        let len = file
            .metadata()
            .map_err(|err| self.io_error("failed to stat log", err))?
            .len();
        if len < tail.read_pos {
            tracing::debug!(path = %self.path.display(), "log shrank; rereading from start");
            tail.read_pos = 0;
            tail.pending.clear();
        }
        if len == tail.read_pos {
            return Ok(());
        }
        file.seek(SeekFrom::Start(tail.read_pos))
            .map_err(|err| self.io_error("failed to seek log", err))?;
        let mut chunk = Vec::new();
        let read = file
            .take(len - tail.read_pos)
            .read_to_end(&mut chunk)
            .map_err(|err| self.io_error("failed to read log", err))?;
        tail.read_pos += read as u64;
        tail.pending.extend_from_slice(&chunk);
        Ok(())
    }

    fn io_error(&self, message: &str, err: std::io::Error) -> Error {
        Error::new(ErrorKind::Io)
            .with_message(message)
            .with_path(&self.path)
            .with_source(err)
    }
}

/// Last `max_lines` lines of a log, for failure diagnostics.
pub fn log_tail(path: &Path, max_lines: usize) -> Option<String> {
    let bytes = std::fs::read(path).ok()?;
    let lines: Vec<&[u8]> = bytes.lines().collect();
    let start = lines.len().saturating_sub(max_lines);
    let text = lines[start..]
        .iter()
        .map(|line| line.to_str_lossy())
        .collect::<Vec<_>>()
        .join("\n");
    if text.is_empty() { None } else { Some(text) }
}
