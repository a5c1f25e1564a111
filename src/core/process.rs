//! Purpose: Spawn, probe, and reliably reap external processes under test.
//! Exports: `ProcessSpec`, `OutputMode`, `ManagedProcess`, `TerminationState`, `ProcessPhase`,
//!          `ProbeStatus`, `ReadinessProbe`, `TcpProbe`, `HttpProbe`.
//! Role: Blocking supervisor used by fixtures and the invoker; one `ManagedProcess` per child.
//! Invariants: Output pipes are always drained, so a child never blocks on a full pipe.
//! Invariants: Captured output keeps at most the last `CAPTURE_LIMIT` bytes per stream.
//! Invariants: An exited child fails `await_ready` within one poll interval.
//! Invariants: `terminate` is idempotent; `Drop` terminates, so every exit path reaps the child.
use std::ffi::OsString;
use std::fs::OpenOptions;
use std::io::Read;
use std::net::{SocketAddr, TcpStream};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread::{JoinHandle, sleep};
use std::time::{Duration, Instant};

use crate::core::error::{Error, ErrorKind};
use crate::core::log_watch::{LogCursor, LogMatch, LogPattern, LogWatcher, log_tail};

const DEFAULT_GRACE: Duration = Duration::from_secs(5);
const EXIT_POLL: Duration = Duration::from_millis(10);
const PIPE_PATIENCE: Duration = Duration::from_millis(500);
const DIAGNOSTIC_LINES: usize = 20;
const CAPTURE_LIMIT: usize = 4 << 20;

#[derive(Clone, Debug, Default)]
pub enum OutputMode {
    /// Drain stdout and stderr into memory.
    #[default]
    Capture,
    /// Append both streams to a file, which becomes the process log.
    LogFile(PathBuf),
    Null,
}

#[derive(Clone, Debug)]
pub struct ProcessSpec {
    program: PathBuf,
    args: Vec<OsString>,
    workdir: Option<PathBuf>,
    env: Vec<(OsString, OsString)>,
    output: OutputMode,
    grace: Duration,
}

impl ProcessSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            workdir: None,
            env: Vec::new(),
            output: OutputMode::Capture,
            grace: DEFAULT_GRACE,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn workdir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn output(mut self, output: OutputMode) -> Self {
        self.output = output;
        self
    }

    /// Time between SIGTERM and SIGKILL during `terminate`.
    pub fn grace_period(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.program.as_os_str())
            .chain(self.args.iter().map(OsString::as_os_str))
            .map(|part| part.to_string_lossy().into_owned())
            .collect()
    }

    pub fn spawn(self) -> Result<ManagedProcess, Error> {
        ManagedProcess::spawn(self)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TerminationState {
    Running,
    ExitedOk,
    ExitedError(i32),
    /// Terminated by a signal (unix signal number; 0 where unknown).
    Killed(i32),
}

impl TerminationState {
    fn from_status(status: ExitStatus) -> Self {
        match status.code() {
            Some(0) => TerminationState::ExitedOk,
            Some(code) => TerminationState::ExitedError(code),
            None => TerminationState::Killed(signal_of(status)),
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, TerminationState::Running)
    }

    /// Exit code, or `128 + signal` for a signal death (shell convention).
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            TerminationState::Running => None,
            TerminationState::ExitedOk => Some(0),
            TerminationState::ExitedError(code) => Some(*code),
            TerminationState::Killed(signal) => Some(128 + signal),
        }
    }
}

#[cfg(unix)]
fn signal_of(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status.signal().unwrap_or(0)
}

#[cfg(not(unix))]
fn signal_of(_status: ExitStatus) -> i32 {
    0
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProcessPhase {
    Spawned,
    Polling,
    Ready,
    TimedOut,
    ExitedEarly,
    Terminated,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProbeStatus {
    Ready,
    NotReady,
}

/// Caller-supplied readiness check. `Err` aborts the wait.
pub trait ReadinessProbe {
    fn probe(&mut self) -> Result<ProbeStatus, Error>;

    fn describe(&self) -> String {
        "readiness probe".to_string()
    }
}

impl<F> ReadinessProbe for F
where
    F: FnMut() -> Result<ProbeStatus, Error>,
{
    fn probe(&mut self) -> Result<ProbeStatus, Error> {
        self()
    }
}

/// Ready once a TCP connection is accepted. Refused connections are "not yet".
#[derive(Clone, Debug)]
pub struct TcpProbe {
    addr: SocketAddr,
    connect_timeout: Duration,
}

impl TcpProbe {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            connect_timeout: Duration::from_millis(200),
        }
    }
}

impl ReadinessProbe for TcpProbe {
    fn probe(&mut self) -> Result<ProbeStatus, Error> {
        match TcpStream::connect_timeout(&self.addr, self.connect_timeout) {
            Ok(_) => Ok(ProbeStatus::Ready),
            Err(err) => {
                tracing::trace!(addr = %self.addr, error = %err, "tcp probe not ready");
                Ok(ProbeStatus::NotReady)
            }
        }
    }

    fn describe(&self) -> String {
        format!("tcp connect to {}", self.addr)
    }
}

/// Ready once `GET url` answers with a 2xx status.
#[derive(Clone, Debug)]
pub struct HttpProbe {
    url: String,
    agent: ureq::Agent,
}

impl HttpProbe {
    pub fn new(url: impl Into<String>) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_millis(200))
            .timeout(Duration::from_secs(2))
            .build();
        Self {
            url: url.into(),
            agent,
        }
    }
}

impl ReadinessProbe for HttpProbe {
    fn probe(&mut self) -> Result<ProbeStatus, Error> {
        match self.agent.get(&self.url).call() {
            Ok(_) => Ok(ProbeStatus::Ready),
            Err(_) => Ok(ProbeStatus::NotReady),
        }
    }

    fn describe(&self) -> String {
        format!("GET {}", self.url)
    }
}

struct CapturedStream {
    buffer: Arc<Mutex<Vec<u8>>>,
    reader: Option<JoinHandle<()>>,
}

impl CapturedStream {
    fn start(mut source: impl Read + Send + 'static) -> Self {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&buffer);
        let reader = std::thread::spawn(move || {
            let mut chunk = [0u8; 8192];
            loop {
                match source.read(&mut chunk) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let mut bytes = sink.lock().unwrap_or_else(|poison| poison.into_inner());
                        bytes.extend_from_slice(&chunk[..n]);
                        // Trim in bulk; `text` only ever shows the last CAPTURE_LIMIT bytes.
                        if bytes.len() > 2 * CAPTURE_LIMIT {
                            let excess = bytes.len() - CAPTURE_LIMIT;
                            bytes.drain(..excess);
                        }
                    }
                }
            }
        });
        Self {
            buffer,
            reader: Some(reader),
        }
    }

    /// Join the reader unless a surviving grandchild still holds the pipe open.
    fn join(&mut self, patience: Duration) {
        let deadline = Instant::now() + patience;
        while self.reader.as_ref().is_some_and(|r| !r.is_finished()) {
            if Instant::now() >= deadline {
                tracing::debug!("output pipe still open after exit; detaching reader");
                self.reader = None;
                return;
            }
            sleep(EXIT_POLL);
        }
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }

    fn text(&self) -> String {
        let bytes = self
            .buffer
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        let start = bytes.len().saturating_sub(CAPTURE_LIMIT);
        String::from_utf8_lossy(&bytes[start..]).into_owned()
    }
}

pub struct ManagedProcess {
    child: Child,
    argv: Vec<String>,
    workdir: Option<PathBuf>,
    log_path: Option<PathBuf>,
    stdout: Option<CapturedStream>,
    stderr: Option<CapturedStream>,
    grace: Duration,
    state: TerminationState,
    phase: ProcessPhase,
}

impl std::fmt::Debug for ManagedProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedProcess")
            .field("pid", &self.child.id())
            .field("argv", &self.argv)
            .field("state", &self.state)
            .field("phase", &self.phase)
            .finish()
    }
}

impl ManagedProcess {
    pub fn spawn(spec: ProcessSpec) -> Result<Self, Error> {
        let argv = spec.argv();
        let mut command = Command::new(&spec.program);
        command.args(&spec.args).stdin(Stdio::null());
        if let Some(workdir) = &spec.workdir {
            command.current_dir(workdir);
        }
        for (key, value) in &spec.env {
            command.env(key, value);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // Own group, so terminate reaches helpers the child forks.
            command.process_group(0);
        }

        let mut log_path = None;
        match &spec.output {
            OutputMode::Capture => {
                command.stdout(Stdio::piped()).stderr(Stdio::piped());
            }
            OutputMode::LogFile(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|err| {
                        Error::new(ErrorKind::Io)
                            .with_message("failed to open process log")
                            .with_path(path)
                            .with_source(err)
                    })?;
                let err_file = file.try_clone().map_err(|err| {
                    Error::new(ErrorKind::Io)
                        .with_message("failed to clone process log handle")
                        .with_path(path)
                        .with_source(err)
                })?;
                command.stdout(file).stderr(err_file);
                log_path = Some(path.clone());
            }
            OutputMode::Null => {
                command.stdout(Stdio::null()).stderr(Stdio::null());
            }
        }

        let mut child = command.spawn().map_err(|err| {
            let kind = if err.kind() == std::io::ErrorKind::NotFound {
                ErrorKind::Usage
            } else {
                ErrorKind::Io
            };
            Error::new(kind)
                .with_message(format!("failed to spawn `{}`", argv.join(" ")))
                .with_path(&spec.program)
                .with_source(err)
        })?;
        let stdout = child.stdout.take().map(CapturedStream::start);
        let stderr = child.stderr.take().map(CapturedStream::start);
        tracing::info!(pid = child.id(), argv = ?argv, "process spawned");

        Ok(Self {
            child,
            argv,
            workdir: spec.workdir,
            log_path,
            stdout,
            stderr,
            grace: spec.grace,
            state: TerminationState::Running,
            phase: ProcessPhase::Spawned,
        })
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    pub fn workdir(&self) -> Option<&Path> {
        self.workdir.as_deref()
    }

    pub fn log_path(&self) -> Option<&Path> {
        self.log_path.as_deref()
    }

    pub fn phase(&self) -> ProcessPhase {
        self.phase
    }

    pub fn state(&self) -> TerminationState {
        self.state
    }

    /// Non-blocking liveness check; records the exit once observed.
    pub fn poll_exit(&mut self) -> Result<TerminationState, Error> {
        if !self.state.is_running() {
            return Ok(self.state);
        }
        let status = self.child.try_wait().map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to poll child status")
                .with_source(err)
        })?;
        if let Some(status) = status {
            self.record_exit(status);
        }
        Ok(self.state)
    }

    /// Alternate a liveness check and `probe` every `poll_interval` until ready.
    pub fn await_ready(
        &mut self,
        probe: &mut dyn ReadinessProbe,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<(), Error> {
        self.phase = ProcessPhase::Polling;
        let start = Instant::now();
        loop {
            let state = self.poll_exit()?;
            if !state.is_running() {
                self.phase = ProcessPhase::ExitedEarly;
                let mut err = Error::new(ErrorKind::ExitedEarly).with_message(format!(
                    "`{}` exited ({state:?}) before {} succeeded",
                    self.argv.join(" "),
                    probe.describe()
                ));
                if let Some(code) = state.exit_code() {
                    err = err.with_exit_code(code);
                }
                if let Some(detail) = self.diagnostics() {
                    err = err.with_detail(detail);
                }
                return Err(err);
            }

            match probe.probe() {
                Ok(ProbeStatus::Ready) => {
                    self.phase = ProcessPhase::Ready;
                    tracing::info!(pid = self.pid(), elapsed = ?start.elapsed(), "process ready");
                    return Ok(());
                }
                Ok(ProbeStatus::NotReady) => {}
                Err(err) => {
                    self.terminate();
                    return Err(err);
                }
            }

            let elapsed = start.elapsed();
            if elapsed >= timeout {
                self.phase = ProcessPhase::TimedOut;
                let detail = self.diagnostics();
                self.terminate();
                let mut err = Error::new(ErrorKind::StartupTimeout).with_message(format!(
                    "`{}` not ready after {timeout:?} ({})",
                    self.argv.join(" "),
                    probe.describe()
                ));
                if let Some(detail) = detail {
                    err = err.with_detail(detail);
                }
                return Err(err);
            }
            tracing::debug!(pid = self.pid(), elapsed = ?elapsed, "not ready yet");
            sleep(poll_interval.min(timeout - elapsed));
        }
    }

    /// Wait for exit, bounded by `timeout`; a hung child is terminated.
    pub fn wait(&mut self, timeout: Duration) -> Result<TerminationState, Error> {
        let start = Instant::now();
        loop {
            let state = self.poll_exit()?;
            if !state.is_running() {
                return Ok(state);
            }
            let elapsed = start.elapsed();
            if elapsed >= timeout {
                self.terminate();
                return Err(Error::new(ErrorKind::Timeout)
                    .with_message(format!(
                        "`{}` did not exit within {timeout:?}",
                        self.argv.join(" ")
                    ))
                    .with_hint("The process was terminated; check its output for a hang."));
            }
            sleep(EXIT_POLL.min(timeout - elapsed));
        }
    }

    /// SIGTERM, wait out the grace period, then SIGKILL. No-op once exited.
    pub fn terminate(&mut self) -> TerminationState {
        if self.state.is_running() {
            if let Err(err) = self.stop() {
                tracing::warn!(pid = self.pid(), error = %err, "failed to stop process");
            }
        }
        self.phase = ProcessPhase::Terminated;
        self.state
    }

    fn stop(&mut self) -> Result<(), Error> {
        if !self.poll_exit()?.is_running() {
            return Ok(());
        }
        send_terminate(&mut self.child);
        let deadline = Instant::now() + self.grace;
        while Instant::now() < deadline {
            if !self.poll_exit()?.is_running() {
                return Ok(());
            }
            sleep(EXIT_POLL);
        }
        tracing::warn!(pid = self.pid(), grace = ?self.grace, "process ignored SIGTERM; killing");
        send_kill(&mut self.child);
        let status = self.child.wait().map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to reap child")
                .with_source(err)
        })?;
        self.record_exit(status);
        Ok(())
    }

    fn record_exit(&mut self, status: ExitStatus) {
        self.state = TerminationState::from_status(status);
        for stream in [&mut self.stdout, &mut self.stderr].into_iter().flatten() {
            stream.join(PIPE_PATIENCE);
        }
        tracing::info!(pid = self.pid(), state = ?self.state, "process exited");
    }

    /// Captured stdout so far (complete once the process has exited).
    pub fn stdout_text(&self) -> String {
        self.stdout.as_ref().map(CapturedStream::text).unwrap_or_default()
    }

    pub fn stderr_text(&self) -> String {
        self.stderr.as_ref().map(CapturedStream::text).unwrap_or_default()
    }

    /// Watcher over this process's log file (`OutputMode::LogFile` only).
    pub fn log_watcher(&self) -> Result<LogWatcher, Error> {
        self.log_path.as_ref().map(LogWatcher::open).ok_or_else(|| {
            Error::new(ErrorKind::Usage)
                .with_message("process was not started with a log file")
                .with_hint("Spawn with OutputMode::LogFile to tail its output.")
        })
    }

    /// Wait for a checkpoint line; a timeout terminates this process before returning.
    pub fn wait_for_log(
        &mut self,
        pattern: &LogPattern,
        from: LogCursor,
        timeout: Duration,
    ) -> Result<LogMatch, Error> {
        let watcher = self.log_watcher()?;
        let result = watcher.wait_for_while(pattern, from, timeout, || {
            self.poll_exit().map(|state| state.is_running()).unwrap_or(false)
        });
        if let Err(err) = &result {
            if err.kind() == ErrorKind::LogPatternTimeout {
                self.terminate();
            }
        }
        result.map_err(|err| match self.state.exit_code() {
            Some(code) if err.kind() == ErrorKind::ExitedEarly => err.with_exit_code(code),
            _ => err,
        })
    }

    fn diagnostics(&self) -> Option<String> {
        if let Some(path) = &self.log_path {
            return log_tail(path, DIAGNOSTIC_LINES).map(|tail| format!("log tail:\n{tail}"));
        }
        let stderr = self.stderr_text();
        let lines: Vec<&str> = stderr.lines().collect();
        if lines.is_empty() {
            return None;
        }
        let start = lines.len().saturating_sub(DIAGNOSTIC_LINES);
        Some(format!("stderr tail:\n{}", lines[start..].join("\n")))
    }
}

impl Drop for ManagedProcess {
    fn drop(&mut self) {
        self.terminate();
    }
}

#[cfg(unix)]
fn signal_group(child: &mut Child, signal: libc::c_int) {
    let pgid = child.id() as libc::pid_t;
    // SAFETY: kill(2) with a negative pid only signals our own process group.
    let rc = unsafe { libc::kill(-pgid, signal) };
    if rc != 0 {
        let _ = child.kill();
    }
}

#[cfg(unix)]
fn send_terminate(child: &mut Child) {
    signal_group(child, libc::SIGTERM);
}

#[cfg(unix)]
fn send_kill(child: &mut Child) {
    signal_group(child, libc::SIGKILL);
}

#[cfg(not(unix))]
fn send_terminate(child: &mut Child) {
    let _ = child.kill();
}

#[cfg(not(unix))]
fn send_kill(child: &mut Child) {
    let _ = child.kill();
}

#[cfg(all(test, unix))]
mod tests {
    use super::{
        CAPTURE_LIMIT, ManagedProcess, OutputMode, ProbeStatus, ProcessPhase, ProcessSpec,
        TcpProbe, TerminationState,
    };
    use crate::core::error::{Error, ErrorKind};
    use crate::core::log_watch::LogPattern;
    use std::time::{Duration, Instant};

    fn sh(script: &str) -> ProcessSpec {
        ProcessSpec::new("/bin/sh").arg("-c").arg(script)
    }

    fn never_ready() -> impl FnMut() -> Result<ProbeStatus, Error> {
        || Ok(ProbeStatus::NotReady)
    }

    #[test]
    fn early_crash_fails_within_one_poll_interval() {
        let mut process = sh("sleep 0.05; echo 'fatal: bad config' >&2; exit 3")
            .spawn()
            .expect("spawn");
        let started = Instant::now();
        let err = process
            .await_ready(
                &mut never_ready(),
                Duration::from_secs(5),
                Duration::from_millis(100),
            )
            .expect_err("exited early");
        let elapsed = started.elapsed();

        assert_eq!(err.kind(), ErrorKind::ExitedEarly);
        assert_eq!(err.exit_code(), Some(3));
        assert!(err.detail().is_some_and(|d| d.contains("fatal: bad config")));
        assert!(elapsed < Duration::from_secs(1), "took {elapsed:?}");
        assert_eq!(process.phase(), ProcessPhase::ExitedEarly);
    }

    #[test]
    fn startup_timeout_kills_the_process() {
        let mut process = sh("sleep 30").spawn().expect("spawn");
        let started = Instant::now();
        let err = process
            .await_ready(
                &mut never_ready(),
                Duration::from_millis(200),
                Duration::from_millis(50),
            )
            .expect_err("timed out");
        assert_eq!(err.kind(), ErrorKind::StartupTimeout);
        // 200ms timeout + one 50ms poll + SIGTERM reaping.
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!process.state().is_running());
        assert_eq!(process.phase(), ProcessPhase::Terminated);
    }

    #[test]
    fn ready_as_soon_as_probe_succeeds() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let mut process = sh("sleep 30").spawn().expect("spawn");
        let started = Instant::now();
        process
            .await_ready(
                &mut TcpProbe::new(addr),
                Duration::from_secs(5),
                Duration::from_millis(100),
            )
            .expect("ready");
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(process.phase(), ProcessPhase::Ready);
    }

    #[test]
    fn terminate_twice_is_a_noop() {
        let mut process = sh("sleep 30").spawn().expect("spawn");
        let first = process.terminate();
        assert_eq!(first, TerminationState::Killed(libc::SIGTERM));
        let second = process.terminate();
        assert_eq!(second, first);
    }

    #[test]
    fn terminate_after_exit_keeps_exit_state() {
        let mut process = sh("exit 0").spawn().expect("spawn");
        let state = process.wait(Duration::from_secs(5)).expect("wait");
        assert_eq!(state, TerminationState::ExitedOk);
        assert_eq!(process.terminate(), TerminationState::ExitedOk);
    }

    #[test]
    fn stubborn_process_is_killed_after_grace() {
        let mut process = sh("trap '' TERM; sleep 30")
            .grace_period(Duration::from_millis(100))
            .spawn()
            .expect("spawn");
        std::thread::sleep(Duration::from_millis(50));
        let state = process.terminate();
        assert_eq!(state, TerminationState::Killed(libc::SIGKILL));
    }

    #[test]
    fn wait_times_out_and_terminates() {
        let mut process = sh("sleep 30").spawn().expect("spawn");
        let err = process
            .wait(Duration::from_millis(100))
            .expect_err("timeout");
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(!process.state().is_running());
    }

    #[test]
    fn large_output_does_not_block_the_child() {
        let mut process = sh("head -c 1048576 /dev/zero | tr '\\0' 'x'; echo done >&2")
            .spawn()
            .expect("spawn");
        let state = process.wait(Duration::from_secs(10)).expect("wait");
        assert_eq!(state, TerminationState::ExitedOk);
        assert_eq!(process.stdout_text().len(), 1048576);
        assert_eq!(process.stderr_text(), "done\n");
    }

    #[test]
    fn capture_keeps_only_the_tail_of_long_output() {
        let script = format!(
            "head -c {} /dev/zero | tr '\\0' 'x'; echo end",
            3 * CAPTURE_LIMIT
        );
        let mut process = sh(&script).spawn().expect("spawn");
        let state = process.wait(Duration::from_secs(20)).expect("wait");
        assert_eq!(state, TerminationState::ExitedOk);
        let stdout = process.stdout_text();
        assert_eq!(stdout.len(), CAPTURE_LIMIT);
        assert!(stdout.ends_with("xend\n"));
    }

    #[test]
    fn env_and_workdir_are_applied() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut process = sh("printf '%s %s' \"$GREETING\" \"$(basename \"$PWD\")\"")
            .env("GREETING", "hello")
            .workdir(dir.path())
            .spawn()
            .expect("spawn");
        process.wait(Duration::from_secs(5)).expect("wait");
        let name = dir
            .path()
            .file_name()
            .and_then(|n| n.to_str())
            .expect("name")
            .to_string();
        assert_eq!(process.stdout_text(), format!("hello {name}"));
    }

    #[test]
    fn log_checkpoint_after_mark() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = dir.path().join("server.log");
        let mut process = sh("echo 'boot: waiting'; sleep 0.2; echo 'boot: waiting'; sleep 30")
            .output(OutputMode::LogFile(log.clone()))
            .spawn()
            .expect("spawn");
        std::thread::sleep(Duration::from_millis(100));
        let watcher = process.log_watcher().expect("watcher");
        let mark = watcher.mark().expect("mark");
        assert!(mark.offset() > 0);

        let found = process
            .wait_for_log(&LogPattern::from("boot: waiting"), mark, Duration::from_secs(5))
            .expect("second checkpoint");
        assert!(found.cursor.offset() > mark.offset());

        let err = process
            .wait_for_log(&LogPattern::from("never"), found.cursor, Duration::from_millis(100))
            .expect_err("timeout");
        assert_eq!(err.kind(), ErrorKind::LogPatternTimeout);
        assert!(!process.state().is_running());
    }

    #[test]
    fn missing_binary_is_a_usage_error() {
        let err = ProcessSpec::new("/nonexistent/restmock-binary")
            .spawn()
            .expect_err("missing");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }
}
