//! Purpose: Run one step of a scenario: seed the queue, run the command, verify the outcome.
//! Exports: `Invoker`, `CommandLayout`, `Invocation`.
//! Role: The composition point for tests; owns no long-lived state beyond its settings.
//! Invariants: The queue is snapshotted and cleared after every run, pass or fail.
//! Invariants: A failing exit status is reported before leftover expectations.
#![allow(clippy::result_large_err)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use super::client::{ExpectationControl, ExpectationGuard, StepOutcome};
use crate::core::address::ServerAddress;
use crate::core::error::{Error, ErrorKind};
use crate::core::expectation::ExpectedRequest;
use crate::core::process::{ProcessSpec, TerminationState};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
const STDERR_TAIL_LINES: usize = 20;

/// How the command under test is told where to send its requests.
#[derive(Clone, Debug)]
pub enum CommandLayout {
    /// `binary prefix.. method extra.. -h <mock ip> -p <mock port> args..`
    Direct {
        prefix: Vec<String>,
        extra: Vec<String>,
    },
    /// `binary -h <bridge ip> -p <bridge port> method args..`; the bridge talks to the mock.
    Bridged { bridge: ServerAddress },
}

impl Default for CommandLayout {
    fn default() -> Self {
        CommandLayout::Direct {
            prefix: Vec::new(),
            extra: Vec::new(),
        }
    }
}

/// Everything one run produced, kept for callers that assert on failures.
#[derive(Clone, Debug)]
pub struct Invocation {
    pub argv: Vec<String>,
    pub state: TerminationState,
    pub stdout: String,
    pub stderr: String,
    pub outcome: StepOutcome,
}

impl Invocation {
    /// Exit status first, then anything left in (or rejected by) the queue.
    pub fn check(&self) -> Result<(), Error> {
        if self.state != TerminationState::ExitedOk {
            let mut err = Error::new(ErrorKind::CommandFailed).with_message(format!(
                "`{}` failed ({:?})",
                self.argv.join(" "),
                self.state
            ));
            if let Some(code) = self.state.exit_code() {
                err = err.with_exit_code(code);
            }
            let mut detail = stderr_tail(&self.stderr);
            if !self.outcome.is_clean() {
                detail.push_str(&format!(
                    "\n({} expectation(s) left, {} request(s) rejected)",
                    self.outcome.remaining.len(),
                    self.outcome.mismatches.len()
                ));
            }
            return Err(err.with_detail(detail));
        }
        self.outcome.ensure_drained()
    }
}

#[derive(Clone)]
pub struct Invoker {
    binary: PathBuf,
    layout: CommandLayout,
    mock: ServerAddress,
    control: Arc<dyn ExpectationControl>,
    host_flag: String,
    port_flag: String,
    timeout: Duration,
    env: Vec<(String, String)>,
    workdir: Option<PathBuf>,
    echo: bool,
}

impl std::fmt::Debug for Invoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Invoker")
            .field("binary", &self.binary)
            .field("layout", &self.layout)
            .field("mock", &self.mock)
            .field("workdir", &self.workdir)
            .finish()
    }
}

impl Invoker {
    pub fn new(
        binary: impl Into<PathBuf>,
        mock: ServerAddress,
        control: Arc<dyn ExpectationControl>,
    ) -> Self {
        Self {
            binary: binary.into(),
            layout: CommandLayout::default(),
            mock,
            control,
            host_flag: "-h".to_string(),
            port_flag: "-p".to_string(),
            timeout: DEFAULT_TIMEOUT,
            env: Vec::new(),
            workdir: None,
            echo: true,
        }
    }

    pub fn with_layout(mut self, layout: CommandLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn with_flags(
        mut self,
        host_flag: impl Into<String>,
        port_flag: impl Into<String>,
    ) -> Self {
        self.host_flag = host_flag.into();
        self.port_flag = port_flag.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Directory the command under test runs in; inherits ours when unset.
    pub fn with_workdir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }

    /// Echo captured output to this process's stdout/stderr (on by default).
    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    pub fn control(&self) -> &dyn ExpectationControl {
        self.control.as_ref()
    }

    pub fn argv(&self, method: &str, args: &[&str]) -> Vec<String> {
        let mut argv = vec![self.binary.to_string_lossy().into_owned()];
        match &self.layout {
            CommandLayout::Direct { prefix, extra } => {
                argv.extend(prefix.iter().cloned());
                argv.push(method.to_string());
                argv.extend(extra.iter().cloned());
                argv.extend(self.target_flags(self.mock));
            }
            CommandLayout::Bridged { bridge } => {
                argv.extend(self.target_flags(*bridge));
                argv.push(method.to_string());
            }
        }
        argv.extend(args.iter().map(|arg| arg.to_string()));
        argv
    }

    fn target_flags(&self, address: ServerAddress) -> [String; 4] {
        [
            self.host_flag.clone(),
            address.ip.to_string(),
            self.port_flag.clone(),
            address.port.to_string(),
        ]
    }

    /// Run `method args..`, optionally replacing the queue first, and return its stdout.
    pub fn run(
        &self,
        method: &str,
        args: &[&str],
        expected: Option<Vec<ExpectedRequest>>,
    ) -> Result<String, Error> {
        let invocation = self.invoke(method, args, expected)?;
        invocation.check()?;
        Ok(invocation.stdout)
    }

    /// Like `run`, but hands back the raw result without judging it.
    pub fn invoke(
        &self,
        method: &str,
        args: &[&str],
        expected: Option<Vec<ExpectedRequest>>,
    ) -> Result<Invocation, Error> {
        let guard = match expected {
            Some(expected) => ExpectationGuard::set(self.control.as_ref(), expected)?,
            None => ExpectationGuard::adopt(self.control.as_ref()),
        };

        let argv = self.argv(method, args);
        let mut spec = ProcessSpec::new(&argv[0]).args(&argv[1..]);
        for (key, value) in &self.env {
            spec = spec.env(key, value);
        }
        if let Some(dir) = &self.workdir {
            spec = spec.workdir(dir);
        }
        tracing::info!(argv = ?argv, "invoking command under test");
        let mut process = spec.spawn()?;
        let waited = process.wait(self.timeout);
        let stdout = process.stdout_text();
        let stderr = process.stderr_text();
        if self.echo {
            print!("{stdout}");
            eprint!("{stderr}");
        }
        let state = match waited {
            Ok(state) => state,
            Err(err) => return Err(err.with_detail(stderr_tail(&stderr))),
        };
        let outcome = guard.finish()?;
        Ok(Invocation {
            argv,
            state,
            stdout,
            stderr,
            outcome,
        })
    }
}

fn stderr_tail(stderr: &str) -> String {
    let lines: Vec<&str> = stderr.lines().collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    if lines.is_empty() {
        return "stderr: <empty>".to_string();
    }
    format!("stderr tail:\n{}", lines[start..].join("\n"))
}

#[cfg(test)]
mod tests {
    use super::{CommandLayout, Invocation, Invoker};
    use crate::api::client::{ExpectationControl, LocalExpectations, StepOutcome};
    use crate::core::address::ServerAddress;
    use crate::core::error::ErrorKind;
    use crate::core::expectation::expect;
    use crate::core::process::TerminationState;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Arc;

    fn mock() -> ServerAddress {
        ServerAddress::new(IpAddr::V4(Ipv4Addr::new(127, 3, 4, 5)), 23456)
    }

    #[test]
    fn direct_layout_injects_mock_address() {
        let invoker = Invoker::new("/opt/scylla", mock(), Arc::new(LocalExpectations::new()))
            .with_layout(CommandLayout::Direct {
                prefix: vec!["nodetool".to_string()],
                extra: vec![
                    "--logger-log-level".to_string(),
                    "scylla-nodetool=trace".to_string(),
                ],
            });
        assert_eq!(
            invoker.argv("compact", &["ks1"]),
            vec![
                "/opt/scylla",
                "nodetool",
                "compact",
                "--logger-log-level",
                "scylla-nodetool=trace",
                "-h",
                "127.3.4.5",
                "-p",
                "23456",
                "ks1",
            ]
        );
    }

    #[test]
    fn bridged_layout_targets_the_bridge() {
        let bridge = ServerAddress::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 17199);
        let invoker = Invoker::new("/opt/nodetool", mock(), Arc::new(LocalExpectations::new()))
            .with_layout(CommandLayout::Bridged { bridge })
            .with_flags("--host", "--port");
        assert_eq!(
            invoker.argv("status", &[]),
            vec!["/opt/nodetool", "--host", "127.0.0.1", "--port", "17199", "status"]
        );
    }

    #[test]
    fn exit_status_is_reported_before_leftovers() {
        let invocation = Invocation {
            argv: vec!["tool".to_string()],
            state: TerminationState::ExitedError(2),
            stdout: String::new(),
            stderr: "error: connection refused\n".to_string(),
            outcome: StepOutcome {
                remaining: vec![expect("GET", "/a")],
                mismatches: Vec::new(),
            },
        };
        let err = invocation.check().expect_err("failed");
        assert_eq!(err.kind(), ErrorKind::CommandFailed);
        assert_eq!(err.exit_code(), Some(2));
        let detail = err.detail().expect("detail");
        assert!(detail.contains("connection refused"));
        assert!(detail.contains("1 expectation(s) left"));
    }

    #[cfg(unix)]
    #[test]
    fn idle_command_leaves_expectation_unconsumed() {
        let local = LocalExpectations::new();
        let invoker = Invoker::new("/bin/sh", mock(), Arc::new(local.clone()))
            .with_layout(CommandLayout::Direct {
                prefix: vec!["-c".to_string(), "exit 0".to_string()],
                extra: Vec::new(),
            })
            .with_echo(false);
        let err = invoker
            .run("noop", &[], Some(vec![expect("GET", "/storage_service/host_id")]))
            .expect_err("unconsumed");
        assert_eq!(err.kind(), ErrorKind::UnconsumedExpectations);
        assert!(local.remaining().expect("remaining").is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn queue_is_cleared_even_when_the_command_fails() {
        let local = LocalExpectations::new();
        let invoker = Invoker::new("/bin/sh", mock(), Arc::new(local.clone()))
            .with_layout(CommandLayout::Direct {
                prefix: vec!["-c".to_string(), "echo boom >&2; exit 4".to_string()],
                extra: Vec::new(),
            })
            .with_echo(false);
        let invocation = invoker
            .invoke("noop", &[], Some(vec![expect("GET", "/a")]))
            .expect("invoked");
        assert_eq!(invocation.state, TerminationState::ExitedError(4));
        assert_eq!(invocation.stderr, "boom\n");
        assert_eq!(invocation.outcome.remaining.len(), 1);
        assert!(local.remaining().expect("remaining").is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn command_runs_in_the_configured_workdir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let invoker = Invoker::new("/bin/sh", mock(), Arc::new(LocalExpectations::new()))
            .with_layout(CommandLayout::Direct {
                prefix: vec!["-c".to_string(), "pwd".to_string()],
                extra: Vec::new(),
            })
            .with_workdir(dir.path())
            .with_echo(false);
        let stdout = invoker.run("noop", &[], Some(Vec::new())).expect("run");
        assert_eq!(
            std::path::Path::new(stdout.trim()).canonicalize().expect("canonical"),
            dir.path().canonicalize().expect("canonical")
        );
    }
}
