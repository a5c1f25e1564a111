//! Purpose: Start a bridge process that relays a CLI's calls to the mock server.
//! Exports: `Bridge`, `BridgeConfig`, `default_handshake`.
//! Role: Session fixture; readiness is observed as the bridge consuming its startup handshake.
//! Invariants: The bridge is terminated when `Bridge` is dropped.
#![allow(clippy::result_large_err)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use super::client::ExpectationControl;
use super::invoker::CommandLayout;
use crate::core::address::ServerAddress;
use crate::core::error::{Error, ErrorKind};
use crate::core::expectation::{ExpectedRequest, expect};
use crate::core::process::{ManagedProcess, OutputMode, ProbeStatus, ProcessSpec};

/// Requests a freshly started bridge makes against the REST API before it accepts clients.
pub fn default_handshake() -> Vec<ExpectedRequest> {
    vec![
        expect("GET", "/column_family/").respond_json(json!([
            {"ks": "system_schema", "cf": "columns", "type": "ColumnFamilies"},
            {"ks": "system_schema", "cf": "computed_columns", "type": "ColumnFamilies"},
        ])),
        expect("GET", "/stream_manager/").respond_json(json!([])),
    ]
}

#[derive(Clone, Debug)]
pub struct BridgeConfig {
    pub program: PathBuf,
    pub workdir: Option<PathBuf>,
    pub handshake: Vec<ExpectedRequest>,
    pub startup_timeout: Duration,
    pub poll_interval: Duration,
    pub output: OutputMode,
}

impl BridgeConfig {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        let program = program.into();
        // Launcher scripts live in `<root>/scripts/` and expect to run from `<root>`.
        let workdir = program
            .parent()
            .and_then(|scripts| scripts.parent())
            .map(PathBuf::from);
        Self {
            program,
            workdir,
            handshake: default_handshake(),
            startup_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(100),
            output: OutputMode::Capture,
        }
    }

    pub fn with_handshake(mut self, handshake: Vec<ExpectedRequest>) -> Self {
        self.handshake = handshake;
        self
    }

    pub fn with_workdir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_output(mut self, output: OutputMode) -> Self {
        self.output = output;
        self
    }
}

#[derive(Debug)]
pub struct Bridge {
    process: ManagedProcess,
    address: ServerAddress,
}

impl Bridge {
    /// Seed the handshake, launch `program -a ip -p port -ja bridge_ip -jp bridge_port`,
    /// and wait until every handshake request has been served.
    pub fn start(
        config: BridgeConfig,
        expectations: Arc<dyn ExpectationControl>,
        mock: ServerAddress,
        address: ServerAddress,
    ) -> Result<Self, Error> {
        if address == mock {
            return Err(Error::new(ErrorKind::Usage)
                .with_message(format!("bridge and mock server both assigned {address}")));
        }
        expectations.set_expectations(config.handshake.clone())?;

        let args = [
            "-a".to_string(),
            mock.ip.to_string(),
            "-p".to_string(),
            mock.port.to_string(),
            "-ja".to_string(),
            address.ip.to_string(),
            "-jp".to_string(),
            address.port.to_string(),
        ];
        let mut spec = ProcessSpec::new(&config.program)
            .args(args)
            .output(config.output.clone());
        if let Some(workdir) = &config.workdir {
            spec = spec.workdir(workdir);
        }
        let mut process = match spec.spawn() {
            Ok(process) => process,
            Err(err) => {
                let _ = expectations.clear();
                return Err(err);
            }
        };

        let control = Arc::clone(&expectations);
        let mut handshake_drained = move || -> Result<ProbeStatus, Error> {
            if control.remaining()?.is_empty() {
                Ok(ProbeStatus::Ready)
            } else {
                Ok(ProbeStatus::NotReady)
            }
        };
        let ready = process.await_ready(
            &mut handshake_drained,
            config.startup_timeout,
            config.poll_interval,
        );
        if let Err(err) = ready {
            let leftovers = expectations.remaining().unwrap_or_default();
            let _ = expectations.clear();
            let err = if leftovers.is_empty() {
                err
            } else {
                err.with_hint(format!(
                    "{} handshake request(s) never arrived; is the bridge pointed at {mock}?",
                    leftovers.len()
                ))
            };
            return Err(err);
        }
        tracing::info!(address = %address, pid = process.pid(), "bridge ready");
        Ok(Self { process, address })
    }

    pub fn address(&self) -> ServerAddress {
        self.address
    }

    /// Layout for a CLI that should talk to this bridge.
    pub fn layout(&self) -> CommandLayout {
        CommandLayout::Bridged {
            bridge: self.address,
        }
    }

    pub fn process(&mut self) -> &mut ManagedProcess {
        &mut self.process
    }
}
