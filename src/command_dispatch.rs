//! Purpose: Hold top-level CLI command dispatch for `restmock`.
//! Exports: `dispatch_command`.
//! Role: Keep `main.rs` focused on parse/bootstrap and delegate command execution.
//! Invariants: Only `serve` blocks the main thread on a runtime.
//! Invariants: `run` hosts its mock on a private runtime.

use std::sync::Arc;

use restmock::api::{
    Backend, Bridge, BridgeConfig, ExpectationControl, Invoker, LocalExpectations, MockServer,
    RemoteExpectations,
};

use super::*;

pub(super) fn dispatch_command(command: Command) -> Result<RunOutcome, Error> {
    match command {
        Command::Completion { shell } => {
            let mut cmd = Cli::command();
            clap_complete::aot::generate(shell, &mut cmd, "restmock", &mut io::stdout());
            Ok(RunOutcome::ok())
        }
        Command::Version => {
            emit_version_output();
            Ok(RunOutcome::ok())
        }
        Command::Serve { bind, expect } => {
            let expectations = match expect {
                Some(path) => read_expectations(&path)?,
                None => Vec::new(),
            };
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .map_err(|err| {
                    Error::new(ErrorKind::Internal)
                        .with_message("failed to start runtime")
                        .with_source(err)
                })?;
            runtime.block_on(serve::serve(serve::ServeConfig { bind, expectations }))?;
            Ok(RunOutcome::ok())
        }
        Command::Expect { command } => match command {
            ExpectCommand::Set { file, url } => {
                let expected = read_expectations(&file)?;
                let count = expected.len();
                RemoteExpectations::new(url)?.set_expectations(expected)?;
                emit_json(json!({ "ok": true, "queued": count }));
                Ok(RunOutcome::ok())
            }
            ExpectCommand::Get { url } => {
                let remaining = RemoteExpectations::new(url)?.remaining()?;
                emit_json(to_json(&remaining)?);
                Ok(RunOutcome::ok())
            }
            ExpectCommand::Clear { url } => {
                RemoteExpectations::new(url)?.clear()?;
                emit_json(json!({ "ok": true }));
                Ok(RunOutcome::ok())
            }
            ExpectCommand::Mismatches { url } => {
                let mismatches = RemoteExpectations::new(url)?.mismatches()?;
                emit_json(to_json(&mismatches)?);
                Ok(RunOutcome::ok())
            }
        },
        Command::Request {
            method,
            path,
            data,
            url,
        } => {
            let body = data
                .map(|raw| {
                    serde_json::from_str::<Value>(&raw).map_err(|err| {
                        Error::new(ErrorKind::Usage)
                            .with_message(format!("--data is not valid JSON: {err}"))
                    })
                })
                .transpose()?;
            let reply = RemoteExpectations::new(url)?.send(&method, &path, body.as_ref())?;
            if !reply.body.is_null() {
                emit_json(reply.body);
            }
            if (200..300).contains(&reply.status) {
                Ok(RunOutcome::ok())
            } else {
                Ok(RunOutcome::with_code(to_exit_code(ErrorKind::CommandFailed)))
            }
        }
        Command::Run {
            harness,
            expect,
            method,
            args,
        } => {
            serve::init_tracing();
            let expected = expect.as_deref().map(read_expectations).transpose()?;
            let mut allocator = harness.address_allocator()?;
            let server = MockServer::start(allocator.allocate()?)?;
            let control: Arc<dyn ExpectationControl> =
                Arc::new(LocalExpectations::clone(server.expectations()));

            // Bridge first: it consumes its own handshake before the step's queue is set.
            let bridge = match harness.backend {
                Backend::Native => None,
                Backend::Bridged => {
                    let address = allocator.allocate_on(std::net::Ipv4Addr::LOCALHOST.into())?;
                    let config = BridgeConfig::new(harness.bridge_path())
                        .with_startup_timeout(harness.startup_timeout())
                        .with_poll_interval(harness.poll_interval());
                    Some(Bridge::start(
                        config,
                        Arc::clone(&control),
                        server.address(),
                        address,
                    )?)
                }
            };
            let layout = match &bridge {
                Some(bridge) => bridge.layout(),
                None => harness.direct_layout(),
            };

            let invoker = Invoker::new(harness.binary_path(), server.address(), control)
                .with_layout(layout)
                .with_timeout(harness.command_timeout());
            let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
            invoker.run(&method, &arg_refs, expected)?;
            Ok(RunOutcome::ok())
        }
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<Value, Error> {
    serde_json::to_value(value).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("failed to encode output")
            .with_source(err)
    })
}
