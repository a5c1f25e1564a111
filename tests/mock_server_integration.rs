//! Purpose: Drive `restmock serve` as a separate process over HTTP and through the CLI.
//! Role: Covers the admin channel, mismatch reporting, and graceful shutdown end to end.
#![cfg(unix)]

use std::path::Path;
use std::process::Command;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use restmock::api::{
    AddressAllocator, ErrorKind, ExpectationControl, HttpProbe, ManagedProcess, ProcessSpec,
    RemoteExpectations, ServerAddress, TerminationState, expect, to_exit_code,
};
use serde_json::{Value, json};

type TestResult<T> = Result<T, Box<dyn std::error::Error>>;

static SERVER_LOCK: Mutex<()> = Mutex::new(());

struct TestServer {
    process: ManagedProcess,
    address: ServerAddress,
    remote: RemoteExpectations,
}

impl TestServer {
    fn start() -> TestResult<Self> {
        let mut allocator = AddressAllocator::new();
        let mut last_err = None;
        for _ in 0..3 {
            let address = allocator.allocate()?;
            match Self::start_on(address) {
                Ok(server) => return Ok(server),
                Err(err) => last_err = Some(err),
            }
        }
        Err(last_err.unwrap_or_else(|| "server did not start".into()))
    }

    fn start_on(address: ServerAddress) -> TestResult<Self> {
        let mut process = ProcessSpec::new(env!("CARGO_BIN_EXE_restmock"))
            .args(["serve", "--bind", &address.socket_addr().to_string()])
            .env("RUST_LOG", "warn")
            .spawn()?;
        let mut probe = HttpProbe::new(format!("{}/__healthz__", address.base_url()));
        process.await_ready(&mut probe, Duration::from_secs(5), Duration::from_millis(25))?;
        let remote = RemoteExpectations::for_address(address)?;
        Ok(Self {
            process,
            address,
            remote,
        })
    }

    fn url(&self) -> String {
        self.address.base_url()
    }
}

fn cli(server: &TestServer, args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_restmock"))
        .args(args)
        .env("RESTMOCK_URL", server.url())
        .output()
        .expect("run restmock")
}

fn parse_json(output: &[u8]) -> Value {
    let text = String::from_utf8_lossy(output);
    let line = text.lines().next().expect("json line");
    serde_json::from_str(line).expect("valid json")
}

fn write_expectations(dir: &Path, value: &Value) -> TestResult<std::path::PathBuf> {
    let path = dir.join("expected.json");
    std::fs::write(&path, serde_json::to_vec(value)?)?;
    Ok(path)
}

#[test]
fn cli_admin_round_trip() -> TestResult<()> {
    let _lock = SERVER_LOCK.lock().unwrap_or_else(|err| err.into_inner());
    let server = TestServer::start()?;
    let temp = tempfile::tempdir()?;
    let file = write_expectations(
        temp.path(),
        &json!([
            {
                "method": "GET",
                "path": "/column_family/",
                "response": [{"ks": "system", "cf": "local"}]
            },
            {"method": "GET", "path": "/stream_manager/", "response": []}
        ]),
    )?;

    let set = cli(&server, &["expect", "set", file.to_str().unwrap()]);
    assert!(set.status.success(), "{}", String::from_utf8_lossy(&set.stderr));
    assert_eq!(parse_json(&set.stdout), json!({"ok": true, "queued": 2}));

    let pending = cli(&server, &["expect", "get"]);
    assert!(pending.status.success());
    let pending = parse_json(&pending.stdout);
    assert_eq!(pending.as_array().map(Vec::len), Some(2));
    assert_eq!(pending[0]["path"], "/column_family/");

    let first = cli(&server, &["request", "GET", "/column_family/"]);
    assert!(first.status.success());
    assert_eq!(parse_json(&first.stdout)[0]["cf"], "local");

    let second = cli(&server, &["request", "get", "/stream_manager/"]);
    assert!(second.status.success());
    assert_eq!(parse_json(&second.stdout), json!([]));

    let drained = cli(&server, &["expect", "get"]);
    assert_eq!(parse_json(&drained.stdout), json!([]));
    assert!(server.remote.mismatches()?.is_empty());
    Ok(())
}

#[test]
fn out_of_order_request_is_rejected_and_recorded() -> TestResult<()> {
    let _lock = SERVER_LOCK.lock().unwrap_or_else(|err| err.into_inner());
    let server = TestServer::start()?;
    server.remote.set_expectations(vec![
        expect("GET", "/column_family/"),
        expect("GET", "/stream_manager/"),
    ])?;

    let output = cli(&server, &["request", "GET", "/stream_manager/"]);
    assert_eq!(
        output.status.code(),
        Some(to_exit_code(ErrorKind::ExpectationMismatch))
    );
    let err = parse_json(&output.stderr);
    assert_eq!(err["error"]["kind"], "ExpectationMismatch");
    let detail = err["error"]["detail"].as_str().unwrap_or_default();
    assert!(detail.contains("/column_family/"), "detail: {detail}");
    assert!(detail.contains("/stream_manager/"), "detail: {detail}");

    // The head stays in place after a rejected request.
    assert_eq!(server.remote.remaining()?.len(), 2);
    let recorded = cli(&server, &["expect", "mismatches"]);
    let recorded = parse_json(&recorded.stdout);
    assert_eq!(recorded.as_array().map(Vec::len), Some(1));

    server.remote.clear()?;
    assert!(server.remote.remaining()?.is_empty());
    assert!(server.remote.mismatches()?.is_empty());
    Ok(())
}

#[test]
fn pending_queue_refuses_replacement() -> TestResult<()> {
    let _lock = SERVER_LOCK.lock().unwrap_or_else(|err| err.into_inner());
    let server = TestServer::start()?;
    server
        .remote
        .set_expectations(vec![expect("GET", "/storage_service/host_id")])?;

    let err = server
        .remote
        .set_expectations(vec![expect("GET", "/column_family/")])
        .expect_err("queue still pending");
    assert_eq!(err.kind(), ErrorKind::PendingExpectations);

    let temp = tempfile::tempdir()?;
    let file = write_expectations(temp.path(), &json!([{"method": "GET", "path": "/x"}]))?;
    let output = cli(&server, &["expect", "set", file.to_str().unwrap()]);
    assert_eq!(
        output.status.code(),
        Some(to_exit_code(ErrorKind::PendingExpectations))
    );
    assert_eq!(server.remote.remaining()?[0].path, "/storage_service/host_id");
    Ok(())
}

#[test]
fn canned_error_status_fails_request_command() -> TestResult<()> {
    let _lock = SERVER_LOCK.lock().unwrap_or_else(|err| err.into_inner());
    let server = TestServer::start()?;
    server.remote.set_expectations(vec![
        expect("POST", "/storage_service/keyspace_compaction/ks")
            .with_param("cf", "t1")
            .respond_status(503)
            .respond_json(json!({"message": "busy"})),
    ])?;

    let output = cli(
        &server,
        &[
            "request",
            "POST",
            "/storage_service/keyspace_compaction/ks?cf=t1",
        ],
    );
    assert_eq!(
        output.status.code(),
        Some(to_exit_code(ErrorKind::CommandFailed))
    );
    assert_eq!(parse_json(&output.stdout)["message"], "busy");
    assert!(server.remote.remaining()?.is_empty());
    Ok(())
}

#[test]
fn sigterm_stops_server_cleanly() -> TestResult<()> {
    let _lock = SERVER_LOCK.lock().unwrap_or_else(|err| err.into_inner());
    let mut server = TestServer::start()?;
    assert!(server.remote.is_healthy());

    assert_eq!(server.process.terminate(), TerminationState::ExitedOk);
    assert!(!server.remote.is_healthy());
    Ok(())
}

#[test]
fn port_zero_reports_bound_address() -> TestResult<()> {
    let mut process = ProcessSpec::new(env!("CARGO_BIN_EXE_restmock"))
        .args(["serve", "--bind", "127.0.0.1:0"])
        .env("RUST_LOG", "warn")
        .spawn()?;
    let mut announced = None;
    let deadline = Instant::now() + Duration::from_secs(5);
    while announced.is_none() && Instant::now() < deadline {
        announced = process
            .stdout_text()
            .lines()
            .next()
            .and_then(|line| serde_json::from_str::<Value>(line).ok());
        std::thread::sleep(Duration::from_millis(25));
    }
    let announced = announced.ok_or("server never announced its address")?;
    let url = announced["listening"].as_str().ok_or("missing listening")?;
    assert!(url.starts_with("http://127.0.0.1:"));
    assert!(!url.ends_with(":0"));
    assert!(RemoteExpectations::new(url)?.is_healthy());

    process.terminate();
    Ok(())
}

