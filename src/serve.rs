//! Purpose: `restmock serve`: run the mock router as a standalone process.
//! Exports: `ServeConfig`, `serve`.
//! Role: Out-of-process mock for suites that spawn it and drive it over the admin channel.
//! Invariants: The bound address is printed on stdout before the first request is accepted.
//! Invariants: SIGTERM or ctrl-c drains in-flight requests, bounded by a shutdown timeout.
use std::future::Future;
use std::io::IsTerminal;
use std::net::SocketAddr;
use std::time::Duration;

use serde_json::json;
use tracing_subscriber::EnvFilter;

use restmock::api::server::serve_on;
use restmock::api::{Error, ErrorKind, ExpectationControl, ExpectedRequest, LocalExpectations};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

pub struct ServeConfig {
    pub bind: SocketAddr,
    pub expectations: Vec<ExpectedRequest>,
}

pub async fn serve(config: ServeConfig) -> Result<(), Error> {
    init_tracing();

    let expectations = LocalExpectations::new();
    if !config.expectations.is_empty() {
        expectations.set_expectations(config.expectations)?;
    }

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message(format!("failed to bind mock server on {}", config.bind))
                .with_source(err)
        })?;
    let bound = listener.local_addr().map_err(|err| {
        Error::new(ErrorKind::Io)
            .with_message("failed to read bound address")
            .with_source(err)
    })?;
    super::emit_json(json!({ "listening": format!("http://{bound}") }));
    tracing::info!(address = %bound, "mock server listening");

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server = serve_on(listener, expectations.clone(), async {
        let _ = shutdown_rx.await;
    });
    run_until_signal(server, shutdown_tx, shutdown_signal()).await?;

    let leftover = expectations.remaining()?;
    if !leftover.is_empty() {
        tracing::warn!(count = leftover.len(), "stopped with unconsumed expectations");
    }
    tracing::info!(served = expectations.served(), "mock server stopped");
    Ok(())
}

async fn run_until_signal(
    server: impl Future<Output = Result<(), Error>>,
    shutdown_tx: tokio::sync::oneshot::Sender<()>,
    signal: impl Future<Output = ()>,
) -> Result<(), Error> {
    tokio::pin!(server);
    tokio::select! {
        result = &mut server => result,
        _ = signal => {
            let _ = shutdown_tx.send(());
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut server).await {
                Ok(result) => result,
                Err(_) => {
                    Err(Error::new(ErrorKind::Timeout).with_message("server shutdown timed out"))
                }
            }
        }
    }
}

pub(super) fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_ansi(std::io::stderr().is_terminal())
        .with_writer(std::io::stderr)
        .try_init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "cannot install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(unix)]
    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    #[cfg(not(unix))]
    ctrl_c.await;
}
