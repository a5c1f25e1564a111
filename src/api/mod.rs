//! Purpose: Public surface of the harness: mock server, queue control, invoker, fixtures.
//! Exports: Re-exports of the core data model plus the HTTP and process composition layers.
//! Role: What tests and the `restmock` CLI import; `core` stays free of tokio and HTTP.
//! Invariants: Every fixture here releases its process, server, or queue on drop.

pub mod bridge;
pub mod client;
pub mod config;
pub mod invoker;
pub mod remote;
pub mod server;

#[doc(hidden)]
pub use crate::core::error::to_exit_code;
pub use crate::core::address::{
    AddressAllocator, NAMESPACE_ADDRESS, ServerAddress, prepare_namespace,
};
pub use crate::core::error::{Error, ErrorKind};
pub use crate::core::expectation::{
    BodyMatcher, CannedResponse, ExpectedRequest, Mismatch, Multiplicity, ReceivedRequest, expect,
};
pub use crate::core::log_watch::{LogCursor, LogMatch, LogPattern, LogWatcher};
pub use crate::core::process::{
    HttpProbe, ManagedProcess, OutputMode, ProbeStatus, ProcessPhase, ProcessSpec,
    ReadinessProbe, TcpProbe, TerminationState,
};
pub use bridge::{Bridge, BridgeConfig, default_handshake};
pub use client::{ExpectationControl, ExpectationGuard, LocalExpectations, StepOutcome};
pub use config::{Backend, BuildMode, HarnessArgs, HarnessConfig};
pub use invoker::{CommandLayout, Invocation, Invoker};
pub use remote::{MockReply, RemoteExpectations};
pub use server::MockServer;
