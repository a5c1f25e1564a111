//! Purpose: Library backing the `restmock` CLI and the integration-test harness.
//! Exports: `core` (matching, queue, processes, logs, errors) and `api` (server, clients, invoker).
//! Role: Tests link against `api`; `core` stays usable without a tokio runtime.
//! Invariants: Every owned resource (server, process, queue step) is released on drop.
pub mod api;
pub mod core;
