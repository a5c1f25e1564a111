// Core modules: expectation matching, address allocation, process supervision, log tailing.
pub mod address;
pub mod error;
pub mod expectation;
pub mod log_watch;
pub mod process;
pub mod queue;
