//! Purpose: The seam through which a harness drives an expectation queue.
//! Exports: `ExpectationControl`, `LocalExpectations`, `ExpectationGuard`, `StepOutcome`.
//! Role: One trait for in-process and remote queues; the guard scopes a queue to one step.
//! Invariants: The queue mutex is held only for a single synchronous queue operation.
//! Invariants: A guard clears its queue on every exit path, including panics.
#![allow(clippy::result_large_err)]

use std::sync::{Arc, Mutex, MutexGuard};

use crate::core::error::{Error, ErrorKind};
use crate::core::expectation::{CannedResponse, ExpectedRequest, Mismatch, ReceivedRequest};
use crate::core::queue::{ExpectationQueue, describe_all};

pub type ApiResult<T> = Result<T, Error>;

pub trait ExpectationControl: Send + Sync {
    /// Replace the queue; fails with `PendingExpectations` while unsatisfied entries remain.
    fn set_expectations(&self, expected: Vec<ExpectedRequest>) -> ApiResult<()>;

    /// Unsatisfied entries, in queue order.
    fn remaining(&self) -> ApiResult<Vec<ExpectedRequest>>;

    fn mismatches(&self) -> ApiResult<Vec<Mismatch>>;

    fn clear(&self) -> ApiResult<()>;
}

/// Shared in-process queue. Clones share state with the server that answers from it.
#[derive(Clone, Debug, Default)]
pub struct LocalExpectations {
    queue: Arc<Mutex<ExpectationQueue>>,
}

impl LocalExpectations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Match one inbound request; the whole match-consume step is one critical section.
    pub fn handle(&self, request: ReceivedRequest) -> Result<CannedResponse, Mismatch> {
        self.lock().handle(request)
    }

    pub fn served(&self) -> u64 {
        self.lock().served()
    }

    fn lock(&self) -> MutexGuard<'_, ExpectationQueue> {
        // A panic elsewhere cannot leave the queue half-updated; keep serving.
        self.queue
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }
}

impl ExpectationControl for LocalExpectations {
    fn set_expectations(&self, expected: Vec<ExpectedRequest>) -> ApiResult<()> {
        self.lock().set(expected)
    }

    fn remaining(&self) -> ApiResult<Vec<ExpectedRequest>> {
        Ok(self.lock().remaining())
    }

    fn mismatches(&self) -> ApiResult<Vec<Mismatch>> {
        Ok(self.lock().mismatches())
    }

    fn clear(&self) -> ApiResult<()> {
        self.lock().clear();
        Ok(())
    }
}

/// What was left over when a step finished.
#[derive(Clone, Debug, Default)]
pub struct StepOutcome {
    pub remaining: Vec<ExpectedRequest>,
    pub mismatches: Vec<Mismatch>,
}

impl StepOutcome {
    pub fn is_clean(&self) -> bool {
        self.remaining.is_empty() && self.mismatches.is_empty()
    }

    /// `UnconsumedExpectations` when entries are left, else `ExpectationMismatch` when
    /// unexpected requests were rejected along the way.
    pub fn ensure_drained(&self) -> ApiResult<()> {
        if self.is_clean() {
            return Ok(());
        }
        let mut detail = Vec::new();
        if !self.remaining.is_empty() {
            detail.push(format!("unconsumed:\n{}", describe_all(&self.remaining)));
        }
        if !self.mismatches.is_empty() {
            let rejected = self
                .mismatches
                .iter()
                .map(|mismatch| format!("  - {mismatch}"))
                .collect::<Vec<_>>()
                .join("\n");
            detail.push(format!("rejected requests:\n{rejected}"));
        }
        let err = if self.remaining.is_empty() {
            Error::new(ErrorKind::ExpectationMismatch).with_message(format!(
                "{} unexpected request(s) were rejected",
                self.mismatches.len()
            ))
        } else {
            Error::new(ErrorKind::UnconsumedExpectations).with_message(format!(
                "{} expected request(s) were never received",
                self.remaining.len()
            ))
        };
        Err(err.with_detail(detail.join("\n")))
    }
}

/// Scopes a queue to one step: `finish` snapshots and clears; dropping clears regardless.
pub struct ExpectationGuard<'a> {
    control: &'a dyn ExpectationControl,
    finished: bool,
}

impl<'a> ExpectationGuard<'a> {
    pub fn set(
        control: &'a dyn ExpectationControl,
        expected: Vec<ExpectedRequest>,
    ) -> ApiResult<Self> {
        control.set_expectations(expected)?;
        Ok(Self::adopt(control))
    }

    /// Take ownership of whatever is already queued.
    pub fn adopt(control: &'a dyn ExpectationControl) -> Self {
        Self {
            control,
            finished: false,
        }
    }

    pub fn finish(mut self) -> ApiResult<StepOutcome> {
        self.finished = true;
        let snapshot = self
            .control
            .remaining()
            .and_then(|remaining| Ok((remaining, self.control.mismatches()?)));
        // Clear even when the snapshot failed, so the next step starts empty.
        let cleared = self.control.clear();
        let (remaining, mismatches) = snapshot?;
        cleared?;
        Ok(StepOutcome {
            remaining,
            mismatches,
        })
    }
}

impl Drop for ExpectationGuard<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(err) = self.control.clear() {
            tracing::warn!(error = %err, "failed to clear expectations");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ExpectationControl, ExpectationGuard, LocalExpectations, StepOutcome};
    use crate::core::error::ErrorKind;
    use crate::core::expectation::{ReceivedRequest, expect};

    #[test]
    fn guard_clears_on_drop() {
        let local = LocalExpectations::new();
        {
            let _guard = ExpectationGuard::set(&local, vec![expect("GET", "/a")]).expect("set");
            assert_eq!(local.remaining().expect("remaining").len(), 1);
        }
        assert!(local.remaining().expect("remaining").is_empty());
        local
            .set_expectations(vec![expect("GET", "/b")])
            .expect("next step");
    }

    #[test]
    fn finish_reports_leftovers_then_clears() {
        let local = LocalExpectations::new();
        let guard = ExpectationGuard::set(
            &local,
            vec![expect("GET", "/storage_service/host_id")],
        )
        .expect("set");
        let _ = local.handle(ReceivedRequest::new("GET", "/wrong"));

        let outcome = guard.finish().expect("finish");
        assert_eq!(outcome.remaining.len(), 1);
        assert_eq!(outcome.mismatches.len(), 1);
        let err = outcome.ensure_drained().expect_err("dirty");
        assert_eq!(err.kind(), ErrorKind::UnconsumedExpectations);
        let detail = err.detail().expect("detail");
        assert!(detail.contains("GET /storage_service/host_id"));
        assert!(detail.contains("received: GET /wrong"));

        assert!(local.remaining().expect("remaining").is_empty());
        assert!(local.mismatches().expect("mismatches").is_empty());
    }

    #[test]
    fn mismatch_only_outcome_is_a_mismatch_error() {
        let local = LocalExpectations::new();
        let _ = local.handle(ReceivedRequest::new("POST", "/stray"));
        let outcome = StepOutcome {
            remaining: Vec::new(),
            mismatches: local.mismatches().expect("mismatches"),
        };
        let err = outcome.ensure_drained().expect_err("mismatch");
        assert_eq!(err.kind(), ErrorKind::ExpectationMismatch);
    }

    #[test]
    fn clones_share_one_queue() {
        let local = LocalExpectations::new();
        let server_side = local.clone();
        local
            .set_expectations(vec![expect("GET", "/a")])
            .expect("set");
        server_side
            .handle(ReceivedRequest::new("GET", "/a"))
            .expect("served");
        assert!(local.remaining().expect("remaining").is_empty());
        assert_eq!(local.served(), 1);
    }
}
