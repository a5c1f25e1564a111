//! Purpose: The ordered expectation queue served by the mock control-plane.
//! Exports: `ExpectationQueue`.
//! Role: Single-owner state; callers wrap it in a mutex so `handle` is one critical section.
//! Invariants: Requests are matched strictly in enqueue order.
//! Invariants: A rejected request never mutates the queue (idempotent rejection).
//! Invariants: Only satisfied repeatable entries may be skipped, and only by a later match.
use std::collections::VecDeque;

use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::core::error::{Error, ErrorKind};
use crate::core::expectation::{
    CannedResponse, ExpectedRequest, Mismatch, Multiplicity, ReceivedRequest,
};

#[derive(Debug)]
struct Queued {
    request: ExpectedRequest,
    hits: u64,
}

impl Queued {
    fn is_satisfied(&self) -> bool {
        match self.request.multiple {
            Multiplicity::Once => false,
            Multiplicity::AtLeastOnce => self.hits > 0,
            Multiplicity::Any => true,
        }
    }
}

#[derive(Debug, Default)]
pub struct ExpectationQueue {
    entries: VecDeque<Queued>,
    mismatches: Vec<Mismatch>,
    served: u64,
}

impl ExpectationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the queue. Refused while the previous step still has unsatisfied entries.
    pub fn set(&mut self, expected: Vec<ExpectedRequest>) -> Result<(), Error> {
        let pending = self.remaining();
        if !pending.is_empty() {
            return Err(Error::new(ErrorKind::PendingExpectations)
                .with_message(format!(
                    "{} expectation(s) from a previous step are still pending",
                    pending.len()
                ))
                .with_detail(describe_all(&pending))
                .with_hint("Clear the queue between steps before pushing a new one."));
        }
        if let Some(bad) = expected
            .iter()
            .find(|request| !(100..=999).contains(&request.response_status))
        {
            return Err(Error::new(ErrorKind::Usage)
                .with_message(format!(
                    "expectation `{bad}` has invalid response status {}",
                    bad.response_status
                ))
                .with_hint("Use an HTTP status code between 100 and 999."));
        }
        tracing::debug!(count = expected.len(), "expectation queue set");
        self.entries = expected
            .into_iter()
            .map(|request| Queued { request, hits: 0 })
            .collect();
        self.mismatches.clear();
        Ok(())
    }

    /// Match `request` against the head. On success the head is consumed (or its hit
    /// count advanced) and the canned response returned; on failure nothing moves.
    pub fn handle(&mut self, mut request: ReceivedRequest) -> Result<CannedResponse, Mismatch> {
        if request.received_at.is_none() {
            request.received_at = OffsetDateTime::now_utc().format(&Rfc3339).ok();
        }

        // The entry that blocked the walk is the one to report; satisfied entries before it
        // were only candidates for skipping.
        let mut blocker: Option<(usize, String)> = None;
        let mut first_skippable: Option<(usize, String)> = None;
        let mut matched = None;
        for (idx, entry) in self.entries.iter().enumerate() {
            match entry.request.check(&request) {
                Ok(()) => {
                    matched = Some(idx);
                    break;
                }
                Err(reason) if entry.is_satisfied() => {
                    if first_skippable.is_none() {
                        first_skippable = Some((idx, reason));
                    }
                }
                Err(reason) => {
                    blocker = Some((idx, reason));
                    break;
                }
            }
        }

        let Some(idx) = matched else {
            let (expected, reason) = match blocker.or(first_skippable) {
                Some((at, reason)) => {
                    let reason = if at > 0 {
                        format!("{reason} (after {at} optional entr{})", plural_y(at))
                    } else {
                        reason
                    };
                    (self.entries.get(at).map(|entry| entry.request.to_string()), reason)
                }
                None => (None, "no expectations queued".to_string()),
            };
            let mismatch = Mismatch {
                expected,
                received: request,
                reason,
            };
            tracing::warn!(
                expected = mismatch.expected.as_deref().unwrap_or("<nothing>"),
                received = %mismatch.received,
                "unexpected request"
            );
            self.mismatches.push(mismatch.clone());
            return Err(mismatch);
        };

        self.entries.drain(..idx);
        let mut response = CannedResponse {
            status: 200,
            body: None,
        };
        let mut consumed = false;
        if let Some(head) = self.entries.front_mut() {
            response = head.request.canned_response();
            head.hits += 1;
            consumed = head.request.consume_once();
        }
        if consumed {
            self.entries.pop_front();
        }
        self.served += 1;
        tracing::debug!(request = %request, status = response.status, "expectation consumed");
        Ok(response)
    }

    /// Entries that still need at least one request.
    pub fn remaining(&self) -> Vec<ExpectedRequest> {
        self.entries
            .iter()
            .filter(|entry| !entry.is_satisfied())
            .map(|entry| entry.request.clone())
            .collect()
    }

    pub fn mismatches(&self) -> Vec<Mismatch> {
        self.mismatches.clone()
    }

    /// Number of requests answered from the queue since creation.
    pub fn served(&self) -> u64 {
        self.served
    }

    pub fn clear(&mut self) {
        if !self.entries.is_empty() || !self.mismatches.is_empty() {
            tracing::debug!(
                entries = self.entries.len(),
                mismatches = self.mismatches.len(),
                "expectation queue cleared"
            );
        }
        self.entries.clear();
        self.mismatches.clear();
    }
}

fn plural_y(count: usize) -> &'static str {
    if count == 1 { "y" } else { "ies" }
}

pub(crate) fn describe_all(expected: &[ExpectedRequest]) -> String {
    expected
        .iter()
        .map(|request| format!("  - {request}"))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::ExpectationQueue;
    use crate::core::error::ErrorKind;
    use crate::core::expectation::{Multiplicity, ReceivedRequest, expect};
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    fn get(path: &str) -> ReceivedRequest {
        ReceivedRequest::new("GET", path)
    }

    #[test]
    fn in_order_requests_drain_the_queue() {
        let mut queue = ExpectationQueue::new();
        queue
            .set(vec![
                expect("GET", "/column_family/").respond_json(json!([{"ks": "system_schema"}])),
                expect("GET", "/stream_manager/").respond_json(json!([])),
            ])
            .expect("set");

        let first = queue.handle(get("/column_family/")).expect("first");
        assert_eq!(first.status, 200);
        assert_eq!(first.body, Some(json!([{"ks": "system_schema"}])));
        let second = queue.handle(get("/stream_manager/")).expect("second");
        assert_eq!(second.body, Some(json!([])));

        assert!(queue.remaining().is_empty());
        assert!(queue.mismatches().is_empty());
        assert_eq!(queue.served(), 2);
    }

    #[test]
    fn rejection_leaves_head_in_place() {
        let mut queue = ExpectationQueue::new();
        queue
            .set(vec![
                expect("GET", "/column_family/"),
                expect("GET", "/stream_manager/"),
            ])
            .expect("set");

        let mismatch = queue
            .handle(get("/stream_manager/"))
            .expect_err("out of order");
        assert_eq!(mismatch.expected.as_deref(), Some("GET /column_family/ -> 200"));
        assert!(mismatch.reason.contains("path differs"));

        // Keeps failing, and does not skip the head.
        assert!(queue.handle(get("/stream_manager/")).is_err());
        assert_eq!(queue.remaining().len(), 2);
        assert_eq!(queue.mismatches().len(), 2);

        queue.handle(get("/column_family/")).expect("corrected");
        queue.handle(get("/stream_manager/")).expect("then next");
        assert!(queue.remaining().is_empty());
    }

    #[test]
    fn empty_queue_rejects_everything() {
        let mut queue = ExpectationQueue::new();
        let mismatch = queue.handle(get("/anything")).expect_err("empty");
        assert_eq!(mismatch.expected, None);
        assert_eq!(mismatch.reason, "no expectations queued");
    }

    #[test]
    fn set_refuses_pending_entries_until_cleared() {
        let mut queue = ExpectationQueue::new();
        queue.set(vec![expect("GET", "/a")]).expect("set");
        let err = queue.set(vec![expect("GET", "/b")]).expect_err("pending");
        assert_eq!(err.kind(), ErrorKind::PendingExpectations);
        assert!(err.detail().is_some_and(|detail| detail.contains("GET /a")));

        queue.clear();
        queue.set(vec![expect("GET", "/b")]).expect("after clear");
        assert_eq!(queue.remaining()[0].path, "/b");
    }

    #[test]
    fn repeatable_entries_are_skipped_only_when_satisfied() {
        let mut queue = ExpectationQueue::new();
        queue
            .set(vec![
                expect("GET", "/storage_service/host_id").with_multiplicity(Multiplicity::Any),
                expect("POST", "/storage_service/compact")
                    .with_multiplicity(Multiplicity::AtLeastOnce),
                expect("GET", "/done"),
            ])
            .expect("set");

        // `Any` may be skipped without a hit.
        queue
            .handle(ReceivedRequest::new("POST", "/storage_service/compact"))
            .expect("compact");
        queue
            .handle(ReceivedRequest::new("POST", "/storage_service/compact"))
            .expect("compact again");
        assert_eq!(queue.remaining().len(), 1);

        queue.handle(get("/done")).expect("done");
        assert!(queue.remaining().is_empty());
    }

    #[test]
    fn unhit_at_least_once_blocks_later_entries() {
        let mut queue = ExpectationQueue::new();
        queue
            .set(vec![
                expect("GET", "/a").with_multiplicity(Multiplicity::AtLeastOnce),
                expect("GET", "/b"),
            ])
            .expect("set");
        assert!(queue.handle(get("/b")).is_err());
        assert_eq!(queue.remaining().len(), 2);
    }

    #[test]
    fn rejection_does_not_drop_satisfied_entries() {
        let mut queue = ExpectationQueue::new();
        queue
            .set(vec![
                expect("GET", "/maybe").with_multiplicity(Multiplicity::Any),
                expect("GET", "/must"),
            ])
            .expect("set");
        assert!(queue.handle(get("/other")).is_err());
        // The optional head is still there to be hit.
        queue.handle(get("/maybe")).expect("optional still queued");
        queue.handle(get("/must")).expect("must");
    }

    #[test]
    fn rejection_names_the_entry_that_blocked() {
        let mut queue = ExpectationQueue::new();
        queue
            .set(vec![
                expect("GET", "/maybe").with_multiplicity(Multiplicity::Any),
                expect("GET", "/must"),
            ])
            .expect("set");
        let mismatch = queue.handle(get("/other")).expect_err("blocked");
        assert_eq!(mismatch.expected.as_deref(), Some("GET /must -> 200"));
        assert!(mismatch.reason.contains("expected /must, got /other"));
        assert!(mismatch.reason.contains("after 1 optional entry"));
    }

    #[test]
    fn only_satisfied_entries_report_the_first_one() {
        let mut queue = ExpectationQueue::new();
        queue
            .set(vec![expect("GET", "/maybe").with_multiplicity(Multiplicity::Any)])
            .expect("set");
        let mismatch = queue.handle(get("/other")).expect_err("no match");
        assert_eq!(mismatch.expected.as_deref(), Some("GET /maybe (0+) -> 200"));
        assert!(mismatch.reason.contains("expected /maybe"));
    }

    #[test]
    fn invalid_response_status_is_refused() {
        let mut queue = ExpectationQueue::new();
        let err = queue
            .set(vec![expect("GET", "/a").respond_status(42)])
            .expect_err("bad status");
        assert_eq!(err.kind(), ErrorKind::Usage);
        assert!(err.message().is_some_and(|message| message.contains("42")));
        assert!(queue.remaining().is_empty());

        queue
            .set(vec![expect("GET", "/a").respond_status(503)])
            .expect("valid status");
    }

    #[test]
    fn concurrent_requests_never_share_a_head() {
        let queue = Arc::new(Mutex::new(ExpectationQueue::new()));
        let expected = (0..64)
            .map(|idx| expect("GET", "/token").respond_json(json!(idx)))
            .collect();
        queue.lock().expect("lock").set(expected).expect("set");

        let mut handles = Vec::new();
        for _ in 0..8 {
            let queue = Arc::clone(&queue);
            handles.push(std::thread::spawn(move || {
                let mut bodies = Vec::new();
                for _ in 0..8 {
                    let response = queue
                        .lock()
                        .expect("lock")
                        .handle(ReceivedRequest::new("GET", "/token"))
                        .expect("served");
                    bodies.push(response.body.and_then(|v| v.as_u64()).expect("index"));
                }
                bodies
            }));
        }

        let mut seen = Vec::new();
        for handle in handles {
            seen.extend(handle.join().expect("join"));
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..64).collect::<Vec<u64>>());
        assert!(queue.lock().expect("lock").remaining().is_empty());
    }
}
