//! Pending-request table: identifier allocation and response correlation.
//!
//! Responses are matched strictly by id, never by arrival order. Timing out
//! a request only removes its entry; nothing is sent to the server, and a
//! response that shows up afterwards finds no entry and is dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::protocol::ResponseError;

pub(crate) type Outcome = Result<serde_json::Value, ResponseError>;

struct PendingRequest {
    method: String,
    sent_at: Instant,
    tx: oneshot::Sender<Outcome>,
}

pub(crate) struct Correlator {
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, PendingRequest>>,
}

impl Correlator {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
        }
    }

    fn table(&self) -> MutexGuard<'_, HashMap<u64, PendingRequest>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate the next id and record a pending entry for it.
    pub fn register(&self, method: &str) -> (u64, oneshot::Receiver<Outcome>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.table().insert(
            id,
            PendingRequest {
                method: method.to_string(),
                sent_at: Instant::now(),
                tx,
            },
        );
        (id, rx)
    }

    /// Route a response to its waiter. Returns `false` when no entry exists
    /// (timed out, cancelled, or never sent).
    pub fn complete(&self, id: u64, outcome: Outcome) -> bool {
        let entry = self.table().remove(&id);
        let Some(entry) = entry else {
            tracing::debug!(id, "Dropping response for unknown or expired request");
            return false;
        };
        tracing::debug!(
            id,
            method = %entry.method,
            elapsed_ms = entry.sent_at.elapsed().as_millis(),
            ok = outcome.is_ok(),
            "LSP response"
        );
        // The waiter may already be gone (caller dropped the future).
        let _ = entry.tx.send(outcome);
        true
    }

    /// Remove an entry without completing it.
    pub fn forget(&self, id: u64) -> bool {
        self.table().remove(&id).is_some()
    }

    /// Drop every pending entry. Waiters observe a closed channel.
    pub fn fail_all(&self) -> usize {
        let drained: Vec<_> = self.table().drain().collect();
        for (id, entry) in &drained {
            tracing::debug!(id, method = %entry.method, "Abandoning pending LSP request");
        }
        drained.len()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.table().len()
    }
}

/// Removes a pending entry when the waiting future goes away, whatever the
/// reason (response, timeout, or the caller dropping the future).
pub(crate) struct PendingGuard<'a> {
    correlator: &'a Correlator,
    id: u64,
}

impl<'a> PendingGuard<'a> {
    pub fn new(correlator: &'a Correlator, id: u64) -> Self {
        Self { correlator, id }
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.correlator.forget(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_start_at_zero_and_increase() {
        let correlator = Correlator::new();
        let (a, _rx_a) = correlator.register("a");
        let (b, _rx_b) = correlator.register("b");
        let (c, _rx_c) = correlator.register("c");
        assert_eq!((a, b, c), (0, 1, 2));
        assert_eq!(correlator.len(), 3);
    }

    #[tokio::test]
    async fn test_out_of_order_responses_reach_their_own_waiters() {
        let correlator = Correlator::new();
        let receivers: Vec<_> = (0..5).map(|i| correlator.register(&format!("m{i}"))).collect();

        for id in [3, 0, 4, 1, 2] {
            assert!(correlator.complete(id, Ok(serde_json::json!({ "echo": id }))));
        }

        for (id, rx) in receivers {
            let value = rx.await.unwrap().unwrap();
            assert_eq!(value["echo"], id);
        }
        assert_eq!(correlator.len(), 0);
    }

    #[tokio::test]
    async fn test_error_outcome_is_delivered() {
        let correlator = Correlator::new();
        let (id, rx) = correlator.register("textDocument/rename");
        correlator.complete(
            id,
            Err(ResponseError {
                code: -32803,
                message: String::from("nope"),
            }),
        );
        let err = rx.await.unwrap().unwrap_err();
        assert_eq!(err.code, -32803);
    }

    #[test]
    fn test_late_response_after_forget_is_dropped() {
        let correlator = Correlator::new();
        let (id, _rx) = correlator.register("textDocument/hover");
        assert!(correlator.forget(id));
        assert!(!correlator.complete(id, Ok(serde_json::Value::Null)));
        assert_eq!(correlator.len(), 0);
    }

    #[test]
    fn test_unknown_id_is_ignored() {
        let correlator = Correlator::new();
        assert!(!correlator.complete(999, Ok(serde_json::Value::Null)));
    }

    #[tokio::test]
    async fn test_fail_all_closes_waiters() {
        let correlator = Correlator::new();
        let (_, rx1) = correlator.register("a");
        let (_, rx2) = correlator.register("b");
        assert_eq!(correlator.fail_all(), 2);
        assert!(rx1.await.is_err());
        assert!(rx2.await.is_err());
        assert_eq!(correlator.len(), 0);
    }

    #[test]
    fn test_guard_removes_entry_on_drop() {
        let correlator = Correlator::new();
        let (id, _rx) = correlator.register("a");
        {
            let _guard = PendingGuard::new(&correlator, id);
        }
        assert_eq!(correlator.len(), 0);
    }

    #[test]
    fn test_ids_not_reused_after_completion() {
        let correlator = Correlator::new();
        let (first, _rx) = correlator.register("a");
        correlator.complete(first, Ok(serde_json::Value::Null));
        let (second, _rx) = correlator.register("a");
        assert_ne!(first, second);
    }
}
