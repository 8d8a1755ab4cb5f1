//! Pending request table
//!
//! Maps the correlation id of every frame suspended on an RPC to the state
//! collecting its responses. Both the receipt path (transport thread) and the
//! timeout path (a timeout frame on a worker) go through the table lock, so
//! exactly one of them removes the entry and resumes the frame.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use parking_lot::Mutex;
use crate::scheduler::FrameId;

/// Collects the responses of one request
pub(crate) trait ResponseSink: Send {
    /// Record a response. Returns `None` when `from` is not an unanswered
    /// destination, otherwise whether the request is now finished.
    fn accept(&mut self, from: SocketAddr, payload: &[u8]) -> Option<bool>;

    /// Fill in a timeout for every destination that has not answered
    fn expire(&mut self);
}

pub(crate) type SharedSink = Arc<Mutex<dyn ResponseSink>>;

/// RPC statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RpcStats {
    /// Requests dispatched
    pub dispatched: usize,
    /// Responses recorded against a pending request
    pub responses_matched: usize,
    /// Responses dropped as late, duplicate or foreign
    pub responses_discarded: usize,
    /// Requests finished by their timeout
    pub timeouts: usize,
}

/// Outcome of handing a response to the table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Receipt {
    /// Finish condition met; the frame must be resumed
    Resume(FrameId),
    /// Recorded, still waiting for more responses
    Recorded,
    /// Not matched to any pending request
    Discarded,
}

struct PendingEntry {
    frame: FrameId,
    function_id: u16,
    sequence: u64,
    sink: SharedSink,
}

/// Requests awaiting responses, keyed by correlation id
#[derive(Default)]
pub struct PendingTable {
    entries: Mutex<HashMap<u64, PendingEntry>>,
    next_sequence: AtomicU64,
    dispatched: AtomicUsize,
    matched: AtomicUsize,
    discarded: AtomicUsize,
    timeouts: AtomicUsize,
}

impl PendingTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of requests awaiting responses
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether no request is pending
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get RPC statistics
    pub fn stats(&self) -> RpcStats {
        RpcStats {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            responses_matched: self.matched.load(Ordering::Relaxed),
            responses_discarded: self.discarded.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
        }
    }

    /// Publish a request. Returns the dispatch sequence its timeout must quote.
    pub(crate) fn insert(&self, correlation_id: u64, frame: FrameId, function_id: u16, sink: SharedSink) -> u64 {
        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        let entry = PendingEntry {
            frame,
            function_id,
            sequence,
            sink,
        };
        if self.entries.lock().insert(correlation_id, entry).is_some() {
            log::warn!("Request {} replaced a pending request", correlation_id);
        }
        self.dispatched.fetch_add(1, Ordering::Relaxed);
        sequence
    }

    /// Receipt path
    pub(crate) fn receive(&self, correlation_id: u64, function_id: u16, from: SocketAddr, payload: &[u8]) -> Receipt {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get(&correlation_id) else {
            log::debug!("No pending request {} for response from {}", correlation_id, from);
            return self.discard();
        };
        if entry.function_id != function_id {
            log::debug!(
                "Response from {} names function {} but request {} called {}",
                from,
                function_id,
                correlation_id,
                entry.function_id
            );
            return self.discard();
        }

        let accepted = entry.sink.lock().accept(from, payload);
        let Some(finished) = accepted else {
            log::debug!("Unexpected response from {} for request {}", from, correlation_id);
            return self.discard();
        };
        self.matched.fetch_add(1, Ordering::Relaxed);

        if !finished {
            return Receipt::Recorded;
        }
        match entries.remove(&correlation_id) {
            Some(entry) => Receipt::Resume(entry.frame),
            None => Receipt::Recorded,
        }
    }

    /// Timeout path. Only expires the request dispatched with `sequence`.
    pub(crate) fn expire(&self, correlation_id: u64, sequence: u64) -> Option<FrameId> {
        let mut entries = self.entries.lock();
        match entries.get(&correlation_id) {
            Some(entry) if entry.sequence == sequence => {}
            _ => return None,
        }
        let entry = entries.remove(&correlation_id)?;
        entry.sink.lock().expire();
        self.timeouts.fetch_add(1, Ordering::Relaxed);
        Some(entry.frame)
    }

    /// Count a response dropped before it reached the table
    pub(crate) fn discard(&self) -> Receipt {
        self.discarded.fetch_add(1, Ordering::Relaxed);
        Receipt::Discarded
    }
}

impl std::fmt::Debug for PendingTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingTable")
            .field("pending", &self.len())
            .field("stats", &self.stats())
            .finish()
    }
}
