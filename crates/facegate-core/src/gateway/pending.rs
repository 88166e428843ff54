//! Correlation table for requests the engine has accepted.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::id::CorrelationId;
use crate::protocol::Request;

/// Requests awaiting an engine completion, keyed by correlation id.
///
/// Lookup and removal happen under one lock acquisition, so a completion
/// can claim its entry at most once.
#[derive(Debug, Default)]
pub struct PendingTable {
    entries: Mutex<HashMap<CorrelationId, Request>>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<CorrelationId, Request>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record a request. Returns the entry it displaced, if any.
    pub fn insert(&self, request: Request) -> Option<Request> {
        self.lock().insert(request.correlation_id, request)
    }

    /// Remove and return the entry for `id`.
    pub fn take(&self, id: CorrelationId) -> Option<Request> {
        self.lock().remove(&id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry, returning how many there were.
    pub fn clear(&self) -> usize {
        let mut entries = self.lock();
        let n = entries.len();
        entries.clear();
        n
    }
}
