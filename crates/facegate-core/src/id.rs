//! Identifier types and the lock-free id generator.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic 64-bit counter handing out correlation ids.
///
/// Starts at zero. Every call to [`UniqueId::get`] returns the value the
/// counter held before the increment, so concurrent callers always observe
/// disjoint values.
#[derive(Debug, Default)]
pub struct UniqueId {
    next: AtomicU64,
}

impl UniqueId {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the next id.
    pub fn get(&self) -> CorrelationId {
        let mut current = self.next.load(Ordering::Relaxed);
        loop {
            match self.next.compare_exchange_weak(
                current,
                current.wrapping_add(1),
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(prev) => return CorrelationId(prev),
                Err(actual) => current = actual,
            }
        }
    }
}

/// Server-generated id that ties an engine completion back to its request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationId(pub u64);

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Streaming connection id. Never reused while the process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
