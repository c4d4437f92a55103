//! In-Flight Connection Accounting
//!
//! Process-wide gauge of outbound requests per backend plus a running total.
//! Dispatch paths increment through [`ConnectionCounter::track`]; the
//! returned guard decrements on drop, so the counter returns to zero on
//! success, failure and cancellation alike. The gauge feeds the per-round
//! eviction decision that enforces `ConnLimit`.

use std::sync::atomic::{AtomicI64, Ordering};

use dashmap::DashMap;
use url::Url;

/// Process-wide in-flight request counter.
#[derive(Default)]
pub struct ConnectionCounter {
    total: AtomicI64,
    per_backend: DashMap<Url, i64>,
}

impl ConnectionCounter {
    /// Create an empty counter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a dispatch to `backend`; the guard releases it on drop.
    #[must_use]
    pub fn track(&self, backend: &Url) -> InFlightGuard<'_> {
        self.total.fetch_add(1, Ordering::Relaxed);
        *self.per_backend.entry(backend.clone()).or_insert(0) += 1;
        InFlightGuard {
            counter: self,
            backend: backend.clone(),
        }
    }

    /// In-flight requests towards one backend.
    #[must_use]
    pub fn in_flight(&self, backend: &Url) -> i64 {
        self.per_backend.get(backend).map_or(0, |entry| *entry)
    }

    /// Total in-flight requests across all backends.
    #[must_use]
    pub fn total(&self) -> i64 {
        self.total.load(Ordering::Relaxed)
    }

    /// The candidate with the largest in-flight count, ties broken by order.
    #[must_use]
    pub fn busiest<'a>(&self, candidates: impl Iterator<Item = &'a Url>) -> Option<Url> {
        let mut winner: Option<(i64, &Url)> = None;
        for url in candidates {
            let count = self.in_flight(url);
            match winner {
                Some((best, _)) if best >= count => {}
                _ => winner = Some((count, url)),
            }
        }
        winner.map(|(_, url)| url.clone())
    }

    fn release(&self, backend: &Url) {
        self.total.fetch_sub(1, Ordering::Relaxed);
        if let Some(mut entry) = self.per_backend.get_mut(backend) {
            *entry -= 1;
        }
    }
}

/// Guard decrementing the counter when a dispatch completes.
pub struct InFlightGuard<'a> {
    counter: &'a ConnectionCounter,
    backend: Url,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.counter.release(&self.backend);
    }
}

// ============================================================================
// Tests
// ============================================================================
