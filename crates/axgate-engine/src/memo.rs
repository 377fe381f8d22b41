//! Per-check memoization with single-flight de-duplication.
//!
//! The store is the only shared mutable state in the engine. All mutation
//! goes through `get_or_compute`: at most one computation runs per key,
//! concurrent callers for the same missing key await the in-flight one,
//! and completed entries are evicted least-recently-used first once the
//! store is full. No partially-written entry is ever observable - a key
//! maps to a `OnceCell` that resolves exactly once.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, OnceCell};
use tracing::debug;

use axgate_domain::{Check, CheckResult, EvaluationContext};

type Slot = Arc<OnceCell<CheckResult>>;

struct Inner {
    entries: HashMap<String, Slot>,
    /// LRU order, oldest at the front.
    order: VecDeque<String>,
}

/// Bounded, concurrency-safe memoization store for check results.
pub struct MemoStore {
    capacity: usize,
    inner: Mutex<Inner>,
}

impl MemoStore {
    /// Create a store holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    /// Maximum entry count.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current entry count (completed and in-flight).
    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    /// Whether the store holds no entries.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Canonical memoization key for `(check, context)`.
    ///
    /// Covers the check's criteria digest (subtree included, for recursive
    /// checks) plus the canonical rendering of exactly the context fields
    /// the check reads (`Check::memo_context_keys`). Context changes
    /// outside that slice never invalidate the entry.
    pub fn canonical_key(check: &Check, context: &EvaluationContext) -> String {
        let keys = check.memo_context_keys();
        let slice = context.canonical_slice(&keys);

        let mut hasher = Sha256::new();
        hasher.update(check.criteria_digest().as_bytes());
        hasher.update(b"\0");
        hasher.update(slice.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Drop the entry for `key`, if any. Used to evict placeholder results
    /// (e.g. cancellation artifacts) that must not satisfy later runs.
    pub async fn invalidate(&self, key: &str) {
        let mut inner = self.inner.lock().await;
        if inner.entries.remove(key).is_some() {
            if let Some(pos) = inner.order.iter().position(|k| k == key) {
                inner.order.remove(pos);
            }
        }
    }

    /// Return the memoized result for `key`, computing it via `compute` on
    /// a miss. The boolean is true when the result was served from the
    /// store (including joining another caller's in-flight computation).
    pub async fn get_or_compute<F, Fut>(&self, key: &str, compute: F) -> (CheckResult, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CheckResult>,
    {
        let (slot, preexisting) = {
            let mut inner = self.inner.lock().await;
            if let Some(slot) = inner.entries.get(key).cloned() {
                touch(&mut inner.order, key);
                (slot, true)
            } else {
                let slot: Slot = Arc::new(OnceCell::new());
                inner.entries.insert(key.to_string(), slot.clone());
                inner.order.push_back(key.to_string());
                evict_over_capacity(&mut inner, self.capacity);
                (slot, false)
            }
        };

        let mut computed_here = false;
        let result = slot
            .get_or_init(|| {
                computed_here = true;
                compute()
            })
            .await
            .clone();

        let was_cached = !computed_here;
        if was_cached {
            debug!(key = %&key[..12.min(key.len())], preexisting, "memo hit");
            (result.as_cached(), true)
        } else {
            (result, false)
        }
    }
}

/// Move `key` to the back of the LRU order.
fn touch(order: &mut VecDeque<String>, key: &str) {
    if let Some(pos) = order.iter().position(|k| k == key) {
        if let Some(k) = order.remove(pos) {
            order.push_back(k);
        }
    }
}

/// Evict entries, oldest first, until within capacity.
///
/// An entry is evictable when its result has resolved, or when its
/// computation was abandoned: an uninitialized slot whose only remaining
/// reference is the map's own (every computing or waiting caller cloned
/// the `Arc` under the lock, so a strong count of one means nobody will
/// resolve it). Slots with live waiters are never evicted out from under
/// them; the store may transiently exceed capacity while they resolve.
fn evict_over_capacity(inner: &mut Inner, capacity: usize) {
    while inner.entries.len() > capacity {
        let Some(pos) = inner.order.iter().position(|k| {
            inner
                .entries
                .get(k)
                .is_some_and(|slot| slot.get().is_some() || Arc::strong_count(slot) == 1)
        }) else {
            break;
        };
        if let Some(key) = inner.order.remove(pos) {
            inner.entries.remove(&key);
        }
    }
}
