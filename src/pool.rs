//! Backend Pool — a thread-safe directory of remote build workers.
//!
//! See SPEC_FULL.md §4.1. All methods acquire a single exclusive lock for
//! the duration of inspection+mutation; the lock is never held across I/O
//! because this module performs none.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{ServiceError, ServiceResult};
use crate::types::Backend;

/// Outcome of [`BackendPool::reserve`]. Distinguishing `NoMatch` from
/// `AllBusy` lets the Scheduler tell "no such backend" from "back off".
pub enum ReserveOutcome {
    Reserved(Reservation),
    NoMatch,
    AllBusy,
}

/// A transient handle on one concurrency slot of a Backend.
///
/// Released by exactly one effective call to [`Reservation::release`]; a
/// second call is a no-op, reported via the returned `bool` so callers can
/// detect a double-release attempt. Dropping an unreleased reservation
/// releases it best-effort and logs a warning — this should never happen in
/// normal operation, since the Scheduler releases on every code path.
pub struct Reservation {
    pool: Arc<Mutex<PoolInner>>,
    addr: String,
    released: AtomicBool,
}

impl Reservation {
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Releases the slot. Returns `true` if this call performed the
    /// release, `false` if it had already happened.
    pub fn release(&self) -> bool {
        if self.released.swap(true, Ordering::AcqRel) {
            return false;
        }
        let mut inner = self.pool.lock().expect("backend pool lock poisoned");
        if let Some(backend) = inner.backends.get_mut(&self.addr) {
            backend.inflight = backend.inflight.saturating_sub(1);
        }
        true
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.released.load(Ordering::Acquire) && self.release() {
            tracing::warn!(addr = %self.addr, "reservation dropped without explicit release");
        }
    }
}

struct PoolInner {
    backends: HashMap<String, Backend>,
}

/// Registry of worker endpoints, selected by architecture + label under
/// concurrency-safe reservation.
pub struct BackendPool {
    inner: Arc<Mutex<PoolInner>>,
}

impl Default for BackendPool {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendPool {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(PoolInner {
                backends: HashMap::new(),
            })),
        }
    }

    pub fn add(&self, backend: Backend) -> ServiceResult<Backend> {
        let mut inner = self.inner.lock().expect("backend pool lock poisoned");
        if inner.backends.contains_key(&backend.addr) {
            return Err(ServiceError::Conflict(format!(
                "backend {} already registered",
                backend.addr
            )));
        }
        inner.backends.insert(backend.addr.clone(), backend.clone());
        Ok(backend)
    }

    pub fn remove(&self, addr: &str, force: bool) -> ServiceResult<()> {
        let mut inner = self.inner.lock().expect("backend pool lock poisoned");
        match inner.backends.get(addr) {
            None => Err(ServiceError::NotFound(format!("backend {addr} not found"))),
            Some(backend) if backend.inflight > 0 && !force => Err(ServiceError::InUse(format!(
                "backend {addr} has {} in-flight reservations",
                backend.inflight
            ))),
            Some(_) => {
                inner.backends.remove(addr);
                Ok(())
            }
        }
    }

    /// Returns backends matching `arch_filter` (None matches all) and the
    /// set of distinct architectures present across the whole pool.
    pub fn list(&self, arch_filter: Option<&str>) -> (Vec<Backend>, Vec<String>) {
        let inner = self.inner.lock().expect("backend pool lock poisoned");
        let mut architectures: std::collections::BTreeSet<String> =
            std::collections::BTreeSet::new();
        let mut matched = Vec::new();
        for backend in inner.backends.values() {
            architectures.insert(backend.arch.clone());
            if arch_filter.map(|a| a == backend.arch).unwrap_or(true) {
                matched.push(backend.clone());
            }
        }
        matched.sort_by(|a, b| a.addr.cmp(&b.addr));
        (matched, architectures.into_iter().collect())
    }

    pub fn status(&self) -> Vec<Backend> {
        let inner = self.inner.lock().expect("backend pool lock poisoned");
        let mut backends: Vec<Backend> = inner.backends.values().cloned().collect();
        backends.sort_by(|a, b| a.addr.cmp(&b.addr));
        backends
    }

    /// Atomically finds a backend matching `arch` + `selector` with spare
    /// capacity. Selection policy: least-loaded first, ties broken by
    /// lexicographic `addr` for determinism.
    pub fn reserve(&self, arch: &str, selector: &BTreeMap<String, String>) -> ReserveOutcome {
        let mut inner = self.inner.lock().expect("backend pool lock poisoned");

        let mut candidates: Vec<&Backend> = inner
            .backends
            .values()
            .filter(|b| b.matches(arch, selector))
            .collect();

        if candidates.is_empty() {
            return ReserveOutcome::NoMatch;
        }

        candidates.sort_by(|a, b| a.inflight.cmp(&b.inflight).then_with(|| a.addr.cmp(&b.addr)));

        let chosen_addr = match candidates.iter().find(|b| b.has_capacity()) {
            Some(b) => b.addr.clone(),
            None => return ReserveOutcome::AllBusy,
        };

        let backend = inner.backends.get_mut(&chosen_addr).expect("chosen backend vanished");
        backend.inflight += 1;

        ReserveOutcome::Reserved(Reservation {
            pool: Arc::clone(&self.inner),
            addr: chosen_addr,
            released: AtomicBool::new(false),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn backend(addr: &str, arch: &str, capacity: u32) -> Backend {
        Backend {
            addr: addr.to_string(),
            arch: arch.to_string(),
            labels: BTreeMap::new(),
            inflight: 0,
            capacity,
        }
    }

    #[test]
    fn add_rejects_duplicate_addr() {
        let pool = BackendPool::new();
        pool.add(backend("a1", "x86_64", 1)).unwrap();
        let err = pool.add(backend("a1", "x86_64", 1)).unwrap_err();
        assert!(matches!(err, ServiceError::Conflict(_)));
    }

    #[test]
    fn remove_refuses_while_inflight() {
        let pool = BackendPool::new();
        pool.add(backend("a1", "x86_64", 2)).unwrap();
        let ReserveOutcome::Reserved(res) = pool.reserve("x86_64", &BTreeMap::new()) else {
            panic!("expected reservation");
        };
        let err = pool.remove("a1", false).unwrap_err();
        assert!(matches!(err, ServiceError::InUse(_)));
        res.release();
        pool.remove("a1", false).unwrap();
    }

    #[test]
    fn reserve_prefers_least_loaded_then_lexicographic_addr() {
        let pool = BackendPool::new();
        pool.add(backend("b", "x86_64", 2)).unwrap();
        pool.add(backend("a", "x86_64", 2)).unwrap();

        let ReserveOutcome::Reserved(first) = pool.reserve("x86_64", &BTreeMap::new()) else {
            panic!("expected reservation");
        };
        assert_eq!(first.addr(), "a");

        let ReserveOutcome::Reserved(second) = pool.reserve("x86_64", &BTreeMap::new()) else {
            panic!("expected reservation");
        };
        assert_eq!(second.addr(), "b");
    }

    #[test]
    fn reserve_distinguishes_no_match_from_all_busy() {
        let pool = BackendPool::new();
        pool.add(backend("a", "x86_64", 1)).unwrap();

        assert!(matches!(
            pool.reserve("aarch64", &BTreeMap::new()),
            ReserveOutcome::NoMatch
        ));

        let ReserveOutcome::Reserved(_res) = pool.reserve("x86_64", &BTreeMap::new()) else {
            panic!("expected reservation");
        };
        assert!(matches!(
            pool.reserve("x86_64", &BTreeMap::new()),
            ReserveOutcome::AllBusy
        ));
    }

    #[test]
    fn release_is_idempotent() {
        let pool = BackendPool::new();
        pool.add(backend("a", "x86_64", 1)).unwrap();
        let ReserveOutcome::Reserved(res) = pool.reserve("x86_64", &BTreeMap::new()) else {
            panic!("expected reservation");
        };
        assert!(res.release());
        assert!(!res.release());
    }

    #[test]
    fn remove_unknown_addr_is_not_found() {
        let pool = BackendPool::new();
        let err = pool.remove("ghost", false).unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
    }
}
