use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

/// Shared block behind every handle to one counter. The value lives
/// under the same mutex `lock()` takes, so single-step operations and
/// compound critical sections serialize against each other.
#[derive(Debug, Default)]
pub struct AtomicIntegerInner {
    value: Mutex<i64>,
}

/// Shared integer with atomic single-step operations.
#[derive(Debug, Clone, Default)]
pub struct AtomicInteger {
    inner: Arc<AtomicIntegerInner>,
}

impl AtomicInteger {
    pub fn new(initial: i64) -> Self {
        Self {
            inner: Arc::new(AtomicIntegerInner {
                value: Mutex::new(initial),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<AtomicIntegerInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn share(&self) -> Arc<AtomicIntegerInner> {
        self.inner.clone()
    }

    pub fn same_block(&self, other: &AtomicInteger) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn refcount(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    pub fn get(&self) -> i64 {
        *self.inner.value.lock()
    }

    pub fn set(&self, value: i64) {
        *self.inner.value.lock() = value;
    }

    /// Adds one and returns the new value. Wraps at the integer
    /// boundary, like any fixed-width counter.
    pub fn inc(&self) -> i64 {
        let mut value = self.inner.value.lock();
        *value = value.wrapping_add(1);
        *value
    }

    /// Subtracts one and returns the new value. Wraps at the integer
    /// boundary.
    pub fn dec(&self) -> i64 {
        let mut value = self.inner.value.lock();
        *value = value.wrapping_sub(1);
        *value
    }

    /// Acquires the counter mutex for a compound critical section, e.g.
    /// a check-then-set that must not interleave with other writers.
    pub fn lock(&self) -> AtomicIntegerGuard<'_> {
        AtomicIntegerGuard {
            value: self.inner.value.lock(),
        }
    }
}

pub struct AtomicIntegerGuard<'a> {
    value: MutexGuard<'a, i64>,
}

impl AtomicIntegerGuard<'_> {
    pub fn get(&self) -> i64 {
        *self.value
    }

    pub fn set(&mut self, value: i64) {
        *self.value = value;
    }

    pub fn inc(&mut self) -> i64 {
        *self.value = self.value.wrapping_add(1);
        *self.value
    }

    pub fn dec(&mut self) -> i64 {
        *self.value = self.value.wrapping_sub(1);
        *self.value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_arithmetic() {
        let a = AtomicInteger::new(10);
        assert_eq!(a.get(), 10);
        assert_eq!(a.inc(), 11);
        assert_eq!(a.dec(), 10);
        a.set(-3);
        assert_eq!(a.get(), -3);
    }

    #[test]
    fn wraps_at_the_integer_boundary() {
        let a = AtomicInteger::new(i64::MAX);
        assert_eq!(a.inc(), i64::MIN);
        assert_eq!(a.dec(), i64::MAX);
        a.set(i64::MIN);
        assert_eq!(a.dec(), i64::MAX);
    }

    #[test]
    fn default_starts_at_zero() {
        assert_eq!(AtomicInteger::default().get(), 0);
    }

    #[test]
    fn concurrent_increments_never_lose_updates() {
        let a = AtomicInteger::new(0);
        let threads = 8i64;
        let per_thread = 1000i64;
        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let shared = a.share();
                std::thread::spawn(move || {
                    let a = AtomicInteger::from_inner(shared);
                    for _ in 0..per_thread {
                        a.inc();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(a.get(), threads * per_thread);
    }

    #[test]
    fn guard_holds_other_writers_out() {
        let a = AtomicInteger::new(5);
        let mut guard = a.lock();
        if guard.get() == 5 {
            guard.set(100);
        }
        assert_eq!(guard.inc(), 101);
        drop(guard);
        assert_eq!(a.get(), 101);
    }
}
