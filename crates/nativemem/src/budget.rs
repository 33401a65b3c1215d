//! Budget semaphore: back-pressure on native allocation
//!
//! Permits are bytes.
//! The fast path is a single atomic update, as for a plain counting budget.
//! Only callers which actually have to wait touch the mutex and condvar.

#![forbid(unsafe_code)]

use crate::internal_prelude::*;

/// Counting permit pool, sized to the native memory ceiling
///
/// Allocation acquires permits; freeing a block releases them, exactly once.
///
/// The engine's semaphore is available from
/// [`ReclamationEngine::budget`](crate::ReclamationEngine::budget).
#[derive(Debug)]
pub struct BudgetSemaphore {
    /// Total permits; `usize::MAX` if unlimited
    ceiling: usize,

    /// Permits not currently acquired
    ///
    /// Invariant: `available <= ceiling`.
    available: AtomicUsize,

    /// Number of threads waiting in [`acquire`](BudgetSemaphore::acquire)
    ///
    /// Releasers take this lock before notifying,
    /// so a waiter which found too few permits can't miss the wakeup.
    waiters: Mutex<usize>,

    /// Signalled when permits are released and someone is waiting
    released: Condvar,
}

impl BudgetSemaphore {
    /// Make a new semaphore with `ceiling` permits, or unlimited permits if `None`
    pub fn new(ceiling: Option<usize>) -> Self {
        let ceiling = ceiling.unwrap_or(usize::MAX);
        BudgetSemaphore {
            ceiling,
            available: AtomicUsize::new(ceiling),
            waiters: Mutex::new(0),
            released: Condvar::new(),
        }
    }

    /// The ceiling, or `None` if unlimited
    pub fn ceiling(&self) -> Option<usize> {
        (!self.is_unlimited()).then_some(self.ceiling)
    }

    /// Is this semaphore unlimited?
    pub fn is_unlimited(&self) -> bool {
        self.ceiling == usize::MAX
    }

    /// Permits currently available
    ///
    /// A snapshot: may be out of date by the time the caller looks at it.
    pub fn available(&self) -> usize {
        self.available.load(Ordering::Acquire)
    }

    /// Permits currently acquired and not released
    pub fn outstanding(&self) -> usize {
        self.ceiling - self.available()
    }

    /// Acquire `size` permits if they are available right now
    pub fn try_acquire(&self, size: usize) -> bool {
        self.available
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |avail| {
                avail.checked_sub(size)
            })
            .is_ok()
    }

    /// Acquire `size` permits, waiting at most `timeout` for them
    ///
    /// Returns `false` if the permits did not become available in time
    /// (or can never become available, because `size` exceeds the ceiling).
    pub fn acquire(&self, size: usize, timeout: Duration) -> bool {
        if size > self.ceiling {
            return false;
        }
        if self.try_acquire(size) {
            return true;
        }

        let deadline = Instant::now().checked_add(timeout);
        let mut waiters = self.lock_waiters();
        *waiters += 1;
        let got = loop {
            if self.try_acquire(size) {
                break true;
            }
            let wait = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        break false;
                    }
                    remaining
                }
                // Overflowed `Instant`: as good as forever
                None => timeout,
            };
            trace!(
                "native budget: waiting for {} bytes ({} available)",
                size,
                self.available()
            );
            waiters = self
                .released
                .wait_timeout(waiters, wait)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        };
        *waiters -= 1;
        got
    }

    /// Release `size` permits
    ///
    /// Must be called exactly once for each successful acquisition, with the same `size`.
    pub fn release(&self, size: usize) {
        let before = self.available.fetch_add(size, Ordering::AcqRel);
        debug_assert!(
            before
                .checked_add(size)
                .is_some_and(|after| after <= self.ceiling),
            "released more native budget than was acquired"
        );
        let waiters = self.lock_waiters();
        if *waiters > 0 {
            self.released.notify_all();
        }
    }

    /// Lock the waiter count
    ///
    /// The count is only ever adjusted by one under the lock,
    /// so it is still meaningful after a panic elsewhere.
    fn lock_waiters(&self) -> MutexGuard<'_, usize> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod test {
    // @@ begin test lint list @@
    #![allow(clippy::bool_assert_comparison)]
    #![allow(clippy::clone_on_copy)]
    #![allow(clippy::dbg_macro)]
    #![allow(clippy::mixed_attributes_style)]
    #![allow(clippy::print_stderr)]
    #![allow(clippy::print_stdout)]
    #![allow(clippy::single_char_pattern)]
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::unchecked_duration_subtraction)]
    #![allow(clippy::useless_vec)]
    #![allow(clippy::needless_pass_by_value)]
    //! <!-- @@ end test lint list @@ -->

    use super::*;
    use std::sync::mpsc;

    #[test]
    fn accounting() {
        let sem = BudgetSemaphore::new(Some(100));
        assert_eq!(sem.ceiling(), Some(100));
        assert!(sem.try_acquire(80));
        assert_eq!(sem.available(), 20);
        assert_eq!(sem.outstanding(), 80);
        assert!(!sem.try_acquire(21));
        assert!(sem.try_acquire(20));
        assert_eq!(sem.available(), 0);
        sem.release(80);
        sem.release(20);
        assert_eq!(sem.available(), 100);
    }

    #[test]
    fn over_ceiling() {
        let sem = BudgetSemaphore::new(Some(100));
        let t0 = Instant::now();
        assert!(!sem.acquire(101, Duration::from_secs(60)));
        assert!(t0.elapsed() < Duration::from_secs(30), "should not wait");
    }

    #[test]
    fn unlimited() {
        let sem = BudgetSemaphore::new(None);
        assert!(sem.is_unlimited());
        assert_eq!(sem.ceiling(), None);
        assert!(sem.acquire(1 << 30, Duration::ZERO));
        assert_eq!(sem.outstanding(), 1 << 30);
        sem.release(1 << 30);
        assert_eq!(sem.outstanding(), 0);
    }

    #[test]
    fn times_out() {
        let sem = BudgetSemaphore::new(Some(10));
        assert!(sem.try_acquire(10));
        let t0 = Instant::now();
        assert!(!sem.acquire(1, Duration::from_millis(50)));
        assert!(t0.elapsed() >= Duration::from_millis(50));
        assert_eq!(sem.available(), 0);
        assert_eq!(*sem.lock_waiters(), 0);
    }

    #[test]
    fn blocked_acquire_resumes() {
        let sem = Arc::new(BudgetSemaphore::new(Some(100)));
        assert!(sem.acquire(80, Duration::ZERO));

        let (tx, rx) = mpsc::channel();
        let waiter = thread::spawn({
            let sem = sem.clone();
            move || {
                let got = sem.acquire(50, Duration::from_secs(30));
                tx.send(got).unwrap();
            }
        });

        // Still blocked
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

        sem.release(80);
        assert_eq!(rx.recv_timeout(Duration::from_secs(30)).unwrap(), true);
        waiter.join().unwrap();
        assert_eq!(sem.available(), 50);
    }
}
