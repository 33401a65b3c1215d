//! Collectors: holders of cached handles which can be asked to let go

use crate::internal_prelude::*;

/// An object which may be holding [`Handle`](crate::Handle)s it could do without
///
/// Register with
/// [`ReclamationEngine::register_collector`](crate::ReclamationEngine::register_collector).
/// The engine holds only a `Weak`; a collector which has gone away is forgotten.
///
/// Implementors should be prepared for `release_unused` to be called
/// from any thread, at any time, including from within an allocation
/// that is waiting for native budget.
pub trait IsCollectable: Debug + Send + Sync + 'static {
    /// Drop (or explicitly release) handles that are no longer needed
    ///
    /// Called by
    /// [`force_full_cleanup`](crate::ReclamationEngine::force_full_cleanup).
    /// Should not block for long, and must not call `force_full_cleanup`.
    ///
    /// A panic here is caught and logged; it does not stop the cleanup.
    fn release_unused(&self);
}

/// The engine's registered collectors
#[derive(Debug, Default)]
pub(crate) struct Collectors {
    /// Registered collectors; may contain dead entries until the next prune
    list: Mutex<Vec<Weak<dyn IsCollectable>>>,
}

impl Collectors {
    /// Register a collector
    pub(crate) fn register(&self, collector: Weak<dyn IsCollectable>) {
        let mut list = self.lock();
        list.retain(|c| c.strong_count() > 0);
        list.push(collector);
    }

    /// Ask every live collector to release what it can
    ///
    /// The collectors are called without holding our lock,
    /// so a collector may register further collectors.
    ///
    /// Returns the number of collectors called.
    pub(crate) fn release_unused(&self) -> usize {
        let live: Vec<Arc<dyn IsCollectable>> = {
            let mut list = self.lock();
            list.retain(|c| c.strong_count() > 0);
            list.iter().filter_map(Weak::upgrade).collect()
        };
        for collector in &live {
            if catch_unwind(AssertUnwindSafe(|| collector.release_unused())).is_err() {
                warn!("native memory collector {:?} panicked; continuing", collector);
            }
        }
        live.len()
    }

    /// Lock the list
    ///
    /// The list is only pushed to and pruned, so it is usable after a panic.
    fn lock(&self) -> MutexGuard<'_, Vec<Weak<dyn IsCollectable>>> {
        self.list.lock().unwrap_or_else(PoisonError::into_inner)
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
    use std::sync::atomic::AtomicBool;
    use tracing_test::traced_test;

    #[derive(Debug, Default)]
    struct Counting {
        calls: AtomicUsize,
        panics: AtomicBool,
    }

    impl IsCollectable for Counting {
        fn release_unused(&self) {
            self.calls.fetch_add(1, Ordering::Relaxed);
            if self.panics.load(Ordering::Relaxed) {
                panic!("collector failure (expected in test)");
            }
        }
    }

    fn weak(c: &Arc<Counting>) -> Weak<dyn IsCollectable> {
        let c: Arc<dyn IsCollectable> = c.clone();
        Arc::downgrade(&c)
    }

    #[test]
    #[traced_test]
    fn calls_and_prunes() {
        let collectors = Collectors::default();
        let a = Arc::new(Counting::default());
        let b = Arc::new(Counting::default());
        collectors.register(weak(&a));
        collectors.register(weak(&b));

        assert_eq!(collectors.release_unused(), 2);
        assert_eq!(a.calls.load(Ordering::Relaxed), 1);

        drop(b);
        assert_eq!(collectors.release_unused(), 1);
        assert_eq!(collectors.lock().len(), 1);

        a.panics.store(true, Ordering::Relaxed);
        let c = Arc::new(Counting::default());
        collectors.register(weak(&c));
        assert_eq!(collectors.release_unused(), 2);
        assert_eq!(c.calls.load(Ordering::Relaxed), 1);
        assert!(logs_contain("panicked; continuing"));
    }
}
