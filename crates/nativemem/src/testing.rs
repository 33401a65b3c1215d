//! Test doubles and helpers, for the unit tests

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

use crate::internal_prelude::*;
use std::collections::BTreeMap;

/// Gap left between fake blocks, so that overruns don't land in a neighbour
const GAP: usize = 0x100;

/// Fake native memory, which records what happens to it
///
/// Blocks are `Vec`s.  Addresses are made up, and never reused,
/// so a use after free, or a double free, always shows up (as a panic).
#[derive(Debug)]
pub(crate) struct RecordingMemory {
    /// The state
    inner: Mutex<Inner>,
}

/// State of a [`RecordingMemory`]
#[derive(Debug)]
struct Inner {
    /// Next address to hand out
    next: usize,
    /// Live blocks, by start address
    blocks: BTreeMap<usize, Vec<u8>>,
    /// Every successful allocation, in order
    allocs: Vec<(usize, usize)>,
    /// Every free, in order
    frees: Vec<(usize, usize)>,
    /// Fail this many more allocations
    fail_allocs: usize,
    /// Panic in `free`
    panic_on_free: bool,
    /// Sleep this long in each `free`
    free_delay: Duration,
}

impl RecordingMemory {
    /// Make a new `RecordingMemory`
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(RecordingMemory {
            inner: Mutex::new(Inner {
                next: 0x1000,
                blocks: BTreeMap::new(),
                allocs: vec![],
                frees: vec![],
                fail_allocs: 0,
                panic_on_free: false,
                free_delay: Duration::ZERO,
            }),
        })
    }

    /// `(address, size)` of every free so far
    pub(crate) fn frees(&self) -> Vec<(usize, usize)> {
        self.lock().frees.clone()
    }

    /// `(address, size)` of every allocation so far
    pub(crate) fn allocs(&self) -> Vec<(usize, usize)> {
        self.lock().allocs.clone()
    }

    /// Number of blocks allocated and not freed
    pub(crate) fn n_live(&self) -> usize {
        self.lock().blocks.len()
    }

    /// Make the next `n` allocations fail
    pub(crate) fn fail_next_allocs(&self, n: usize) {
        self.lock().fail_allocs = n;
    }

    /// Make `free` panic (after recording the free)
    pub(crate) fn set_panic_on_free(&self, panic: bool) {
        self.lock().panic_on_free = panic;
    }

    /// Make each `free` take (at least) `delay`
    pub(crate) fn set_free_delay(&self, delay: Duration) {
        self.lock().free_delay = delay;
    }

    /// Lock
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` on the live block containing `address .. address + len`
    fn with_block<R>(&self, address: Address, len: usize, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut inner = self.lock();
        let addr = address.get();
        let (base, block) = inner
            .blocks
            .range_mut(..=addr)
            .next_back()
            .unwrap_or_else(|| panic!("access to unallocated {address}"));
        let start = addr - base;
        assert!(start + len <= block.len(), "access beyond block at {address}");
        f(&mut block[start..start + len])
    }
}

impl NativeMemory for RecordingMemory {
    fn alloc(&self, size: usize) -> Result<Address, NativeAllocFailed> {
        let mut inner = self.lock();
        if inner.fail_allocs > 0 {
            inner.fail_allocs -= 1;
            return Err(NativeAllocFailed::new(size));
        }
        let addr = inner.next;
        inner.next += size + GAP;
        inner.blocks.insert(addr, vec![0; size]);
        inner.allocs.push((addr, size));
        Ok(Address::new(addr).unwrap())
    }

    unsafe fn free(&self, address: Address, size: usize) {
        let mut inner = self.lock();
        let addr = address.get();
        inner.frees.push((addr, size));
        let block = inner.blocks.remove(&addr);
        let panic_on_free = inner.panic_on_free;
        let free_delay = inner.free_delay;
        drop(inner);

        thread::sleep(free_delay);
        let block = block.unwrap_or_else(|| panic!("double free, or bad free, of {address}"));
        assert_eq!(block.len(), size, "free of {address} with wrong size");
        if panic_on_free {
            panic!("native free failed (expected in test)");
        }
    }

    unsafe fn read(&self, address: Address, dst: &mut [u8]) {
        self.with_block(address, dst.len(), |src| dst.copy_from_slice(src));
    }

    unsafe fn write(&self, address: Address, src: &[u8]) {
        self.with_block(address, src.len(), |dst| dst.copy_from_slice(src));
    }
}

/// Make an engine using a [`RecordingMemory`], with a short tick, not started
pub(crate) fn engine(budget: Option<usize>) -> (Arc<RecordingMemory>, Arc<ReclamationEngine>) {
    let memory = RecordingMemory::new();
    let engine = ReclamationEngine::new(&config(budget), memory.clone());
    (memory, engine)
}

/// Config for tests: short tick and waits
pub(crate) fn config(budget: Option<usize>) -> Config {
    let mut b = Config::builder();
    b.tick(Duration::from_millis(2))
        .allocation_wait(Duration::from_millis(200))
        .cleanup_timeout(Duration::from_millis(200));
    if let Some(budget) = budget {
        b.budget(budget);
    }
    b.build().unwrap()
}
