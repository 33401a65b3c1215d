//! Native memory primitives
//!
//! [`NativeMemory`] is the seam between this crate and whatever actually
//! owns the memory: the C heap, a capture library's buffer pool, or a test double.
//!
//! This is the only place where we touch raw pointers.
//! The rest of the crate guarantees the preconditions of the `unsafe` trait methods:
//! every address passed back came from `alloc`, is freed at most once,
//! and is only read or written (within bounds) while its block is known to be live.

use crate::internal_prelude::*;

/// Address of the start of, or a position within, a native block
///
/// Never zero: a zero address means "unbound", which we represent with `Option`.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, derive_more::Display)]
#[display("{:#x}", _0.get())]
pub struct Address(NonZeroUsize);

/// Native allocation primitives
///
/// Implementations must be usable from any thread.
pub trait NativeMemory: Debug + Send + Sync + 'static {
    /// Allocate a block of `size` bytes
    ///
    /// `size` is never zero.
    /// The block's contents need not be initialised,
    /// but [`read`](NativeMemory::read) must be sound on it.
    fn alloc(&self, size: usize) -> Result<Address, NativeAllocFailed>;

    /// Free a block
    ///
    /// # Safety
    ///
    /// `address` and `size` must be exactly as obtained from a call to
    /// [`alloc`](NativeMemory::alloc) on this same object,
    /// and the block must not have been freed already.
    unsafe fn free(&self, address: Address, size: usize);

    /// Copy bytes out of native memory, starting at `address`
    ///
    /// # Safety
    ///
    /// `address .. address + dst.len()` must lie within a block
    /// allocated by this object and not yet freed.
    unsafe fn read(&self, address: Address, dst: &mut [u8]);

    /// Copy bytes into native memory, starting at `address`
    ///
    /// # Safety
    ///
    /// As for [`read`](NativeMemory::read).
    unsafe fn write(&self, address: Address, src: &[u8]);
}

/// [`NativeMemory`] backed by the C heap (`calloc` and `free`)
#[derive(Debug, Clone, Copy, Default)]
#[non_exhaustive]
pub struct SystemMemory;

impl Address {
    /// Make an `Address` from a raw integer; `None` if it is zero
    pub fn new(raw: usize) -> Option<Self> {
        NonZeroUsize::new(raw).map(Address)
    }

    /// Return the raw integer value
    pub fn get(self) -> usize {
        self.0.get()
    }

    /// Return the address `offset` bytes further on
    ///
    /// `None` on overflow.
    pub fn checked_add(self, offset: usize) -> Option<Address> {
        self.0.checked_add(offset).map(Address)
    }
}

impl SystemMemory {
    /// Return a `SystemMemory`, ready to be handed to a [`ReclamationEngine`]
    pub fn shared() -> Arc<dyn NativeMemory> {
        Arc::new(SystemMemory)
    }
}

impl NativeMemory for SystemMemory {
    fn alloc(&self, size: usize) -> Result<Address, NativeAllocFailed> {
        // SAFETY: calloc has no preconditions.  A null return is handled below.
        let ptr = unsafe { libc::calloc(1, size) };
        Address::new(ptr as usize).ok_or_else(|| NativeAllocFailed::new(size))
    }

    unsafe fn free(&self, address: Address, _size: usize) {
        // SAFETY: the caller promises this came from our calloc, and is freed only once.
        unsafe { libc::free(address.get() as *mut libc::c_void) }
    }

    unsafe fn read(&self, address: Address, dst: &mut [u8]) {
        // SAFETY: the caller promises the source range is within a live block.
        // `dst` is a distinct Rust allocation, so the ranges cannot overlap.
        unsafe {
            ptr::copy_nonoverlapping(address.get() as *const u8, dst.as_mut_ptr(), dst.len());
        }
    }

    unsafe fn write(&self, address: Address, src: &[u8]) {
        // SAFETY: as for read.
        unsafe {
            ptr::copy_nonoverlapping(src.as_ptr(), address.get() as *mut u8, src.len());
        }
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

    #[test]
    fn address() {
        assert!(Address::new(0).is_none());
        let a = Address::new(0x1000).unwrap();
        assert_eq!(a.to_string(), "0x1000");
        assert_eq!(a.checked_add(0x10).unwrap().get(), 0x1010);
        assert!(Address::new(usize::MAX).unwrap().checked_add(1).is_none());
    }

    #[test]
    fn system_memory() {
        let mem = SystemMemory;
        let a = mem.alloc(64).unwrap();
        let mut buf = [0xff_u8; 64];
        unsafe {
            mem.read(a, &mut buf);
        }
        assert_eq!(buf, [0; 64], "calloc should zero");

        unsafe {
            mem.write(a.checked_add(8).unwrap(), b"native");
            mem.read(a.checked_add(8).unwrap(), &mut buf[0..6]);
            mem.free(a, 64);
        }
        assert_eq!(&buf[0..6], b"native");
    }
}
