//! Handles onto native blocks
//!
//! A [`Handle`] is either unbound, or bound to a view (a sub-range)
//! of a shared [`Block`] record.
//! At most one handle is the block's owner.
//!
//! The `Block` is reference counted: every handle bound to it holds it.
//! Whichever of these happens first frees the native memory:
//!
//!  * the owner's explicit [`release`](Handle::release),
//!    which frees synchronously and marks the block freed;
//!  * the last handle letting go of the block without it having been released,
//!    whereupon `Block`'s `Drop` delivers a token to the engine.
//!
//! ### Locking
//!
//! Each handle's binding has its own mutex, held only to read or replace the binding.
//! Each block's `freed` flag is behind a `RwLock`:
//! accessors hold it shared while they touch native memory,
//! and release holds it exclusively while it frees.
//! We never hold a handle's lock while taking a block's lock,
//! nor while calling into the engine.
//! `transfer_ownership` takes two handle locks, in address order.

use crate::internal_prelude::*;

/// Handle onto (part of) a native memory block
///
/// Created unbound with [`Handle::new`], and then bound by
/// [`allocate`](Handle::allocate) (making it the owner of a fresh block)
/// or [`peer`](Handle::peer) (making it a non-owning view of another handle's block).
///
/// Dropping a handle is not a release.
/// If the owner is dropped (or rebound) without releasing,
/// the block is freed by the engine once no handle refers to it any more.
///
/// All methods take `&self`; a handle can be shared between threads.
#[derive(Educe)]
#[educe(Debug)]
pub struct Handle {
    /// Engine used for allocation
    #[educe(Debug(ignore))]
    engine: Arc<ReclamationEngine>,

    /// What we are bound to
    binding: Mutex<Binding>,
}

assert_impl_all!(Handle: Send, Sync);

/// A handle's binding
#[derive(Debug, Default)]
struct Binding {
    /// The view, if bound
    view: Option<View>,

    /// Are we the block's owner?
    ///
    /// Invariant: if `owner`, `view` is `Some`, and its block is not freed.
    /// At most one handle is owner of any block.
    owner: bool,

    /// May we write?
    readonly: bool,
}

/// A range within a block
#[derive(Debug, Clone)]
struct View {
    /// The block (the handle's keeper)
    block: Arc<Block>,

    /// Start of the view, relative to the start of the block
    offset: usize,

    /// Length of the view
    ///
    /// Invariant: `offset + len <= block.size`
    len: usize,
}

/// Shared record of a native block
///
/// Outlives every handle bound to it.
#[derive(Educe)]
#[educe(Debug)]
struct Block {
    /// The engine which allocated the block and will free it
    #[educe(Debug(ignore))]
    engine: Arc<ReclamationEngine>,

    /// Start of the block
    address: Address,

    /// Size of the block
    size: usize,

    /// Has the block been freed, by explicit release?
    freed: RwLock<bool>,
}

impl Block {
    /// Has the block been freed?
    fn is_freed(&self) -> bool {
        *self.freed.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Free the block now
    ///
    /// Called by (and only by) the owning handle, which then unbinds.
    fn release(&self) {
        let mut freed = self.freed.write().unwrap_or_else(PoisonError::into_inner);
        debug_assert!(!*freed, "native block {} released twice", self.address);
        if *freed {
            return;
        }
        // Set first: even if the free panics, it must never be attempted again.
        *freed = true;
        // SAFETY: we allocated this block from this engine (see `Handle::allocate_within`).
        // It has not been freed: `freed` was false, and we hold the write lock.
        // Its token will never be delivered: `Drop` checks `freed`.
        // No accessor is using it: they hold the read lock.
        unsafe { self.engine.free_now(self.address, self.size) };
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        let freed = *self.freed.get_mut().unwrap_or_else(PoisonError::into_inner);
        if !freed {
            self.engine.deliver(self.address, self.size);
        }
    }
}

impl View {
    /// Absolute address of `offset` within the view
    fn address_at(&self, offset: usize) -> Result<Address, Bug> {
        self.offset
            .checked_add(offset)
            .and_then(|offset| self.block.address.checked_add(offset))
            .ok_or_else(|| internal!("native view address overflow"))
    }
}

/// Define the fixed-size integer accessors
macro_rules! define_int_accessors { {
    $( $ty:ident: $read_be:ident, $read_le:ident, $write_be:ident, $write_le:ident; )*
} => { $(
    #[doc = concat!("Read a big-endian `", stringify!($ty), "` at `offset`")]
    pub fn $read_be(&self, offset: usize) -> crate::Result<$ty> {
        let mut buf = [0; mem::size_of::<$ty>()];
        self.read_bytes(offset, &mut buf)?;
        Ok($ty::from_be_bytes(buf))
    }

    #[doc = concat!("Read a little-endian `", stringify!($ty), "` at `offset`")]
    pub fn $read_le(&self, offset: usize) -> crate::Result<$ty> {
        let mut buf = [0; mem::size_of::<$ty>()];
        self.read_bytes(offset, &mut buf)?;
        Ok($ty::from_le_bytes(buf))
    }

    #[doc = concat!("Write a big-endian `", stringify!($ty), "` at `offset`")]
    pub fn $write_be(&self, offset: usize, value: $ty) -> crate::Result<()> {
        self.write_bytes(offset, &value.to_be_bytes())
    }

    #[doc = concat!("Write a little-endian `", stringify!($ty), "` at `offset`")]
    pub fn $write_le(&self, offset: usize, value: $ty) -> crate::Result<()> {
        self.write_bytes(offset, &value.to_le_bytes())
    }
)* } }

impl Handle {
    /// Make a new, unbound, handle
    pub fn new(engine: &Arc<ReclamationEngine>) -> Self {
        Handle {
            engine: engine.clone(),
            binding: Mutex::new(Binding::default()),
        }
    }

    /// Make a new handle owning a freshly allocated block of `size` bytes
    pub fn allocated(engine: &Arc<ReclamationEngine>, size: usize) -> crate::Result<Self> {
        let handle = Handle::new(engine);
        handle.allocate(size)?;
        Ok(handle)
    }

    /// Allocate a block of `size` bytes, and become its owner
    ///
    /// Any previous binding is released first.
    ///
    /// Waits for budget for at most the configured
    /// [`allocation_wait`](crate::ConfigBuilder::allocation_wait),
    /// then forces a cleanup; if there is still not enough, fails.
    pub fn allocate(&self, size: usize) -> crate::Result<()> {
        self.allocate_within(size, self.engine.allocation_wait())
    }

    /// Allocate a block of `size` bytes, waiting at most `wait` for budget
    ///
    /// Otherwise like [`allocate`](Handle::allocate).
    pub fn allocate_within(&self, size: usize, wait: Duration) -> crate::Result<()> {
        self.release();
        let address = self.engine.acquire_native(size, wait)?;
        let block = Arc::new(Block {
            engine: self.engine.clone(),
            address,
            size,
            freed: RwLock::new(false),
        });
        self.rebind(Binding {
            view: Some(View {
                block,
                offset: 0,
                len: size,
            }),
            owner: true,
            readonly: false,
        });
        Ok(())
    }

    /// Become a non-owning view of `length` bytes at `offset` within `source`
    ///
    /// Any previous binding is released first (freeing the block, if we owned it),
    /// but only once `source` has been checked.
    /// `source` is not modified.  Read-only-ness is inherited from `source`.
    ///
    /// Fails with [`UnboundHandleError`] if `source` is unbound (or its block has been freed),
    /// and with [`BoundsError`] if the range is not within `source`.
    pub fn peer(&self, source: &Handle, offset: usize, length: usize) -> crate::Result<()> {
        self.peer_range(source, offset, Some(length))
    }

    /// Become a non-owning view of the whole of `source`
    pub fn peer_all(&self, source: &Handle) -> crate::Result<()> {
        self.peer_range(source, 0, None)
    }

    /// Implementation of `peer` and `peer_all`
    ///
    /// `length` of `None` means the rest of `source`'s view,
    /// as it is when we look at it.
    fn peer_range(
        &self,
        source: &Handle,
        offset: usize,
        length: Option<usize>,
    ) -> crate::Result<()> {
        let (view, readonly) = {
            let src = source.lock();
            let src_view = src.view.as_ref().ok_or(UnboundHandleError)?;
            let length = length.unwrap_or_else(|| src_view.len.saturating_sub(offset));
            let _end = BoundsError::check(offset, length, src_view.len)?;
            let view = View {
                block: src_view.block.clone(),
                offset: src_view.offset + offset,
                len: length,
            };
            (view, src.readonly)
        };
        if view.block.is_freed() {
            return Err(UnboundHandleError.into());
        }
        self.rebind(Binding {
            view: Some(view),
            owner: false,
            readonly,
        });
        Ok(())
    }

    /// Release this handle's binding
    ///
    /// If we are the owner, the block is freed now, and its budget returned.
    /// Any peers remain bound, but can no longer access it.
    ///
    /// If we are not the owner, we simply let go of the block.
    ///
    /// Idempotent.
    pub fn release(&self) {
        self.rebind(Binding::default());
    }

    /// Take ownership of the block from `other`
    ///
    /// Succeeds only if `other` is the owner, and `self` is bound to
    /// the same block, at the same address.
    /// Then `self` becomes the owner, and `other` remains bound as a non-owning peer.
    ///
    /// Returns `false`, and changes nothing, otherwise.
    pub fn transfer_ownership(&self, other: &Handle) -> bool {
        if ptr::eq(self, other) {
            return false;
        }
        let (mut mine, mut theirs) = lock_pair(self, other);
        if !theirs.owner {
            return false;
        }
        let (Some(my_view), Some(their_view)) = (&mine.view, &theirs.view) else {
            return false;
        };
        if !Arc::ptr_eq(&my_view.block, &their_view.block) || my_view.offset != their_view.offset
        {
            return false;
        }
        debug_assert!(!mine.owner, "two owners of one native block");
        mine.owner = true;
        theirs.owner = false;
        true
    }

    /// Is this handle the owner of its block?
    pub fn is_owner(&self) -> bool {
        self.lock().owner
    }

    /// Is this handle read-only?
    pub fn is_readonly(&self) -> bool {
        self.lock().readonly
    }

    /// Make this handle read-only, or writeable
    ///
    /// A peer can be made read-only, but a read-only peer cannot be made writeable
    /// (fails with [`Error::ReadOnly`]).  The owner may do either.
    pub fn set_readonly(&self, readonly: bool) -> crate::Result<()> {
        let mut binding = self.lock();
        if binding.readonly && !readonly && !binding.owner {
            return Err(Error::ReadOnly);
        }
        binding.readonly = readonly;
        Ok(())
    }

    /// Is this handle bound to a block?
    ///
    /// The block may have been freed since; see [`is_live`](Handle::is_live).
    pub fn is_bound(&self) -> bool {
        self.lock().view.is_some()
    }

    /// Is this handle bound to a block which has not been freed?
    pub fn is_live(&self) -> bool {
        self.current_view().is_some_and(|view| !view.block.is_freed())
    }

    /// Start of this handle's view, or `None` if unbound
    pub fn address(&self) -> Option<Address> {
        self.current_view()
            .and_then(|view| view.address_at(0).ok())
    }

    /// Length of this handle's view; zero if unbound
    pub fn size(&self) -> usize {
        self.lock().view.as_ref().map_or(0, |view| view.len)
    }

    /// The engine this handle allocates from
    pub fn engine(&self) -> &Arc<ReclamationEngine> {
        &self.engine
    }

    //---------- accessors ----------

    /// Copy `dst.len()` bytes, starting at `offset`, out of the block
    pub fn read_bytes(&self, offset: usize, dst: &mut [u8]) -> crate::Result<()> {
        self.with_live(offset, dst.len(), false, |memory, address| {
            // SAFETY: `with_live` checked that the range is within the view,
            // which is within the block, which is live while we run.
            unsafe { memory.read(address, dst) }
        })
    }

    /// Copy `src` into the block, starting at `offset`
    ///
    /// Fails with [`Error::ReadOnly`] if this handle is read-only.
    pub fn write_bytes(&self, offset: usize, src: &[u8]) -> crate::Result<()> {
        self.with_live(offset, src.len(), true, |memory, address| {
            // SAFETY: as for read_bytes
            unsafe { memory.write(address, src) }
        })
    }

    /// Read the byte at `offset`
    pub fn read_u8(&self, offset: usize) -> crate::Result<u8> {
        let mut buf = [0];
        self.read_bytes(offset, &mut buf)?;
        Ok(buf[0])
    }

    /// Write the byte at `offset`
    pub fn write_u8(&self, offset: usize, value: u8) -> crate::Result<()> {
        self.write_bytes(offset, &[value])
    }

    define_int_accessors! {
        u16: read_u16_be, read_u16_le, write_u16_be, write_u16_le;
        u32: read_u32_be, read_u32_le, write_u32_be, write_u32_le;
        u64: read_u64_be, read_u64_le, write_u64_be, write_u64_le;
    }

    /// Set every byte of the view to `value`
    pub fn fill(&self, value: u8) -> crate::Result<()> {
        let len = self.size();
        self.write_bytes(0, &vec![value; len])
    }

    /// Copy the whole view out
    pub fn to_vec(&self) -> crate::Result<Vec<u8>> {
        let mut out = vec![0; self.size()];
        self.read_bytes(0, &mut out)?;
        Ok(out)
    }

    //---------- internals ----------

    /// Run `f` on the absolute address of `offset`, if the range is accessible
    ///
    /// Checks, in order: that we are bound to a live block, that we may write
    /// (if `write`), and that `length` bytes at `offset` are within our view.
    /// The block stays live until `f` returns.
    fn with_live<R>(
        &self,
        offset: usize,
        length: usize,
        write: bool,
        f: impl FnOnce(&dyn NativeMemory, Address) -> R,
    ) -> crate::Result<R> {
        let (view, readonly) = {
            let binding = self.lock();
            let view = binding.view.clone().ok_or(UnboundHandleError)?;
            (view, binding.readonly)
        };
        let freed = view
            .block
            .freed
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        if *freed {
            return Err(UnboundHandleError.into());
        }
        if write && readonly {
            return Err(Error::ReadOnly);
        }
        let _end = BoundsError::check(offset, length, view.len)?;
        let address = view.address_at(offset)?;
        let r = f(view.block.engine.memory(), address);
        drop(freed);
        Ok(r)
    }

    /// Replace our binding, releasing the old one
    ///
    /// If we owned the old block, it is freed.
    fn rebind(&self, new: Binding) {
        let old = mem::replace(&mut *self.lock(), new);
        if old.owner {
            if let Some(view) = &old.view {
                view.block.release();
            }
        }
    }

    /// Our current view, if any
    fn current_view(&self) -> Option<View> {
        self.lock().view.clone()
    }

    /// Lock the binding
    ///
    /// Nothing that can panic runs with this lock held, other than our own bookkeeping.
    fn lock(&self) -> MutexGuard<'_, Binding> {
        self.binding.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Lock two distinct handles' bindings, in a consistent order
///
/// Returns the guards in the order of the arguments.
fn lock_pair<'h>(
    a: &'h Handle,
    b: &'h Handle,
) -> (MutexGuard<'h, Binding>, MutexGuard<'h, Binding>) {
    if (a as *const Handle) < (b as *const Handle) {
        let ga = a.lock();
        let gb = b.lock();
        (ga, gb)
    } else {
        let gb = b.lock();
        let ga = a.lock();
        (ga, gb)
    }
}
