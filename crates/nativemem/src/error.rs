//! Errors arising from native handles and their reclamation

use crate::internal_prelude::*;

/// An error occurring when using a [`Handle`](crate::Handle)
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum Error {
    /// Could not obtain a native block
    #[error("{0}")]
    Allocation(#[from] AllocationError),

    /// A range fell outside the handle's view
    #[error("{0}")]
    Bounds(#[from] BoundsError),

    /// The handle is not bound to a live native block
    #[error("{0}")]
    Unbound(#[from] UnboundHandleError),

    /// Attempted to write through a read-only handle
    #[error("attempted to write through a read-only native handle")]
    ReadOnly,

    /// Bug
    #[error("internal error")]
    Bug(#[from] Bug),
}

/// A native block could not be allocated
///
/// Allocation failures are recoverable:
/// a caller may retry after [`force_full_cleanup`](crate::ReclamationEngine::force_full_cleanup),
/// or ask for less.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum AllocationError {
    /// Zero-sized blocks are not supported
    #[error("refusing to allocate a zero-sized native block")]
    ZeroSize,

    /// The request can never be satisfied within the configured budget
    #[error("requested {requested} bytes, more than the whole native memory budget of {ceiling}")]
    ExceedsBudget {
        /// Bytes requested
        requested: usize,
        /// The configured ceiling
        ceiling: usize,
    },

    /// The budget stayed exhausted, even after waiting and forcing a cleanup
    #[error(
        "native memory budget exhausted: requested {requested} bytes, {available} available after waiting {waited:?}"
    )]
    BudgetExhausted {
        /// Bytes requested
        requested: usize,
        /// Bytes available when we gave up
        available: usize,
        /// How long we waited, in total
        waited: Duration,
    },

    /// The native allocation primitive failed
    #[error("{0}")]
    Native(#[from] NativeAllocFailed),
}

/// The native allocation primitive could not provide a block
///
/// Returned by implementations of [`NativeMemory::alloc`](crate::NativeMemory::alloc).
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
#[error("native allocator could not provide {size} bytes")]
pub struct NativeAllocFailed {
    /// Bytes requested
    pub size: usize,
}

/// A range fell outside a handle's view
#[derive(Debug, Clone, Copy, Eq, PartialEq, Error)]
#[non_exhaustive]
#[error("range of {length} bytes at offset {offset} is outside a native view of {size} bytes")]
pub struct BoundsError {
    /// Start of the requested range, relative to the handle
    pub offset: usize,
    /// Length of the requested range
    pub length: usize,
    /// Size of the handle's view
    pub size: usize,
}

/// A handle was used while not bound to a live native block
///
/// Either the handle was never bound, it was released,
/// or it is a peer whose block has since been released by its owner.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default, Error)]
#[non_exhaustive]
#[error("native handle is not bound to a live block")]
pub struct UnboundHandleError;

/// An error occurring when starting a [`ReclamationEngine`](crate::ReclamationEngine)
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum StartupError {
    /// Thread spawn failed
    #[error("couldn't spawn reclamation worker thread")]
    Spawn(#[source] Arc<std::io::Error>),

    /// `start` was called on the worker thread, while that worker was stopping
    #[error("cannot restart reclamation from within its own stopping worker")]
    FromWorker,
}

/// The reclamation worker (or a caller draining on its behalf) failed
///
/// Handed to the engine's fault handler.
/// After this, asynchronous reclamation has stopped;
/// explicit releases, and draining by callers, still work.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum ReclaimCrashed {
    /// The native free primitive panicked
    ///
    /// The block is treated as freed (it may have leaked),
    /// and its permits are not returned to the budget.
    #[error("native free of {size} bytes at {address} panicked")]
    FreePanicked {
        /// Address passed to the free primitive
        address: Address,
        /// Size passed to the free primitive
        size: usize,
    },

    /// The worker loop itself panicked
    #[error("reclamation worker panicked")]
    WorkerPanicked,

    /// Bug
    #[error("internal error")]
    Bug(#[from] Bug),
}

impl NativeAllocFailed {
    /// Report that `size` bytes could not be allocated
    pub fn new(size: usize) -> Self {
        NativeAllocFailed { size }
    }
}

impl BoundsError {
    /// Check that `length` bytes at `offset` lie within a view of `size` bytes
    ///
    /// Returns the end of the range.
    pub(crate) fn check(offset: usize, length: usize, size: usize) -> Result<usize, BoundsError> {
        offset
            .checked_add(length)
            .filter(|end| *end <= size)
            .ok_or(BoundsError {
                offset,
                length,
                size,
            })
    }
}

impl From<std::io::Error> for StartupError {
    fn from(e: std::io::Error) -> StartupError {
        StartupError::Spawn(Arc::new(e))
    }
}

impl HasKind for Error {
    fn kind(&self) -> ErrorKind {
        use Error as E;
        use ErrorKind as EK;
        match self {
            E::Allocation(e) => e.kind(),
            E::Bounds(e) => e.kind(),
            E::Unbound(e) => e.kind(),
            E::ReadOnly => EK::BadApiUsage,
            E::Bug(e) => e.kind(),
        }
    }
}

impl HasKind for AllocationError {
    fn kind(&self) -> ErrorKind {
        use AllocationError as AE;
        use ErrorKind as EK;
        match self {
            AE::ZeroSize => EK::BadApiUsage,
            AE::ExceedsBudget { .. } => EK::LocalResourceExhausted,
            AE::BudgetExhausted { .. } => EK::LocalResourceExhausted,
            AE::Native(_) => EK::LocalResourceExhausted,
        }
    }
}

impl HasKind for BoundsError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::BadApiUsage
    }
}

impl HasKind for UnboundHandleError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::BadApiUsage
    }
}

impl HasKind for StartupError {
    fn kind(&self) -> ErrorKind {
        match self {
            StartupError::Spawn(_) => ErrorKind::LocalResourceExhausted,
            StartupError::FromWorker => ErrorKind::BadApiUsage,
        }
    }
}

impl HasKind for ReclaimCrashed {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Internal
    }
}
