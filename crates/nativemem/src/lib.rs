#![cfg_attr(docsrs, feature(doc_auto_cfg, doc_cfg))]
#![doc = include_str!("../README.md")]

//! ## Intended behaviour
//!
//! An allocation through a [`Handle`] consumes permits from the engine's
//! [`BudgetSemaphore`] and obtains a block from the [`NativeMemory`] primitives.
//! The handle becomes the block's *owner*.
//!
//! Other handles can *peer* onto the block (or onto a sub-range of it).
//! Peers hold the shared block record strongly, so the record outlives them.
//!
//! The block is freed exactly once, in one of two ways:
//!
//!  * **Explicitly**: the owner calls [`Handle::release`].
//!    The native memory is freed synchronously and the permits are returned.
//!    Peers which are still around stay bound,
//!    but every access through them fails with [`UnboundHandleError`].
//!
//!  * **Asynchronously**: the last handle referencing the block is dropped
//!    without an explicit release.
//!    A tracking token is delivered to the engine's reclamation queue,
//!    and the background worker frees it.
//!
//! ## Key concepts
//!
//!  * **Tracking token**: `(address, size, enqueue time)`.
//!    Everything needed to free a block, without the handles.
//!
//!  * **Generations**: delivered tokens age through three buckets
//!    (young, aged, old).  A token reaching the old bucket means
//!    reclamation is not keeping up (or the engine was never started);
//!    we log a warning.
//!
//!  * **Drained**: all buckets empty and no free in progress.
//!    [`ReclamationEngine::wait_for_full_cleanup`] waits for this.
//!
//!  * **Back-pressure**: when the budget is exhausted, allocation blocks
//!    for at most [`allocation_wait`](ConfigBuilder::allocation_wait),
//!    then forces a cleanup, then fails with [`AllocationError`].
//!
//! ## Ownership and Arc keeping-alive
//!
//! ```text
//!     Handle (owner) ====> Arc<Block> <==== Handle (peer)
//!                              ||
//!                              \/
//!                    Arc<ReclamationEngine> ----> worker thread
//!                                                 (holds only a Weak)
//! ```
//!
//! Dropping the last `Arc<Block>` delivers its token.
//! The worker holds only a weak reference to the engine,
//! so dropping every handle and every engine reference shuts it down.

// @@ begin lint list @@
#![warn(missing_docs)]
#![warn(noop_method_call)]
#![warn(unreachable_pub)]
#![warn(clippy::all)]
#![deny(clippy::await_holding_lock)]
#![deny(clippy::cast_lossless)]
#![deny(clippy::checked_conversions)]
#![warn(clippy::cognitive_complexity)]
#![deny(clippy::debug_assert_with_mut_call)]
#![deny(clippy::exhaustive_enums)]
#![deny(clippy::exhaustive_structs)]
#![deny(clippy::expl_impl_clone_on_copy)]
#![deny(clippy::fallible_impl_from)]
#![deny(clippy::implicit_clone)]
#![deny(clippy::large_stack_arrays)]
#![warn(clippy::manual_ok_or)]
#![deny(clippy::missing_docs_in_private_items)]
#![warn(clippy::needless_borrow)]
#![warn(clippy::needless_pass_by_value)]
#![warn(clippy::option_option)]
#![deny(clippy::print_stderr)]
#![deny(clippy::print_stdout)]
#![warn(clippy::rc_buffer)]
#![deny(clippy::ref_option_ref)]
#![warn(clippy::semicolon_if_nothing_returned)]
#![warn(clippy::trait_duplication_in_bounds)]
#![deny(clippy::unchecked_duration_subtraction)]
#![deny(clippy::unnecessary_wraps)]
#![warn(clippy::unseparated_literal_suffix)]
#![deny(clippy::unwrap_used)]
#![allow(clippy::let_unit_value)] // This can reasonably be done for explicitness
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::significant_drop_in_scrutinee)]
#![allow(clippy::result_large_err)]
#![allow(clippy::needless_raw_string_hashes)] // complained-about code is fine, often best
//! <!-- @@ end lint list @@ -->

// Internal supporting modules
mod internal_prelude;
#[cfg(test)]
mod testing;

// Modules with public items
mod budget;
mod collect;
mod config;
mod diag;
mod engine;
mod error;
mod generation;
mod handle;
mod native;
mod token;

//---------- re-exports at the crate root ----------

pub use budget::BudgetSemaphore;
pub use collect::IsCollectable;
pub use config::{Config, ConfigBuilder};
pub use diag::{Diagnostics, Tally};
pub use engine::{Phase, ReclamationEngine};
pub use error::{
    AllocationError, BoundsError, Error, NativeAllocFailed, ReclaimCrashed, StartupError,
    UnboundHandleError,
};
pub use generation::Generation;
pub use handle::Handle;
pub use native::{Address, NativeMemory, SystemMemory};

/// `Result` whose `Err` is [`nativemem::Error`](Error)
pub type Result<T> = std::result::Result<T, Error>;
