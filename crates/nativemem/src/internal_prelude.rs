//! Internal prelude
//!
//! This file contains most of the imports we wish to use, throughout this crate.
//!
//! Every module does `use crate::internal_prelude::*;`
//!
//! Exceptions:
//!
//!  * Names that are private to a module and its submodules
//!    are imported to the sub-modules via `use super::*`.
//!    (Thus, the sub-module inherits the prelude from its parent.)

#![allow(unused_imports)]

pub(crate) use std::{
    collections::VecDeque,
    fmt::{self, Debug, Display},
    mem,
    num::NonZeroUsize,
    panic::{AssertUnwindSafe, catch_unwind},
    ptr,
    sync::{
        Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock, Weak,
        atomic::{AtomicUsize, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

pub(crate) use {
    derive_deftly::{Deftly, define_derive_deftly},
    educe::Educe,
    serde::{Deserialize, Serialize},
    static_assertions::assert_impl_all,
    thiserror::Error,
    tracing::{debug, error, info, trace, warn},
};

pub(crate) use {
    tor_config::ConfigBuildError,
    tor_error::{Bug, ErrorKind, HasKind, error_report, internal},
};

pub(crate) use crate::{
    budget::BudgetSemaphore,
    collect::IsCollectable,
    config::{Config, Timings},
    diag::{Diagnostics, Tally},
    engine::{Phase, ReclamationEngine},
    error::{
        AllocationError, BoundsError, Error, NativeAllocFailed, ReclaimCrashed, StartupError,
        UnboundHandleError,
    },
    generation::{Buckets, Generation},
    native::{Address, NativeMemory},
    token::Token,
};
