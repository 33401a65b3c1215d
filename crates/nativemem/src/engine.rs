//! Reclamation engine
//!
//! Owns the reclamation queue (the generational [`Buckets`]),
//! the running totals, the budget, and the background worker thread.
//!
//! ### Locking
//!
//! There are two mutexes:
//!
//!  * `worker`, the lifecycle lock, serialises `start` and `stop`.
//!  * `state` guards the queue and counters.
//!    It is held only briefly: for delivery, dequeue, sweeps and snapshots.
//!    Native frees, calls to collectors and the fault handler,
//!    and budget operations, all happen without it.
//!
//! Lock order is `worker`, then `state`.
//! The budget semaphore's own lock never nests with either.

use crate::internal_prelude::*;

use crate::collect::Collectors;
use tor_config::ReconfigureError;

mod worker;

/// Name of the background worker thread
const WORKER_THREAD_NAME: &str = "nativemem-reclaim";

/// Longest single wait within `force_full_cleanup`, between calls to the collectors
const FORCE_CLEANUP_SLICE: Duration = Duration::from_millis(100);

/// Callback for reporting failures of reclamation
type FaultHandler = Arc<dyn Fn(&ReclaimCrashed) + Send + Sync>;

/// Lifecycle state of a [`ReclamationEngine`]'s background worker
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, derive_more::Display)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum Phase {
    /// No worker; callers waiting for cleanup drain the queue themselves
    #[display("stopped")]
    Stopped,

    /// Worker being spawned
    #[display("starting")]
    Starting,

    /// Worker running
    #[display("running")]
    Running,

    /// Worker draining the queue, and then exiting
    #[display("stopping")]
    Stopping,
}

/// Frees native blocks once no handle references them
///
/// Create one of these at startup (usually with [`launch`](ReclamationEngine::launch))
/// and pass the `Arc` to whatever needs to allocate.
/// Every [`Handle`](crate::Handle) keeps its engine alive.
///
/// The background worker holds only a weak reference,
/// so the engine (and the worker) go away when the last handle, and the last
/// other reference, are dropped.  Any tokens still queued are then freed synchronously.
#[derive(Educe)]
#[educe(Debug)]
pub struct ReclamationEngine {
    /// The native primitives
    memory: Arc<dyn NativeMemory>,

    /// Back-pressure
    budget: BudgetSemaphore,

    /// Queue, counters and phase
    state: Mutex<State>,

    /// Signalled when a token is delivered, or the phase changes
    ///
    /// The worker waits on this.
    delivered: Condvar,

    /// Signalled whenever the engine might have become drained,
    /// and when the worker begins a burst of processing
    ///
    /// `wait_for_full_cleanup` waits on this.
    drained: Condvar,

    /// The worker thread, if we have spawned one (lifecycle lock)
    worker: Mutex<Option<JoinHandle<()>>>,

    /// Registered collectors
    collectors: Collectors,

    /// Called when reclamation fails
    #[educe(Debug(ignore))]
    fault_handler: FaultHandler,
}

/// Mutable state of an engine
#[derive(Debug)]
struct State {
    /// Lifecycle
    phase: Phase,

    /// Current timings; can be changed by `reconfigure`
    timings: Timings,

    /// The reclamation queue
    buckets: Buckets,

    /// Tokens dequeued, whose free has not yet completed
    in_flight: usize,

    /// Are we in a burst of reclamation?
    ///
    /// Set by the worker when it dequeues a token, cleared after an idle tick.
    processing: bool,

    /// Has the worker dequeued anything since its last tick timed out?
    dequeued_since_tick: bool,

    /// When we last did a generational sweep
    last_sweep: Instant,

    /// Number of old tokens at the last sweep
    ///
    /// We warn only when this increases.
    old_reported: usize,

    /// Disposed of during the current burst, for logging
    burst: Tally,

    /// Freed by the engine, in total
    disposed: Tally,

    /// Freed by explicit release, in total
    released: Tally,

    /// Allocated and not yet freed
    live: Tally,
}

/// Marker indicating that the worker has finished normally
#[derive(Debug)]
struct TaskFinished;

impl Phase {
    /// Should the worker keep going even once the queue is empty?
    fn keeps_worker_alive(self) -> bool {
        match self {
            Phase::Starting | Phase::Running => true,
            Phase::Stopped | Phase::Stopping => false,
        }
    }
}

impl State {
    /// Nothing queued, and nothing being freed
    fn is_drained(&self) -> bool {
        self.buckets.is_empty() && self.in_flight == 0
    }
}

impl ReclamationEngine {
    /// Make a new engine, without starting its worker
    ///
    /// Until [`start`](ReclamationEngine::start) is called,
    /// unreferenced blocks are freed only when someone calls
    /// [`wait_for_full_cleanup`](ReclamationEngine::wait_for_full_cleanup)
    /// (or [`force_full_cleanup`](ReclamationEngine::force_full_cleanup)).
    ///
    /// Failures of reclamation are logged.
    pub fn new(config: &Config, memory: Arc<dyn NativeMemory>) -> Arc<Self> {
        Self::new_with_fault_handler(config, memory, |crashed| {
            error_report!(crashed.clone(), "native memory reclamation failed");
        })
    }

    /// Make a new engine, reporting failures of reclamation to `fault_handler`
    ///
    /// `fault_handler` is called on whichever thread observed the failure,
    /// without any of the engine's locks held.
    /// It must not call [`start`](ReclamationEngine::start) or [`stop`](ReclamationEngine::stop).
    pub fn new_with_fault_handler(
        config: &Config,
        memory: Arc<dyn NativeMemory>,
        fault_handler: impl Fn(&ReclaimCrashed) + Send + Sync + 'static,
    ) -> Arc<Self> {
        let state = State {
            phase: Phase::Stopped,
            timings: config.timings,
            buckets: Buckets::default(),
            in_flight: 0,
            processing: false,
            dequeued_since_tick: false,
            last_sweep: Instant::now(),
            old_reported: 0,
            burst: Tally::default(),
            disposed: Tally::default(),
            released: Tally::default(),
            live: Tally::default(),
        };
        Arc::new(ReclamationEngine {
            memory,
            budget: BudgetSemaphore::new(config.budget),
            state: Mutex::new(state),
            delivered: Condvar::new(),
            drained: Condvar::new(),
            worker: Mutex::new(None),
            collectors: Collectors::default(),
            fault_handler: Arc::new(fault_handler),
        })
    }

    /// Make a new engine and start its worker
    pub fn launch(
        config: &Config,
        memory: Arc<dyn NativeMemory>,
    ) -> Result<Arc<Self>, StartupError> {
        let engine = Self::new(config, memory);
        engine.start()?;
        Ok(engine)
    }

    /// Start the background worker
    ///
    /// Idempotent: does nothing if the worker is already running.
    /// Can be used to restart the engine after [`stop`](ReclamationEngine::stop),
    /// or after a failure.
    pub fn start(self: &Arc<Self>) -> Result<(), StartupError> {
        let mut worker = self.lock_worker();

        {
            let state = self.lock_state();
            if state.phase.keeps_worker_alive() {
                return Ok(());
            }
        }

        // A previous worker may still be finishing off (eg, stopped from within itself).
        if let Some(previous) = worker.take() {
            if let Err(previous) = join_unless_current(previous) {
                // Called on the stopping worker, which will exit once drained.
                *worker = Some(previous);
                return Err(StartupError::FromWorker);
            }
        }

        self.lock_state().phase = Phase::Starting;

        let weak = Arc::downgrade(self);
        let spawned = thread::Builder::new()
            .name(WORKER_THREAD_NAME.into())
            .spawn(move || worker::task(weak));

        let mut state = self.lock_state();
        match spawned {
            Ok(handle) => {
                *worker = Some(handle);
                if state.phase == Phase::Starting {
                    state.phase = Phase::Running;
                }
                info!(
                    "native memory reclamation started (budget {})",
                    DisplayBudget(self.budget.ceiling()),
                );
                Ok(())
            }
            Err(e) => {
                state.phase = Phase::Stopped;
                Err(e.into())
            }
        }
    }

    /// Stop the background worker
    ///
    /// The worker first drains the queue.
    /// Blocks until it has exited, unless called from the worker thread itself.
    ///
    /// Idempotent.
    pub fn stop(&self) {
        let mut worker = self.lock_worker();

        {
            let mut state = self.lock_state();
            if state.phase.keeps_worker_alive() {
                state.phase = Phase::Stopping;
            }
            self.delivered.notify_all();
        }

        let Some(handle) = worker.take() else {
            self.lock_state().phase = Phase::Stopped;
            return;
        };

        if let Err(handle) = join_unless_current(handle) {
            // We are the worker; it will exit once it has drained the queue.
            // Keep the handle, so that a later `start` waits for it.
            *worker = Some(handle);
            return;
        }

        let mut state = self.lock_state();
        state.phase = Phase::Stopped;
        info!("native memory reclamation stopped");
    }

    /// Is the background worker running?
    pub fn is_running(&self) -> bool {
        self.phase() == Phase::Running
    }

    /// Lifecycle state of the background worker
    pub fn phase(&self) -> Phase {
        self.lock_state().phase
    }

    /// The budget semaphore
    pub fn budget(&self) -> &BudgetSemaphore {
        &self.budget
    }

    /// The current configuration
    pub fn config(&self) -> Config {
        Config {
            budget: self.budget.ceiling(),
            timings: self.lock_state().timings,
        }
    }

    /// Wait until every unreferenced block has been freed
    ///
    /// Returns `true` if the queue is empty and no free is in progress;
    /// `false` if that did not happen before `timeout` (`None` means wait indefinitely).
    ///
    /// If the worker is not running, the calling thread frees queued blocks itself.
    pub fn wait_for_full_cleanup(&self, timeout: Option<Duration>) -> bool {
        let deadline = deadline_after(timeout);
        let mut state = self.lock_state();
        loop {
            if state.is_drained() {
                return true;
            }

            if !state.phase.keeps_worker_alive() && !state.buckets.is_empty() {
                drop(state);
                self.drain_here();
                state = self.lock_state();
                continue;
            }

            // Wait in slices of at most one tick, so that we notice
            // if the worker stops and we must drain ourselves.
            let tick = state.timings.tick;
            let slice = match remaining(deadline, tick) {
                Some(slice) => slice,
                None => return false,
            };
            state = self
                .drained
                .wait_timeout(state, slice)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Ask collectors to drop cached handles, and wait until everything unreferenced is freed
    ///
    /// Repeatedly calls [`release_unused`](IsCollectable::release_unused) on every
    /// registered collector, and waits for cleanup, until the engine is drained
    /// or `timeout` has elapsed (`None` means indefinitely).
    ///
    /// Returns whether the engine was drained.  Partial progress is not an error.
    pub fn force_full_cleanup(&self, timeout: Option<Duration>) -> bool {
        let t0 = Instant::now();
        let deadline = deadline_after(timeout);
        let mut passes: usize = 0;
        loop {
            passes += 1;
            let ncollectors = self.collectors.release_unused();
            let Some(slice) = remaining(deadline, FORCE_CLEANUP_SLICE) else {
                return self.wait_for_full_cleanup(Some(Duration::ZERO));
            };
            if self.wait_for_full_cleanup(Some(slice)) {
                debug!(
                    "native memory cleanup complete after {:?} ({} passes, {} collectors)",
                    t0.elapsed(),
                    passes,
                    ncollectors,
                );
                return true;
            }
        }
    }

    /// Register a collector, to be called by [`force_full_cleanup`](ReclamationEngine::force_full_cleanup)
    ///
    /// The engine holds only a weak reference.
    pub fn register_collector(&self, collector: Weak<dyn IsCollectable>) {
        self.collectors.register(collector);
    }

    /// Snapshot of the engine's state
    ///
    /// Also brings the generations up to date.
    pub fn diagnostics(&self) -> Diagnostics {
        let mut state = self.lock_state();
        self.sweep(&mut state, Instant::now());
        Diagnostics {
            phase: state.phase,
            processing: state.processing,
            young: state.buckets.tally(Generation::Young),
            aged: state.buckets.tally(Generation::Aged),
            old: state.buckets.tally(Generation::Old),
            in_flight: state.in_flight,
            disposed: state.disposed,
            released: state.released,
            live: state.live,
            permits_available: self.budget.available(),
            permits_ceiling: self.budget.ceiling(),
        }
    }

    /// Reconfigure
    ///
    /// The timings can be changed; the budget cannot.
    pub fn reconfigure(
        &self,
        new_config: &Config,
        how: tor_config::Reconfigure,
    ) -> Result<(), ReconfigureError> {
        use tor_config::Reconfigure;

        if new_config.budget != self.budget.ceiling() {
            how.cannot_change("budget")?;
        }

        match how {
            Reconfigure::CheckAllOrNothing => return Ok(()),
            Reconfigure::AllOrNothing | Reconfigure::WarnOnFailures => {}
            _ => Err(internal!("Reconfigure variant unknown! {how:?}"))?,
        }

        let mut state = self.lock_state();
        if state.timings != new_config.timings {
            state.timings = new_config.timings;
            info!("native memory reclamation reconfigured: {:?}", state.timings);
        }
        // The worker might be waiting with the old tick.
        self.delivered.notify_all();
        Ok(())
    }

    //---------- crate-internal interface, used by handles ----------

    /// Obtain a new native block, applying back-pressure
    ///
    /// Acquires permits (waiting for at most `wait`), forcing a cleanup if they
    /// still aren't available, then calls the native allocator.
    pub(crate) fn acquire_native(
        &self,
        size: usize,
        wait: Duration,
    ) -> Result<Address, AllocationError> {
        if size == 0 {
            return Err(AllocationError::ZeroSize);
        }
        if let Some(ceiling) = self.budget.ceiling() {
            if size > ceiling {
                return Err(AllocationError::ExceedsBudget {
                    requested: size,
                    ceiling,
                });
            }
        }

        let t0 = Instant::now();
        if !self.budget.acquire(size, wait) {
            let cleanup_timeout = self.lock_state().timings.cleanup_timeout;
            debug!(
                "native budget exhausted ({} bytes wanted, {} available): forcing cleanup",
                size,
                self.budget.available(),
            );
            if !self.cleanup_until_acquired(size, cleanup_timeout) {
                return Err(AllocationError::BudgetExhausted {
                    requested: size,
                    available: self.budget.available(),
                    waited: t0.elapsed(),
                });
            }
        }

        let address = match self.memory.alloc(size) {
            Ok(address) => address,
            Err(e) => {
                self.budget.release(size);
                return Err(e.into());
            }
        };
        self.lock_state().live.add(size);
        trace!("allocated native block {} ({} bytes)", address, size);
        Ok(address)
    }

    /// Free a block right away, on behalf of its owner
    ///
    /// # Safety
    ///
    /// `address` and `size` must describe a block obtained from
    /// [`acquire_native`](ReclamationEngine::acquire_native) on this engine,
    /// which has not been freed, and whose token will never be delivered.
    pub(crate) unsafe fn free_now(&self, address: Address, size: usize) {
        trace!("releasing native block {} ({} bytes)", address, size);
        // SAFETY: as promised by our caller
        unsafe { self.memory.free(address, size) };
        self.budget.release(size);
        let mut state = self.lock_state();
        state.released.add(size);
        state.live.sub(size);
    }

    /// Deliver the token for an unreferenced block, for the worker to free
    ///
    /// The caller promises that the block was allocated by this engine,
    /// that it has not been freed, and that no handle can access it any more.
    pub(crate) fn deliver(&self, address: Address, size: usize) {
        let mut state = self.lock_state();
        // Made under the lock, so that the young bucket stays in order.
        state.buckets.push(Token::new(address, size));
        trace!("delivered native block {} ({} bytes) for reclamation", address, size);
        self.delivered.notify_one();
    }

    /// The native primitives
    pub(crate) fn memory(&self) -> &dyn NativeMemory {
        &*self.memory
    }

    /// Default wait for budget
    pub(crate) fn allocation_wait(&self) -> Duration {
        self.lock_state().timings.allocation_wait
    }

    //---------- internal utilities ----------

    /// Force a cleanup until `size` permits can be acquired, or `timeout` elapses
    ///
    /// Like [`force_full_cleanup`](ReclamationEngine::force_full_cleanup),
    /// but stops as soon as the permits are ours, drained or not.
    /// Returns whether we acquired them.
    fn cleanup_until_acquired(&self, size: usize, timeout: Duration) -> bool {
        let deadline = deadline_after(Some(timeout));
        loop {
            let _: usize = self.collectors.release_unused();
            if !self.phase().keeps_worker_alive() {
                self.drain_here();
            }
            let Some(slice) = remaining(deadline, FORCE_CLEANUP_SLICE) else {
                return self.budget.try_acquire(size);
            };
            if self.budget.acquire(size, slice) {
                return true;
            }
        }
    }

    /// Bring the generations up to date
    ///
    /// Logs if more tokens than before are now old.
    fn sweep(&self, state: &mut State, now: Instant) {
        let promoted = state.buckets.sweep(now, &state.timings);
        state.last_sweep = now;
        if promoted.to_aged.count > 0 {
            trace!("native memory reclamation: {} tokens now aged", promoted.to_aged);
        }
        if promoted.to_old.count > 0 {
            trace!("native memory reclamation: {} tokens now old", promoted.to_old);
        }

        let old = state.buckets.tally(Generation::Old);
        if old.count > state.old_reported {
            warn!(
                "{} native blocks ({} bytes) have been awaiting reclamation for over {:?}; phase {}",
                old.count, old.bytes, state.timings.old_after, state.phase,
            );
        }
        state.old_reported = old.count;
    }

    /// Lock the state
    ///
    /// No user code runs with this lock held,
    /// so poisoning could only come from a bug in this module,
    /// after which the counters are still no worse than approximate.
    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take the lifecycle lock
    fn lock_worker(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.worker.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for ReclamationEngine {
    fn drop(&mut self) {
        // The worker (if any) will find it can no longer upgrade its reference, and exit.
        // Anything it hadn't got to, we free now.
        self.drain_here();
    }
}

/// Join a thread, unless it is the current one
///
/// Hands the handle back if it is the current thread's.
fn join_unless_current(handle: JoinHandle<()>) -> Result<(), JoinHandle<()>> {
    if handle.thread().id() == thread::current().id() {
        return Err(handle);
    }
    if handle.join().is_err() {
        error!("native memory reclamation worker thread panicked");
    }
    Ok(())
}

/// Convert an optional timeout into an optional deadline
///
/// `None` (or a timeout too large to represent) means no deadline.
fn deadline_after(timeout: Option<Duration>) -> Option<Instant> {
    timeout.and_then(|timeout| Instant::now().checked_add(timeout))
}

/// How long to wait next: the time until `deadline`, but no more than `max`
///
/// `None` if the deadline has passed.
fn remaining(deadline: Option<Instant>, max: Duration) -> Option<Duration> {
    match deadline {
        None => Some(max),
        Some(deadline) => {
            let left = deadline.saturating_duration_since(Instant::now());
            (!left.is_zero()).then(|| left.min(max))
        }
    }
}

/// Displays an optional budget
struct DisplayBudget(Option<usize>);

impl Display for DisplayBudget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(ceiling) => write!(f, "{} bytes", ceiling),
            None => write!(f, "unlimited"),
        }
    }
}
