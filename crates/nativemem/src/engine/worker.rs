//! Background reclamation worker, and the freeing of delivered tokens
//!
//! [`task`] is the body of the worker thread.
//! [`drain_here`](ReclamationEngine::drain_here) is the same work, done synchronously
//! by a caller, when there is no worker.

use super::*;

use std::ops::ControlFlow;

/// Body of the worker thread
///
/// Handles reporting of crashes.
pub(super) fn task(engine: Weak<ReclamationEngine>) {
    let outcome = catch_unwind(AssertUnwindSafe(|| task_loop(&engine)));
    let crashed = match outcome {
        Ok(Ok(TaskFinished)) => return,
        Ok(Err(crashed)) => crashed,
        Err(_panicked) => ReclaimCrashed::WorkerPanicked,
    };
    match engine.upgrade() {
        Some(engine) => engine.crashed(&crashed),
        None => error_report!(crashed, "native memory reclamation worker failed"),
    }
}

/// Main loop of the worker
fn task_loop(engine: &Weak<ReclamationEngine>) -> Result<TaskFinished, ReclaimCrashed> {
    loop {
        // We don't hold a strong reference while we loop around, so we notice
        // when the last handle and the last other reference have gone.
        let Some(engine) = engine.upgrade() else {
            return Ok(TaskFinished);
        };

        if let ControlFlow::Break(finished) = engine.step()? {
            return Ok(finished);
        }
    }
}

impl ReclamationEngine {
    /// Free one token, or wait up to one tick for one to arrive
    fn step(&self) -> Result<ControlFlow<TaskFinished>, ReclaimCrashed> {
        let mut state = self.lock_state();

        // Even when busy, keep the generations up to date.
        let now = Instant::now();
        if now.saturating_duration_since(state.last_sweep) >= state.timings.tick {
            self.sweep(&mut state, now);
        }

        if let Some(token) = state.buckets.pop_oldest() {
            state.in_flight += 1;
            state.dequeued_since_tick = true;
            if !state.processing {
                state.processing = true;
                self.drained.notify_all();
            }
            drop(state);
            self.dispose(token)?;
            return Ok(ControlFlow::Continue(()));
        }

        if !state.phase.keeps_worker_alive() {
            // Queue empty, and we've been asked to stop.
            state.phase = Phase::Stopped;
            self.go_idle(&mut state);
            return Ok(ControlFlow::Break(TaskFinished));
        }

        let tick = state.timings.tick;
        let (mut state, waited) = self
            .delivered
            .wait_timeout(state, tick)
            .unwrap_or_else(PoisonError::into_inner);

        if waited.timed_out() && !mem::take(&mut state.dequeued_since_tick) {
            // A whole tick with nothing to do.
            self.sweep(&mut state, Instant::now());
            self.go_idle(&mut state);
        }
        Ok(ControlFlow::Continue(()))
    }

    /// End a burst of processing, if we were in one, and wake waiters if we're drained
    fn go_idle(&self, state: &mut State) {
        if state.processing {
            state.processing = false;
            let burst = mem::take(&mut state.burst);
            debug!(
                "native memory reclamation idle, after freeing {} blocks ({} bytes)",
                burst.count, burst.bytes,
            );
        }
        if state.is_drained() {
            self.drained.notify_all();
        }
    }

    /// Free queued blocks on the calling thread, until the queue is empty
    ///
    /// Failures are reported to the fault handler; we carry on with the remaining tokens.
    pub(super) fn drain_here(&self) {
        loop {
            let token = {
                let mut state = self.lock_state();
                let Some(token) = state.buckets.pop_oldest() else {
                    return;
                };
                state.in_flight += 1;
                token
            };
            if let Err(crashed) = self.dispose(token) {
                self.crashed(&crashed);
            }
        }
    }

    /// Free the block described by a dequeued token, and do the accounting
    ///
    /// The caller must have counted `token` in `in_flight`.
    ///
    /// If the native free panics, the block is treated as gone,
    /// but its permits are not returned: the memory may have leaked.
    fn dispose(&self, token: Token) -> Result<(), ReclaimCrashed> {
        let Token { address, size, .. } = token;
        trace!("freeing native block {} ({} bytes)", address, size);

        let freed = catch_unwind(AssertUnwindSafe(|| {
            // SAFETY: a token is made only by `deliver`, which is called only when
            // the last reference to an unreleased block of ours has gone;
            // and each token is dequeued exactly once.
            unsafe { self.memory.free(address, size) }
        }));
        if freed.is_ok() {
            self.budget.release(size);
        }

        let mut state = self.lock_state();
        state.in_flight -= 1;
        let outcome = match freed {
            Ok(()) => {
                state.live.sub(size);
                state.disposed.add(size);
                // Callers draining synchronously aren't part of the worker's burst.
                if state.processing {
                    state.burst.add(size);
                }
                Ok(())
            }
            Err(_panicked) => Err(ReclaimCrashed::FreePanicked { address, size }),
        };
        if state.is_drained() {
            self.drained.notify_all();
        }
        outcome
    }

    /// Handle a failure: stop asynchronous reclamation, and call the fault handler
    fn crashed(&self, crashed: &ReclaimCrashed) {
        {
            let mut state = self.lock_state();
            state.phase = Phase::Stopped;
            state.processing = false;
            self.drained.notify_all();
        }
        if catch_unwind(AssertUnwindSafe(|| (self.fault_handler)(crashed))).is_err() {
            error!("native memory reclamation fault handler panicked");
        }
    }
}
