use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crate::error::{SchedulerError, SchedulerResult};
use crate::scheduling::driver::LoopHandle;
use crate::scheduling::group::{Attachment, Group};
use crate::timing::predictor::{BiasedEmaPredictor, TimeSpanPredictor};
use crate::timing::waiter::{self, SmartCvWaiter};

/// User code run by the scheduler once per iteration of the enclosing group.
///
/// Bodies are shared across worker threads; a `Parallel` module may have
/// overlapping `on_run` calls, so mutable state goes through interior
/// mutability (atomics, locks, channels).
///
/// # Example
/// ```rust,ignore
/// struct Physics {
///     steps: AtomicUsize,
/// }
///
/// impl ModuleBody for Physics {
///     fn on_run(&self) {
///         self.steps.fetch_add(1, Ordering::Relaxed);
///     }
/// }
/// ```
pub trait ModuleBody: Send + Sync {
    /// The module's work for one run.
    fn on_run(&self);

    /// Extra gate consulted by the `ExclusiveCustom` and `ParallelCustom`
    /// policies. Must be cheap and must not call back into the scheduler.
    fn can_run(&self) -> bool {
        true
    }

    /// Called with the payload of a panic that escaped `on_run`. The default
    /// swallows it; a panic thrown from the handler itself is swallowed too.
    fn handle_panic(&self, _payload: &(dyn Any + Send)) {}
}

/// When a module is permitted to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanRunPolicy {
    /// At most one concurrent execution.
    Exclusive,
    /// Any number of concurrent executions.
    Parallel,
    /// As `Exclusive`, and the body's `can_run` must also agree.
    ExclusiveCustom,
    /// Concurrent executions gated only by the body's `can_run`.
    ParallelCustom,
}

struct ModuleState {
    /// Always true for the parallel policies.
    is_available: bool,
    higher_predictor: Box<dyn TimeSpanPredictor>,
    lower_predictor: Box<dyn TimeSpanPredictor>,
}

/// A runnable leaf of the group tree.
///
/// Wraps a [`ModuleBody`] with the exclusivity policy, the two
/// execution-time prediction bands, the availability wake-up bus, and the
/// parent/loop attachment slots. Shared as `Arc<Module>` between the
/// application and the scheduler.
pub struct Module {
    policy: CanRunPolicy,
    body: Box<dyn ModuleBody>,
    state: RwLock<ModuleState>,
    availability_bus: Mutex<()>,
    availability_cv: Condvar,
    wait_helper: SmartCvWaiter,
    attachment: Attachment,
    idling: AtomicBool,
}

impl Module {
    /// Creates a module with the default biased-EMA prediction bands.
    pub fn new(policy: CanRunPolicy, body: impl ModuleBody + 'static) -> Self {
        Self::with_predictors(
            policy,
            body,
            Box::new(BiasedEmaPredictor::higher_band(0.0)),
            Box::new(BiasedEmaPredictor::lower_band(0.0)),
        )
    }

    /// Creates a module with caller-supplied prediction bands.
    pub fn with_predictors(
        policy: CanRunPolicy,
        body: impl ModuleBody + 'static,
        higher_predictor: Box<dyn TimeSpanPredictor>,
        lower_predictor: Box<dyn TimeSpanPredictor>,
    ) -> Self {
        Self {
            policy,
            body: Box::new(body),
            state: RwLock::new(ModuleState {
                is_available: true,
                higher_predictor,
                lower_predictor,
            }),
            availability_bus: Mutex::new(()),
            availability_cv: Condvar::new(),
            wait_helper: SmartCvWaiter::new(),
            attachment: Attachment::new(),
            idling: AtomicBool::new(false),
        }
    }

    pub fn policy(&self) -> CanRunPolicy {
        self.policy
    }

    /// Claims permission for one run, reserving it until the token is
    /// consumed by [`RunningToken::run`] or dropped.
    pub fn acquire_token(&self) -> RunningToken<'_> {
        let may_run = match self.policy {
            CanRunPolicy::Parallel => true,
            CanRunPolicy::ParallelCustom => self.body.can_run(),
            CanRunPolicy::Exclusive | CanRunPolicy::ExclusiveCustom => {
                let mut state = self.write_state();
                if state.is_available
                    && (self.policy == CanRunPolicy::Exclusive || self.body.can_run())
                {
                    state.is_available = false;
                    true
                } else {
                    false
                }
            }
        };
        RunningToken {
            module: self,
            may_run,
        }
    }

    /// Whether a token acquired right now would be allowed to run.
    ///
    /// Cheap and optimistic: for the custom policies the answer may be stale
    /// by the time a token is actually acquired.
    pub fn is_available(&self) -> bool {
        match self.policy {
            CanRunPolicy::Parallel => true,
            CanRunPolicy::ParallelCustom => self.body.can_run(),
            CanRunPolicy::Exclusive => self.read_state().is_available,
            CanRunPolicy::ExclusiveCustom => self.read_state().is_available && self.body.can_run(),
        }
    }

    /// Parks until the module looks available or the deadline expires.
    /// May return spuriously. `max_waiting_time` of 0 waits forever.
    pub fn wait_for_availability(&self, max_waiting_time: f64) {
        if self.is_available() {
            return;
        }
        let guard = waiter::lock_bus(&self.availability_bus);
        if max_waiting_time == 0.0 {
            let _guard = waiter::wait_unbounded(&self.availability_cv, guard, || {
                self.is_available()
            });
        } else if max_waiting_time > 0.0 {
            let _ = waiter::bounded_wait(
                &self.wait_helper,
                &self.availability_cv,
                guard,
                max_waiting_time,
                || self.is_available(),
            );
        }
    }

    /// The higher (conservative) predicted execution time, in seconds.
    pub fn predict_higher_execution_time(&self) -> f64 {
        self.read_state().higher_predictor.predict()
    }

    /// The lower (optimistic) predicted execution time, in seconds.
    pub fn predict_lower_execution_time(&self) -> f64 {
        self.read_state().lower_predictor.predict()
    }

    /// The group this module currently belongs to, if any.
    pub fn parent(&self) -> Option<Arc<dyn Group>> {
        self.attachment.parent()
    }

    /// A handle on the enclosing loop, if the module is attached to one.
    pub fn loop_handle(&self) -> Option<LoopHandle> {
        self.attachment.loop_core().map(LoopHandle::new)
    }

    /// Yields this thread to the loop for at least `min_waiting_time`
    /// seconds: instead of sleeping, the thread keeps dispatching other
    /// modules through the root group. Preferred over [`Module::start_idling`].
    ///
    /// Call from inside `on_run` when the module conceptually blocks.
    pub fn idle(&self, min_waiting_time: f64) -> SchedulerResult<()> {
        let core = self
            .attachment
            .loop_core()
            .ok_or(SchedulerError::NotInLoop)?;
        let root = core.architecture();
        let start = Instant::now();
        loop {
            let remaining = min_waiting_time - start.elapsed().as_secs_f64();
            if remaining <= 0.0 {
                return Ok(());
            }
            if !root.run_next(remaining) {
                root.wait_for_availability(remaining, remaining);
            }
        }
    }

    /// Spawns a background thread that yields to the loop until the returned
    /// token is stopped or dropped.
    ///
    /// `max_waiting_time_after_stop` bounds each dispatch step (and thus how
    /// long [`IdlingToken::stop`] can block). A `total_max_waiting_time` of 0
    /// idles until stopped. Single-shot: while a token is live, further
    /// calls return an inert token.
    pub fn start_idling(
        self: &Arc<Self>,
        max_waiting_time_after_stop: f64,
        total_max_waiting_time: f64,
    ) -> SchedulerResult<IdlingToken> {
        let core = self
            .attachment
            .loop_core()
            .ok_or(SchedulerError::NotInLoop)?;
        if self
            .idling
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            log::trace!("start_idling called while already idling; returning inert token");
            return Ok(IdlingToken::inert());
        }

        let should_stop = Arc::new(Mutex::new(false));
        let thread_stop = Arc::clone(&should_stop);
        let weak_core = Arc::downgrade(&core);
        let handle = thread::spawn(move || {
            let start = Instant::now();
            loop {
                let step = if total_max_waiting_time == 0.0 {
                    max_waiting_time_after_stop
                } else {
                    let remaining = total_max_waiting_time - start.elapsed().as_secs_f64();
                    if remaining <= 0.0 {
                        return;
                    }
                    remaining.min(max_waiting_time_after_stop)
                };
                let Some(core) = weak_core.upgrade() else {
                    return;
                };
                let root = core.architecture();
                if !root.run_next(step) {
                    root.wait_for_availability(step, step * 0.25);
                }
                if *thread_stop.lock().unwrap_or_else(PoisonError::into_inner) {
                    return;
                }
            }
        });

        Ok(IdlingToken {
            module: Arc::downgrade(self),
            should_stop,
            handle: Some(handle),
        })
    }

    pub(crate) fn attachment(&self) -> &Attachment {
        &self.attachment
    }

    /// Restores availability and wakes every waiter. The bus mutex is taken
    /// before the state write so a parked waiter cannot observe the old
    /// state after the notification.
    fn restore_availability(&self) {
        {
            let _bus = waiter::lock_bus(&self.availability_bus);
            self.write_state().is_available = true;
        }
        self.availability_cv.notify_all();
    }

    fn read_state(&self) -> RwLockReadGuard<'_, ModuleState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, ModuleState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A scoped reservation authorising exactly one run of a module.
///
/// Move semantics make the single-use discipline structural: `run` consumes
/// the token. Dropping a token that still holds an exclusivity claim
/// releases the claim and notifies waiters.
pub struct RunningToken<'a> {
    module: &'a Module,
    may_run: bool,
}

impl RunningToken<'_> {
    /// Whether running is permitted. Resolved when the token was acquired.
    pub fn may_run(&self) -> bool {
        self.may_run
    }

    /// Runs the module body once, if permitted. Returns whether it ran.
    ///
    /// Availability is restored and waiters are notified on every exit path,
    /// a panicking body included. The measured duration trains both
    /// prediction bands.
    pub fn run(mut self) -> bool {
        if !self.may_run {
            return false;
        }
        // The claim is consumed here; the drop below must not release it again.
        self.may_run = false;
        let module = self.module;

        struct AvailabilityGuard<'a>(&'a Module);
        impl Drop for AvailabilityGuard<'_> {
            fn drop(&mut self) {
                self.0.restore_availability();
            }
        }
        let _restore = AvailabilityGuard(module);

        let start = Instant::now();
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| module.body.on_run())) {
            log::trace!("module body panicked; routing the payload to handle_panic");
            let _ = catch_unwind(AssertUnwindSafe(|| module.body.handle_panic(&*payload)));
        }
        let elapsed = start.elapsed().as_secs_f64();

        let mut state = module.write_state();
        state.higher_predictor.observe(elapsed);
        state.lower_predictor.observe(elapsed);
        true
    }
}

impl Drop for RunningToken<'_> {
    fn drop(&mut self) {
        if self.may_run
            && matches!(
                self.module.policy,
                CanRunPolicy::Exclusive | CanRunPolicy::ExclusiveCustom
            )
        {
            self.module.restore_availability();
        }
    }
}

/// Scoped handle on a background idling thread started by
/// [`Module::start_idling`]. Stopping (or dropping) signals the thread and
/// joins it.
pub struct IdlingToken {
    module: Weak<Module>,
    should_stop: Arc<Mutex<bool>>,
    handle: Option<JoinHandle<()>>,
}

impl IdlingToken {
    fn inert() -> Self {
        Self {
            module: Weak::new(),
            should_stop: Arc::new(Mutex::new(true)),
            handle: None,
        }
    }

    /// Stops idling. Only the first call has an effect.
    pub fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        *self
            .should_stop
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = true;
        let _ = handle.join();
        if let Some(module) = self.module.upgrade() {
            module.idling.store(false, Ordering::Release);
        }
    }
}

impl Drop for IdlingToken {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Counting {
        runs: AtomicUsize,
    }

    impl Counting {
        fn new() -> Self {
            Self {
                runs: AtomicUsize::new(0),
            }
        }
    }

    impl ModuleBody for Counting {
        fn on_run(&self) {
            self.runs.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn exclusive_token_blocks_second_acquisition() {
        let module = Module::new(CanRunPolicy::Exclusive, Counting::new());
        let first = module.acquire_token();
        assert!(first.may_run());
        let second = module.acquire_token();
        assert!(!second.may_run());
        drop(second);
        // The losing token must not have released the winner's claim.
        assert!(!module.is_available());
        drop(first);
        assert!(module.is_available());
    }

    #[test]
    fn parallel_tokens_always_run() {
        let module = Module::new(CanRunPolicy::Parallel, Counting::new());
        let a = module.acquire_token();
        let b = module.acquire_token();
        assert!(a.may_run());
        assert!(b.may_run());
        assert!(module.is_available());
    }

    #[test]
    fn run_restores_availability_and_trains_predictors() {
        let module = Module::new(CanRunPolicy::Exclusive, Counting::new());
        assert_eq!(module.predict_higher_execution_time(), 0.0);
        let token = module.acquire_token();
        assert!(!module.is_available());
        assert!(token.run());
        assert!(module.is_available());
        assert!(module.predict_higher_execution_time() > 0.0);
    }

    struct Gated {
        open: AtomicBool,
    }

    impl ModuleBody for Gated {
        fn on_run(&self) {}
        fn can_run(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn custom_policies_consult_the_predicate() {
        let module = Module::new(
            CanRunPolicy::ExclusiveCustom,
            Gated {
                open: AtomicBool::new(false),
            },
        );
        assert!(!module.is_available());
        let token = module.acquire_token();
        assert!(!token.may_run());
        // A vetoed acquisition must not have claimed exclusivity.
        drop(token);
        let state_available = module.read_state().is_available;
        assert!(state_available);

        let parallel = Module::new(
            CanRunPolicy::ParallelCustom,
            Gated {
                open: AtomicBool::new(true),
            },
        );
        assert!(parallel.acquire_token().may_run());
    }

    struct Exploding {
        handled: AtomicUsize,
    }

    impl ModuleBody for Exploding {
        fn on_run(&self) {
            panic!("boom");
        }
        fn handle_panic(&self, _payload: &(dyn Any + Send)) {
            self.handled.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn panic_is_contained_and_availability_restored() {
        let module = Arc::new(Module::new(
            CanRunPolicy::Exclusive,
            Exploding {
                handled: AtomicUsize::new(0),
            },
        ));
        for _ in 0..3 {
            let token = module.acquire_token();
            assert!(token.may_run());
            assert!(token.run());
            assert!(module.is_available());
        }
    }

    #[test]
    fn waiting_thread_wakes_when_claim_released() {
        let module = Arc::new(Module::new(CanRunPolicy::Exclusive, Counting::new()));
        let token = module.acquire_token();
        assert!(token.may_run());

        let waiter_module = Arc::clone(&module);
        let handle = thread::spawn(move || {
            waiter_module.wait_for_availability(0.0);
            waiter_module.is_available()
        });
        thread::sleep(std::time::Duration::from_millis(20));
        drop(token);
        assert!(handle.join().unwrap());
    }

    #[test]
    fn idle_without_loop_fails() {
        let module = Module::new(CanRunPolicy::Exclusive, Counting::new());
        assert_eq!(module.idle(0.01), Err(SchedulerError::NotInLoop));
    }
}
