use std::sync::{
    Arc, Condvar, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak,
};
use std::time::Instant;

use crate::core::module::Module;
use crate::error::{SchedulerError, SchedulerResult};
use crate::scheduling::group::{
    adopt_members, Attachment, Group, GroupMember, MIN_REMAINING_TIME,
};
use crate::timing::predictor::{BiasedEmaPredictor, TimeSpanPredictor};
use crate::timing::waiter::{self, SmartCvWaiter};

/// Executes its members strictly in order, one stage at a time.
///
/// A stage finishes when its member is done: a module once it has run, a
/// subgroup once it reports `is_done()`. Member *i + 1* never overlaps
/// member *i*; inside a subgroup stage several workers may still cooperate.
pub struct SequentialGroup {
    members: Vec<GroupMember>,
    state: RwLock<SeqState>,
    bus: Mutex<()>,
    cv: Condvar,
    wait_helper: SmartCvWaiter,
    attachment: Attachment,
}

struct SeqState {
    /// `None` before the first stage of an iteration.
    current: Option<usize>,
    current_runs: u32,
    running_threads: u32,
    last_module_start: Instant,
    last_module_higher: f64,
    last_module_lower: f64,
    /// Bumped by [`Group::notify_waiters`]; parked waits snapshot it and
    /// return spuriously when it advances.
    wake_epoch: u64,
    iteration_start: Option<Instant>,
    iteration_higher: BiasedEmaPredictor,
    iteration_lower: BiasedEmaPredictor,
}

/// Decrements `running_threads` and wakes waiters on scope exit, panics
/// included. The bus mutex is taken before the state write so parked
/// waiters observe the decrement after waking.
struct RunningGuard<'a> {
    group: &'a SequentialGroup,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        {
            let _bus = waiter::lock_bus(&self.group.bus);
            self.group.write_state().running_threads -= 1;
        }
        self.group.cv.notify_all();
    }
}

impl SequentialGroup {
    /// Creates the group and becomes the parent of every member, in order.
    /// Rolls the whole adoption back and fails if any member already has a
    /// different parent.
    pub fn new(members: Vec<GroupMember>) -> SchedulerResult<Arc<Self>> {
        let group = Arc::new(Self {
            members,
            state: RwLock::new(SeqState {
                current: None,
                current_runs: 0,
                running_threads: 0,
                last_module_start: Instant::now(),
                last_module_higher: 0.0,
                last_module_lower: 0.0,
                wake_epoch: 0,
                iteration_start: None,
                iteration_higher: BiasedEmaPredictor::higher_band(0.0),
                iteration_lower: BiasedEmaPredictor::lower_band(0.0),
            }),
            bus: Mutex::new(()),
            cv: Condvar::new(),
            wait_helper: SmartCvWaiter::new(),
            attachment: Attachment::new(),
        });
        let dyn_group: Arc<dyn Group> = group.clone();
        let weak: Weak<dyn Group> = Arc::downgrade(&dyn_group);
        adopt_members(&group.members, &weak)?;
        Ok(group)
    }

    fn stage_finished(&self, state: &SeqState) -> bool {
        match state.current {
            None => false,
            Some(index) => match &self.members[index] {
                GroupMember::Module(_) => state.current_runs > 0,
                GroupMember::Group(group) => group.is_done(),
            },
        }
    }

    fn should_advance(&self, state: &SeqState) -> bool {
        if state.running_threads != 0 {
            return false;
        }
        match state.current {
            None => !self.members.is_empty(),
            Some(index) => index + 1 < self.members.len() && self.stage_finished(state),
        }
    }

    fn should_run_module(&self, state: &SeqState, budget: f64) -> bool {
        if state.running_threads != 0 || state.current_runs != 0 {
            return false;
        }
        match state.current {
            Some(index) => match &self.members[index] {
                GroupMember::Module(module) => {
                    budget == 0.0 || module.predict_higher_execution_time() <= budget
                }
                GroupMember::Group(_) => false,
            },
            None => false,
        }
    }

    /// Budget to hand to the current subgroup stage, or `None` when the
    /// stage should not be entered. A done subgroup is only re-entered while
    /// threads still drain out of it, and then with the budget clamped to
    /// the predicted tail; a clamp below the sentinel declines the attempt
    /// to avoid wasteful spins.
    fn group_attempt_budget(&self, state: &SeqState, budget: f64) -> Option<f64> {
        let index = state.current?;
        let group = match &self.members[index] {
            GroupMember::Group(group) => group,
            GroupMember::Module(_) => return None,
        };
        if !group.is_done() {
            return Some(budget);
        }
        if state.running_threads == 0 {
            return None;
        }
        let tail = self.lower_remaining(state);
        let effective = if budget == 0.0 { tail } else { budget.min(tail) };
        if effective < MIN_REMAINING_TIME {
            None
        } else {
            Some(effective)
        }
    }

    fn is_run_available_with(&self, state: &SeqState, budget: f64) -> bool {
        if self.should_advance(state) {
            return true;
        }
        match state.current.map(|index| &self.members[index]) {
            Some(GroupMember::Module(module)) => {
                self.should_run_module(state, budget) && module.is_available()
            }
            Some(GroupMember::Group(group)) => match self.group_attempt_budget(state, budget) {
                Some(effective) => group.is_run_available(effective),
                None => false,
            },
            None => false,
        }
    }

    fn is_done_with(&self, state: &SeqState) -> bool {
        if state.running_threads != 0 {
            return false;
        }
        match state.current {
            None => self.members.is_empty(),
            Some(index) => index + 1 == self.members.len() && self.stage_finished(state),
        }
    }

    fn higher_remaining(&self, state: &SeqState) -> f64 {
        self.remaining(state, state.last_module_higher, |group| {
            group.predict_higher_remaining_execution_time()
        })
    }

    fn lower_remaining(&self, state: &SeqState) -> f64 {
        self.remaining(state, state.last_module_lower, |group| {
            group.predict_lower_remaining_execution_time()
        })
    }

    fn remaining(
        &self,
        state: &SeqState,
        module_prediction: f64,
        group_remaining: impl Fn(&Arc<dyn Group>) -> f64,
    ) -> f64 {
        if state.running_threads == 0 {
            return 0.0;
        }
        let Some(index) = state.current else {
            return 0.0;
        };
        match &self.members[index] {
            GroupMember::Module(_) => {
                let elapsed = state.last_module_start.elapsed().as_secs_f64();
                (module_prediction - elapsed).max(MIN_REMAINING_TIME)
            }
            GroupMember::Group(group) => group_remaining(group).max(MIN_REMAINING_TIME),
        }
    }

    fn wait_impl(&self, budget: f64, max_waiting_time: f64, include_done: bool) {
        enum Target {
            Ready,
            Module(Arc<Module>),
            Group {
                group: Arc<dyn Group>,
                effective: f64,
                draining: bool,
            },
            Park,
        }

        let start = Instant::now();
        let target = {
            let state = self.read_state();
            if self.is_run_available_with(&state, budget)
                || (include_done && self.is_done_with(&state))
            {
                Target::Ready
            } else {
                match state.current.map(|index| &self.members[index]) {
                    Some(GroupMember::Group(group)) => {
                        match self.group_attempt_budget(&state, budget) {
                            Some(effective) => Target::Group {
                                group: Arc::clone(group),
                                effective,
                                draining: group.is_done(),
                            },
                            None => Target::Park,
                        }
                    }
                    Some(GroupMember::Module(module))
                        if state.running_threads == 0
                            && state.current_runs == 0
                            && !module.is_available() =>
                    {
                        Target::Module(Arc::clone(module))
                    }
                    _ => Target::Park,
                }
            }
        };

        // Remaining deadline relative to the caller's request; `None` once
        // it has already expired. Zero keeps meaning "no limit".
        let remaining = |limit: f64| -> Option<f64> {
            if limit == 0.0 {
                return Some(0.0);
            }
            let left = limit - start.elapsed().as_secs_f64();
            (left > 0.0).then_some(left)
        };

        match target {
            Target::Ready => {}
            Target::Module(module) => {
                if let Some(left) = remaining(max_waiting_time) {
                    module.wait_for_availability(left);
                }
            }
            Target::Group {
                group,
                effective,
                draining,
            } => {
                if let Some(mut left) = remaining(max_waiting_time) {
                    if draining {
                        // The subgroup is only being drained: the final
                        // completion may already have been announced, so an
                        // open-ended wait could sleep through it. The
                        // predicted tail bounds the wait instead.
                        let bound = effective.max(MIN_REMAINING_TIME);
                        left = if left == 0.0 { bound } else { left.min(bound) };
                    }
                    group.wait_for_run_availability(effective, left);
                }
            }
            Target::Park => {
                let wake_epoch = self.read_state().wake_epoch;
                let predicate = || {
                    let state = self.read_state();
                    state.wake_epoch != wake_epoch
                        || self.is_run_available_with(&state, budget)
                        || self.group_attempt_budget(&state, budget).is_some()
                        || (include_done && self.is_done_with(&state))
                };
                let guard = waiter::lock_bus(&self.bus);
                if max_waiting_time == 0.0 {
                    let _guard = waiter::wait_unbounded(&self.cv, guard, predicate);
                } else if let Some(left) = remaining(max_waiting_time) {
                    let _ = waiter::bounded_wait(&self.wait_helper, &self.cv, guard, left, predicate);
                }
            }
        }
    }

    fn read_state(&self) -> RwLockReadGuard<'_, SeqState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, SeqState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Group for SequentialGroup {
    fn run_next(&self, max_estimated_execution_time: f64) -> bool {
        let mut state = self.write_state();
        if self.should_advance(&state) {
            state.current = Some(state.current.map_or(0, |index| index + 1));
            state.current_runs = 0;
        }

        let member = state.current.map(|index| self.members[index].clone());
        match member {
            Some(GroupMember::Module(module))
                if self.should_run_module(&state, max_estimated_execution_time) =>
            {
                let token = module.acquire_token();
                if !token.may_run() {
                    return false;
                }
                state.current_runs += 1;
                state.running_threads += 1;
                state.last_module_start = Instant::now();
                state.last_module_higher = module.predict_higher_execution_time();
                state.last_module_lower = module.predict_lower_execution_time();
                drop(state);

                let _running = RunningGuard { group: self };
                token.run();
                true
            }
            Some(GroupMember::Group(group)) => {
                let Some(effective) =
                    self.group_attempt_budget(&state, max_estimated_execution_time)
                else {
                    return false;
                };
                state.running_threads += 1;
                drop(state);

                let _running = RunningGuard { group: self };
                group.run_next(effective)
            }
            _ => false,
        }
    }

    fn is_run_available(&self, max_estimated_execution_time: f64) -> bool {
        let state = self.read_state();
        self.is_run_available_with(&state, max_estimated_execution_time)
    }

    fn wait_for_run_availability(&self, max_estimated_execution_time: f64, max_waiting_time: f64) {
        self.wait_impl(max_estimated_execution_time, max_waiting_time, false);
    }

    fn wait_for_availability(&self, max_estimated_execution_time: f64, max_waiting_time: f64) {
        self.wait_impl(max_estimated_execution_time, max_waiting_time, true);
    }

    fn is_done(&self) -> bool {
        let state = self.read_state();
        self.is_done_with(&state)
    }

    fn start_next_iteration(&self) -> SchedulerResult<()> {
        if !self.is_done() {
            return Err(SchedulerError::IterationNotDone);
        }
        self.reset_iteration();
        Ok(())
    }

    fn predict_higher_remaining_execution_time(&self) -> f64 {
        let state = self.read_state();
        self.higher_remaining(&state)
    }

    fn predict_lower_remaining_execution_time(&self) -> f64 {
        let state = self.read_state();
        self.lower_remaining(&state)
    }

    fn predict_higher_execution_time(&self) -> f64 {
        self.read_state().iteration_higher.predict()
    }

    fn predict_lower_execution_time(&self) -> f64 {
        self.read_state().iteration_lower.predict()
    }

    fn members(&self) -> &[GroupMember] {
        &self.members
    }

    fn attachment(&self) -> &Attachment {
        &self.attachment
    }

    fn reset_iteration(&self) {
        let completed = self.is_done();
        {
            let _bus = waiter::lock_bus(&self.bus);
            let mut state = self.write_state();
            if completed {
                if let Some(iteration_start) = state.iteration_start {
                    let elapsed = iteration_start.elapsed().as_secs_f64();
                    state.iteration_higher.observe(elapsed);
                    state.iteration_lower.observe(elapsed);
                }
            }
            state.iteration_start = Some(Instant::now());
            state.current = None;
            state.current_runs = 0;
        }
        self.cv.notify_all();

        for member in &self.members {
            if let GroupMember::Group(group) = member {
                group.reset_iteration();
            }
        }
    }

    fn notify_waiters(&self) {
        {
            let _bus = waiter::lock_bus(&self.bus);
            self.write_state().wake_epoch += 1;
        }
        self.cv.notify_all();

        for member in &self.members {
            if let GroupMember::Group(group) = member {
                group.notify_waiters();
            }
        }
    }
}
