use std::collections::{HashMap, VecDeque};
use std::sync::{
    Arc, Condvar, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak,
};
use std::time::Instant;

use crate::core::module::RunningToken;
use crate::error::{SchedulerError, SchedulerResult};
use crate::scheduling::group::{
    adopt_members, Attachment, Group, GroupMember, MIN_REMAINING_TIME,
};
use crate::timing::predictor::{BiasedEmaPredictor, TimeSpanPredictor};
use crate::timing::waiter::{self, SmartCvWaiter};

/// A [`ParallelGroup`] member together with its re-run allowance.
///
/// After the mandatory first run of an iteration, the member is enqueued
/// `run_shares_after_first` more times on the secondary queue; those copies
/// only run while the iteration has no mandatory work left.
#[derive(Clone)]
pub struct ParallelMember {
    member: GroupMember,
    run_shares_after_first: u32,
}

impl ParallelMember {
    /// A member that runs exactly once per iteration.
    pub fn new(member: impl Into<GroupMember>) -> Self {
        Self::with_shares(member, 0)
    }

    pub fn with_shares(member: impl Into<GroupMember>, run_shares_after_first: u32) -> Self {
        Self {
            member: member.into(),
            run_shares_after_first,
        }
    }

    pub fn member(&self) -> &GroupMember {
        &self.member
    }

    pub fn run_shares_after_first(&self) -> u32 {
        self.run_shares_after_first
    }
}

struct ModuleRunInfo {
    run_count: u32,
    start: Instant,
    higher: f64,
    lower: f64,
}

struct ParState {
    /// Members that still owe their mandatory run this iteration.
    main_queue: VecDeque<usize>,
    /// Re-run shares, cycled to the back after each run.
    secondary_queue: VecDeque<usize>,
    running_modules: HashMap<usize, ModuleRunInfo>,
    running_groups: HashMap<usize, u32>,
    running_threads: u32,
    /// Bumped whenever a run finishes anywhere inside; waiters use a
    /// snapshot of it as their wake-up salt.
    notify_counter: u64,
    iteration_start: Option<Instant>,
    iteration_higher: BiasedEmaPredictor,
    iteration_lower: BiasedEmaPredictor,
}

/// Executes its members concurrently, in two phases per iteration: every
/// member runs once off the main queue, then re-run shares run off the
/// secondary queue while workers would otherwise starve.
///
/// `is_done()` turns true as soon as the main queue empties; members might
/// still be running then, so when this group is the root, the tail of one
/// iteration may overlap the head of the next.
pub struct ParallelGroup {
    members: Vec<ParallelMember>,
    /// Same members without the share counts, for [`Group::members`].
    flat_members: Vec<GroupMember>,
    /// When set, a done subgroup whose whole-iteration prediction fits the
    /// budget is recycled mid-iteration to keep workers busy.
    extend_iteration: bool,
    state: RwLock<ParState>,
    bus: Mutex<()>,
    cv: Condvar,
    wait_helper: SmartCvWaiter,
    attachment: Attachment,
}

enum RunSlot {
    Module(usize),
    Group(usize),
}

/// Releases the running bookkeeping and wakes waiters on scope exit, panics
/// included.
struct RunGuard<'a> {
    group: &'a ParallelGroup,
    slot: RunSlot,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        {
            let _bus = waiter::lock_bus(&self.group.bus);
            let mut state = self.group.write_state();
            state.running_threads -= 1;
            state.notify_counter += 1;
            match self.slot {
                RunSlot::Module(index) => {
                    if let Some(info) = state.running_modules.get_mut(&index) {
                        info.run_count -= 1;
                        if info.run_count == 0 {
                            state.running_modules.remove(&index);
                        }
                    }
                }
                RunSlot::Group(index) => {
                    if let Some(count) = state.running_groups.get_mut(&index) {
                        *count -= 1;
                        if *count == 0 {
                            state.running_groups.remove(&index);
                        }
                    }
                }
            }
        }
        self.group.cv.notify_all();
    }
}

impl ParallelGroup {
    /// Creates the group and becomes the parent of every member. Rolls the
    /// whole adoption back and fails if any member already has a different
    /// parent.
    pub fn new(members: Vec<ParallelMember>) -> SchedulerResult<Arc<Self>> {
        Self::build(members, false)
    }

    /// As [`ParallelGroup::new`], with iteration extension enabled: done
    /// subgroups are restarted mid-iteration when their predicted cost fits
    /// the budget. Trades iteration cleanliness for worker utilisation when
    /// the enclosing scheduler is sequential.
    pub fn with_iteration_extension(members: Vec<ParallelMember>) -> SchedulerResult<Arc<Self>> {
        Self::build(members, true)
    }

    fn build(members: Vec<ParallelMember>, extend_iteration: bool) -> SchedulerResult<Arc<Self>> {
        let flat_members: Vec<GroupMember> =
            members.iter().map(|m| m.member.clone()).collect();
        let member_count = members.len();
        let group = Arc::new(Self {
            members,
            flat_members,
            extend_iteration,
            state: RwLock::new(ParState {
                main_queue: (0..member_count).collect(),
                secondary_queue: VecDeque::new(),
                running_modules: HashMap::new(),
                running_groups: HashMap::new(),
                running_threads: 0,
                notify_counter: 0,
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
        adopt_members(&group.flat_members, &weak)?;
        Ok(group)
    }

    /// Commits the running bookkeeping for a claimed module, releases the
    /// lock, and runs it. The token was acquired under the state lock.
    /// `publish_sweep` broadcasts queue changes made earlier in the walk
    /// before the possibly long run starts.
    fn execute_module(
        &self,
        mut state: RwLockWriteGuard<'_, ParState>,
        index: usize,
        higher: f64,
        lower: f64,
        token: RunningToken<'_>,
        publish_sweep: bool,
    ) -> bool {
        let now = Instant::now();
        let info = state
            .running_modules
            .entry(index)
            .or_insert_with(|| ModuleRunInfo {
                run_count: 0,
                start: now,
                higher: 0.0,
                lower: 0.0,
            });
        info.run_count += 1;
        info.start = now;
        info.higher = higher;
        info.lower = lower;
        state.running_threads += 1;
        drop(state);
        if publish_sweep {
            self.publish();
        }

        let _running = RunGuard {
            group: self,
            slot: RunSlot::Module(index),
        };
        token.run();
        true
    }

    /// Commits the running bookkeeping for a subgroup recursion, releases
    /// the lock, and recurses. The walk cannot resume afterwards: while the
    /// lock was released other workers may have reshaped the queues.
    fn execute_group(
        &self,
        mut state: RwLockWriteGuard<'_, ParState>,
        index: usize,
        group: Arc<dyn Group>,
        budget: f64,
        publish_sweep: bool,
    ) -> bool {
        *state.running_groups.entry(index).or_insert(0) += 1;
        state.running_threads += 1;
        drop(state);
        if publish_sweep {
            self.publish();
        }

        let _running = RunGuard {
            group: self,
            slot: RunSlot::Group(index),
        };
        group.run_next(budget)
    }

    /// Barrier against a waiter evaluating its predicate right now, then
    /// broadcast state already committed under the write lock.
    fn publish(&self) {
        drop(waiter::lock_bus(&self.bus));
        self.cv.notify_all();
    }

    fn is_run_available_with(&self, state: &ParState, budget: f64) -> bool {
        for &index in &state.main_queue {
            match &self.members[index].member {
                GroupMember::Module(module) => {
                    let admitted =
                        budget == 0.0 || module.predict_higher_execution_time() <= budget;
                    if admitted && module.is_available() {
                        return true;
                    }
                }
                GroupMember::Group(group) => {
                    // A done subgroup still in the main queue can always be
                    // swept out, which is progress in itself.
                    if group.is_done() || group.is_run_available(budget) {
                        return true;
                    }
                }
            }
        }
        for &index in &state.secondary_queue {
            match &self.members[index].member {
                GroupMember::Module(module) => {
                    let admitted =
                        budget == 0.0 || module.predict_higher_execution_time() <= budget;
                    if admitted && module.is_available() {
                        return true;
                    }
                }
                GroupMember::Group(group) => {
                    if self.extend_iteration
                        && (budget == 0.0 || group.predict_higher_execution_time() <= budget)
                    {
                        return true;
                    }
                }
            }
        }
        false
    }

    fn wait_impl(&self, budget: f64, max_waiting_time: f64, include_done: bool) {
        let start = Instant::now();
        let snapshot = {
            let state = self.read_state();
            if self.is_run_available_with(&state, budget)
                || (include_done && state.main_queue.is_empty())
            {
                return;
            }
            state.notify_counter
        };

        let predicate = || {
            let state = self.read_state();
            state.notify_counter != snapshot
                || self.is_run_available_with(&state, budget)
                || (include_done && state.main_queue.is_empty())
        };
        let guard = waiter::lock_bus(&self.bus);
        if max_waiting_time == 0.0 {
            let _guard = waiter::wait_unbounded(&self.cv, guard, predicate);
        } else if max_waiting_time > 0.0 {
            let left = max_waiting_time - start.elapsed().as_secs_f64();
            if left > 0.0 {
                let _ = waiter::bounded_wait(&self.wait_helper, &self.cv, guard, left, predicate);
            }
        }
    }

    fn read_state(&self) -> RwLockReadGuard<'_, ParState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, ParState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Group for ParallelGroup {
    fn run_next(&self, max_estimated_execution_time: f64) -> bool {
        let budget = max_estimated_execution_time;
        let mut state = self.write_state();
        let mut swept = false;

        // Phase one: mandatory runs, front to back.
        let mut pos = 0;
        while pos < state.main_queue.len() {
            let index = state.main_queue[pos];
            match &self.members[index].member {
                GroupMember::Module(module) => {
                    if budget != 0.0 && module.predict_higher_execution_time() > budget {
                        pos += 1;
                        continue;
                    }
                    let token = module.acquire_token();
                    if !token.may_run() {
                        pos += 1;
                        continue;
                    }
                    state.main_queue.remove(pos);
                    for _ in 0..self.members[index].run_shares_after_first {
                        state.secondary_queue.push_back(index);
                    }
                    let higher = module.predict_higher_execution_time();
                    let lower = module.predict_lower_execution_time();
                    return self.execute_module(state, index, higher, lower, token, swept);
                }
                GroupMember::Group(group) => {
                    if group.is_done() {
                        state.main_queue.remove(pos);
                        for _ in 0..self.members[index].run_shares_after_first {
                            state.secondary_queue.push_back(index);
                        }
                        // Sweeping can flip is_done; waiters must hear
                        // about it even though nothing ran.
                        state.notify_counter += 1;
                        swept = true;
                        // The slot at `pos` now holds the next entry.
                        continue;
                    }
                    // Only recurse when the subgroup has work within the
                    // budget; an ineligible subgroup must not shadow
                    // eligible members behind it in the queue.
                    if !group.is_run_available(budget) {
                        pos += 1;
                        continue;
                    }
                    let group = Arc::clone(group);
                    return self.execute_group(state, index, group, budget, swept);
                }
            }
        }

        // Phase two: re-run shares.
        let mut pos = 0;
        while pos < state.secondary_queue.len() {
            let index = state.secondary_queue[pos];
            match &self.members[index].member {
                GroupMember::Module(module) => {
                    if budget != 0.0 && module.predict_higher_execution_time() > budget {
                        pos += 1;
                        continue;
                    }
                    let token = module.acquire_token();
                    if !token.may_run() {
                        pos += 1;
                        continue;
                    }
                    state.secondary_queue.remove(pos);
                    state.secondary_queue.push_back(index);
                    let higher = module.predict_higher_execution_time();
                    let lower = module.predict_lower_execution_time();
                    return self.execute_module(state, index, higher, lower, token, swept);
                }
                GroupMember::Group(group) => {
                    if self.extend_iteration
                        && (budget == 0.0 || group.predict_higher_execution_time() <= budget)
                    {
                        let group = Arc::clone(group);
                        if group.start_next_iteration().is_ok() {
                            state.secondary_queue.remove(pos);
                            state.main_queue.push_back(index);
                            return self.execute_group(state, index, group, budget, swept);
                        }
                    }
                    pos += 1;
                }
            }
        }

        drop(state);
        if swept {
            self.publish();
        }
        false
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
        self.read_state().main_queue.is_empty()
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
        if state.running_threads == 0 {
            return 0.0;
        }
        let mut worst: f64 = 0.0;
        for info in state.running_modules.values() {
            worst = worst.max(info.higher - info.start.elapsed().as_secs_f64());
        }
        for index in state.running_groups.keys() {
            if let GroupMember::Group(group) = &self.members[*index].member {
                worst = worst.max(group.predict_higher_remaining_execution_time());
            }
        }
        worst.max(MIN_REMAINING_TIME)
    }

    fn predict_lower_remaining_execution_time(&self) -> f64 {
        let state = self.read_state();
        if state.running_threads == 0 {
            return 0.0;
        }
        let mut worst: f64 = 0.0;
        for info in state.running_modules.values() {
            worst = worst.max(info.lower - info.start.elapsed().as_secs_f64());
        }
        for index in state.running_groups.keys() {
            if let GroupMember::Group(group) = &self.members[*index].member {
                worst = worst.max(group.predict_lower_remaining_execution_time());
            }
        }
        worst.max(MIN_REMAINING_TIME)
    }

    fn predict_higher_execution_time(&self) -> f64 {
        self.read_state().iteration_higher.predict()
    }

    fn predict_lower_execution_time(&self) -> f64 {
        self.read_state().iteration_lower.predict()
    }

    fn members(&self) -> &[GroupMember] {
        &self.flat_members
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
            state.main_queue = (0..self.members.len()).collect();
            state.secondary_queue.clear();
        }
        self.cv.notify_all();

        for member in &self.flat_members {
            if let GroupMember::Group(group) = member {
                group.reset_iteration();
            }
        }
    }

    fn notify_waiters(&self) {
        {
            let _bus = waiter::lock_bus(&self.bus);
            // Parked waits compare against their counter snapshot, so the
            // bump alone forces them to return.
            self.write_state().notify_counter += 1;
        }
        self.cv.notify_all();

        for member in &self.flat_members {
            if let GroupMember::Group(group) = member {
                group.notify_waiters();
            }
        }
    }
}
