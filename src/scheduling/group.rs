use std::sync::{Arc, Mutex, PoisonError, Weak};

use crate::core::module::Module;
use crate::error::{SchedulerError, SchedulerResult};
use crate::scheduling::driver::LoopCore;

/// Remaining-time floor, in seconds, reported while any work is in flight.
/// Also the threshold below which a clamped budget is considered useless.
pub(crate) const MIN_REMAINING_TIME: f64 = 0.000_001;

mod sealed {
    pub trait Sealed {}
    impl Sealed for crate::scheduling::sequential::SequentialGroup {}
    impl Sealed for crate::scheduling::parallel::ParallelGroup {}
}

/// A node of the scheduling tree that composes modules and other groups.
///
/// Implemented by [`SequentialGroup`](crate::scheduling::SequentialGroup)
/// and [`ParallelGroup`](crate::scheduling::ParallelGroup) only; the trait
/// is sealed because the loop driver relies on the implementations upholding
/// the topology and progress invariants.
///
/// All budget and waiting-time parameters are seconds; `0.0` means "no
/// limit". A non-zero budget forbids starting any module whose *higher*
/// predicted execution time exceeds it.
pub trait Group: Send + Sync + sealed::Sealed {
    /// Attempts to advance the iteration by one module execution.
    /// Returns whether work happened.
    fn run_next(&self, max_estimated_execution_time: f64) -> bool;

    /// Whether a module is immediately runnable under the budget.
    fn is_run_available(&self, max_estimated_execution_time: f64) -> bool;

    /// Whether a module is immediately runnable, or the iteration is done.
    fn is_available(&self, max_estimated_execution_time: f64) -> bool {
        self.is_run_available(max_estimated_execution_time) || self.is_done()
    }

    /// Parks until [`Group::is_run_available`] looks true or the deadline
    /// expires. May return spuriously.
    fn wait_for_run_availability(&self, max_estimated_execution_time: f64, max_waiting_time: f64);

    /// Parks until [`Group::is_available`] looks true or the deadline
    /// expires. May return spuriously.
    fn wait_for_availability(&self, max_estimated_execution_time: f64, max_waiting_time: f64);

    /// Whether the current iteration has completed. Worker threads may still
    /// be draining out of the subtree when this turns true.
    fn is_done(&self) -> bool;

    /// Resets this group and, recursively, every member group to a fresh
    /// iteration. Fails with [`SchedulerError::IterationNotDone`] unless
    /// [`Group::is_done`] holds.
    fn start_next_iteration(&self) -> SchedulerResult<()>;

    /// Conservative estimate, in seconds, of how long the work currently in
    /// flight will take. `0.0` iff nothing is running; otherwise at least
    /// a 1 µs sentinel.
    fn predict_higher_remaining_execution_time(&self) -> f64;

    /// Optimistic counterpart of
    /// [`Group::predict_higher_remaining_execution_time`].
    fn predict_lower_remaining_execution_time(&self) -> f64;

    /// Conservative whole-iteration prediction, trained at iteration
    /// boundaries.
    fn predict_higher_execution_time(&self) -> f64;

    /// Optimistic whole-iteration prediction.
    fn predict_lower_execution_time(&self) -> f64;

    /// The member list, in construction order.
    fn members(&self) -> &[GroupMember];

    #[doc(hidden)]
    fn attachment(&self) -> &Attachment;

    /// Unconditional recursive iteration reset, used internally by
    /// `start_next_iteration` once the precondition has been checked at the
    /// call boundary. Descendants may legally still have draining threads.
    #[doc(hidden)]
    fn reset_iteration(&self);

    /// Broadcasts on this subtree's wake-up buses, forcing every parked
    /// wait to return (spuriously if need be) so callers re-check their
    /// surroundings. The loop driver uses this when a stop is requested.
    #[doc(hidden)]
    fn notify_waiters(&self);
}

/// A member of a group: either a nested group or a module leaf.
#[derive(Clone)]
pub enum GroupMember {
    Group(Arc<dyn Group>),
    Module(Arc<Module>),
}

impl GroupMember {
    /// Installs `parent` into this member's parent slot.
    fn try_set_parent(&self, parent: &Weak<dyn Group>) -> bool {
        match self {
            GroupMember::Group(g) => g.attachment().try_set_parent(parent),
            GroupMember::Module(m) => m.attachment().try_set_parent(parent),
        }
    }

    fn clear_parent(&self) {
        match self {
            GroupMember::Group(g) => g.attachment().clear_parent(),
            GroupMember::Module(m) => m.attachment().clear_parent(),
        }
    }
}

impl From<Arc<Module>> for GroupMember {
    fn from(module: Arc<Module>) -> Self {
        GroupMember::Module(module)
    }
}

impl From<Arc<dyn Group>> for GroupMember {
    fn from(group: Arc<dyn Group>) -> Self {
        GroupMember::Group(group)
    }
}

impl<G: Group + 'static> From<Arc<G>> for GroupMember {
    fn from(group: Arc<G>) -> Self {
        GroupMember::Group(group)
    }
}

/// Installs `parent` on every member, rolling the whole batch back on the
/// first conflict. Used by group constructors.
pub(crate) fn adopt_members(
    members: &[GroupMember],
    parent: &Weak<dyn Group>,
) -> SchedulerResult<()> {
    for (index, member) in members.iter().enumerate() {
        if !member.try_set_parent(parent) {
            for adopted in &members[..index] {
                adopted.clear_parent();
            }
            return Err(SchedulerError::AlreadyInGroup);
        }
    }
    Ok(())
}

struct AttachmentSlots {
    parent: Option<Weak<dyn Group>>,
    loop_core: Option<Weak<LoopCore>>,
}

/// Set-once / clear-once parent and loop back-reference slots shared by
/// modules and groups.
///
/// The handles are weak: a slot whose referent has been dropped counts as
/// vacant, so a dead parent or loop never blocks re-attachment.
pub struct Attachment {
    slots: Mutex<AttachmentSlots>,
}

impl Attachment {
    pub(crate) fn new() -> Self {
        Self {
            slots: Mutex::new(AttachmentSlots {
                parent: None,
                loop_core: None,
            }),
        }
    }

    /// Succeeds when the slot is vacant or already holds this very parent
    /// (the same `Arc` may be a member of one group several times).
    pub(crate) fn try_set_parent(&self, parent: &Weak<dyn Group>) -> bool {
        let mut slots = self.lock_slots();
        match slots.parent.as_ref().and_then(Weak::upgrade) {
            Some(existing) => match parent.upgrade() {
                Some(candidate) => {
                    Arc::as_ptr(&existing) as *const () == Arc::as_ptr(&candidate) as *const ()
                }
                None => false,
            },
            None => {
                slots.parent = Some(parent.clone());
                true
            }
        }
    }

    pub(crate) fn clear_parent(&self) {
        self.lock_slots().parent = None;
    }

    pub(crate) fn parent(&self) -> Option<Arc<dyn Group>> {
        self.lock_slots().parent.as_ref().and_then(Weak::upgrade)
    }

    pub(crate) fn try_set_loop(&self, loop_core: &Weak<LoopCore>) -> bool {
        let mut slots = self.lock_slots();
        match &slots.loop_core {
            Some(existing) if existing.strong_count() > 0 => existing.ptr_eq(loop_core),
            _ => {
                slots.loop_core = Some(loop_core.clone());
                true
            }
        }
    }

    pub(crate) fn clear_loop(&self) {
        self.lock_slots().loop_core = None;
    }

    pub(crate) fn loop_core(&self) -> Option<Arc<LoopCore>> {
        self.lock_slots().loop_core.as_ref().and_then(Weak::upgrade)
    }

    fn lock_slots(&self) -> std::sync::MutexGuard<'_, AttachmentSlots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
