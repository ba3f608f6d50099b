use thiserror::Error;

/// Errors surfaced by topology installation and loop lifecycle operations.
///
/// Budget denials are not errors: `run_next` returning `false` is part of the
/// scheduling contract. Panics escaping a module body are contained at the
/// module boundary and never reach this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SchedulerError {
    /// A group or module is already a member of a different group.
    #[error("a group or a module cannot be a member of more than one group")]
    AlreadyInGroup,

    /// A group or module already belongs to a different loop.
    #[error("a group or a module cannot be part of more than one loop")]
    AlreadyInLoop,

    /// `Loop::run` was called while the loop was already running.
    #[error("cannot start running the loop twice")]
    LoopAlreadyRunning,

    /// `start_next_iteration` was called before the current iteration was done.
    #[error("cannot start the next iteration before the current one is done")]
    IterationNotDone,

    /// A module operation that needs the enclosing loop (`idle`,
    /// `start_idling`) was called on a detached module.
    #[error("the module is not attached to a loop")]
    NotInLoop,
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
