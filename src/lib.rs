//! # loopsched
//!
//! A multi-threaded iterative scheduler for composable workloads.
//!
//! An application describes its work as a tree of groups whose leaves are
//! modules (user code). A [`Loop`] drives a worker pool that repeatedly
//! executes one iteration of the root group:
//!
//! - **Modules**: user-extensible leaves with an exclusivity policy and
//!   learned execution-time predictions
//! - **Groups**: sequential or parallel composition, arbitrarily nested
//! - **Budgets**: dispatch declines work whose predicted cost exceeds a
//!   caller-supplied time budget
//! - **Cooperative idling**: a blocked module lends its thread back to the
//!   scheduler instead of sleeping
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use loopsched::{CanRunPolicy, Loop, Module, ModuleBody, SequentialGroup};
//!
//! struct Control;
//!
//! impl ModuleBody for Control {
//!     fn on_run(&self) {
//!         // one step of work per iteration
//!     }
//! }
//!
//! let control = Arc::new(Module::new(CanRunPolicy::Exclusive, Control));
//! let root = SequentialGroup::new(vec![control.into()])?;
//! let scheduler_loop = Loop::new(root)?;
//! scheduler_loop.run(4)?; // blocks until a module stops the loop
//! ```

pub mod core;
pub mod error;
pub mod scheduling;
pub mod timing;

// Re-export commonly used types for easy access
pub use crate::core::{CanRunPolicy, IdlingToken, Module, ModuleBody, RunningToken};
pub use error::{SchedulerError, SchedulerResult};
pub use scheduling::{
    Group, GroupMember, Loop, LoopHandle, ParallelGroup, ParallelMember, SequentialGroup,
};
pub use timing::{BiasedEmaPredictor, SmartCvWaiter, TimeSpanPredictor};
