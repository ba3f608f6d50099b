//! The group composition algebra and the loop driver.
//!
//! Groups compose modules and other groups either strictly in order
//! ([`SequentialGroup`]) or concurrently with a two-phase priority queue
//! ([`ParallelGroup`]). A [`Loop`] owns the root of such a tree (its
//! *architecture*) and drives it with a worker pool, one iteration at a
//! time.

pub mod driver;
pub mod group;
pub mod parallel;
pub mod sequential;

pub use driver::{Loop, LoopHandle};
pub use group::{Group, GroupMember};
pub use parallel::{ParallelGroup, ParallelMember};
pub use sequential::SequentialGroup;
