//! User-facing leaf units: the `ModuleBody` trait and the `Module` wrapper
//! that the scheduling layer drives.

pub mod module;

pub use module::{CanRunPolicy, IdlingToken, Module, ModuleBody, RunningToken};
