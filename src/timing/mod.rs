//! Execution-time prediction and deadline-aware waiting.
//!
//! All timespans in this module are seconds as `f64`, matching the budget
//! hints threaded through the scheduling layer.

pub mod predictor;
pub mod waiter;

pub use predictor::{BiasedEmaPredictor, TimeSpanPredictor};
pub use waiter::SmartCvWaiter;
