use std::sync::{Condvar, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};

use super::predictor::{BiasedEmaPredictor, TimeSpanPredictor};

/// Performs timed condition-variable waits in a smarter way, by accounting
/// for the historically observed wait overshoot to wake closer to the
/// nominal deadline.
///
/// The waiter keeps a higher-band predictor of the scheduling error. Before
/// waiting it subtracts the predicted error from the requested duration; if
/// the prediction already exceeds the request, the wait is declined
/// outright. After a pure timeout the measured error trains the predictor.
/// Predicate wakeups are never used as training samples: they would mix
/// signal latency into the overshoot estimate.
pub struct SmartCvWaiter {
    error_predictor: RwLock<Box<dyn TimeSpanPredictor>>,
}

impl SmartCvWaiter {
    pub fn new() -> Self {
        Self::with_predictor(Box::new(BiasedEmaPredictor::higher_band(0.0)))
    }

    pub fn with_predictor(error_predictor: Box<dyn TimeSpanPredictor>) -> Self {
        Self {
            error_predictor: RwLock::new(error_predictor),
        }
    }

    /// Waits on `cv` for up to `duration_secs`, guarded by `predicate`.
    ///
    /// Returns the guard and whether the predicate was satisfied. Returns
    /// `false` without waiting when the predicted overshoot already eats the
    /// whole duration.
    pub fn wait_for<'a, T, F>(
        &self,
        cv: &Condvar,
        guard: MutexGuard<'a, T>,
        duration_secs: f64,
        mut predicate: F,
    ) -> (MutexGuard<'a, T>, bool)
    where
        F: FnMut() -> bool,
    {
        let error_prediction = self
            .error_predictor
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .predict();
        if error_prediction >= duration_secs {
            return (guard, false);
        }
        let corrected = duration_secs - error_prediction.max(0.0);

        let start = Instant::now();
        let (guard, result) = cv
            .wait_timeout_while(guard, Duration::from_secs_f64(corrected), |_| !predicate())
            .unwrap_or_else(PoisonError::into_inner);
        if result.timed_out() {
            // Pure time error: the predicate never fired.
            let actual = start.elapsed().as_secs_f64();
            self.error_predictor
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .observe(actual - duration_secs);
            (guard, false)
        } else {
            (guard, true)
        }
    }
}

impl Default for SmartCvWaiter {
    fn default() -> Self {
        Self::new()
    }
}

/// Bounded wait used by the scheduling layer: goes through the smart waiter
/// when the `smart-cv-waiter` feature is enabled, a plain timed wait
/// otherwise.
pub(crate) fn bounded_wait<'a, T, F>(
    waiter: &SmartCvWaiter,
    cv: &Condvar,
    guard: MutexGuard<'a, T>,
    max_wait_secs: f64,
    mut predicate: F,
) -> (MutexGuard<'a, T>, bool)
where
    F: FnMut() -> bool,
{
    if cfg!(feature = "smart-cv-waiter") {
        waiter.wait_for(cv, guard, max_wait_secs, predicate)
    } else {
        let (guard, result) = cv
            .wait_timeout_while(
                guard,
                Duration::from_secs_f64(max_wait_secs),
                |_| !predicate(),
            )
            .unwrap_or_else(PoisonError::into_inner);
        (guard, !result.timed_out())
    }
}

/// Unbounded wait on `cv` until `predicate` turns true.
pub(crate) fn wait_unbounded<'a, T, F>(
    cv: &Condvar,
    guard: MutexGuard<'a, T>,
    mut predicate: F,
) -> MutexGuard<'a, T>
where
    F: FnMut() -> bool,
{
    cv.wait_while(guard, |_| !predicate())
        .unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn lock_bus(bus: &Mutex<()>) -> MutexGuard<'_, ()> {
    bus.lock().unwrap_or_else(PoisonError::into_inner)
}
