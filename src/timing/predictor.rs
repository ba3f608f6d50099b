/// Predicts future timespans from past observations.
///
/// Implementations learn online: the scheduler feeds every measured module
/// run into `observe` and consults `predict` when steering dispatch under a
/// budget.
pub trait TimeSpanPredictor: Send + Sync {
    /// Reinitializes, forgetting the past observations.
    fn initialize(&mut self, time_span: f64);
    /// Reports a new timespan observation, in seconds.
    fn observe(&mut self, time_span: f64);
    /// Returns the predicted timespan, in seconds.
    ///
    /// Must not mutate the predictor's state.
    fn predict(&self) -> f64;
}

/// Exponential moving average with asymmetric smoothing factors.
///
/// On each observation `x` the single state value `s` moves by
/// `alpha_up * (x - s)` when `x > s` and by `alpha_down * (x - s)` otherwise.
/// Pairing two instances with mirrored alphas yields the two prediction
/// bands used throughout the scheduler:
///
/// - *higher* band (`alpha_up` fast, `alpha_down` slow): chases spikes up
///   and decays slowly, giving a conservative bound.
/// - *lower* band (`alpha_up` slow, `alpha_down` fast): chases valleys,
///   giving an optimistic bound.
#[derive(Debug, Clone)]
pub struct BiasedEmaPredictor {
    alpha_up: f64,
    alpha_down: f64,
    state: f64,
}

impl BiasedEmaPredictor {
    /// Fast smoothing factor used by the default bands.
    pub const FAST_ALPHA: f64 = 0.2;
    /// Slow smoothing factor used by the default bands.
    pub const SLOW_ALPHA: f64 = 0.05;

    pub fn new(initial_value: f64, alpha_up: f64, alpha_down: f64) -> Self {
        Self {
            alpha_up,
            alpha_down,
            state: initial_value,
        }
    }

    /// Conservative band: tracks spikes up, decays slowly.
    pub fn higher_band(initial_value: f64) -> Self {
        Self::new(initial_value, Self::FAST_ALPHA, Self::SLOW_ALPHA)
    }

    /// Optimistic band: tracks valleys, rises slowly.
    pub fn lower_band(initial_value: f64) -> Self {
        Self::new(initial_value, Self::SLOW_ALPHA, Self::FAST_ALPHA)
    }
}

impl TimeSpanPredictor for BiasedEmaPredictor {
    fn initialize(&mut self, time_span: f64) {
        self.state = time_span;
    }

    fn observe(&mut self, time_span: f64) {
        let alpha = if time_span > self.state {
            self.alpha_up
        } else {
            self.alpha_down
        };
        self.state += alpha * (time_span - self.state);
    }

    fn predict(&self) -> f64 {
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converges_to_constant_observations() {
        let mut p = BiasedEmaPredictor::higher_band(0.0);
        for _ in 0..200 {
            p.observe(0.010);
        }
        assert!((p.predict() - 0.010).abs() < 0.010 * 0.01);
    }

    #[test]
    fn higher_band_chases_spikes_faster_than_it_decays() {
        let mut p = BiasedEmaPredictor::higher_band(0.001);
        p.observe(0.1);
        let after_spike = p.predict();
        assert!(after_spike > 0.001 + 0.19 * (0.1 - 0.001));

        let before_decay = p.predict();
        p.observe(0.001);
        let decayed = before_decay - p.predict();
        let risen = after_spike - 0.001;
        assert!(decayed < risen);
    }

    #[test]
    fn lower_band_chases_valleys() {
        let mut p = BiasedEmaPredictor::lower_band(0.1);
        p.observe(0.001);
        // Fast downward alpha: most of the drop is absorbed immediately.
        assert!(p.predict() < 0.1 - 0.19 * (0.1 - 0.001));
        p.observe(0.1);
        // Slow upward alpha: the rise is damped.
        assert!(p.predict() < 0.05);
    }

    #[test]
    fn initialize_forgets_history() {
        let mut p = BiasedEmaPredictor::higher_band(0.0);
        for _ in 0..50 {
            p.observe(1.0);
        }
        p.initialize(0.002);
        assert_eq!(p.predict(), 0.002);
    }

    #[test]
    fn predict_does_not_mutate() {
        let p = BiasedEmaPredictor::higher_band(0.5);
        let a = p.predict();
        let b = p.predict();
        assert_eq!(a, b);
        assert_eq!(a, 0.5);
    }
}
