//! Exponentially weighted moving averages for meter rates.
//!
//! Rates advance in fixed five-second steps. There is no background ticker
//! thread: the owner calls [`Ewma::tick`] for every elapsed step before
//! reading, so an idle meter decays correctly the next time it is observed.

/// Interval of one rate step, in seconds.
pub const TICK_INTERVAL_SECS: u64 = 5;

/// One moving average over a fixed window (1, 5 or 15 minutes).
#[derive(Debug)]
pub struct Ewma {
    alpha: f64,
    rate: f64,
    initialized: bool,
    uncounted: u64,
}

impl Ewma {
    /// Average over a window of `minutes` minutes.
    pub fn over_minutes(minutes: f64) -> Self {
        let alpha = 1.0 - (-(TICK_INTERVAL_SECS as f64) / 60.0 / minutes).exp();
        Self { alpha, rate: 0.0, initialized: false, uncounted: 0 }
    }

    pub fn update(&mut self, n: u64) {
        self.uncounted += n;
    }

    /// Advance one five-second step.
    pub fn tick(&mut self) {
        let instant_rate = self.uncounted as f64 / TICK_INTERVAL_SECS as f64;
        self.uncounted = 0;
        if self.initialized {
            self.rate += self.alpha * (instant_rate - self.rate);
        } else {
            self.rate = instant_rate;
            self.initialized = true;
        }
    }

    /// Events per second.
    pub fn rate(&self) -> f64 {
        self.rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_tick_sets_instant_rate() {
        let mut ewma = Ewma::over_minutes(1.0);
        ewma.update(10);
        ewma.tick();
        assert!((ewma.rate() - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn rate_decays_over_idle_ticks() {
        let mut ewma = Ewma::over_minutes(1.0);
        ewma.update(10);
        ewma.tick();
        let initial = ewma.rate();
        for _ in 0..12 {
            ewma.tick();
        }
        assert!(ewma.rate() < initial);
        assert!(ewma.rate() > 0.0);
    }

    #[test]
    fn unticked_updates_do_not_change_rate() {
        let mut ewma = Ewma::over_minutes(5.0);
        ewma.update(100);
        assert_eq!(ewma.rate(), 0.0);
    }
}
