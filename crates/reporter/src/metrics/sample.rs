//! Reservoir samples backing histograms and timers.
//!
//! Two reservoirs are provided: a uniform sample (Vitter's algorithm R)
//! and an exponentially-decaying sample with a forward-decaying priority
//! reservoir. The decaying sample favours recent data, which is what the
//! exporters want for latency-style metrics; the uniform sample exists for
//! deterministic tests and callers that need an unbiased view.
//!
//! Percentiles use linear interpolation between closest ranks over the
//! sorted reservoir, so a 10-sample population of [16s x 9, 18s] reports
//! p50 = p75 = 16s and p95..p999 = 18s.

use std::time::{Duration, Instant};

use rand::Rng;

/// Default reservoir size for exponentially-decaying samples.
pub const DEFAULT_RESERVOIR_SIZE: usize = 100;

/// Default decay factor for exponentially-decaying samples.
pub const DEFAULT_ALPHA: f64 = 0.015;

/// Priorities are rescaled once per hour to keep the keys from overflowing.
const RESCALE_THRESHOLD: Duration = Duration::from_secs(60 * 60);

/// A reservoir of sampled values with a total update count.
#[derive(Debug)]
pub enum Sample {
    Uniform(UniformSample),
    ExpDecay(ExpDecaySample),
}

impl Sample {
    /// Exponentially-decaying sample with the library defaults.
    pub fn exp_decay() -> Self {
        Self::ExpDecay(ExpDecaySample::new(DEFAULT_RESERVOIR_SIZE, DEFAULT_ALPHA))
    }

    /// Uniform sample holding at most `size` values.
    pub fn uniform(size: usize) -> Self {
        Self::Uniform(UniformSample::new(size))
    }

    pub fn update(&mut self, value: i64) {
        match self {
            Self::Uniform(s) => s.update(value),
            Self::ExpDecay(s) => s.update(value),
        }
    }

    /// Total number of values ever recorded, not the reservoir occupancy.
    pub fn count(&self) -> u64 {
        match self {
            Self::Uniform(s) => s.count,
            Self::ExpDecay(s) => s.count,
        }
    }

    pub fn values(&self) -> Vec<i64> {
        match self {
            Self::Uniform(s) => s.values.clone(),
            Self::ExpDecay(s) => s.values.iter().map(|w| w.value).collect(),
        }
    }

    pub fn clear(&mut self) {
        match self {
            Self::Uniform(s) => {
                s.count = 0;
                s.values.clear();
            }
            Self::ExpDecay(s) => {
                s.count = 0;
                s.values.clear();
                s.t0 = Instant::now();
            }
        }
    }
}

/// Uniform reservoir sample (Vitter's algorithm R).
#[derive(Debug)]
pub struct UniformSample {
    size: usize,
    count: u64,
    values: Vec<i64>,
}

impl UniformSample {
    pub fn new(size: usize) -> Self {
        Self { size, count: 0, values: Vec::with_capacity(size) }
    }

    fn update(&mut self, value: i64) {
        self.count += 1;
        if self.values.len() < self.size {
            self.values.push(value);
            return;
        }
        let r = rand::thread_rng().gen_range(0..self.count);
        if (r as usize) < self.size {
            self.values[r as usize] = value;
        }
    }
}

#[derive(Debug)]
struct WeightedValue {
    key: f64,
    value: i64,
}

/// Exponentially-decaying reservoir sample.
///
/// Each value gets the priority `exp(alpha * age) / u` with `u` drawn
/// uniformly from (0, 1]; when the reservoir is full the lowest-priority
/// entry is evicted. The landmark `t0` is moved forward once per hour and
/// existing priorities are rescaled so old entries keep decaying.
#[derive(Debug)]
pub struct ExpDecaySample {
    size: usize,
    alpha: f64,
    count: u64,
    t0: Instant,
    values: Vec<WeightedValue>,
}

impl ExpDecaySample {
    pub fn new(size: usize, alpha: f64) -> Self {
        Self { size, alpha, count: 0, t0: Instant::now(), values: Vec::with_capacity(size) }
    }

    fn update(&mut self, value: i64) {
        self.count += 1;
        let now = Instant::now();
        if now.duration_since(self.t0) >= RESCALE_THRESHOLD {
            self.rescale(now);
        }
        let age = now.duration_since(self.t0).as_secs_f64();
        let u: f64 = rand::thread_rng().gen_range(f64::MIN_POSITIVE..=1.0);
        let key = (self.alpha * age).exp() / u;
        if self.values.len() < self.size {
            self.values.push(WeightedValue { key, value });
            return;
        }
        // Replace the lowest-priority entry if the newcomer outranks it.
        if let Some((min_idx, min_key)) = self
            .values
            .iter()
            .enumerate()
            .map(|(i, w)| (i, w.key))
            .min_by(|a, b| a.1.total_cmp(&b.1))
        {
            if key > min_key {
                self.values[min_idx] = WeightedValue { key, value };
            }
        }
    }

    fn rescale(&mut self, now: Instant) {
        let factor = (-self.alpha * now.duration_since(self.t0).as_secs_f64()).exp();
        for w in &mut self.values {
            w.key *= factor;
        }
        self.t0 = now;
    }
}

/// Percentiles over a population, interpolating between closest ranks.
pub fn percentiles(mut values: Vec<i64>, ps: &[f64]) -> Vec<f64> {
    let mut scores = vec![0.0; ps.len()];
    let size = values.len();
    if size == 0 {
        return scores;
    }
    values.sort_unstable();
    for (i, p) in ps.iter().enumerate() {
        let pos = p * (size as f64 + 1.0);
        scores[i] = if pos < 1.0 {
            values[0] as f64
        } else if pos >= size as f64 {
            values[size - 1] as f64
        } else {
            let lower = values[pos as usize - 1] as f64;
            let upper = values[pos as usize] as f64;
            lower + (pos - pos.floor()) * (upper - lower)
        };
    }
    scores
}

pub fn mean(values: &[i64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().map(|v| *v as f64).sum::<f64>() / values.len() as f64
}

pub fn std_dev(values: &[i64]) -> f64 {
    variance(values).sqrt()
}

fn variance(values: &[i64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    values.iter().map(|v| (*v as f64 - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_sample_keeps_everything_below_capacity() {
        let mut sample = Sample::uniform(10);
        for v in 0..5 {
            sample.update(v);
        }
        assert_eq!(sample.count(), 5);
        let mut values = sample.values();
        values.sort_unstable();
        assert_eq!(values, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn uniform_sample_caps_reservoir() {
        let mut sample = Sample::uniform(10);
        for v in 0..1000 {
            sample.update(v);
        }
        assert_eq!(sample.count(), 1000);
        assert_eq!(sample.values().len(), 10);
    }

    #[test]
    fn exp_decay_sample_caps_reservoir() {
        let mut sample = Sample::exp_decay();
        for v in 0..1000 {
            sample.update(v);
        }
        assert_eq!(sample.count(), 1000);
        assert_eq!(sample.values().len(), DEFAULT_RESERVOIR_SIZE);
    }

    #[test]
    fn percentile_interpolation_matches_timer_fixture() {
        // One 18 among nine 16s: the median stays 16, the tail reports 18.
        let mut values = vec![18i64];
        values.extend(std::iter::repeat(16i64).take(9));
        let ps = percentiles(values, &[0.5, 0.75, 0.95, 0.98, 0.99, 0.999]);
        assert_eq!(ps[0], 16.0);
        assert_eq!(ps[1], 16.0);
        assert_eq!(ps[2], 18.0);
        assert_eq!(ps[3], 18.0);
        assert_eq!(ps[4], 18.0);
        assert_eq!(ps[5], 18.0);
    }

    #[test]
    fn percentiles_of_empty_population_are_zero() {
        assert_eq!(percentiles(Vec::new(), &[0.5, 0.99]), vec![0.0, 0.0]);
    }

    #[test]
    fn stddev_of_constant_population_is_zero() {
        assert_eq!(std_dev(&[5, 5, 5, 5]), 0.0);
    }
}
