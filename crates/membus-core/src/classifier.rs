//! Contention bit classification against a calibrated baseline.
//!
//! The baseline is the latency distribution observed before any bit is
//! exchanged, when nobody is writing. Each later window is compared with it by
//! a two-sample statistic; a statistic at or above the cutoff reads as a 1.

use serde::Serialize;

use crate::stats::{SampleSet, SampleStats};

/// Statistic at or above which a window reads as contended.
pub const DEFAULT_CUTOFF: f64 = 3.0;

// ---------------------------------------------------------------------------
// Two-sample statistics
// ---------------------------------------------------------------------------

/// A dissimilarity measure between the baseline and a candidate window.
///
/// Implementations must be near zero when both come from the same
/// distribution and must not decrease when the candidate shifts to higher
/// latencies.
pub trait TwoSampleStatistic {
    /// `baseline` is sorted ascending; `candidate` is in arrival order.
    fn statistic(&self, baseline: &[u64], candidate: &[u64]) -> f64;
}

/// One-sided Kolmogorov-Smirnov statistic, scaled by `sqrt(nm / (n + m))`.
///
/// Measures how far the candidate's empirical CDF lies below the baseline's,
/// i.e. how much the candidate is shifted towards higher latency. Under the
/// null hypothesis the scaled value exceeds 3.0 with probability about
/// `exp(-18)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct KsMeanShift;

impl TwoSampleStatistic for KsMeanShift {
    fn statistic(&self, baseline: &[u64], candidate: &[u64]) -> f64 {
        let n = baseline.len();
        let m = candidate.len();
        if n == 0 || m == 0 {
            return 0.0;
        }
        let mut cand = candidate.to_vec();
        cand.sort_unstable();

        let (mut i, mut j) = (0usize, 0usize);
        let mut d_plus: f64 = 0.0;
        while i < n && j < m {
            let v = baseline[i].min(cand[j]);
            while i < n && baseline[i] == v {
                i += 1;
            }
            while j < m && cand[j] == v {
                j += 1;
            }
            let diff = i as f64 / n as f64 - j as f64 / m as f64;
            d_plus = d_plus.max(diff);
        }
        let scale = ((n * m) as f64 / (n + m) as f64).sqrt();
        scale * d_plus
    }
}

// ---------------------------------------------------------------------------
// Baseline
// ---------------------------------------------------------------------------

/// The uncontended latency distribution, sorted once and never modified.
#[derive(Debug, Clone, Serialize)]
pub struct Baseline {
    sorted: Vec<u64>,
    stats: SampleStats,
}

impl Baseline {
    pub fn new(samples: SampleSet) -> Self {
        let mut sorted = samples.readings;
        sorted.sort_unstable();
        Self {
            sorted,
            stats: samples.stats,
        }
    }

    pub fn readings(&self) -> &[u64] {
        &self.sorted
    }

    pub fn stats(&self) -> &SampleStats {
        &self.stats
    }
}

// ---------------------------------------------------------------------------
// Classifier
// ---------------------------------------------------------------------------

/// Configuration for a [`BitClassifier`].
#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    /// **Default:** `3.0`
    pub cutoff: f64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            cutoff: DEFAULT_CUTOFF,
        }
    }
}

/// A classified window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Decision {
    pub bit: bool,
    pub statistic: f64,
}

/// Thresholds a [`TwoSampleStatistic`] into bits.
pub struct BitClassifier<S: TwoSampleStatistic = KsMeanShift> {
    config: ClassifierConfig,
    test: S,
}

impl BitClassifier<KsMeanShift> {
    pub fn new(config: ClassifierConfig) -> Self {
        Self::with_statistic(config, KsMeanShift)
    }
}

impl Default for BitClassifier<KsMeanShift> {
    fn default() -> Self {
        Self::new(ClassifierConfig::default())
    }
}

impl<S: TwoSampleStatistic> BitClassifier<S> {
    pub fn with_statistic(config: ClassifierConfig, test: S) -> Self {
        Self { config, test }
    }

    pub fn cutoff(&self) -> f64 {
        self.config.cutoff
    }

    /// Raw statistic of `candidate` against `baseline`.
    pub fn statistic(&self, baseline: &Baseline, candidate: &SampleSet) -> f64 {
        self.test.statistic(baseline.readings(), &candidate.readings)
    }

    pub fn classify(&self, baseline: &Baseline, candidate: &SampleSet) -> Decision {
        let statistic = self.statistic(baseline, candidate);
        Decision {
            bit: statistic >= self.config.cutoff,
            statistic,
        }
    }
}
