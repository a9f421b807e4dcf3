//! Latency sample sets and their summary statistics.
//!
//! Readings are raw cycle counts. Outlier trimming uses a 3-sigma cutoff
//! expressed as `(x - mean)^2 <= 9 * variance`, which avoids a square root.

use serde::Serialize;

/// Outlier cutoff in units of variance (3 standard deviations squared).
const OUTLIER_VARIANCE_FACTOR: f64 = 9.0;

/// Summary of one sample window.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct SampleStats {
    pub count: usize,
    pub mean: f64,
    /// Unbiased (n - 1) sample variance.
    pub variance: f64,
    pub min: u64,
    pub max: u64,
}

impl SampleStats {
    /// Compute statistics over `readings`. Empty and single-element inputs
    /// yield zero variance.
    pub fn of(readings: &[u64]) -> Self {
        match readings {
            [] => Self::default(),
            [only] => Self {
                count: 1,
                mean: *only as f64,
                variance: 0.0,
                min: *only,
                max: *only,
            },
            _ => {
                let n = readings.len();
                let mut sum = 0.0;
                let mut min = u64::MAX;
                let mut max = 0;
                for &r in readings {
                    sum += r as f64;
                    min = min.min(r);
                    max = max.max(r);
                }
                let mean = sum / n as f64;
                let sq: f64 = readings
                    .iter()
                    .map(|&r| {
                        let d = r as f64 - mean;
                        d * d
                    })
                    .sum();
                Self {
                    count: n,
                    mean,
                    variance: sq / (n - 1) as f64,
                    min,
                    max,
                }
            }
        }
    }

    pub fn std_dev(&self) -> f64 {
        self.variance.sqrt()
    }

    /// Whether `value` lies within three standard deviations of the mean.
    #[inline]
    pub fn within_cutoff(&self, value: u64) -> bool {
        let d = value as f64 - self.mean;
        d * d <= OUTLIER_VARIANCE_FACTOR * self.variance
    }
}

/// Remove 3-sigma outliers from `readings` in place.
///
/// Each pass replaces a rejected reading with the current tail element and
/// shrinks the working length, so order is not preserved. Passes repeat until
/// one rejects nothing: the returned statistics describe exactly the retained
/// readings, and every retained reading is within the cutoff of them. A
/// single pass would judge later readings against statistics that still
/// include the outliers it already dropped.
/// Inputs of zero or one reading are returned untouched.
pub fn trim_outliers(readings: &mut Vec<u64>) -> SampleStats {
    loop {
        let stats = SampleStats::of(readings);
        if readings.len() <= 1 {
            return stats;
        }
        let mut i = 0;
        let mut end = readings.len();
        while i < end {
            if stats.within_cutoff(readings[i]) {
                i += 1;
            } else {
                readings[i] = readings[end - 1];
                end -= 1;
            }
        }
        if end == readings.len() {
            return stats;
        }
        readings.truncate(end);
    }
}

/// The readings of one sampler window plus their statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SampleSet {
    pub readings: Vec<u64>,
    pub stats: SampleStats,
}

impl SampleSet {
    pub fn new(mut readings: Vec<u64>, remove_outliers: bool) -> Self {
        let stats = if remove_outliers {
            trim_outliers(&mut readings)
        } else {
            SampleStats::of(&readings)
        };
        Self { readings, stats }
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }
}
