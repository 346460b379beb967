use serde::{Deserialize, Serialize};

/// Linearly interpolated percentile figures over one sampled metric.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PercentileSet {
    pub samples: usize,
    pub min: f64,
    pub max: f64,
    pub p50: f64,
    pub p75: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
}

/// Percentile by linear interpolation: `index = (n - 1) * p`; fractional
/// indexes interpolate between the floor and ceil elements. `sorted` must
/// be ascending.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0],
        n => {
            let index = (n - 1) as f64 * p;
            let lo = index.floor() as usize;
            let hi = index.ceil() as usize;
            if lo == hi {
                sorted[lo]
            } else {
                let weight = index - lo as f64;
                sorted[lo] * (1.0 - weight) + sorted[hi] * weight
            }
        }
    }
}

pub fn compute_percentiles(values: &mut Vec<f64>) -> PercentileSet {
    if values.is_empty() {
        return PercentileSet::default();
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    PercentileSet {
        samples: values.len(),
        min: values[0],
        max: values[values.len() - 1],
        p50: percentile(values, 0.50),
        p75: percentile(values, 0.75),
        p90: percentile(values, 0.90),
        p95: percentile(values, 0.95),
        p99: percentile(values, 0.99),
    }
}

/// Population mean and standard deviation.
pub fn mean_stddev(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    (mean, variance.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interpolation_between_samples() {
        // n = 4, p50 index = 1.5 -> midpoint of 20 and 30.
        let values = [10.0, 20.0, 30.0, 40.0];
        assert_eq!(percentile(&values, 0.50), 25.0);
        assert_eq!(percentile(&values, 0.0), 10.0);
        assert_eq!(percentile(&values, 1.0), 40.0);
    }

    #[test]
    fn test_percentiles_monotonic() {
        let mut values: Vec<f64> = (1..=97).map(|v| v as f64 * 3.7).collect();
        let set = compute_percentiles(&mut values);

        assert!(set.min <= set.p50);
        assert!(set.p50 <= set.p75);
        assert!(set.p75 <= set.p90);
        assert!(set.p90 <= set.p95);
        assert!(set.p95 <= set.p99);
        assert!(set.p99 <= set.max);
    }

    #[test]
    fn test_single_sample() {
        let mut values = vec![42.0];
        let set = compute_percentiles(&mut values);
        assert_eq!(set.p50, 42.0);
        assert_eq!(set.p99, 42.0);
    }

    #[test]
    fn test_mean_stddev_alternating() {
        let values: Vec<f64> = (0..50)
            .map(|i| if i % 2 == 0 { 900.0 } else { 1100.0 })
            .collect();
        let (mean, stddev) = mean_stddev(&values);
        assert!((mean - 1000.0).abs() < f64::EPSILON);
        assert!((stddev - 100.0).abs() < 1e-9);
    }
}
