/// Default explicit bucket boundaries for histograms
pub const DEFAULT_BOUNDARIES: [f64; 15] = [
    0.0, 5.0, 10.0, 25.0, 50.0, 75.0, 100.0, 250.0, 500.0, 750.0, 1000.0, 2500.0, 5000.0, 7500.0,
    10000.0,
];

/// Count, sum, min, max and bucket counts for one attribute set.
///
/// Bucket `i` holds values in `(bounds[i-1], bounds[i]]`; the last bucket is
/// unbounded above.
#[derive(Clone, Debug, PartialEq)]
pub struct HistogramState {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub bucket_counts: Vec<u64>,
}

impl HistogramState {
    pub fn new(bounds: &[f64]) -> Self {
        Self {
            count: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            bucket_counts: vec![0; bounds.len() + 1],
        }
    }

    pub fn record(&mut self, value: f64, bounds: &[f64]) {
        let idx = bounds.partition_point(|b| *b < value);
        self.bucket_counts[idx] += 1;
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    pub fn merge(&mut self, other: &HistogramState) {
        self.count += other.count;
        self.sum += other.sum;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        for (mine, theirs) in self.bucket_counts.iter_mut().zip(&other.bucket_counts) {
            *mine += theirs;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn min(&self) -> Option<f64> {
        (!self.is_empty()).then_some(self.min)
    }

    pub fn max(&self) -> Option<f64> {
        (!self.is_empty()).then_some(self.max)
    }
}

/// Sort and deduplicate user supplied boundaries, dropping non-finite values
pub fn normalize_boundaries(mut bounds: Vec<f64>) -> Vec<f64> {
    bounds.retain(|b| b.is_finite());
    bounds.sort_by(|a, b| a.total_cmp(b));
    bounds.dedup();
    bounds
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_upper_bound_is_inclusive() {
        let bounds = [0.0, 5.0, 10.0];
        let mut state = HistogramState::new(&bounds);

        state.record(-1.0, &bounds);
        state.record(5.0, &bounds);
        state.record(5.5, &bounds);
        state.record(100.0, &bounds);

        assert_eq!(state.bucket_counts, vec![1, 1, 1, 1]);
        assert_eq!(state.count, 4);
        assert_eq!(state.min(), Some(-1.0));
        assert_eq!(state.max(), Some(100.0));
    }

    #[test]
    fn test_merge_combines_extremes() {
        let bounds = [10.0];
        let mut a = HistogramState::new(&bounds);
        let mut b = HistogramState::new(&bounds);
        a.record(3.0, &bounds);
        b.record(30.0, &bounds);
        b.record(1.0, &bounds);

        a.merge(&b);

        assert_eq!(a.count, 3);
        assert_eq!(a.sum, 34.0);
        assert_eq!(a.min(), Some(1.0));
        assert_eq!(a.max(), Some(30.0));
        assert_eq!(a.bucket_counts, vec![2, 1]);
    }

    #[test]
    fn test_empty_has_no_extremes() {
        let state = HistogramState::new(&DEFAULT_BOUNDARIES);
        assert_eq!(state.min(), None);
        assert_eq!(state.bucket_counts.len(), DEFAULT_BOUNDARIES.len() + 1);
    }

    #[test]
    fn test_normalize_boundaries() {
        let bounds = normalize_boundaries(vec![10.0, f64::NAN, 1.0, 10.0, f64::INFINITY]);
        assert_eq!(bounds, vec![1.0, 10.0]);
    }
}
