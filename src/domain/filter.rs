//! Sensor Sample Filter
//!
//! Tracks the recent sensor history in two bounded FIFO windows: a long
//! sample window used for ranging (min/max) and a short filter window used
//! for the moving average.

use crate::domain::models::SensorRange;
use std::collections::VecDeque;
use tracing::trace;

/// Number of samples used to range the sensor
pub const SAMPLE_WINDOW_CAPACITY: usize = 400;

/// Number of samples averaged into the filtered value
pub const FILTER_WINDOW_CAPACITY: usize = 15;

/// Result of folding one raw sample into the filter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterOutput {
    pub filtered: i32,
    pub range: SensorRange,
    /// True once the sample window is full and `range` reflects it
    pub range_valid: bool,
}

#[derive(Debug, Clone)]
pub struct SampleFilter {
    sample_window: VecDeque<i32>,
    filter_window: VecDeque<i32>,
    filtered: i32,
    range: SensorRange,
}

impl Default for SampleFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl SampleFilter {
    pub fn new() -> Self {
        Self {
            sample_window: VecDeque::with_capacity(SAMPLE_WINDOW_CAPACITY),
            filter_window: VecDeque::with_capacity(FILTER_WINDOW_CAPACITY),
            filtered: 0,
            range: SensorRange::default(),
        }
    }

    /// Fold a raw reading into both windows.
    ///
    /// The moving average is taken over the filter window as it stood before
    /// this sample is appended, and only once that window is full. Until
    /// then the previous filtered value (initially 0) is kept.
    pub fn ingest(&mut self, raw_value: i32) -> FilterOutput {
        if self.sample_window.len() >= SAMPLE_WINDOW_CAPACITY {
            self.sample_window.pop_front();
        }
        self.sample_window.push_back(raw_value);

        if self.filter_window.len() >= FILTER_WINDOW_CAPACITY {
            let sum: i64 = self.filter_window.iter().map(|&v| v as i64).sum();
            self.filtered = (sum / self.filter_window.len() as i64) as i32;
            self.filter_window.pop_front();
        }
        self.filter_window.push_back(raw_value);

        let range_valid = self.is_range_valid();
        if range_valid {
            // Full rescan; the window is small enough.
            let min = self.sample_window.iter().copied().min().unwrap_or_default();
            let max = self.sample_window.iter().copied().max().unwrap_or_default();
            self.range = SensorRange::new(min, max);
            trace!("Ranged max: {} Ranged min: {}", max, min);
        }

        FilterOutput {
            filtered: self.filtered,
            range: self.range,
            range_valid,
        }
    }

    pub fn filtered(&self) -> i32 {
        self.filtered
    }

    pub fn range(&self) -> SensorRange {
        self.range
    }

    pub fn is_range_valid(&self) -> bool {
        self.sample_window.len() == SAMPLE_WINDOW_CAPACITY
    }

    /// Samples in arrival order, oldest first
    pub fn samples(&self) -> impl Iterator<Item = i32> + '_ {
        self.sample_window.iter().copied()
    }

    pub fn sample_count(&self) -> usize {
        self.sample_window.len()
    }

    pub fn filter_len(&self) -> usize {
        self.filter_window.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_filtered_stays_zero_until_window_full() {
        let mut filter = SampleFilter::new();
        for v in 1..=15 {
            let out = filter.ingest(v * 10);
            assert_eq!(out.filtered, 0);
        }
        assert_eq!(filter.filter_len(), 15);
    }

    #[test]
    fn test_average_uses_window_before_append() {
        let mut filter = SampleFilter::new();
        for v in 1..=15 {
            filter.ingest(v);
        }
        // Mean of 1..=15 is 8; the 1000 must not be included.
        let out = filter.ingest(1000);
        assert_eq!(out.filtered, 8);
        assert_eq!(filter.filter_len(), 15);

        // Window is now 2..=15, 1000 -> (119 + 1000) / 15 = 74
        let out = filter.ingest(0);
        assert_eq!(out.filtered, 74);
    }

    #[test]
    fn test_average_truncates() {
        let mut filter = SampleFilter::new();
        for _ in 0..14 {
            filter.ingest(1);
        }
        filter.ingest(2);
        // 16 / 15 truncates to 1
        assert_eq!(filter.ingest(0).filtered, 1);
    }

    #[test]
    fn test_range_valid_from_400th_sample() {
        let mut filter = SampleFilter::new();
        for i in 0..399 {
            let out = filter.ingest(i % 50);
            assert!(!out.range_valid, "sample {} should not be ranged", i + 1);
            assert_eq!(out.range, SensorRange::default());
        }
        let out = filter.ingest(75);
        assert!(out.range_valid);
        assert_eq!(out.range, SensorRange::new(0, 75));

        let out = filter.ingest(3);
        assert!(out.range_valid);
    }

    #[test]
    fn test_range_forgets_evicted_extremes() {
        let mut filter = SampleFilter::new();
        filter.ingest(255);
        for _ in 0..399 {
            filter.ingest(100);
        }
        assert_eq!(filter.range(), SensorRange::new(100, 255));
        // The 255 is evicted by the next sample.
        let out = filter.ingest(120);
        assert_eq!(out.range, SensorRange::new(100, 120));
    }

    proptest! {
        #[test]
        fn prop_windows_stay_bounded_and_ordered(
            values in proptest::collection::vec(0i32..=255, 0..900)
        ) {
            let mut filter = SampleFilter::new();
            for (i, &v) in values.iter().enumerate() {
                let out = filter.ingest(v);
                prop_assert!(filter.sample_count() <= SAMPLE_WINDOW_CAPACITY);
                prop_assert!(filter.filter_len() <= FILTER_WINDOW_CAPACITY);
                prop_assert_eq!(out.range_valid, i + 1 >= SAMPLE_WINDOW_CAPACITY);
            }

            let start = values.len().saturating_sub(SAMPLE_WINDOW_CAPACITY);
            let expected: Vec<i32> = values[start..].to_vec();
            let actual: Vec<i32> = filter.samples().collect();
            prop_assert_eq!(actual, expected);
        }

        #[test]
        fn prop_filtered_within_observed_values(
            values in proptest::collection::vec(0i32..=255, 16..200)
        ) {
            let mut filter = SampleFilter::new();
            let mut last = 0;
            for &v in &values {
                last = filter.ingest(v).filtered;
            }
            let min = *values.iter().min().unwrap();
            let max = *values.iter().max().unwrap();
            prop_assert!(last >= min && last <= max);
        }
    }
}
