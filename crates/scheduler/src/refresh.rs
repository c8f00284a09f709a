use std::collections::VecDeque;
use std::time::{Duration, Instant};

const DEFAULT_WINDOW: usize = 32;
const MIN_SAMPLES: usize = 5;
/// Intervals longer than this are stalls (window hidden, breakpoint), not refreshes.
const MAX_INTERVAL: Duration = Duration::from_millis(250);

/// Measures the display refresh rate from presentation timestamps.
///
/// Uses the median interval of a sliding window so the odd late present
/// does not drag the estimate down.
#[derive(Debug, Clone)]
pub struct RefreshRateEstimator {
    window: usize,
    intervals: VecDeque<Duration>,
    last_present: Option<Instant>,
}

impl Default for RefreshRateEstimator {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

impl RefreshRateEstimator {
    pub fn new(window: usize) -> Self {
        let window = window.max(MIN_SAMPLES);
        Self {
            window,
            intervals: VecDeque::with_capacity(window),
            last_present: None,
        }
    }

    pub fn record_present(&mut self, now: Instant) {
        if let Some(last) = self.last_present.replace(now) {
            let interval = now.saturating_duration_since(last);
            if interval.is_zero() || interval > MAX_INTERVAL {
                return;
            }
            if self.intervals.len() == self.window {
                self.intervals.pop_front();
            }
            self.intervals.push_back(interval);
        }
    }

    /// Forgets the history, e.g. after the window moved to another monitor.
    pub fn reset(&mut self) {
        self.intervals.clear();
        self.last_present = None;
    }

    /// Estimated refresh rate in Hz once enough presents were seen.
    pub fn estimate(&self) -> Option<f32> {
        if self.intervals.len() < MIN_SAMPLES {
            return None;
        }
        let mut sorted: Vec<Duration> = self.intervals.iter().copied().collect();
        sorted.sort_unstable();
        let mid = sorted.len() / 2;
        let median = if sorted.len() % 2 == 0 {
            (sorted[mid - 1] + sorted[mid]) / 2
        } else {
            sorted[mid]
        };
        Some((1.0 / median.as_secs_f64()) as f32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(estimator: &mut RefreshRateEstimator, start: Instant, intervals_us: &[u64]) -> Instant {
        let mut now = start;
        estimator.record_present(now);
        for interval in intervals_us {
            now += Duration::from_micros(*interval);
            estimator.record_present(now);
        }
        now
    }

    #[test]
    fn needs_a_few_samples() {
        let mut estimator = RefreshRateEstimator::default();
        feed(&mut estimator, Instant::now(), &[16_667, 16_667]);
        assert_eq!(estimator.estimate(), None);
    }

    #[test]
    fn median_ignores_outliers() {
        let mut estimator = RefreshRateEstimator::default();
        feed(
            &mut estimator,
            Instant::now(),
            &[8_333, 8_333, 40_000, 8_333, 8_333, 1_000, 8_333],
        );
        let hz = estimator.estimate().unwrap();
        assert!((hz - 120.0).abs() < 0.5, "estimated {hz}");
    }

    #[test]
    fn stalls_are_not_samples() {
        let mut estimator = RefreshRateEstimator::default();
        feed(
            &mut estimator,
            Instant::now(),
            &[16_667, 16_667, 900_000, 16_667, 16_667, 16_667],
        );
        let hz = estimator.estimate().unwrap();
        assert!((hz - 60.0).abs() < 0.5, "estimated {hz}");
    }

    #[test]
    fn window_slides() {
        let mut estimator = RefreshRateEstimator::new(5);
        let now = feed(&mut estimator, Instant::now(), &[16_667; 5]);
        feed(&mut estimator, now, &[6_944; 5]);
        let hz = estimator.estimate().unwrap();
        assert!((hz - 144.0).abs() < 0.5, "estimated {hz}");
    }
}
