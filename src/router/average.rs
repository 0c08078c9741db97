//! Time-windowed moving average

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Mean of the samples seen during the last `window`
#[derive(Debug, Clone)]
pub struct MovingAverage {
    window: Duration,
    samples: VecDeque<(Instant, f64)>,
}

impl MovingAverage {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            samples: VecDeque::new(),
        }
    }

    pub fn set_window(&mut self, window: Duration) {
        self.window = window;
    }

    pub fn push(&mut self, now: Instant, value: f64) {
        self.samples.push_back((now, value));
        while let Some(&(t, _)) = self.samples.front() {
            if now.saturating_duration_since(t) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// `None` until the first sample
    pub fn mean(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.samples.iter().map(|(_, v)| v).sum::<f64>() / self.samples.len() as f64)
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_old_samples_expire() {
        let t0 = Instant::now();
        let mut avg = MovingAverage::new(Duration::from_secs(20));
        assert_eq!(avg.mean(), None);
        avg.push(t0, 1.0);
        avg.push(t0 + Duration::from_secs(10), 0.0);
        assert_eq!(avg.mean(), Some(0.5));
        avg.push(t0 + Duration::from_secs(25), 0.0);
        assert_eq!(avg.mean(), Some(0.0));
    }
}
