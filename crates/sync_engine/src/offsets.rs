//! Fixed-length window of clock offset samples

use ringbuf::{traits::*, HeapRb};

/// Circular buffer of offsets (µs) with the statistics used for calibration
///
/// All statistics of an empty buffer are 0, never NaN.
pub struct OffsetBuffer {
    samples: HeapRb<i64>,
    capacity: usize,
    sum: i128,
}

impl std::fmt::Debug for OffsetBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OffsetBuffer")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl OffsetBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: HeapRb::new(capacity),
            capacity,
            sum: 0,
        }
    }

    /// Append a sample, evicting the oldest one when full
    pub fn push(&mut self, offset_us: i64) {
        if let Some(evicted) = self.samples.push_overwrite(offset_us) {
            self.sum -= i128::from(evicted);
        }
        self.sum += i128::from(offset_us);
    }

    pub fn len(&self) -> usize {
        self.samples.occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.samples = HeapRb::new(self.capacity);
        self.sum = 0;
    }

    pub fn mean(&self) -> f64 {
        match self.len() {
            0 => 0.0,
            n => self.sum as f64 / n as f64,
        }
    }

    /// Median, rounded toward the lower middle sample pair average
    pub fn median(&self) -> i64 {
        let mut sorted: Vec<i64> = self.samples.iter().copied().collect();
        if sorted.is_empty() {
            return 0;
        }
        sorted.sort_unstable();
        let mid = sorted.len() / 2;
        if sorted.len() % 2 == 1 {
            sorted[mid]
        } else {
            let pair = i128::from(sorted[mid - 1]) + i128::from(sorted[mid]);
            (pair / 2) as i64
        }
    }

    /// Population standard deviation
    pub fn std_dev(&self) -> f64 {
        let n = self.len();
        if n < 2 {
            return 0.0;
        }
        let mean = self.mean();
        let variance = self
            .samples
            .iter()
            .map(|&v| {
                let d = v as f64 - mean;
                d * d
            })
            .sum::<f64>()
            / n as f64;
        variance.sqrt()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_statistics_are_zero() {
        let buffer = OffsetBuffer::new(0);
        assert_eq!(buffer.capacity(), 1);
        assert_eq!(buffer.median(), 0);
        assert_eq!(buffer.mean(), 0.0);
        assert_eq!(buffer.std_dev(), 0.0);
    }

    #[test]
    fn test_median_resists_outliers() {
        let mut buffer = OffsetBuffer::new(5);
        for v in [100, 101, 99, 100, 90_000] {
            buffer.push(v);
        }
        assert_eq!(buffer.median(), 100);
        assert!(buffer.mean() > 10_000.0);
    }

    #[test]
    fn test_overwrite_keeps_running_sum() {
        let mut buffer = OffsetBuffer::new(3);
        for v in [10, 20, 30, 40, 50] {
            buffer.push(v);
        }
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.mean(), 40.0);
        assert_eq!(buffer.median(), 40);
    }

    #[test]
    fn test_std_dev() {
        let mut buffer = OffsetBuffer::new(4);
        for v in [2, 4, 4, 6] {
            buffer.push(v);
        }
        assert!((buffer.std_dev() - 2f64.sqrt()).abs() < 1e-9);

        buffer.clear();
        assert!(buffer.is_empty());
        assert_eq!(buffer.mean(), 0.0);
    }
}
