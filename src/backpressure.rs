//! Backpressure controller: the writer consults this on every
//! poll to decide how large a batch to pull from the bus and how long to
//! sleep before the next one, keyed off queue depth rather than CPU or
//! memory. Mirrors `vantage_common/backpressure.py`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing::info;

#[derive(Debug, Clone, Copy)]
pub struct BackpressureConfig {
    pub max_queue_depth: u64,
    pub low_watermark: f64,
    pub high_watermark: f64,
    /// Pressure ratio above which `should_throttle` fires and the delay
    /// policy kicks in. Distinct from `high_watermark`, which only governs
    /// the batch-size midpoint boundary.
    pub threshold_ratio: f64,
    pub min_batch_size: usize,
    pub mid_batch_size: usize,
    pub max_batch_size: usize,
    pub max_delay: Duration,
    pub base_delay: Duration,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        BackpressureConfig {
            max_queue_depth: 10_000,
            low_watermark: 0.3,
            high_watermark: 0.7,
            threshold_ratio: 0.8,
            min_batch_size: 10,
            mid_batch_size: 55,
            max_batch_size: 100,
            max_delay: Duration::from_secs_f64(2.0),
            base_delay: Duration::from_secs_f64(0.1),
        }
    }
}

/// Advice returned to the writer loop for the next poll iteration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackpressureDecision {
    pub pressure_ratio: f64,
    pub should_throttle: bool,
    pub batch_size: usize,
    pub delay: Duration,
}

/// Tracks queue depth (bus lag) and derives batch-size/delay advice from it.
/// `last_batch_size` is kept so the writer only logs when the advised batch
/// size actually shifts by a significant margin, not on every poll.
pub struct BackpressureController {
    config: BackpressureConfig,
    last_batch_size: AtomicU64,
}

const SIGNIFICANT_CHANGE: i64 = 10;

impl BackpressureController {
    pub fn new(config: BackpressureConfig) -> Self {
        BackpressureController {
            last_batch_size: AtomicU64::new(config.max_batch_size as u64),
            config,
        }
    }

    /// `queue_depth` is the current bus lag (records not yet committed).
    pub fn evaluate(&self, queue_depth: u64) -> BackpressureDecision {
        let pressure_ratio = (queue_depth as f64 / self.config.max_queue_depth as f64).min(1.0);
        let should_throttle = pressure_ratio >= self.config.threshold_ratio;

        let batch_size = if pressure_ratio < self.config.low_watermark {
            self.config.min_batch_size
        } else if pressure_ratio < self.config.high_watermark {
            self.config.mid_batch_size
        } else {
            self.config.max_batch_size
        };

        let delay = if !should_throttle {
            Duration::ZERO
        } else {
            let exponent = (pressure_ratio - self.config.threshold_ratio) / self.config.threshold_ratio;
            let scaled = self.config.base_delay.as_secs_f64() * 2f64.powf(exponent);
            Duration::from_secs_f64(scaled.min(self.config.max_delay.as_secs_f64()))
        };

        let previous = self.last_batch_size.swap(batch_size as u64, Ordering::Relaxed) as i64;
        if (previous - batch_size as i64).abs() > SIGNIFICANT_CHANGE {
            info!(
                event = "backpressure_adjusted",
                pressure_ratio,
                previous_batch_size = previous,
                batch_size,
                delay_ms = delay.as_millis() as u64,
                "backpressure batch size changed"
            );
        }

        BackpressureDecision { pressure_ratio, should_throttle, batch_size, delay }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> BackpressureController {
        BackpressureController::new(BackpressureConfig::default())
    }

    #[test]
    fn low_pressure_uses_min_batch() {
        let c = controller();
        let decision = c.evaluate(1_000);
        assert_eq!(decision.batch_size, 10);
        assert!(!decision.should_throttle);
        assert_eq!(decision.delay, Duration::ZERO);
    }

    #[test]
    fn mid_pressure_uses_mid_batch_no_delay() {
        let c = controller();
        let decision = c.evaluate(5_000);
        assert_eq!(decision.batch_size, 55);
        assert!(!decision.should_throttle);
        assert_eq!(decision.delay, Duration::ZERO);
    }

    #[test]
    fn high_pressure_throttles_with_delay() {
        let c = controller();
        let decision = c.evaluate(9_000);
        assert_eq!(decision.batch_size, 100);
        assert!(decision.should_throttle);
        assert!(decision.delay > Duration::ZERO);
        assert!(decision.delay <= Duration::from_secs_f64(2.0));
    }

    #[test]
    fn pressure_ratio_is_capped_at_one() {
        let c = controller();
        let decision = c.evaluate(50_000);
        assert_eq!(decision.pressure_ratio, 1.0);
        assert!(decision.should_throttle);
        // exponent = (1.0 - 0.8) / 0.8 = 0.25 -> 0.1 * 2^0.25 ~= 0.119s
        assert!(decision.delay > Duration::from_millis(100));
        assert!(decision.delay < Duration::from_millis(150));
    }

    #[test]
    fn delay_is_zero_below_threshold_ratio() {
        let c = controller();
        // pressure 0.75 is above high_watermark (batch-size boundary) but
        // below threshold_ratio (throttle boundary), so no delay yet.
        let decision = c.evaluate(7_500);
        assert!(!decision.should_throttle);
        assert_eq!(decision.delay, Duration::ZERO);
        assert_eq!(decision.batch_size, 100);
    }
}
