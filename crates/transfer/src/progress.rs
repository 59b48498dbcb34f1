use std::time::{Duration, Instant};

/// Default minimum time between progress notifications.
const DEFAULT_INTERVAL: Duration = Duration::from_millis(500);

/// Default minimum percentage change between progress notifications.
const DEFAULT_STEP: f64 = 2.0;

/// Rate-limits progress notifications for one transfer.
///
/// A notification passes when progress moved by at least the step, the
/// interval elapsed since the last one, or the transfer reached 100%.
#[derive(Debug, Clone)]
pub struct ProgressThrottle {
    interval: Duration,
    step: f64,
    last_pct: Option<f64>,
    last_at: Instant,
}

impl Default for ProgressThrottle {
    fn default() -> Self {
        Self::new(DEFAULT_INTERVAL, DEFAULT_STEP)
    }
}

impl ProgressThrottle {
    pub fn new(interval: Duration, step: f64) -> Self {
        Self {
            interval,
            step,
            last_pct: None,
            last_at: Instant::now(),
        }
    }

    /// Returns `true` if a notification for `pct` should go out now.
    pub fn should_emit(&mut self, pct: f64) -> bool {
        let due = match self.last_pct {
            None => true,
            Some(last) => {
                (pct >= 100.0 && last < 100.0)
                    || pct - last >= self.step
                    || self.last_at.elapsed() >= self.interval
            }
        };
        if due {
            self.last_pct = Some(pct);
            self.last_at = Instant::now();
        }
        due
    }
}
