use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{Instant, sleep_until};
use tracing::trace;

/// Independent spacing budgets for outbound calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Budget {
    /// Catalog and other registry API calls.
    Api,
    /// Release archive downloads.
    Download,
}

/// Enforces a minimum gap between consecutive calls on each budget.
///
/// Each budget has its own lock, held across the wait, so callers sharing one
/// limiter are spaced globally rather than per caller.
pub struct RateLimiter {
    api_delay: Duration,
    download_delay: Duration,
    api_last: Mutex<Option<Instant>>,
    download_last: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(api_delay: Duration, download_delay: Duration) -> Self {
        Self {
            api_delay,
            download_delay,
            api_last: Mutex::new(None),
            download_last: Mutex::new(None),
        }
    }

    /// A limiter that never waits.
    pub fn unlimited() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }

    pub fn delay(&self, budget: Budget) -> Duration {
        match budget {
            Budget::Api => self.api_delay,
            Budget::Download => self.download_delay,
        }
    }

    /// Wait until the budget's delay has elapsed since its previous call.
    ///
    /// Returns the instant the call was granted.
    pub async fn throttle(&self, budget: Budget) -> Instant {
        let delay = self.delay(budget);
        let slot = match budget {
            Budget::Api => &self.api_last,
            Budget::Download => &self.download_last,
        };

        let mut last = slot.lock().await;
        if let Some(previous) = *last {
            let ready_at = previous + delay;
            if ready_at > Instant::now() {
                trace!(?budget, wait_ms = (ready_at - Instant::now()).as_millis() as u64, "throttling");
                sleep_until(ready_at).await;
            }
        }
        let granted = Instant::now();
        *last = Some(granted);
        granted
    }
}
