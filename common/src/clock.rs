// Injected time source

use chrono::{DateTime, Duration, Utc};

/// Source of the current instant. Every component asks the clock instead of
/// calling `Utc::now()` so tests can control time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Wall time anchored at construction and advanced by the tokio clock.
///
/// Under `tokio::time::pause()` the reported instant only moves with
/// `tokio::time::advance` or auto-advance, which keeps it in step with
/// `tokio::time::sleep` deadlines.
#[derive(Debug, Clone)]
pub struct TokioClock {
    base: DateTime<Utc>,
    started: tokio::time::Instant,
}

impl TokioClock {
    pub fn starting_at(base: DateTime<Utc>) -> Self {
        Self {
            base,
            started: tokio::time::Instant::now(),
        }
    }
}

impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = tokio::time::Instant::now().duration_since(self.started);
        // An elapsed time beyond chrono's range is not reachable in practice
        self.base + Duration::from_std(elapsed).unwrap_or_else(|_| Duration::zero())
    }
}
