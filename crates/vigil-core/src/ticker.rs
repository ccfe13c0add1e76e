//! Cancellable fixed-period sampling timer.

use std::time::Duration;

use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Cancellable periodic sampling timer.
///
/// Ticks never queue up: if the work for one tick overruns the period, the
/// next tick is delayed rather than fired in a burst. Once the token is
/// cancelled every call to [`Ticker::tick`] returns `None`.
pub struct Ticker {
    interval: Interval,
    cancel: CancellationToken,
}

impl Ticker {
    /// Must be called from within a Tokio runtime. The first tick fires
    /// immediately.
    pub fn new(period: Duration, cancel: CancellationToken) -> Self {
        let mut interval = time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { interval, cancel }
    }

    pub fn period(&self) -> Duration {
        self.interval.period()
    }

    /// Wait for the next tick. Returns the time the tick was delivered, or
    /// `None` once cancelled.
    pub async fn tick(&mut self) -> Option<Instant> {
        if self.cancel.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            _ = self.interval.tick() => Some(Instant::now()),
        }
    }
}
