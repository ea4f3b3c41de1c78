use std::{sync::Arc, time::Duration};

use tokio::{
    sync::Notify,
    time::{Interval, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

/// Drives a periodic background loop.
///
/// Each call to [`tick`](Poller::tick) waits for the next interval tick or,
/// when configured, for a wake-up signal, whichever comes first. The first
/// tick completes immediately.
pub(crate) struct Poller {
    ticker: Interval,
    wake: Option<Arc<Notify>>,
}

/// Builder for creating a `Poller`.
pub(crate) struct PollerBuilder {
    interval: Duration,
    wake: Option<Arc<Notify>>,
}

impl PollerBuilder {
    /// Create a new `PollerBuilder` with the specified polling interval.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            wake: None,
        }
    }

    /// Also wake up whenever `notify` fires.
    pub fn wake_on(mut self, notify: Option<Arc<Notify>>) -> Self {
        self.wake = notify;
        self
    }

    pub fn build(self) -> Poller {
        // tokio panics on a zero period.
        let mut ticker = tokio::time::interval(self.interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Poller {
            ticker,
            wake: self.wake,
        }
    }
}

impl Poller {
    /// Wait for the next cycle. Returns `false` once `cancel` fires.
    pub async fn tick(&mut self, cancel: &CancellationToken) -> bool {
        let Self { ticker, wake } = self;
        let woken = async {
            match wake {
                Some(notify) => notify.notified().await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            _ = ticker.tick() => true,
            _ = woken => {
                ticker.reset();
                true
            }
        }
    }
}
