use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::Result;

/// Delay between two runs of a periodic task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interval {
    Fixed(Duration),
    /// Drawn uniformly from `[lo, hi]` on every tick so that a fleet of
    /// supervisors does not hit the store in lockstep.
    Jittered { lo: Duration, hi: Duration },
}

impl Interval {
    /// `[0.5 × center, 1.5 × center]`, with the upper bound saturating at
    /// `Duration::MAX`.
    pub fn around(center: Duration) -> Self {
        let half = center / 2;
        Interval::Jittered {
            lo: half,
            hi: center.saturating_add(half),
        }
    }

    pub fn next_delay(&self) -> Duration {
        match *self {
            Interval::Fixed(delay) => delay,
            Interval::Jittered { lo, hi } if hi <= lo => lo,
            Interval::Jittered { lo, hi } => rand::thread_rng().gen_range(lo..=hi),
        }
    }
}

/// Run `tick` now and then again after every `interval`, until `shutdown`
/// is cancelled.
///
/// A failing tick is logged and the schedule continues: one bad run must
/// not stop the others.
pub async fn every<F, Fut>(name: &'static str, interval: Interval, shutdown: CancellationToken, mut tick: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    loop {
        if let Err(e) = tick().await {
            warn!(task = name, error = %e, "periodic task failed");
        }
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(interval.next_delay()) => {}
        }
    }
}
