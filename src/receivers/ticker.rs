//! Fixed-rate scheduling for receiver workers
//!
//! A [`Ticker`] tracks the next scheduled tick on the monotonic clock and
//! reports how late a tick was processed. [`run_periodic`] drives an
//! acquisition pass from it until the stop channel fires.

use log::{debug, warn};
use serde::Deserialize;
use std::sync::mpsc::{Receiver, RecvTimeoutError, TryRecvError};
use std::time::{Duration, Instant};

/// Lateness above which a tick is reported as drifted
pub const DRIFT_THRESHOLD: Duration = Duration::from_secs(5);

/// What to do with ticks that elapsed while a pass was still running
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MissedTickPolicy {
    /// Fold all missed ticks into one pass and realign to the schedule
    #[default]
    Coalesce,
    /// Run one pass for every missed tick, back to back
    Replay,
}

/// A processed tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tick {
    /// Scheduled instant of the tick
    pub scheduled: Instant,
    /// How long after `scheduled` it was processed
    pub late: Duration,
    /// Ticks dropped by [`MissedTickPolicy::Coalesce`]
    pub skipped: u32,
    drift_threshold: Duration,
}

impl Tick {
    pub fn drifted(&self) -> bool {
        self.late > self.drift_threshold
    }
}

#[derive(Debug, Clone)]
pub struct Ticker {
    interval: Duration,
    next: Instant,
    policy: MissedTickPolicy,
    drift_threshold: Duration,
}

impl Ticker {
    /// First tick is due one `interval` after `start`
    pub fn new(interval: Duration, start: Instant, policy: MissedTickPolicy) -> Self {
        Self {
            interval,
            next: start + interval,
            policy,
            drift_threshold: DRIFT_THRESHOLD,
        }
    }

    pub fn with_drift_threshold(mut self, threshold: Duration) -> Self {
        self.drift_threshold = threshold;
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Time left until the next tick is due
    pub fn remaining(&self, now: Instant) -> Duration {
        self.next.saturating_duration_since(now)
    }

    /// Consume the due tick, processed at `now`
    pub fn fire(&mut self, now: Instant) -> Tick {
        let scheduled = self.next;
        let late = now.saturating_duration_since(scheduled);
        let mut skipped = 0;

        self.next = scheduled + self.interval;
        if self.policy == MissedTickPolicy::Coalesce && self.next <= now {
            let behind = now.duration_since(self.next).as_nanos() / self.interval.as_nanos().max(1);
            let behind = u32::try_from(behind).unwrap_or(u32::MAX - 1);
            skipped = behind + 1;
            self.next += self.interval * skipped;
        }

        Tick {
            scheduled,
            late,
            skipped,
            drift_threshold: self.drift_threshold,
        }
    }
}

/// Counters reported by a worker when it exits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub passes: u64,
    pub drifted_ticks: u64,
    pub skipped_ticks: u64,
}

/// Run `pass` immediately and then on every tick until `stop` fires
///
/// Stop is signalled by sending on, or dropping the sender of, `stop`. It is
/// checked before every pass and while waiting for a tick; a running pass is
/// never interrupted.
pub fn run_periodic<F>(
    name: &str,
    mut ticker: Ticker,
    stop: &Receiver<()>,
    mut pass: F,
) -> LoopStats
where
    F: FnMut(),
{
    let mut stats = LoopStats::default();

    loop {
        match stop.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => break,
            Err(TryRecvError::Empty) => {}
        }

        pass();
        stats.passes += 1;

        match stop.recv_timeout(ticker.remaining(Instant::now())) {
            Err(RecvTimeoutError::Timeout) => {
                let tick = ticker.fire(Instant::now());
                if tick.drifted() {
                    stats.drifted_ticks += 1;
                    warn!("{}: missed ticker event for more than {:?}", name, tick.late);
                }
                if tick.skipped > 0 {
                    stats.skipped_ticks += u64::from(tick.skipped);
                    debug!("{}: coalesced {} missed ticks", name, tick.skipped);
                }
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    stats
}
