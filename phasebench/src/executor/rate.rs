//! Rate limiting: converting a phase's target rate into issue permits.
//!
//! Every terminal asks its [`Pacer`] for a permit before starting a transaction. The pacer
//! depends on the active phase:
//!
//! - **unlimited**: permits are granted immediately.
//! - **closed arrival**: the terminal waits until `last_issue + interval`, where the
//!   per-terminal interval is `active_terminals / rate` so the phase as a whole never
//!   exceeds `rate`. A slow transaction never causes a catch-up burst.
//! - **open arrival**: a governor task owned by the phase driver releases permits into a
//!   shared pool on a fixed schedule, independent of completions. The `n`th permit is
//!   due at `phase_start + n / rate`; a terminal that picks it up late reports the delay
//!   as the sample's lateness.
//!
//! # Mathematical behavior of the governor
//! At every tick the governor recomputes how many permits should exist from the elapsed
//! time rather than adding a per-tick increment:
//!
//! ```text
//! due(t) = floor(t * rate) + 1
//! add    = due(t) - released
//! ```
//!
//! Because `due` is derived from the monotonic clock, a late tick only delays permits, it
//! never loses them, and scheduling jitter cannot decay the long-run rate.
//!
//! # Tuning knobs
//! - `tick`: granularity of permit releases. Smaller ticks reduce lateness at the cost of
//!   more wakeups. Typical values: 1–20ms.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::{
    sync::Semaphore,
    time::{Instant, sleep_until},
};

use crate::phase::{Arrival, Phase, RateSpec};

/// The semaphore reserves the top bits of usize for flags; never release more permits
/// than it can hold.
pub(crate) const MAX_PERMITS: u64 = Semaphore::MAX_PERMITS as u64;

/// Number of open-loop permits due `elapsed` after the phase start, counting the one
/// issued at the start itself. Saturates instead of panicking on extreme rates.
pub(crate) fn permits_due(elapsed: Duration, rate: f64) -> u64 {
    let due = (elapsed.as_secs_f64() * rate).floor() + 1.0;
    if due.is_nan() || due < 1.0 {
        0
    } else if due >= MAX_PERMITS as f64 {
        MAX_PERMITS
    } else {
        due as u64
    }
}

/// Open-loop permit pool shared by the phase driver and the terminals of one phase.
pub(crate) struct OpenSchedule {
    started: Instant,
    rate: f64,
    permits: Semaphore,
    taken: AtomicU64,
}

impl OpenSchedule {
    pub(crate) fn new(started: Instant, rate: f64) -> Self {
        Self {
            started,
            rate,
            permits: Semaphore::new(0),
            taken: AtomicU64::new(0),
        }
    }

    /// When the `n`th permit (0-based) was due.
    pub(crate) fn scheduled_at(&self, n: u64) -> Instant {
        self.started + Duration::from_secs_f64(n as f64 / self.rate)
    }

    /// Waits for the next permit and returns how late it was picked up.
    /// `None` once the phase has closed the pool.
    pub(crate) async fn acquire(&self) -> Option<Duration> {
        let permit = self.permits.acquire().await.ok()?;
        // permits are never handed back, only the governor creates them
        permit.forget();
        let n = self.taken.fetch_add(1, Ordering::Relaxed);
        Some(Instant::now().saturating_duration_since(self.scheduled_at(n)))
    }

    pub(crate) fn close(&self) {
        self.permits.close();
    }

    /// Permits handed out to terminals so far.
    pub(crate) fn taken(&self) -> u64 {
        self.taken.load(Ordering::Relaxed)
    }

    /// Governor loop, runs until the pool is closed or the task is aborted.
    pub(crate) async fn govern(self: Arc<Self>, tick: Duration) {
        let mut released = 0u64;
        let mut next_tick = self.started;
        tracing::debug!(rate = self.rate, "Open-loop governor started.");
        while !self.permits.is_closed() {
            let due = permits_due(Instant::now().duration_since(self.started), self.rate);
            if due > released {
                self.permits.add_permits((due - released) as usize);
                released = due;
            }
            next_tick += tick;
            sleep_until(next_tick).await;
        }
        tracing::debug!(released, "Open-loop governor stopped.");
    }
}

/// Completion-driven pacing for one terminal.
#[derive(Debug)]
pub(crate) struct ClosedPacer {
    interval: Duration,
    last_issue: Option<Instant>,
}

impl ClosedPacer {
    pub(crate) fn new(rate: f64, active_terminals: usize) -> Self {
        Self {
            interval: Duration::from_secs_f64(active_terminals.max(1) as f64 / rate),
            last_issue: None,
        }
    }

    /// Absolute deadline of the next permit; never earlier than `now`.
    pub(crate) fn next_deadline(&self, now: Instant) -> Instant {
        match self.last_issue {
            Some(last) => (last + self.interval).max(now),
            None => now,
        }
    }

    /// Cancel-safe: state only changes after the wait completed.
    pub(crate) async fn acquire(&mut self) -> Duration {
        let deadline = self.next_deadline(Instant::now());
        sleep_until(deadline).await;
        self.last_issue = Some(deadline);
        Duration::ZERO
    }
}

/// The permit source a terminal uses during one phase.
pub(crate) enum Pacer {
    Unlimited,
    Closed(ClosedPacer),
    Open(Arc<OpenSchedule>),
}

impl Pacer {
    pub(crate) fn for_phase(phase: &Phase, open: Option<&Arc<OpenSchedule>>) -> Self {
        match (phase.rate, phase.arrival, open) {
            (RateSpec::Limited(_), Arrival::Open, Some(schedule)) => {
                Pacer::Open(Arc::clone(schedule))
            }
            (RateSpec::Limited(rate), _, _) => {
                Pacer::Closed(ClosedPacer::new(rate, phase.active_terminals))
            }
            _ => Pacer::Unlimited,
        }
    }

    /// Waits for permission to issue the next transaction and returns its lateness.
    /// `None` means the phase stopped issuing permits.
    pub(crate) async fn acquire(&mut self) -> Option<Duration> {
        match self {
            Pacer::Unlimited => {
                // keep an unthrottled terminal from starving its neighbours
                tokio::task::yield_now().await;
                Some(Duration::ZERO)
            }
            Pacer::Closed(pacer) => Some(pacer.acquire().await),
            Pacer::Open(schedule) => schedule.acquire().await,
        }
    }
}
