//! Phase driver: walks one benchmark's schedule on the shared clock.
//!
//! The driver is the only writer of its benchmark's phase channel. For every enabled
//! phase it publishes an [`ActivePhase`], waits for the phase to end (its duration
//! elapsed, or its transaction budget completed) and publishes [`PhaseSignal::Idle`]
//! before the next activation, so two phases of a benchmark are never active at once.
//! Terminals receive the signals through `watch` receivers; in-flight transactions of an
//! outgoing phase finish undisturbed.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::{
    sync::{Notify, watch},
    time::{Instant, sleep_until},
};

use super::rate::OpenSchedule;
use crate::phase::{Arrival, Phase, PhaseSchedule, RateSpec};

/// What a benchmark's terminals should be doing.
#[derive(Clone)]
pub(crate) enum PhaseSignal {
    /// Between phases, or before the first one
    Idle,
    Active(Arc<ActivePhase>),
    /// The schedule is exhausted, terminals exit
    Finished,
}

/// One activation of a phase. Identity (pointer equality) tells terminals whether the
/// phase they are working on is still the current one.
pub(crate) struct ActivePhase {
    pub(crate) phase: Arc<Phase>,
    /// Start of the whole run, the origin of sample timestamps
    pub(crate) epoch: Instant,
    pub(crate) started: Instant,
    pub(crate) open: Option<Arc<OpenSchedule>>,
    pub(crate) budget: Option<Arc<Budget>>,
}

impl ActivePhase {
    pub(crate) fn is_warmup(&self, at: Instant) -> bool {
        self.phase.is_warmup(at.saturating_duration_since(self.started))
    }
}

/// Completion budget of a non-timed phase.
///
/// A terminal reserves a slot before executing, then either completes it or, for retry
/// outcomes, gives it back. The phase ends when `target` slots have completed.
pub(crate) struct Budget {
    target: u64,
    available: AtomicU64,
    completed: AtomicU64,
    done: Notify,
}

impl Budget {
    pub(crate) fn new(target: u64) -> Self {
        Self {
            target,
            available: AtomicU64::new(target),
            completed: AtomicU64::new(0),
            done: Notify::new(),
        }
    }

    pub(crate) fn try_reserve(&self) -> bool {
        self.available
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }

    pub(crate) fn release(&self) {
        self.available.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn complete(&self) {
        if self.completed.fetch_add(1, Ordering::AcqRel) + 1 >= self.target {
            self.done.notify_one();
        }
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.completed.load(Ordering::Acquire) >= self.target
    }

    async fn wait(&self) {
        while !self.is_complete() {
            self.done.notified().await;
        }
    }
}

/// Drives every phase of `schedule` and returns the measured (non-warmup) time.
pub(crate) async fn drive_phases(
    schedule: PhaseSchedule,
    signals: watch::Sender<PhaseSignal>,
    epoch: Instant,
    tick: Duration,
) -> Duration {
    let benchmark = Arc::clone(schedule.benchmark());
    let total = schedule.len();
    let mut measured = Duration::ZERO;

    for phase in schedule.iter() {
        if phase.is_disabled() {
            tracing::info!(%benchmark, "Skipping disabled phase {}/{total}", phase.id);
            continue;
        }
        tracing::info!(
            %benchmark,
            rate = ?phase.rate,
            arrival = ?phase.arrival,
            terminals = phase.active_terminals,
            "Starting phase {}/{total}",
            phase.id
        );

        let started = Instant::now();
        let open = match (phase.rate, phase.arrival) {
            (RateSpec::Limited(rate), Arrival::Open) => {
                Some(Arc::new(OpenSchedule::new(started, rate)))
            }
            _ => None,
        };
        let governor = open
            .as_ref()
            .map(|schedule| tokio::spawn(Arc::clone(schedule).govern(tick)));
        let budget = phase.budget().map(|target| Arc::new(Budget::new(target)));

        signals.send_replace(PhaseSignal::Active(Arc::new(ActivePhase {
            phase: Arc::clone(phase),
            epoch,
            started,
            open: open.clone(),
            budget: budget.clone(),
        })));

        match (phase.duration, &budget) {
            (Some(duration), _) => sleep_until(started + duration).await,
            (None, Some(budget)) => budget.wait().await,
            (None, None) => {}
        }

        signals.send_replace(PhaseSignal::Idle);
        if let Some(open) = &open {
            open.close();
            tracing::debug!(%benchmark, taken = open.taken(), "Open-loop pool closed.");
        }
        if let Some(governor) = governor {
            governor.abort();
        }

        let elapsed = started.elapsed();
        measured += elapsed.saturating_sub(phase.warmup);
        tracing::info!(%benchmark, ?elapsed, "Finishing phase {}/{total}", phase.id);
    }

    signals.send_replace(PhaseSignal::Finished);
    tracing::debug!(%benchmark, "Phase schedule exhausted.");
    measured
}
