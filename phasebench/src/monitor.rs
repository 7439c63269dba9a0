//! Live throughput reporting while a run is in progress.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use tokio::{
    sync::watch,
    time::{Instant, MissedTickBehavior, interval_at},
};

use crate::{
    aggregate::{Aggregator, Snapshot},
    metric::{Outcome, TransactionKey},
};

/// Activity observed during one monitor period.
#[derive(Clone, Debug, PartialEq)]
pub struct IntervalReport {
    /// Offset from the start of the run
    pub at: Duration,
    /// Attempts per second over the period, warmup included
    pub throughput: f64,
    /// Average latency of the successes of the period, per transaction type
    pub latencies: BTreeMap<TransactionKey, Duration>,
}

/// Receives one [`IntervalReport`] per monitor period. Must not block.
pub trait IntervalObserver: Send + Sync {
    fn observe(&self, report: &IntervalReport);
}

impl<F> IntervalObserver for F
where
    F: Fn(&IntervalReport) + Send + Sync,
{
    fn observe(&self, report: &IntervalReport) {
        self(report)
    }
}

/// Logs each period's throughput at `info`.
pub struct LogObserver;

impl IntervalObserver for LogObserver {
    fn observe(&self, report: &IntervalReport) {
        tracing::info!(at = ?report.at, "Throughput: {:.2} txn/sec", report.throughput);
    }
}

fn delta(previous: &Snapshot, current: &Snapshot, at: Duration, period: Duration) -> IntervalReport {
    let attempts = current.outcomes().total() - previous.outcomes().total();
    let latencies = current
        .types
        .iter()
        .zip(previous.types.iter())
        .filter_map(|(now, before)| {
            let completed = now.outcomes.get(Outcome::Success) - before.outcomes.get(Outcome::Success);
            let latency = now.success_latency.saturating_sub(before.success_latency);
            (completed > 0).then(|| {
                let average = u64::try_from(latency.as_nanos() / u128::from(completed))
                    .map_or(Duration::MAX, Duration::from_nanos);
                (now.transaction.clone(), average)
            })
        })
        .collect();
    IntervalReport {
        at,
        throughput: attempts as f64 / period.as_secs_f64(),
        latencies,
    }
}

/// Samples the aggregator every `period` until the run stops.
pub(crate) async fn run_monitor(
    aggregator: Arc<Aggregator>,
    period: Duration,
    epoch: Instant,
    observer: Arc<dyn IntervalObserver>,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::debug!(?period, "Interval monitor started.");
    let mut ticker = interval_at(epoch + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut previous = aggregator.snapshot();
    let mut last = epoch;

    loop {
        tokio::select! {
            _ = shutdown.wait_for(|stop| *stop) => break,
            now = ticker.tick() => {
                let current = aggregator.snapshot();
                let report = delta(&previous, &current, now.duration_since(epoch), now - last);
                observer.observe(&report);
                previous = current;
                last = now;
            }
        }
    }
    tracing::debug!("Interval monitor stopped.");
}
