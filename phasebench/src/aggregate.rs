//! Live aggregation shared by every terminal of a run.
//!
//! Terminals keep their samples in a private buffer and additionally bump a set of
//! per-type, per-outcome atomic counters here. The counters never block a terminal and
//! are what the interval monitor reads while the run is in progress. The buffers are
//! handed over once, at the end of the run, to build the final [`Results`].

use std::{
    collections::HashMap,
    fmt,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use serde::{Serialize, Serializer, ser::SerializeMap};

use crate::{
    metric::{Outcome, Sample, TransactionKey},
    results::Results,
};

/// Number of attempts per outcome.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OutcomeCounts([u64; Outcome::COUNT]);

impl OutcomeCounts {
    pub fn get(&self, outcome: Outcome) -> u64 {
        self.0[outcome.index()]
    }

    pub(crate) fn add(&mut self, outcome: Outcome, n: u64) {
        self.0[outcome.index()] += n;
    }

    /// Every attempt, whatever its outcome.
    pub fn total(&self) -> u64 {
        self.0.iter().sum()
    }
}

impl Serialize for OutcomeCounts {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(Outcome::COUNT))?;
        for outcome in Outcome::ALL {
            map.serialize_entry(&outcome, &self.get(outcome))?;
        }
        map.end()
    }
}

impl fmt::Display for OutcomeCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<_> = Outcome::ALL
            .iter()
            .map(|o| format!("{o:?}={}", self.get(*o)))
            .collect();
        write!(f, "{}", parts.join(" "))
    }
}

#[derive(Default)]
struct TypeCounters {
    outcomes: [AtomicU64; Outcome::COUNT],
    success_micros: AtomicU64,
}

/// Point-in-time copy of one transaction type's counters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct TypeSnapshot {
    pub transaction: TransactionKey,
    pub outcomes: OutcomeCounts,
    /// Summed latency of the successful attempts
    pub success_latency: Duration,
}

/// Point-in-time copy of every counter, warmup attempts included.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct Snapshot {
    pub types: Vec<TypeSnapshot>,
}

impl Snapshot {
    pub(crate) fn outcomes(&self) -> OutcomeCounts {
        let mut counts = OutcomeCounts::default();
        for t in &self.types {
            for outcome in Outcome::ALL {
                counts.add(outcome, t.outcomes.get(outcome));
            }
        }
        counts
    }
}

/// Lock-free accumulator every terminal records into.
pub(crate) struct Aggregator {
    slots: HashMap<TransactionKey, usize>,
    keys: Vec<TransactionKey>,
    counters: Box<[TypeCounters]>,
}

impl Aggregator {
    pub(crate) fn new(keys: impl IntoIterator<Item = TransactionKey>) -> Self {
        let mut keys: Vec<_> = keys.into_iter().collect();
        keys.sort();
        keys.dedup();
        let slots = keys
            .iter()
            .enumerate()
            .map(|(slot, key)| (key.clone(), slot))
            .collect();
        let counters = keys.iter().map(|_| TypeCounters::default()).collect();
        Self {
            slots,
            keys,
            counters,
        }
    }

    pub(crate) fn record(&self, sample: &Sample) {
        let Some(&slot) = self.slots.get(&sample.transaction) else {
            tracing::warn!("Sample for unregistered transaction {}", sample.transaction);
            return;
        };
        let counters = &self.counters[slot];
        counters.outcomes[sample.outcome.index()].fetch_add(1, Ordering::Relaxed);
        if sample.outcome == Outcome::Success {
            let micros = u64::try_from(sample.latency.as_micros()).unwrap_or(u64::MAX);
            counters.success_micros.fetch_add(micros, Ordering::Relaxed);
        }
    }

    pub(crate) fn snapshot(&self) -> Snapshot {
        let types = self
            .keys
            .iter()
            .zip(self.counters.iter())
            .map(|(key, counters)| {
                let mut outcomes = OutcomeCounts::default();
                for outcome in Outcome::ALL {
                    outcomes.add(
                        outcome,
                        counters.outcomes[outcome.index()].load(Ordering::Relaxed),
                    );
                }
                TypeSnapshot {
                    transaction: key.clone(),
                    outcomes,
                    success_latency: Duration::from_micros(
                        counters.success_micros.load(Ordering::Relaxed),
                    ),
                }
            })
            .collect();
        Snapshot { types }
    }

    /// Builds the read-only results from the terminals' buffers.
    pub(crate) fn finalize(
        &self,
        buffers: Vec<Vec<Sample>>,
        elapsed: Duration,
        measured: Duration,
    ) -> Results {
        let samples: Vec<Sample> = buffers.into_iter().flatten().collect();
        let recorded = self.snapshot().outcomes().total();
        if recorded != samples.len() as u64 {
            // a terminal task that panicked loses its buffer, its counters survive
            tracing::warn!(
                recorded,
                buffered = samples.len(),
                "Some terminal buffers were lost, results cover the buffered samples only."
            );
        }
        Results::from_samples(samples, elapsed, measured)
    }
}
