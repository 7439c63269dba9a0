//! Finalized results of a run.
//!
//! [`Results`] is read-only once built. It holds one [`OutcomeHistogram`] per outcome,
//! every sample in chronological order and the distinct user-abort messages. Warmup
//! samples stay in the sample sequence but never reach a histogram, a window or an abort
//! count.

use std::{
    collections::{BTreeMap, btree_map},
    fmt,
    time::Duration,
};

use serde::Serialize;

use crate::{
    aggregate::OutcomeCounts,
    histogram::{LatencyHistogram, LatencyStats},
    metric::{Outcome, Sample, TransactionKey},
};

/// Latency histograms of one outcome, keyed by transaction type.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct OutcomeHistogram {
    by_type: BTreeMap<TransactionKey, LatencyHistogram>,
}

impl OutcomeHistogram {
    fn record(&mut self, key: &TransactionKey, latency: Duration) {
        self.by_type.entry(key.clone()).or_default().record(latency);
    }

    pub fn merge(&mut self, other: &OutcomeHistogram) {
        for (key, histogram) in &other.by_type {
            self.by_type.entry(key.clone()).or_default().merge(histogram);
        }
    }

    pub fn get(&self, key: &TransactionKey) -> Option<&LatencyHistogram> {
        self.by_type.get(key)
    }

    /// Count for one transaction type, 0 when it never had this outcome.
    pub fn count_of(&self, key: &TransactionKey) -> u64 {
        self.get(key).map_or(0, LatencyHistogram::count)
    }

    /// Attempts summed over every transaction type.
    pub fn count(&self) -> u64 {
        self.by_type.values().map(LatencyHistogram::count).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_type.is_empty()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, TransactionKey, LatencyHistogram> {
        self.by_type.iter()
    }

    /// All transaction types folded into one histogram.
    pub fn combined(&self) -> LatencyHistogram {
        let mut all = LatencyHistogram::new();
        for histogram in self.by_type.values() {
            all.merge(histogram);
        }
        all
    }
}

impl fmt::Display for OutcomeHistogram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.by_type.is_empty() {
            return writeln!(f, "  <EMPTY>");
        }
        for (key, histogram) in &self.by_type {
            writeln!(f, "  {key:<40} {:>10}", histogram.count())?;
        }
        Ok(())
    }
}

/// One fixed-size bucket of the windowed series.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Window {
    /// `start / window_size`
    pub index: u64,
    /// Offset from the start of the run
    pub start: Duration,
    /// Successful transactions per second within the window
    pub throughput: f64,
    pub completed: u64,
    /// Non-successful attempts, retries included
    pub errors: u64,
    /// Distribution of the successful attempts
    pub latency: Option<LatencyStats>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Results {
    histograms: [OutcomeHistogram; Outcome::COUNT],
    samples: Vec<Sample>,
    abort_messages: BTreeMap<String, u64>,
    elapsed: Duration,
    measured: Duration,
    window_size: Duration,
}

impl Results {
    /// `elapsed` is the wall-clock length of the run, `measured` the part of it outside
    /// warmup windows.
    pub fn from_samples(mut samples: Vec<Sample>, elapsed: Duration, measured: Duration) -> Self {
        let mut results = Self {
            elapsed,
            measured,
            ..Default::default()
        };
        for sample in samples.iter().filter(|s| !s.is_warmup) {
            results.absorb(sample);
        }
        samples.sort_by_key(|s| (s.start, s.worker_id));
        results.samples = samples;
        results
    }

    /// Sets the bucket size [`Results::configured_windows`] uses.
    pub fn with_window_size(mut self, window_size: Duration) -> Self {
        self.window_size = window_size;
        self
    }

    fn absorb(&mut self, sample: &Sample) {
        self.histograms[sample.outcome.index()].record(&sample.transaction, sample.latency);
        if let Some(message) = &sample.abort_message {
            *self.abort_messages.entry(message.clone()).or_default() += 1;
        }
    }

    /// Combines results built from disjoint sample sets of the same run.
    pub fn merge(&mut self, other: Results) {
        for (mine, theirs) in self.histograms.iter_mut().zip(other.histograms.iter()) {
            mine.merge(theirs);
        }
        for (message, count) in other.abort_messages {
            *self.abort_messages.entry(message).or_default() += count;
        }
        self.samples.extend(other.samples);
        self.samples.sort_by_key(|s| (s.start, s.worker_id));
        self.elapsed = self.elapsed.max(other.elapsed);
        self.measured = self.measured.max(other.measured);
        if self.window_size.is_zero() {
            self.window_size = other.window_size;
        }
    }

    pub fn histogram(&self, outcome: Outcome) -> &OutcomeHistogram {
        &self.histograms[outcome.index()]
    }

    pub fn success(&self) -> &OutcomeHistogram {
        self.histogram(Outcome::Success)
    }

    pub fn abort(&self) -> &OutcomeHistogram {
        self.histogram(Outcome::UserAbort)
    }

    pub fn retry(&self) -> &OutcomeHistogram {
        self.histogram(Outcome::Retry)
    }

    pub fn retry_different(&self) -> &OutcomeHistogram {
        self.histogram(Outcome::RetryDifferent)
    }

    pub fn error(&self) -> &OutcomeHistogram {
        self.histogram(Outcome::DbError)
    }

    pub fn unknown(&self) -> &OutcomeHistogram {
        self.histogram(Outcome::Unknown)
    }

    /// Every recorded attempt, warmup included, ordered by start time.
    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn abort_messages(&self) -> &BTreeMap<String, u64> {
        &self.abort_messages
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn measured(&self) -> Duration {
        self.measured
    }

    /// Non-warmup attempts per outcome; they sum to [`Results::measured_attempts`].
    pub fn outcome_counts(&self) -> OutcomeCounts {
        let mut counts = OutcomeCounts::default();
        for outcome in Outcome::ALL {
            counts.add(outcome, self.histogram(outcome).count());
        }
        counts
    }

    pub fn measured_attempts(&self) -> u64 {
        self.outcome_counts().total()
    }

    pub fn warmup_attempts(&self) -> u64 {
        self.samples.iter().filter(|s| s.is_warmup).count() as u64
    }

    /// Measured attempts per second.
    pub fn throughput(&self) -> f64 {
        per_second(self.measured_attempts(), self.measured)
    }

    /// Successful transactions per second.
    pub fn goodput(&self) -> f64 {
        per_second(self.success().count(), self.measured)
    }

    /// Bucket size of the run's windowed series, zero when none was configured.
    pub fn window_size(&self) -> Duration {
        self.window_size
    }

    /// [`Results::windows`] with the window size the run was configured with.
    pub fn configured_windows(&self) -> Vec<Window> {
        self.windows(self.window_size)
    }

    /// Every measured transaction type, bucketed into `window`-sized slices.
    pub fn windows(&self, window: Duration) -> Vec<Window> {
        self.windows_matching(window, |_| true)
    }

    pub fn windows_for(&self, key: &TransactionKey, window: Duration) -> Vec<Window> {
        self.windows_matching(window, |s| s.transaction == *key)
    }

    /// Contiguous buckets from the first to the last matching measured sample.
    fn windows_matching(&self, window: Duration, keep: impl Fn(&Sample) -> bool) -> Vec<Window> {
        if window.is_zero() {
            return Vec::new();
        }
        let bucket_of = |s: &Sample| (s.start.as_nanos() / window.as_nanos()) as u64;

        let mut buckets: BTreeMap<u64, (u64, u64, LatencyHistogram)> = BTreeMap::new();
        for sample in self.samples.iter().filter(|s| !s.is_warmup && keep(s)) {
            let (completed, errors, latency) = buckets.entry(bucket_of(sample)).or_default();
            if sample.outcome == Outcome::Success {
                *completed += 1;
                latency.record(sample.latency);
            } else {
                *errors += 1;
            }
        }

        let (Some(&first), Some(&last)) = (buckets.keys().next(), buckets.keys().next_back())
        else {
            return Vec::new();
        };
        (first..=last)
            .map(|index| {
                let (completed, errors, latency) = buckets.remove(&index).unwrap_or_default();
                Window {
                    index,
                    start: u64::try_from(window.as_nanos() * u128::from(index))
                        .map_or(Duration::MAX, Duration::from_nanos),
                    throughput: per_second(completed, window),
                    completed,
                    errors,
                    latency: latency.stats(),
                }
            })
            .collect()
    }
}

fn per_second(count: u64, over: Duration) -> f64 {
    if over.is_zero() {
        0.0
    } else {
        count as f64 / over.as_secs_f64()
    }
}
