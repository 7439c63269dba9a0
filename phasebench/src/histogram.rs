//! Latency histograms.
//!
//! [`LatencyHistogram`] wraps an HDR histogram with microsecond resolution and three
//! significant figures. The HDR buckets only approximate values, so the wrapper also keeps
//! an exact count, sum, minimum and maximum. Both parts merge additively, which keeps
//! histograms built from disjoint sample sets combinable in any order.

use std::time::Duration;

use hdrhistogram::Histogram;
use serde::{Serialize, Serializer};

const SIGNIFICANT_FIGURES: u8 = 3;

#[derive(Clone, Debug)]
pub struct LatencyHistogram {
    buckets: Histogram<u64>,
    count: u64,
    total: Duration,
    min: Option<Duration>,
    max: Duration,
}

impl LatencyHistogram {
    pub fn new() -> Self {
        Self {
            // auto-resizing, so any latency can be recorded
            buckets: Histogram::new(SIGNIFICANT_FIGURES)
                .expect("3 significant figures is within hdrhistogram's supported range"),
            count: 0,
            total: Duration::ZERO,
            min: None,
            max: Duration::ZERO,
        }
    }

    pub fn record(&mut self, latency: Duration) {
        let micros = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        self.buckets.saturating_record(micros);
        self.count += 1;
        self.total += latency;
        self.min = Some(self.min.map_or(latency, |min| min.min(latency)));
        self.max = self.max.max(latency);
    }

    pub fn merge(&mut self, other: &LatencyHistogram) {
        if let Err(err) = self.buckets.add(&other.buckets) {
            tracing::warn!("Could not merge latency buckets: {err}");
        }
        self.count += other.count;
        self.total += other.total;
        self.min = match (self.min, other.min) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.max = self.max.max(other.max);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn total(&self) -> Duration {
        self.total
    }

    pub fn min(&self) -> Option<Duration> {
        self.min
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    pub fn average(&self) -> Option<Duration> {
        (self.count > 0).then(|| self.total.div_f64(self.count as f64))
    }

    /// Latency at `quantile` (0.0..=1.0), to three significant figures.
    pub fn quantile(&self, quantile: f64) -> Option<Duration> {
        (self.count > 0)
            .then(|| Duration::from_micros(self.buckets.value_at_quantile(quantile)))
    }

    pub fn stats(&self) -> Option<LatencyStats> {
        LatencyStats::from_histogram(self)
    }
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for LatencyHistogram {
    fn eq(&self, other: &Self) -> bool {
        let recorded = |h: &Histogram<u64>| {
            h.iter_recorded()
                .map(|v| (v.value_iterated_to(), v.count_at_value()))
                .collect::<Vec<_>>()
        };
        self.count == other.count
            && self.total == other.total
            && self.min == other.min
            && self.max == other.max
            && recorded(&self.buckets) == recorded(&other.buckets)
    }
}

/// Latency distribution digest, serialized in microseconds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct LatencyStats {
    #[serde(serialize_with = "micros")]
    pub average: Duration,
    #[serde(serialize_with = "micros")]
    pub min: Duration,
    #[serde(serialize_with = "micros")]
    pub p25: Duration,
    #[serde(serialize_with = "micros")]
    pub median: Duration,
    #[serde(serialize_with = "micros")]
    pub p75: Duration,
    #[serde(serialize_with = "micros")]
    pub p90: Duration,
    #[serde(serialize_with = "micros")]
    pub p95: Duration,
    #[serde(serialize_with = "micros")]
    pub p99: Duration,
    #[serde(serialize_with = "micros")]
    pub max: Duration,
}

impl LatencyStats {
    /// `None` for an empty histogram.
    pub fn from_histogram(histogram: &LatencyHistogram) -> Option<Self> {
        let at = |q| histogram.quantile(q);
        Some(Self {
            average: histogram.average()?,
            min: histogram.min()?,
            p25: at(0.25)?,
            median: at(0.5)?,
            p75: at(0.75)?,
            p90: at(0.90)?,
            p95: at(0.95)?,
            p99: at(0.99)?,
            max: histogram.max(),
        })
    }
}

fn micros<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u128(duration.as_micros())
}
