//! Digest of a finished run and the reporters that publish it.

use std::{collections::BTreeMap, fmt::Write as _};

use async_trait::async_trait;
use serde::Serialize;

use crate::{
    aggregate::OutcomeCounts,
    error::Result,
    histogram::LatencyStats,
    metric::{Outcome, TransactionKey},
    results::Results,
};

/// Human- and machine-facing digest of a [`Results`].
///
/// Successes and every failure kind are reported separately, never folded together.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Summary {
    pub elapsed_seconds: f64,
    pub measured_seconds: f64,
    pub outcomes: OutcomeCounts,
    pub warmup_attempts: u64,
    /// Measured attempts per second
    pub throughput: f64,
    /// Successful transactions per second
    pub goodput: f64,
    /// Distribution of every successful transaction
    pub latency: Option<LatencyStats>,
    pub transactions: Vec<TransactionSummary>,
    pub abort_messages: BTreeMap<String, u64>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TransactionSummary {
    pub benchmark: String,
    pub id: u32,
    pub name: String,
    pub outcomes: OutcomeCounts,
    pub latency: Option<LatencyStats>,
}

/// Histogram export, one map per outcome group keyed by transaction.
#[derive(Serialize)]
struct HistogramExport<'a> {
    completed: BTreeMap<String, u64>,
    aborted: BTreeMap<String, u64>,
    rejected: BTreeMap<String, u64>,
    unexpected: BTreeMap<String, u64>,
    unknown: BTreeMap<String, u64>,
    throughput: f64,
    goodput: f64,
    latency: &'a Option<LatencyStats>,
}

impl From<&Results> for Summary {
    fn from(results: &Results) -> Self {
        let mut keys: Vec<&TransactionKey> = Outcome::ALL
            .iter()
            .flat_map(|o| results.histogram(*o).iter().map(|(k, _)| k))
            .collect();
        keys.sort();
        keys.dedup();

        let transactions = keys
            .into_iter()
            .map(|key| {
                let mut outcomes = OutcomeCounts::default();
                for outcome in Outcome::ALL {
                    outcomes.add(outcome, results.histogram(outcome).count_of(key));
                }
                TransactionSummary {
                    benchmark: key.benchmark.to_string(),
                    id: key.id,
                    name: key.name.to_string(),
                    outcomes,
                    latency: results.success().get(key).and_then(|h| h.stats()),
                }
            })
            .collect();

        Self {
            elapsed_seconds: results.elapsed().as_secs_f64(),
            measured_seconds: results.measured().as_secs_f64(),
            outcomes: results.outcome_counts(),
            warmup_attempts: results.warmup_attempts(),
            throughput: results.throughput(),
            goodput: results.goodput(),
            latency: results.success().combined().stats(),
            transactions,
            abort_messages: results.abort_messages().clone(),
        }
    }
}

impl Summary {
    fn count_by_transaction(&self, outcomes: &[Outcome]) -> BTreeMap<String, u64> {
        self.transactions
            .iter()
            .map(|t| {
                let count = outcomes.iter().map(|o| t.outcomes.get(*o)).sum();
                (format!("{}/{}", t.benchmark, t.name), count)
            })
            .collect()
    }

    /// `{completed, aborted, rejected, unexpected, unknown, ...}` with per-transaction counts.
    pub fn to_json(&self) -> Result<String> {
        let export = HistogramExport {
            completed: self.count_by_transaction(&[Outcome::Success]),
            aborted: self.count_by_transaction(&[Outcome::UserAbort]),
            rejected: self.count_by_transaction(&[Outcome::Retry, Outcome::RetryDifferent]),
            unexpected: self.count_by_transaction(&[Outcome::DbError]),
            unknown: self.count_by_transaction(&[Outcome::Unknown]),
            throughput: self.throughput,
            goodput: self.goodput,
            latency: &self.latency,
        };
        Ok(serde_json::to_string_pretty(&export)?)
    }

    /// Text sections, one per outcome, followed by the user-abort messages.
    pub fn sections(&self) -> Vec<(&'static str, String)> {
        let mut sections: Vec<_> = Outcome::ALL
            .iter()
            .map(|outcome| {
                let mut body = String::new();
                for t in self.transactions.iter().filter(|t| t.outcomes.get(*outcome) > 0) {
                    let _ = writeln!(
                        body,
                        "  {}/{:02} {:<32} {:>10}",
                        t.benchmark,
                        t.id,
                        t.name,
                        t.outcomes.get(*outcome)
                    );
                }
                if body.is_empty() {
                    body.push_str("  <EMPTY>\n");
                }
                (outcome.label(), body)
            })
            .collect();

        let mut aborts = String::new();
        for (message, count) in &self.abort_messages {
            let _ = writeln!(aborts, "  {count:>6} x {message}");
        }
        if aborts.is_empty() {
            aborts.push_str("  <EMPTY>\n");
        }
        sections.push(("User Aborts", aborts));
        sections
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "Measured {:.2}s: {:.2} requests/sec, {:.2} goodput/sec",
            self.measured_seconds, self.throughput, self.goodput
        );
        if let Some(latency) = &self.latency {
            let _ = writeln!(
                out,
                "Latency avg={:?} p50={:?} p90={:?} p99={:?} max={:?}",
                latency.average, latency.median, latency.p90, latency.p99, latency.max
            );
        }
        for (title, body) in self.sections() {
            let _ = write!(out, "{title}:\n{body}");
        }
        out
    }
}

/// Sink for a finished run's summary.
#[async_trait]
pub trait Reporter {
    async fn report(&self, summary: &Summary) -> Result<()>;
}

/// Logs the summary section by section.
pub struct StdoutReporter;

#[async_trait]
impl Reporter for StdoutReporter {
    async fn report(&self, summary: &Summary) -> Result<()> {
        tracing::info!(
            "Measured {:.2}s: {:.2} requests/sec, {:.2} goodput/sec ({} warmup attempts excluded)",
            summary.measured_seconds,
            summary.throughput,
            summary.goodput,
            summary.warmup_attempts
        );
        for (title, body) in summary.sections() {
            tracing::info!("{title}:\n{body}");
        }
        Ok(())
    }
}
