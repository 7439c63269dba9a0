use std::{fmt, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};

/// Classification of a single transaction attempt.
///
/// The variants are ordered the way summaries report them: successes first, then every
/// failure kind separately so they are never silently merged.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    Success,
    /// The procedure deliberately rolled back (business logic, not a failure)
    UserAbort,
    /// Transient condition, the same transaction type may be reissued
    Retry,
    /// Transient condition, the next attempt should pick another transaction type
    RetryDifferent,
    /// Unexpected driver or database error
    DbError,
    /// Success or failure cannot be determined, e.g. the connection dropped mid-call
    Unknown,
}

impl Outcome {
    pub const COUNT: usize = 6;

    pub const ALL: [Outcome; Outcome::COUNT] = [
        Outcome::Success,
        Outcome::UserAbort,
        Outcome::Retry,
        Outcome::RetryDifferent,
        Outcome::DbError,
        Outcome::Unknown,
    ];

    /// Dense index, usable for per-outcome arrays
    pub fn index(self) -> usize {
        self as usize
    }

    /// Retries do not consume a fixed-count phase's budget.
    pub fn is_retry(self) -> bool {
        matches!(self, Outcome::Retry | Outcome::RetryDifferent)
    }

    pub fn label(self) -> &'static str {
        match self {
            Outcome::Success => "Completed Transactions",
            Outcome::UserAbort => "Aborted Transactions",
            Outcome::Retry => "Rejected Transactions (Server Retry)",
            Outcome::RetryDifferent => "Rejected Transactions (Retry Different)",
            Outcome::DbError => "Unexpected SQL Errors",
            Outcome::Unknown => "Unknown Status Transactions",
        }
    }
}

/// Identifies a transaction type across every benchmark of a run.
///
/// Ids are only unique within one benchmark, so the benchmark name is part of the key.
/// Ordering is by benchmark, then id.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct TransactionKey {
    pub benchmark: Arc<str>,
    pub id: u32,
    pub name: Arc<str>,
}

impl fmt::Display for TransactionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{:02} {}", self.benchmark, self.id, self.name)
    }
}

/// One recorded transaction attempt. Immutable once produced.
///
/// Warmup samples are kept and tagged; they are dropped only when results are
/// aggregated into histograms.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Sample {
    pub transaction: TransactionKey,
    pub worker_id: usize,
    pub phase_id: u32,
    /// Offset of the issue time from the start of the run
    pub start: Duration,
    pub latency: Duration,
    pub outcome: Outcome,
    pub is_warmup: bool,
    /// How far behind its open-loop schedule the request was issued
    pub lateness: Duration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub abort_message: Option<String>,
}

impl Sample {
    pub fn end(&self) -> Duration {
        self.start + self.latency
    }
}
