//! Phases and the per-benchmark phase schedule.
//!
//! A phase is a scheduled interval with its own rate, weights, arrival model and number
//! of active terminals. Phases run strictly one after another; a disabled phase is skipped
//! but still counts towards the number of phases.

use std::{sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::error::{Result, invalid_config};

/// Target issue rate of a phase.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RateSetting", into = "RateSetting")]
pub enum RateSpec {
    /// Transactions per second, summed across the phase's active terminals
    Limited(f64),
    Unlimited,
    Disabled,
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RateSetting {
    Rate(f64),
    Keyword(String),
}

impl TryFrom<RateSetting> for RateSpec {
    type Error = String;

    fn try_from(value: RateSetting) -> Result<Self, Self::Error> {
        match value {
            RateSetting::Rate(r) => Ok(RateSpec::Limited(r)),
            RateSetting::Keyword(k) => match k.to_ascii_lowercase().as_str() {
                "unlimited" => Ok(RateSpec::Unlimited),
                "disabled" => Ok(RateSpec::Disabled),
                other => Err(format!(
                    "unknown rate `{other}`, expected a number, `unlimited` or `disabled`"
                )),
            },
        }
    }
}

impl From<RateSpec> for RateSetting {
    fn from(value: RateSpec) -> Self {
        match value {
            RateSpec::Limited(r) => RateSetting::Rate(r),
            RateSpec::Unlimited => RateSetting::Keyword("unlimited".to_owned()),
            RateSpec::Disabled => RateSetting::Keyword("disabled".to_owned()),
        }
    }
}

/// How requests arrive during a rate-limited phase.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Arrival {
    /// Each terminal asks for its next permit only after finishing the previous transaction
    #[default]
    Closed,
    /// Permits follow a fixed schedule regardless of completions
    Open,
}

/// One scheduled interval of a benchmark.
///
/// A phase with a `duration` is timed. Without one it ends after `transaction_count`
/// non-retry completions; a serial phase without a count runs one pass over its
/// transaction types per active terminal.
///
/// The warmup is the initial part of the phase whose samples are recorded but excluded
/// from the reported statistics.
#[derive(Clone, Debug, PartialEq, TypedBuilder)]
pub struct Phase {
    #[builder(setter(into))]
    pub benchmark_name: Arc<str>,
    /// 1-based position in the schedule
    pub id: u32,
    #[builder(default, setter(strip_option))]
    pub duration: Option<Duration>,
    #[builder(default)]
    pub warmup: Duration,
    #[builder(default = RateSpec::Unlimited)]
    pub rate: RateSpec,
    /// One weight per transaction type, in id order
    pub weights: Vec<f64>,
    #[builder(default)]
    pub serial: bool,
    #[builder(default, setter(strip_option))]
    pub transaction_count: Option<u64>,
    /// Terminals beyond this index stay dormant; clamped to the benchmark's terminal count
    #[builder(default = usize::MAX)]
    pub active_terminals: usize,
    #[builder(default)]
    pub arrival: Arrival,
}

impl Phase {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self.rate, RateSpec::Limited(_))
    }

    pub fn is_disabled(&self) -> bool {
        matches!(self.rate, RateSpec::Disabled)
    }

    pub fn is_serial(&self) -> bool {
        self.serial
    }

    pub fn is_timed(&self) -> bool {
        self.duration.is_some()
    }

    /// Whether the terminal with this 0-based index takes part in the phase.
    pub fn covers(&self, terminal: usize) -> bool {
        !self.is_disabled() && terminal < self.active_terminals
    }

    pub fn is_warmup(&self, elapsed: Duration) -> bool {
        elapsed < self.warmup
    }

    /// Completions after which a non-timed phase ends. `None` for timed phases.
    pub fn budget(&self) -> Option<u64> {
        if self.is_timed() {
            return None;
        }
        self.transaction_count.or_else(|| {
            let enabled = self.weights.iter().filter(|w| **w > 0.0).count() as u64;
            Some(enabled * self.active_terminals as u64)
        })
    }

    fn validate(&self, benchmark: &str, expected_id: u32, transaction_types: usize) -> Result<()> {
        let fail = |message: String| Err(invalid_config(benchmark, message));

        if *self.benchmark_name != *benchmark {
            return fail(format!(
                "phase {} belongs to benchmark `{}`",
                self.id, self.benchmark_name
            ));
        }
        if self.id != expected_id {
            return fail(format!(
                "phase ids must be sequential from 1, found {} at position {expected_id}",
                self.id
            ));
        }
        if self.weights.len() != transaction_types {
            return fail(format!(
                "phase {} has {} weights for {transaction_types} transaction types",
                self.id,
                self.weights.len()
            ));
        }
        if self.weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return fail(format!("phase {} has a negative or non-finite weight", self.id));
        }
        if self.is_disabled() {
            return Ok(());
        }
        if self.weights.iter().sum::<f64>() <= 0.0 {
            return fail(format!("phase {} has no transaction type with weight", self.id));
        }
        if let RateSpec::Limited(rate) = self.rate {
            if !rate.is_finite() || rate <= 0.0 {
                return fail(format!("phase {} has invalid rate {rate}", self.id));
            }
        }
        if self.active_terminals == 0 {
            return fail(format!("phase {} has no active terminals", self.id));
        }
        match self.duration {
            Some(d) if d.is_zero() => fail(format!("phase {} has a zero duration", self.id)),
            Some(d) if self.warmup > d => fail(format!(
                "phase {} warmup {:?} exceeds its duration {d:?}",
                self.id, self.warmup
            )),
            None if !self.serial && self.transaction_count.is_none() => fail(format!(
                "phase {} needs either a duration or a transaction count",
                self.id
            )),
            None if self.transaction_count == Some(0) => {
                fail(format!("phase {} has a zero transaction count", self.id))
            }
            _ => Ok(()),
        }
    }
}

/// Where a phase sits on the benchmark's timeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PhaseBoundary {
    pub phase_id: u32,
    /// Planned offset from the start of the run, `None` once a count-based phase precedes it
    pub start: Option<Duration>,
    pub end: Option<Duration>,
}

/// Ordered, validated phases of one benchmark. Read-only once built.
#[derive(Clone, Debug)]
pub struct PhaseSchedule {
    benchmark: Arc<str>,
    phases: Vec<Arc<Phase>>,
}

impl PhaseSchedule {
    pub fn new(
        benchmark: Arc<str>,
        phases: Vec<Phase>,
        transaction_types: usize,
        terminals: usize,
    ) -> Result<Self> {
        if phases.is_empty() {
            return Err(invalid_config(&*benchmark, "no phases configured"));
        }
        let phases = phases
            .into_iter()
            .zip(1..)
            .map(|(mut phase, expected_id)| {
                phase.active_terminals = phase.active_terminals.min(terminals);
                phase.validate(&benchmark, expected_id, transaction_types)?;
                Ok(Arc::new(phase))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { benchmark, phases })
    }

    pub fn benchmark(&self) -> &Arc<str> {
        &self.benchmark
    }

    /// Number of phases, disabled ones included.
    pub fn len(&self) -> usize {
        self.phases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Phase>> {
        self.phases.iter()
    }

    /// Cumulative planned boundaries. Disabled phases take no time.
    pub fn boundaries(&self) -> Vec<PhaseBoundary> {
        let mut cursor = Some(Duration::ZERO);
        self.phases
            .iter()
            .map(|phase| {
                let start = cursor;
                let end = if phase.is_disabled() {
                    start
                } else {
                    start.zip(phase.duration).map(|(s, d)| s + d)
                };
                cursor = end;
                PhaseBoundary {
                    phase_id: phase.id,
                    start,
                    end,
                }
            })
            .collect()
    }

    /// Planned length of the schedule, if every enabled phase is timed.
    pub fn planned_duration(&self) -> Option<Duration> {
        self.boundaries().last().and_then(|b| b.end)
    }
}
