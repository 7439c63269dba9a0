//! Run-level knobs and the database descriptor handed to connectors.
//!
//! Both types can be built in code through their builders or deserialized by an outer
//! configuration loader. Durations are read as integers: milliseconds for
//! `interval_monitor` and `governor_tick`, seconds for `window_size`.

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use typed_builder::TypedBuilder;

/// Engine settings that apply to every benchmark of a run.
///
/// # Tuning knobs
/// - `interval_monitor`: period of the live throughput monitor, `Duration::ZERO` disables it.
/// - `window_size`: bucket width for the windowed result series, carried on the run's
///   [`Results`](crate::Results) and used by `Results::configured_windows`.
/// - `max_retries`: retries one transaction slot may take in a row before the next retry
///   counts as its final attempt. Falls back to the database descriptor's `retries` when
///   unset.
/// - `governor_tick`: granularity at which open-loop permits are released. Smaller ticks
///   reduce issue lateness but wake the scheduler more often.
/// - `seed`: makes transaction selection reproducible.
#[derive(Clone, Debug, PartialEq, TypedBuilder, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    #[builder(default)]
    #[serde(deserialize_with = "millis")]
    pub interval_monitor: Duration,
    #[builder(default = Duration::from_secs(5))]
    #[serde(deserialize_with = "seconds")]
    pub window_size: Duration,
    #[builder(default, setter(strip_option))]
    pub max_retries: Option<u32>,
    #[builder(default = Duration::from_millis(10))]
    #[serde(deserialize_with = "millis")]
    pub governor_tick: Duration,
    #[builder(default, setter(strip_option))]
    pub seed: Option<u64>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Connection descriptor for one benchmark's target database.
#[derive(Clone, Debug, PartialEq, Eq, TypedBuilder, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseDescriptor {
    #[builder(default, setter(into))]
    pub db_type: String,
    #[builder(default, setter(into))]
    pub driver: String,
    #[builder(default, setter(into))]
    pub url: String,
    #[builder(default = "TRANSACTION_SERIALIZABLE".to_owned(), setter(into))]
    pub isolation: String,
    #[builder(default = 128)]
    pub batch_size: u32,
    #[builder(default = 3)]
    pub retries: u32,
}

impl Default for DatabaseDescriptor {
    fn default() -> Self {
        Self::builder().build()
    }
}

fn millis<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    u64::deserialize(deserializer).map(Duration::from_millis)
}

fn seconds<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    u64::deserialize(deserializer).map(Duration::from_secs)
}
