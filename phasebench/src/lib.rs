//! Phasebench: a rate-limited, multi-phase engine for transactional database benchmarks.
//!
//! A benchmark is a registry of transaction types, a schedule of phases and a number of
//! terminals (simulated clients). The engine connects every terminal, walks each
//! benchmark's phases on one shared clock, paces the terminals to the phase's target rate
//! and records one classified sample per transaction attempt. The result is a read-only
//! [`Results`] with per-outcome latency histograms, the chronological sample sequence and
//! a windowed throughput series.
//!
//! The engine never talks to a database itself: a [`Connector`] opens one connection per
//! terminal and each transaction type is a [`Procedure`] executed against it.
//!
//! # Architecture
//!
//! - [`TransactionTypes`]: ordered, immutable catalog of a benchmark's transactions.
//! - [`Phase`] / [`PhaseSchedule`]: what to run when, how fast, with which mix.
//! - [`Coordinator`]: runs the terminals of every benchmark and merges their samples.
//!   Pacing (closed- and open-loop) and the terminal state machine live in [`executor`].
//! - [`Results`] / [`Summary`]: finalized statistics and their reportable digest.
//! - [`IntervalObserver`]: optional live throughput callback.
//!
//! # Example
//!
//! ```rust
//! use std::{sync::Arc, time::Duration};
//!
//! use async_trait::async_trait;
//! use phasebench::{
//!     Benchmark, BenchmarkModule, Connector, DatabaseDescriptor, ExecutionConfig, Phase, Procedure,
//!     ProcedureError, RateSpec, TransactionStatus, TransactionTypes, WorkloadConfiguration,
//!     run_workload,
//! };
//!
//! struct Ping;
//!
//! #[async_trait]
//! impl Procedure<()> for Ping {
//!     fn name(&self) -> &str {
//!         "Ping"
//!     }
//!
//!     async fn execute(&self, _conn: &mut ()) -> Result<TransactionStatus, ProcedureError> {
//!         Ok(TransactionStatus::Success)
//!     }
//! }
//!
//! struct NoConnection;
//!
//! #[async_trait]
//! impl Connector<()> for NoConnection {
//!     async fn connect(&self, _: &DatabaseDescriptor, _: usize) -> Result<(), ProcedureError> {
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> phasebench::Result<()> {
//!     let workload = WorkloadConfiguration::builder()
//!         .benchmark_name("ping")
//!         .transaction_types(TransactionTypes::from_procedures(vec![
//!             Arc::new(Ping) as Arc<dyn Procedure<()>>,
//!         ]))
//!         .phases(vec![
//!             Phase::builder()
//!                 .benchmark_name("ping")
//!                 .id(1)
//!                 .duration(Duration::from_millis(200))
//!                 .rate(RateSpec::Limited(50.0))
//!                 .weights(vec![100.0])
//!                 .build(),
//!         ])
//!         .terminals(2)
//!         .build();
//!     let benchmark: Box<dyn Benchmark> =
//!         Box::new(BenchmarkModule::new(workload, Arc::new(NoConnection)));
//!
//!     let results = run_workload(vec![benchmark], ExecutionConfig::default(), None).await?;
//!     assert!(results.success().count() > 0);
//!     Ok(())
//! }
//! ```

/// Shared counters terminals record into while the run is in progress
pub mod aggregate;
pub mod config;
pub mod error;
/// Coordinator, phase drivers, pacing and terminals
pub mod executor;
pub mod histogram;
pub mod metric;
/// Live throughput reporting
pub mod monitor;
pub mod phase;
/// Summaries and reporters
pub mod report;
pub mod results;
mod runner;
pub mod telemetry;
pub mod transaction;
/// Benchmarks as the coordinator sees them
pub mod workload;

pub use aggregate::OutcomeCounts;
pub use config::{DatabaseDescriptor, ExecutionConfig};
pub use error::{Error, Result};
pub use executor::Coordinator;
pub use histogram::{LatencyHistogram, LatencyStats};
pub use metric::{Outcome, Sample, TransactionKey};
pub use monitor::{IntervalObserver, IntervalReport, LogObserver};
pub use phase::{Arrival, Phase, PhaseBoundary, PhaseSchedule, RateSpec};
pub use report::{Reporter, StdoutReporter, Summary};
pub use results::{OutcomeHistogram, Results, Window};
pub use runner::run_workload;
pub use telemetry::setup_logging;
pub use transaction::{
    Connector, Procedure, ProcedureError, TransactionStatus, TransactionType, TransactionTypes,
};
pub use workload::{Benchmark, BenchmarkModule, WorkloadConfiguration};
