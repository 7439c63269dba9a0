//! Executor: running benchmarks' terminal populations on one shared clock
//!
//! The [`Coordinator`] takes any number of benchmarks, each with its own terminals and
//! phase schedule, and runs them concurrently. Rate generation, phase progression and
//! transaction execution live in separate tasks:
//!
//! - one **phase driver** per benchmark walks the schedule and publishes the active phase
//!   on a `watch` channel,
//! - one **governor** per open-loop phase releases permits into a shared pool,
//! - one **terminal** task per simulated client selects, paces and executes transactions.
//!
//! # High-level flow
//! 1. Validate every benchmark's phase schedule and build the shared aggregator.
//! 2. Connect all terminals of all benchmarks. A connection failure aborts the run before
//!    any load is issued.
//! 3. Spawn the terminals. They park until their benchmark's driver activates a phase
//!    that covers them.
//! 4. Spawn one driver per benchmark, all anchored at the same epoch, plus the interval
//!    monitor when enabled.
//! 5. When every driver has exhausted its schedule, broadcast the stop signal, let
//!    in-flight transactions finish and collect the terminals' sample buffers.
//! 6. Finalize the buffers into one [`Results`].
//!
//! # Tuning knobs
//! See [`ExecutionConfig`]. `governor_tick` trades open-loop lateness for wakeups, and
//! `interval_monitor` enables the live progress log.
//!
//! # Notes about correctness & robustness
//! - A transaction that fails or panics becomes an outcome sample; it never reaches the
//!   coordinator.
//! - A terminal task that dies anyway loses its buffer; the run still completes with the
//!   remaining samples and logs the gap.
//! - A driver task that dies is a coordinator failure: terminals are stopped and the run
//!   returns [`Error::Coordinator`].
//! - Phase `k + 1` of a benchmark is only published after phase `k` was withdrawn, and
//!   terminals take a sample's start time before confirming the phase is still current,
//!   so samples of consecutive phases never interleave.

mod driver;
mod rate;
mod selector;
mod worker;

pub use worker::TerminalWiring;
pub(crate) use worker::Worker;

use std::{sync::Arc, time::Duration};

use futures::future::{join_all, try_join_all};
use tokio::{sync::watch, task::JoinHandle, time::Instant};
use typed_builder::TypedBuilder;

use crate::{
    aggregate::Aggregator,
    config::ExecutionConfig,
    error::{Error, Result, invalid_config},
    metric::Sample,
    monitor::{IntervalObserver, LogObserver, run_monitor},
    results::Results,
    workload::Benchmark,
};
use driver::{PhaseSignal, drive_phases};

/// Runs one or more benchmarks to completion and merges their samples.
///
/// ```rust,no_run
/// # use phasebench::{Benchmark, Coordinator, ExecutionConfig};
/// # async fn run(benchmarks: Vec<Box<dyn Benchmark>>) -> phasebench::Result<()> {
/// let results = Coordinator::builder()
///     .config(ExecutionConfig::builder().interval_monitor(std::time::Duration::from_secs(1)).build())
///     .benchmarks(benchmarks)
///     .build()
///     .run()
///     .await?;
/// println!("{} successful transactions", results.success().count());
/// # Ok(())
/// # }
/// ```
#[derive(TypedBuilder)]
pub struct Coordinator {
    #[builder(default)]
    pub config: ExecutionConfig,
    pub benchmarks: Vec<Box<dyn Benchmark>>,
    /// Receives the interval reports; logs them when unset
    #[builder(default, setter(strip_option))]
    pub observer: Option<Arc<dyn IntervalObserver>>,
}

impl Coordinator {
    pub async fn run(&self) -> Result<Results> {
        if self.benchmarks.is_empty() {
            return Err(invalid_config("<none>", "no benchmark to run"));
        }
        let schedules = self
            .benchmarks
            .iter()
            .map(|b| b.schedule())
            .collect::<Result<Vec<_>>>()?;

        let aggregator = Arc::new(Aggregator::new(
            self.benchmarks.iter().flat_map(|b| b.transaction_keys()),
        ));
        let (stop_tx, stop_rx) = watch::channel(false);

        let mut signals = Vec::with_capacity(self.benchmarks.len());
        let mut terminals = Vec::new();
        for benchmark in &self.benchmarks {
            let (signal_tx, signal_rx) = watch::channel(PhaseSignal::Idle);
            let wiring = TerminalWiring {
                phases: signal_rx,
                shutdown: stop_rx.clone(),
                aggregator: Arc::clone(&aggregator),
                max_retries: self
                    .config
                    .max_retries
                    .unwrap_or(benchmark.database().retries),
                seed: self.config.seed,
            };
            tracing::info!(
                "Creating {} virtual terminals for {}...",
                benchmark.terminals(),
                benchmark.name()
            );
            terminals.extend(benchmark.make_workers(wiring).await?);
            signals.push(signal_tx);
        }

        tracing::info!("Spawning {} terminals...", terminals.len());
        let handles: Vec<JoinHandle<Vec<Sample>>> =
            terminals.into_iter().map(tokio::spawn).collect();

        let epoch = Instant::now();
        let monitor = (!self.config.interval_monitor.is_zero()).then(|| {
            let observer = self
                .observer
                .clone()
                .unwrap_or_else(|| Arc::new(LogObserver));
            tokio::spawn(run_monitor(
                Arc::clone(&aggregator),
                self.config.interval_monitor,
                epoch,
                observer,
                stop_rx.clone(),
            ))
        });

        tracing::info!("Running now!");
        let mut drivers: Vec<JoinHandle<Duration>> = schedules
            .into_iter()
            .zip(signals)
            .map(|(schedule, signal)| {
                tokio::spawn(drive_phases(
                    schedule,
                    signal,
                    epoch,
                    self.config.governor_tick,
                ))
            })
            .collect();
        let measured = try_join_all(drivers.iter_mut()).await;
        let elapsed = epoch.elapsed();
        if measured.is_err() {
            drivers.iter().for_each(JoinHandle::abort);
        }
        stop_tx.send_replace(true);

        tracing::info!("Retrieving samples from terminals...");
        let buffers: Vec<Vec<Sample>> = join_all(handles)
            .await
            .into_iter()
            .map(|res| {
                res.unwrap_or_else(|err| {
                    tracing::error!("Terminal task failed: {err}");
                    Vec::new()
                })
            })
            .collect();
        if let Some(monitor) = monitor {
            if let Err(err) = monitor.await {
                tracing::warn!("Interval monitor failed: {err}");
            }
        }

        let measured = match measured {
            Ok(per_benchmark) => per_benchmark.into_iter().max().unwrap_or_default(),
            Err(err) => return Err(Error::Coordinator(err)),
        };

        tracing::info!("Processing results...");
        let results = aggregator
            .finalize(buffers, elapsed, measured)
            .with_window_size(self.config.window_size);
        tracing::info!(
            "Done: {} measured attempts in {:?}.",
            results.measured_attempts(),
            elapsed
        );
        Ok(results)
    }
}
