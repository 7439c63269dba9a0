//! Entry point that wraps the coordinator with the run banners.

use std::sync::Arc;

use crate::{
    config::ExecutionConfig,
    error::Result,
    executor::Coordinator,
    monitor::IntervalObserver,
    phase::RateSpec,
    results::Results,
    workload::Benchmark,
};

/// Runs every benchmark on one shared timeline and returns the merged results.
///
/// Interval reports, when `config.interval_monitor` is non-zero, go to `observer` or to
/// the log.
pub async fn run_workload(
    benchmarks: Vec<Box<dyn Benchmark>>,
    config: ExecutionConfig,
    observer: Option<Arc<dyn IntervalObserver>>,
) -> Result<Results> {
    for benchmark in &benchmarks {
        let schedule = benchmark.schedule()?;
        tracing::info!(
            "Launching the {} Benchmark with {} Phases...",
            benchmark.name(),
            schedule.len()
        );
        if let Some(planned) = schedule.planned_duration() {
            tracing::info!("Planned duration: {planned:?}");
        }
        for phase in schedule.iter() {
            let rate = match phase.rate {
                RateSpec::Limited(rate) => format!("{rate} txn/s ({:?} arrival)", phase.arrival),
                RateSpec::Unlimited => "unlimited".to_owned(),
                RateSpec::Disabled => "disabled".to_owned(),
            };
            let length = match (phase.duration, phase.budget()) {
                (Some(duration), _) => format!("{duration:?}"),
                (None, Some(count)) => format!("{count} transactions"),
                (None, None) => "-".to_owned(),
            };
            tracing::info!(
                "  Phase {}: {length}, warmup {:?}, rate {rate}, {} terminals{}",
                phase.id,
                phase.warmup,
                phase.active_terminals,
                if phase.is_serial() { ", serial" } else { "" }
            );
        }
    }

    let coordinator = match observer {
        Some(observer) => Coordinator::builder()
            .config(config)
            .benchmarks(benchmarks)
            .observer(observer)
            .build(),
        None => Coordinator::builder()
            .config(config)
            .benchmarks(benchmarks)
            .build(),
    };
    let results = coordinator.run().await?;

    tracing::info!(
        outcomes = %results.outcome_counts(),
        "Rate limited reqs/s: {:.2}",
        results.throughput()
    );
    Ok(results)
}
