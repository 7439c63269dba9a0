//! End-to-end runs of the coordinator against stub procedures, on tokio's paused clock.

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use phasebench::{
    Arrival, Benchmark, BenchmarkModule, Connector, Coordinator, DatabaseDescriptor, Error,
    ExecutionConfig, IntervalReport, Outcome, Phase, Procedure, ProcedureError, RateSpec,
    Results, Summary, TransactionStatus, TransactionTypes, WorkloadConfiguration, run_workload,
};
use rstest::rstest;

type Script = fn(u32) -> Result<TransactionStatus, ProcedureError>;

struct Stub {
    name: &'static str,
    latency: Duration,
    script: Script,
    calls: AtomicU32,
}

#[async_trait]
impl Procedure<()> for Stub {
    fn name(&self) -> &str {
        self.name
    }

    async fn execute(&self, _conn: &mut ()) -> Result<TransactionStatus, ProcedureError> {
        let call = self.calls.fetch_add(1, Ordering::Relaxed);
        tokio::time::sleep(self.latency).await;
        (self.script)(call)
    }
}

fn stub(name: &'static str, latency_ms: u64, script: Script) -> Arc<dyn Procedure<()>> {
    Arc::new(Stub {
        name,
        latency: Duration::from_millis(latency_ms),
        script,
        calls: AtomicU32::new(0),
    })
}

fn success(_: u32) -> Result<TransactionStatus, ProcedureError> {
    Ok(TransactionStatus::Success)
}

struct Loopback;

#[async_trait]
impl Connector<()> for Loopback {
    async fn connect(&self, _: &DatabaseDescriptor, _: usize) -> Result<(), ProcedureError> {
        Ok(())
    }
}

struct Unreachable;

#[async_trait]
impl Connector<()> for Unreachable {
    async fn connect(&self, db: &DatabaseDescriptor, terminal: usize) -> Result<(), ProcedureError> {
        if terminal == 2 {
            return Err(ProcedureError::ConnectionLost(format!("{} refused", db.url)));
        }
        Ok(())
    }
}

fn timed(benchmark: &str, id: u32, millis: u64, weights: Vec<f64>) -> Phase {
    Phase::builder()
        .benchmark_name(benchmark)
        .id(id)
        .duration(Duration::from_millis(millis))
        .weights(weights)
        .build()
}

fn benchmark(
    name: &str,
    procedures: Vec<Arc<dyn Procedure<()>>>,
    phases: Vec<Phase>,
    terminals: usize,
) -> Box<dyn Benchmark> {
    let workload = WorkloadConfiguration::builder()
        .benchmark_name(name)
        .transaction_types(TransactionTypes::from_procedures(procedures))
        .phases(phases)
        .terminals(terminals)
        .build();
    Box::new(BenchmarkModule::new(workload, Arc::new(Loopback)))
}

async fn run(benchmarks: Vec<Box<dyn Benchmark>>) -> Results {
    run_workload(benchmarks, ExecutionConfig::default(), None)
        .await
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn closed_loop_rate_ten_for_two_seconds() {
    let mut phase = timed("stub", 1, 2_000, vec![100.0]);
    phase.rate = RateSpec::Limited(10.0);
    let results = run(vec![benchmark("stub", vec![stub("Ping", 2, success)], vec![phase], 1)]).await;

    let completed = results.success().count();
    assert!((18..=22).contains(&completed), "completed {completed}");
    assert_eq!(results.measured_attempts(), completed);
}

#[tokio::test(start_paused = true)]
async fn disabled_phase_produces_nothing_and_is_skipped() {
    let mut disabled = timed("stub", 2, 5_000, vec![100.0]);
    disabled.rate = RateSpec::Disabled;
    let phases = vec![
        timed("stub", 1, 500, vec![100.0]),
        disabled,
        timed("stub", 3, 500, vec![100.0]),
    ];
    let results = run(vec![benchmark("stub", vec![stub("Ping", 10, success)], phases, 2)]).await;

    let samples = results.samples();
    assert!(samples.iter().all(|s| s.phase_id != 2));
    let third = samples.iter().filter(|s| s.phase_id == 3).count();
    assert!(third > 0);
    // phase 3 followed phase 1 directly
    let first_of_third = samples.iter().find(|s| s.phase_id == 3).unwrap();
    assert!(first_of_third.start < Duration::from_millis(600));
    assert!(results.elapsed() < Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn driver_errors_never_abort_the_run() {
    fn broken(_: u32) -> Result<TransactionStatus, ProcedureError> {
        Err(ProcedureError::Driver("relation does not exist".into()))
    }
    let results = run(vec![benchmark(
        "stub",
        vec![stub("Broken", 5, broken)],
        vec![timed("stub", 1, 1_000, vec![100.0])],
        3,
    )])
    .await;

    let total = results.measured_attempts();
    assert!(total > 0);
    assert_eq!(results.error().count(), total);
    assert_eq!(results.success().count(), 0);
}

#[tokio::test(start_paused = true)]
async fn open_loop_issues_rate_times_duration() {
    let mut phase = timed("stub", 1, 2_000, vec![100.0]);
    phase.rate = RateSpec::Limited(100.0);
    phase.arrival = Arrival::Open;
    let results = run(vec![benchmark("stub", vec![stub("Ping", 5, success)], vec![phase], 4)]).await;

    let issued = results.samples().len();
    assert!((195..=205).contains(&issued), "issued {issued}");
    let worst = results.samples().iter().map(|s| s.lateness).max().unwrap();
    assert!(worst <= Duration::from_millis(20), "lateness {worst:?}");
}

#[tokio::test(start_paused = true)]
async fn open_loop_lateness_grows_when_terminals_saturate() {
    let mut phase = timed("stub", 1, 1_000, vec![100.0]);
    phase.rate = RateSpec::Limited(100.0);
    phase.arrival = Arrival::Open;
    // two terminals at 50ms each can only serve 40/s
    let results = run(vec![benchmark("stub", vec![stub("Slow", 50, success)], vec![phase], 2)]).await;

    let issued = results.samples().len();
    assert!((38..=42).contains(&issued), "issued {issued}");
    let worst = results.samples().iter().map(|s| s.lateness).max().unwrap();
    assert!(worst > Duration::from_millis(400), "lateness {worst:?}");
}

#[tokio::test(start_paused = true)]
async fn phases_never_overlap() {
    let phases = (1..=3)
        .map(|id| timed("stub", id, 500, vec![50.0, 50.0]))
        .collect();
    let results = run(vec![benchmark(
        "stub",
        vec![stub("A", 7, success), stub("B", 13, success)],
        phases,
        4,
    )])
    .await;

    for id in 1..3 {
        let latest = results
            .samples()
            .iter()
            .filter(|s| s.phase_id == id)
            .map(|s| s.start)
            .max()
            .unwrap();
        let earliest_next = results
            .samples()
            .iter()
            .filter(|s| s.phase_id == id + 1)
            .map(|s| s.start)
            .min()
            .unwrap();
        assert!(latest <= earliest_next, "phase {id} overlaps phase {}", id + 1);
    }
}

#[tokio::test(start_paused = true)]
async fn warmup_samples_are_kept_but_not_counted() {
    let mut phase = timed("stub", 1, 2_000, vec![100.0]);
    phase.rate = RateSpec::Limited(10.0);
    phase.warmup = Duration::from_secs(1);
    let results = run(vec![benchmark("stub", vec![stub("Ping", 2, success)], vec![phase], 1)]).await;

    let warmup = results.warmup_attempts();
    assert!((9..=11).contains(&warmup), "warmup {warmup}");
    assert!(results.samples().iter().filter(|s| s.is_warmup).all(|s| s.start < Duration::from_secs(1)));
    assert_eq!(
        results.success().count() + warmup,
        results.samples().len() as u64
    );
    assert_eq!(results.measured(), Duration::from_secs(1));
    assert!(results.windows(Duration::from_secs(1)).iter().all(|w| w.index >= 1));
}

#[tokio::test(start_paused = true)]
async fn every_outcome_is_counted_exactly_once() {
    fn mixed(call: u32) -> Result<TransactionStatus, ProcedureError> {
        match call % 6 {
            0 => Ok(TransactionStatus::Success),
            1 => Ok(TransactionStatus::UserAbort("insufficient funds".into())),
            2 => Ok(TransactionStatus::Retry),
            3 => Ok(TransactionStatus::RetryDifferent),
            4 => Err(ProcedureError::Driver("serialization failure".into())),
            _ => Ok(TransactionStatus::Unknown),
        }
    }
    let results = run(vec![benchmark(
        "stub",
        vec![stub("Mixed", 3, mixed), stub("Plain", 4, success)],
        vec![timed("stub", 1, 1_000, vec![70.0, 30.0])],
        3,
    )])
    .await;

    let counts = results.outcome_counts();
    let sum: u64 = Outcome::ALL.iter().map(|o| counts.get(*o)).sum();
    assert_eq!(sum, results.samples().len() as u64);
    for outcome in Outcome::ALL {
        assert!(counts.get(outcome) > 0, "no {outcome:?} recorded");
    }
    assert!(results.abort_messages().contains_key("insufficient funds"));

    let summary = Summary::from(&results);
    assert_eq!(summary.outcomes, counts);
}

#[tokio::test(start_paused = true)]
async fn fixed_count_phase_completes_exactly_its_budget() {
    fn flaky(call: u32) -> Result<TransactionStatus, ProcedureError> {
        if call % 3 == 0 {
            Ok(TransactionStatus::Retry)
        } else {
            Ok(TransactionStatus::Success)
        }
    }
    let counted = Phase::builder()
        .benchmark_name("stub")
        .id(1)
        .transaction_count(20)
        .weights(vec![100.0])
        .build();
    let results = run(vec![benchmark("stub", vec![stub("Flaky", 10, flaky)], vec![counted], 4)]).await;

    assert_eq!(results.success().count(), 20);
    assert!(results.retry().count() > 0);
}

fn always_retry(_: u32) -> Result<TransactionStatus, ProcedureError> {
    Ok(TransactionStatus::Retry)
}

fn always_retry_different(_: u32) -> Result<TransactionStatus, ProcedureError> {
    Ok(TransactionStatus::RetryDifferent)
}

#[rstest]
#[case::same_type(always_retry, Outcome::Retry)]
#[case::different_type(always_retry_different, Outcome::RetryDifferent)]
#[tokio::test(start_paused = true)]
async fn counted_phase_ends_when_every_attempt_asks_for_a_retry(
    #[case] script: Script,
    #[case] outcome: Outcome,
) {
    let counted = Phase::builder()
        .benchmark_name("stub")
        .id(1)
        .transaction_count(5)
        .weights(vec![100.0])
        .build();
    let coordinator = Coordinator::builder()
        .config(ExecutionConfig::builder().max_retries(3).build())
        .benchmarks(vec![benchmark("stub", vec![stub("Busy", 1, script)], vec![counted], 1)])
        .build();
    let run = coordinator.run();
    let results = tokio::time::timeout(Duration::from_secs(3_600), run)
        .await
        .expect("counted phase never ended")
        .unwrap();

    // each of the 5 slots gets a first attempt and 3 retries
    assert_eq!(results.samples().len(), 20);
    assert_eq!(results.outcome_counts().get(outcome), 20);
    assert_eq!(results.success().count(), 0);
}

#[tokio::test(start_paused = true)]
async fn failed_connection_is_fatal() {
    let workload = WorkloadConfiguration::builder()
        .benchmark_name("stub")
        .database(DatabaseDescriptor::builder().url("stub://nowhere").build())
        .transaction_types(TransactionTypes::from_procedures(vec![stub("Ping", 1, success)]))
        .phases(vec![timed("stub", 1, 1_000, vec![100.0])])
        .terminals(4)
        .build();
    let benchmark: Box<dyn Benchmark> = Box::new(BenchmarkModule::new(workload, Arc::new(Unreachable)));

    let err = run_workload(vec![benchmark], ExecutionConfig::default(), None)
        .await
        .unwrap_err();
    assert!(
        matches!(err, Error::TerminalSetup { terminal: 2, .. }),
        "unexpected error {err}"
    );
}

#[tokio::test(start_paused = true)]
async fn invalid_schedule_is_rejected_before_running() {
    let err = run_workload(
        vec![benchmark(
            "stub",
            vec![stub("Ping", 1, success)],
            vec![timed("stub", 1, 1_000, vec![50.0, 50.0])],
            1,
        )],
        ExecutionConfig::default(),
        None,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, Error::InvalidConfiguration { .. }));
}

#[tokio::test(start_paused = true)]
async fn results_carry_the_configured_window_size() {
    let mut phase = timed("stub", 1, 1_000, vec![100.0]);
    phase.rate = RateSpec::Limited(10.0);
    let config = ExecutionConfig::builder()
        .window_size(Duration::from_millis(250))
        .build();
    let results = run_workload(
        vec![benchmark("stub", vec![stub("Ping", 1, success)], vec![phase], 1)],
        config,
        None,
    )
    .await
    .unwrap();

    assert_eq!(results.window_size(), Duration::from_millis(250));
    let windows = results.configured_windows();
    assert_eq!(windows, results.windows(Duration::from_millis(250)));
    // a transaction issued right at the phase end may open a fifth bucket
    assert!((4..=5).contains(&windows.len()), "{} windows", windows.len());
    assert_eq!(windows[0].completed, 3);
}

#[tokio::test(start_paused = true)]
async fn benchmarks_share_one_timeline() {
    let short = benchmark(
        "tatp",
        vec![stub("GetSubscriber", 5, success)],
        vec![timed("tatp", 1, 500, vec![100.0])],
        2,
    );
    let long = benchmark(
        "tpcc",
        vec![stub("NewOrder", 5, success), stub("Payment", 5, success)],
        vec![timed("tpcc", 1, 1_000, vec![45.0, 55.0])],
        2,
    );
    let results = run(vec![short, long]).await;

    let per_benchmark = |name: &str| {
        results
            .samples()
            .iter()
            .filter(|s| &*s.transaction.benchmark == name)
            .collect::<Vec<_>>()
    };
    let tatp = per_benchmark("tatp");
    let tpcc = per_benchmark("tpcc");
    assert!(tatp.iter().all(|s| s.start < Duration::from_millis(500)));
    assert!(tpcc.iter().any(|s| s.start >= Duration::from_millis(500)));
    assert!(tatp.iter().all(|s| s.transaction.id == 1));
    assert_eq!(results.elapsed(), Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn interval_monitor_reports_while_running() {
    let reports: Arc<Mutex<Vec<IntervalReport>>> = Arc::default();
    let observer = {
        let reports = Arc::clone(&reports);
        move |report: &IntervalReport| reports.lock().unwrap().push(report.clone())
    };
    let mut phase = timed("stub", 1, 3_000, vec![100.0]);
    phase.rate = RateSpec::Limited(20.0);

    let results = Coordinator::builder()
        .config(
            ExecutionConfig::builder()
                .interval_monitor(Duration::from_secs(1))
                .build(),
        )
        .benchmarks(vec![benchmark("stub", vec![stub("Ping", 1, success)], vec![phase], 2)])
        .observer(Arc::new(observer))
        .build()
        .run()
        .await
        .unwrap();

    let reports = reports.lock().unwrap();
    assert!((2..=3).contains(&reports.len()), "{} reports", reports.len());
    for report in reports.iter().take(2) {
        assert!((19.0..=21.0).contains(&report.throughput), "{report:?}");
    }
    assert!(results.success().count() >= 58);
}
