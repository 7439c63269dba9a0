//! Terminal: one simulated client issuing transactions.
//!
//! # State machine
//! ```text
//! Idle -> WaitingForPermit -> Executing -> Idle
//!   ^                                       |
//!   +------------ next iteration -----------+        -> Done on stop / schedule exhausted
//! ```
//!
//! Each iteration:
//! 1. Read the benchmark's phase signal; if no phase covers this terminal, park until the
//!    driver publishes a new one or the run stops.
//! 2. Pick a transaction type (serial cycle or weighted draw, honouring retries).
//! 3. Reserve a budget slot for count-based phases, then wait for a permit. Waiting is the
//!    only cancellable point: a phase change or stop abandons the wait.
//! 4. Apply the pre-execution delay, check once more that the phase is current and the run
//!    has not stopped, then execute. An in-flight transaction is never interrupted.
//! 5. Classify the outcome, record the sample, apply the post-execution delay.
//!
//! # Retry policy
//! `Retry` reissues the same type on this terminal, still pacing through the limiter.
//! `RetryDifferent` excludes the failed type from the next draw. A count-based slot
//! survives at most `max_retries` retries in a row: until then a retry hands the slot back
//! to the budget, the retry after that completes it. Whatever the procedure keeps
//! returning, a fixed-count phase therefore ends after at most
//! `count * (max_retries + 1)` attempts.

use std::{panic::AssertUnwindSafe, sync::Arc, time::Duration};

use futures::FutureExt;
use rand::rngs::StdRng;
use tokio::{sync::watch, time::Instant};

use super::{
    driver::{ActivePhase, PhaseSignal},
    rate::Pacer,
    selector::{TransactionSelector, terminal_rng},
};
use crate::{
    aggregate::Aggregator,
    metric::{Outcome, Sample, TransactionKey},
    transaction::{ProcedureError, TransactionStatus, TransactionTypes},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum WorkerStatus {
    Idle,
    WaitingForPermit,
    Executing,
    Done,
}

/// Shared handles every terminal of a benchmark is built from: the benchmark's phase
/// signal, the run-wide stop signal and the aggregator.
#[derive(Clone)]
pub struct TerminalWiring {
    pub(crate) phases: watch::Receiver<PhaseSignal>,
    pub(crate) shutdown: watch::Receiver<bool>,
    pub(crate) aggregator: Arc<Aggregator>,
    pub(crate) max_retries: u32,
    pub(crate) seed: Option<u64>,
}

/// Per-phase state of a terminal, rebuilt on every activation.
struct PhaseRun {
    active: Arc<ActivePhase>,
    selector: TransactionSelector,
    pacer: Pacer,
    pending: Option<Pending>,
}

/// Follow-up decided by the previous attempt's outcome.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Pending {
    Reissue { position: usize, attempts: u32 },
    Avoid { position: usize, attempts: u32 },
}

enum Step {
    Continue,
    Park,
    Stop,
}

pub(crate) struct Worker<C> {
    id: usize,
    conn: C,
    types: Arc<TransactionTypes<C>>,
    keys: Vec<TransactionKey>,
    enabled: Vec<bool>,
    phases: watch::Receiver<PhaseSignal>,
    shutdown: watch::Receiver<bool>,
    aggregator: Arc<Aggregator>,
    max_retries: u32,
    rng: StdRng,
    status: WorkerStatus,
    samples: Vec<Sample>,
}

impl<C: Send + 'static> Worker<C> {
    pub(crate) fn new(
        id: usize,
        benchmark: &Arc<str>,
        conn: C,
        types: Arc<TransactionTypes<C>>,
        wiring: TerminalWiring,
    ) -> Self {
        let keys = types.keys(benchmark);
        let enabled = types.iter().map(|t| !t.is_supplemental()).collect();
        Self {
            id,
            conn,
            types,
            keys,
            enabled,
            phases: wiring.phases,
            shutdown: wiring.shutdown,
            aggregator: wiring.aggregator,
            max_retries: wiring.max_retries,
            rng: terminal_rng(wiring.seed, benchmark, id),
            status: WorkerStatus::Idle,
            samples: Vec::new(),
        }
    }

    /// Runs until the schedule is exhausted or the run stops; returns the sample buffer.
    pub(crate) async fn run(mut self) -> Vec<Sample> {
        tracing::debug!("Terminal {} started.", self.id);
        let mut current: Option<PhaseRun> = None;

        loop {
            if *self.shutdown.borrow() {
                break;
            }
            let signal = self.phases.borrow_and_update().clone();
            let step = match signal {
                PhaseSignal::Finished => break,
                PhaseSignal::Active(active) if active.phase.covers(self.id) => {
                    let run = match current.take() {
                        Some(run) if Arc::ptr_eq(&run.active, &active) => run,
                        _ => self.enter(active),
                    };
                    let run = current.insert(run);
                    self.step(run).await
                }
                _ => Step::Park,
            };
            match step {
                Step::Continue => {}
                Step::Park => {
                    self.set_status(WorkerStatus::Idle);
                    if !self.wait_for_phase_change().await {
                        break;
                    }
                }
                Step::Stop => break,
            }
        }

        self.set_status(WorkerStatus::Done);
        tracing::debug!(
            "Terminal {} done after {} samples.",
            self.id,
            self.samples.len()
        );
        self.samples
    }

    fn enter(&self, active: Arc<ActivePhase>) -> PhaseRun {
        let selector = TransactionSelector::new(
            &active.phase.weights,
            &self.enabled,
            active.phase.is_serial(),
        );
        tracing::debug!(
            "Terminal {} joins phase {} with {} transaction types.",
            self.id,
            active.phase.id,
            selector.len()
        );
        PhaseRun {
            selector,
            pacer: Pacer::for_phase(&active.phase, active.open.as_ref()),
            pending: None,
            active,
        }
    }

    /// `false` when the run stopped or the driver went away.
    async fn wait_for_phase_change(&mut self) -> bool {
        tokio::select! {
            biased;
            _ = self.shutdown.wait_for(|stop| *stop) => false,
            changed = self.phases.changed() => changed.is_ok(),
        }
    }

    fn is_current(&self, active: &Arc<ActivePhase>) -> bool {
        matches!(&*self.phases.borrow(), PhaseSignal::Active(a) if Arc::ptr_eq(a, active))
    }

    async fn step(&mut self, run: &mut PhaseRun) -> Step {
        let (position, attempts) = match run.pending.take() {
            Some(Pending::Reissue { position, attempts }) => (Some(position), attempts),
            Some(Pending::Avoid { position, attempts }) => {
                (run.selector.next(&mut self.rng, Some(position)), attempts)
            }
            None => (run.selector.next(&mut self.rng, None), 0),
        };
        let Some((position, ttype)) = position.and_then(|p| self.types.at(p).map(|t| (p, t)))
        else {
            return Step::Park;
        };
        let procedure = Arc::clone(ttype.procedure());
        let pre_delay = ttype.pre_execution_delay();
        let post_delay = ttype.post_execution_delay();

        let budget = run.active.budget.clone();
        if let Some(budget) = &budget {
            if !budget.try_reserve() {
                return Step::Park;
            }
        }
        let give_back = || {
            if let Some(budget) = &budget {
                budget.release();
            }
        };

        self.set_status(WorkerStatus::WaitingForPermit);
        let lateness = tokio::select! {
            biased;
            _ = self.shutdown.wait_for(|stop| *stop) => {
                give_back();
                return Step::Stop;
            }
            changed = self.phases.changed() => {
                give_back();
                return if changed.is_ok() { Step::Continue } else { Step::Stop };
            }
            permit = run.pacer.acquire() => match permit {
                Some(lateness) => lateness,
                None => {
                    give_back();
                    return Step::Park;
                }
            },
        };

        if !pre_delay.is_zero() {
            tokio::time::sleep(pre_delay).await;
        }

        // Taking the timestamp before the final check keeps samples of consecutive
        // phases from interleaving: a start observed here precedes any later activation.
        let start = Instant::now();
        if *self.shutdown.borrow() {
            give_back();
            return Step::Stop;
        }
        if !self.is_current(&run.active) {
            give_back();
            return Step::Continue;
        }

        self.set_status(WorkerStatus::Executing);
        let result = AssertUnwindSafe(procedure.execute(&mut self.conn))
            .catch_unwind()
            .await;
        let latency = start.elapsed();

        let (outcome, abort_message) = match result {
            Ok(result) => classify(result),
            Err(_) => {
                tracing::warn!(
                    "Terminal {}: transaction `{}` panicked, recorded as unknown.",
                    self.id,
                    self.keys[position].name
                );
                (Outcome::Unknown, None)
            }
        };

        let retry_slot = outcome.is_retry() && attempts < self.max_retries;
        if let Some(budget) = &budget {
            if retry_slot {
                budget.release();
            } else {
                budget.complete();
            }
        }

        let sample = Sample {
            transaction: self.keys[position].clone(),
            worker_id: self.id,
            phase_id: run.active.phase.id,
            start: start.duration_since(run.active.epoch),
            latency,
            outcome,
            is_warmup: run.active.is_warmup(start),
            lateness,
            abort_message,
        };
        self.aggregator.record(&sample);
        self.samples.push(sample);
        run.pending = follow_up(outcome, position, attempts, self.max_retries);

        self.set_status(WorkerStatus::Idle);
        if !post_delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(post_delay) => {}
                _ = self.shutdown.wait_for(|stop| *stop) => return Step::Stop,
            }
        }
        Step::Continue
    }

    fn set_status(&mut self, status: WorkerStatus) {
        if self.status != status {
            tracing::trace!(terminal = self.id, from = ?self.status, to = ?status);
            self.status = status;
        }
    }
}

/// Decides what the next attempt must do after `outcome`. `attempts` counts the retries
/// already spent on the current slot; once it reaches `max_retries` the next attempt
/// starts a fresh slot.
fn follow_up(outcome: Outcome, position: usize, attempts: u32, max_retries: u32) -> Option<Pending> {
    let exhausted = attempts >= max_retries;
    match outcome {
        Outcome::Retry if !exhausted => Some(Pending::Reissue {
            position,
            attempts: attempts + 1,
        }),
        Outcome::RetryDifferent => Some(Pending::Avoid {
            position,
            attempts: if exhausted { 0 } else { attempts + 1 },
        }),
        _ => None,
    }
}

/// Maps what the procedure reported onto the outcome taxonomy.
fn classify(result: Result<TransactionStatus, ProcedureError>) -> (Outcome, Option<String>) {
    match result {
        Ok(TransactionStatus::Success) => (Outcome::Success, None),
        Ok(TransactionStatus::UserAbort(message)) => (Outcome::UserAbort, Some(message)),
        Ok(TransactionStatus::Retry) => (Outcome::Retry, None),
        Ok(TransactionStatus::RetryDifferent) => (Outcome::RetryDifferent, None),
        Ok(TransactionStatus::Unknown) => (Outcome::Unknown, None),
        Err(ProcedureError::Driver(_)) => (Outcome::DbError, None),
        Err(ProcedureError::ConnectionLost(_)) => (Outcome::Unknown, None),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use futures::future::join_all;

    use super::*;
    use crate::{
        executor::driver::drive_phases,
        phase::{Phase, PhaseSchedule, RateSpec},
        transaction::Procedure,
    };

    type Script = fn(u32) -> Result<TransactionStatus, ProcedureError>;

    struct Scripted {
        name: &'static str,
        latency: Duration,
        script: Script,
        calls: AtomicU32,
    }

    fn scripted(name: &'static str, latency_ms: u64, script: Script) -> Arc<dyn Procedure<()>> {
        Arc::new(Scripted {
            name,
            latency: Duration::from_millis(latency_ms),
            script,
            calls: AtomicU32::new(0),
        })
    }

    #[async_trait]
    impl Procedure<()> for Scripted {
        fn name(&self) -> &str {
            self.name
        }

        async fn execute(&self, _conn: &mut ()) -> Result<TransactionStatus, ProcedureError> {
            let call = self.calls.fetch_add(1, Ordering::Relaxed);
            tokio::time::sleep(self.latency).await;
            (self.script)(call)
        }
    }

    struct Panics;

    #[async_trait]
    impl Procedure<()> for Panics {
        fn name(&self) -> &str {
            "Panics"
        }

        async fn execute(&self, _conn: &mut ()) -> Result<TransactionStatus, ProcedureError> {
            tokio::time::sleep(Duration::from_millis(1)).await;
            panic!("procedure bug")
        }
    }

    fn ok(_: u32) -> Result<TransactionStatus, ProcedureError> {
        Ok(TransactionStatus::Success)
    }

    fn phase(id: u32, weights: Vec<f64>) -> Phase {
        Phase::builder()
            .benchmark_name("bench")
            .id(id)
            .duration(Duration::from_secs(1))
            .weights(weights)
            .build()
    }

    /// Runs `terminals` workers through the whole schedule; one sample buffer per terminal.
    async fn run(
        procedures: Vec<Arc<dyn Procedure<()>>>,
        phases: Vec<Phase>,
        terminals: usize,
        max_retries: u32,
    ) -> Vec<Vec<Sample>> {
        let benchmark: Arc<str> = "bench".into();
        let types = Arc::new(TransactionTypes::from_procedures(procedures));
        let schedule =
            PhaseSchedule::new(Arc::clone(&benchmark), phases, types.len(), terminals).unwrap();
        let (stop_tx, stop_rx) = watch::channel(false);
        let (signal_tx, signal_rx) = watch::channel(PhaseSignal::Idle);
        let wiring = TerminalWiring {
            phases: signal_rx,
            shutdown: stop_rx,
            aggregator: Arc::new(Aggregator::new(types.keys(&benchmark))),
            max_retries,
            seed: Some(7),
        };
        let workers: Vec<_> = (0..terminals)
            .map(|id| {
                let worker = Worker::new(id, &benchmark, (), Arc::clone(&types), wiring.clone());
                tokio::spawn(worker.run())
            })
            .collect();

        drive_phases(schedule, signal_tx, Instant::now(), Duration::from_millis(1)).await;
        stop_tx.send_replace(true);
        join_all(workers)
            .await
            .into_iter()
            .map(|res| res.unwrap())
            .collect()
    }

    #[test]
    fn classification() {
        assert_eq!(classify(Ok(TransactionStatus::Success)), (Outcome::Success, None));
        assert_eq!(
            classify(Ok(TransactionStatus::UserAbort("no stock".into()))),
            (Outcome::UserAbort, Some("no stock".into()))
        );
        assert_eq!(
            classify(Err(ProcedureError::Driver("deadlock".into()))),
            (Outcome::DbError, None)
        );
        assert_eq!(
            classify(Err(ProcedureError::ConnectionLost("reset".into()))),
            (Outcome::Unknown, None)
        );
    }

    #[test]
    fn retries_are_bounded() {
        let first = follow_up(Outcome::Retry, 3, 0, 2);
        assert_eq!(first, Some(Pending::Reissue { position: 3, attempts: 1 }));
        assert_eq!(
            follow_up(Outcome::Retry, 3, 1, 2),
            Some(Pending::Reissue { position: 3, attempts: 2 })
        );
        assert_eq!(follow_up(Outcome::Retry, 3, 2, 2), None);
        assert_eq!(follow_up(Outcome::Retry, 3, 0, 0), None);
        assert_eq!(
            follow_up(Outcome::RetryDifferent, 1, 0, 2),
            Some(Pending::Avoid { position: 1, attempts: 1 })
        );
        assert_eq!(
            follow_up(Outcome::RetryDifferent, 1, 2, 2),
            Some(Pending::Avoid { position: 1, attempts: 0 })
        );
        assert_eq!(follow_up(Outcome::DbError, 1, 1, 2), None);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_loop_terminal_issues_at_rate() {
        let mut rated = phase(1, vec![100.0]);
        rated.rate = RateSpec::Limited(10.0);
        let buffers = run(vec![scripted("Ping", 1, ok)], vec![rated], 1, 3).await;

        let samples = &buffers[0];
        assert!((10..=11).contains(&samples.len()), "{} samples", samples.len());
        assert!(samples.iter().all(|s| s.outcome == Outcome::Success));
        // paced by the limiter, not by the 1ms transaction
        for pair in samples.windows(2) {
            assert!(pair[1].start - pair[0].start >= Duration::from_millis(100));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retry_different_moves_to_another_type() {
        fn contended(_: u32) -> Result<TransactionStatus, ProcedureError> {
            Ok(TransactionStatus::RetryDifferent)
        }
        let buffers = run(
            vec![scripted("Hot", 5, contended), scripted("Cold", 5, ok)],
            vec![phase(1, vec![50.0, 50.0])],
            1,
            3,
        )
        .await;

        let samples = &buffers[0];
        assert!(samples.len() > 100);
        for pair in samples.windows(2) {
            if pair[0].outcome == Outcome::RetryDifferent {
                assert_eq!(&*pair[1].transaction.name, "Cold");
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_do_not_consume_the_budget() {
        fn flaky(call: u32) -> Result<TransactionStatus, ProcedureError> {
            if call % 2 == 0 {
                Ok(TransactionStatus::Retry)
            } else {
                Ok(TransactionStatus::Success)
            }
        }
        let counted = Phase::builder()
            .benchmark_name("bench")
            .id(1)
            .transaction_count(5)
            .weights(vec![100.0])
            .build();
        let buffers = run(vec![scripted("Flaky", 10, flaky)], vec![counted], 1, 3).await;

        let outcomes: Vec<_> = buffers[0].iter().map(|s| s.outcome).collect();
        assert_eq!(outcomes.len(), 10);
        assert_eq!(
            outcomes.iter().filter(|o| **o == Outcome::Success).count(),
            5
        );
    }

    #[tokio::test(start_paused = true)]
    async fn endless_retries_still_complete_a_counted_phase() {
        fn busy(_: u32) -> Result<TransactionStatus, ProcedureError> {
            Ok(TransactionStatus::Retry)
        }
        let counted = Phase::builder()
            .benchmark_name("bench")
            .id(1)
            .transaction_count(5)
            .weights(vec![100.0])
            .build();
        let buffers = run(vec![scripted("Busy", 1, busy)], vec![counted], 1, 3).await;

        // one first attempt plus three retries per slot
        assert_eq!(buffers[0].len(), 20);
        assert!(buffers[0].iter().all(|s| s.outcome == Outcome::Retry));
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_procedure_is_recorded_as_unknown() {
        let counted = Phase::builder()
            .benchmark_name("bench")
            .id(1)
            .transaction_count(3)
            .weights(vec![100.0])
            .build();
        let panics: Arc<dyn Procedure<()>> = Arc::new(Panics);
        let buffers = run(vec![panics], vec![counted], 1, 3).await;

        assert_eq!(buffers[0].len(), 3);
        assert!(buffers[0].iter().all(|s| s.outcome == Outcome::Unknown));
    }

    #[tokio::test(start_paused = true)]
    async fn terminals_beyond_active_count_stay_dormant() {
        let mut narrow = phase(1, vec![100.0]);
        narrow.active_terminals = 1;
        let buffers = run(vec![scripted("Ping", 10, ok)], vec![narrow], 3, 3).await;

        assert!(!buffers[0].is_empty());
        assert!(buffers[1].is_empty());
        assert!(buffers[2].is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_lets_the_in_flight_transaction_finish() {
        let benchmark: Arc<str> = "bench".into();
        let types = Arc::new(TransactionTypes::from_procedures(vec![scripted(
            "Slow", 1_000, ok,
        )]));
        let mut long = phase(1, vec![100.0]);
        long.duration = Some(Duration::from_secs(60));
        let schedule = PhaseSchedule::new(Arc::clone(&benchmark), vec![long], 1, 1).unwrap();
        let (stop_tx, stop_rx) = watch::channel(false);
        let (signal_tx, signal_rx) = watch::channel(PhaseSignal::Idle);
        let wiring = TerminalWiring {
            phases: signal_rx,
            shutdown: stop_rx,
            aggregator: Arc::new(Aggregator::new(types.keys(&benchmark))),
            max_retries: 0,
            seed: None,
        };
        let worker = tokio::spawn(Worker::new(0, &benchmark, (), types, wiring).run());
        let epoch = Instant::now();
        let driver = tokio::spawn(drive_phases(schedule, signal_tx, epoch, Duration::from_millis(1)));

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        stop_tx.send_replace(true);
        let samples = worker.await.unwrap();
        driver.abort();

        assert_eq!(samples.len(), 2);
        assert_eq!(samples[1].latency, Duration::from_secs(1));
        assert_eq!(samples[1].end(), Duration::from_secs(2));
        assert_eq!(Instant::now().duration_since(epoch), Duration::from_secs(2));
    }
}
