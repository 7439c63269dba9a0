//! A TPC-C flavoured mix against an in-memory stand-in for a database.
//!
//! Run with `RUST_LOG=info cargo run --example stub_workload`; set `LOG_FORMAT=json` for
//! machine-readable logs.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use phasebench::{
    Arrival, Benchmark, BenchmarkModule, Connector, DatabaseDescriptor, ExecutionConfig, Phase,
    Procedure, ProcedureError, RateSpec, Reporter, StdoutReporter, Summary, TransactionStatus,
    TransactionType, TransactionTypes, WorkloadConfiguration, run_workload, setup_logging,
};

/// Per-terminal "connection": just a counter of statements sent.
struct FakeConnection {
    statements: u64,
}

struct FakeDatabase {
    opened: AtomicU64,
}

#[async_trait]
impl Connector<FakeConnection> for FakeDatabase {
    async fn connect(
        &self,
        database: &DatabaseDescriptor,
        terminal: usize,
    ) -> Result<FakeConnection, ProcedureError> {
        self.opened.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(url = %database.url, terminal, "connected");
        Ok(FakeConnection { statements: 0 })
    }
}

struct NewOrder;

#[async_trait]
impl Procedure<FakeConnection> for NewOrder {
    fn name(&self) -> &str {
        "NewOrder"
    }

    async fn execute(&self, conn: &mut FakeConnection) -> Result<TransactionStatus, ProcedureError> {
        conn.statements += 1;
        tokio::time::sleep(Duration::from_millis(8)).await;
        // about one in a hundred orders references an unknown item
        if conn.statements % 100 == 0 {
            return Ok(TransactionStatus::UserAbort("invalid item number".into()));
        }
        Ok(TransactionStatus::Success)
    }
}

struct Payment;

#[async_trait]
impl Procedure<FakeConnection> for Payment {
    fn name(&self) -> &str {
        "Payment"
    }

    async fn execute(&self, conn: &mut FakeConnection) -> Result<TransactionStatus, ProcedureError> {
        conn.statements += 1;
        tokio::time::sleep(Duration::from_millis(4)).await;
        if conn.statements % 50 == 0 {
            return Ok(TransactionStatus::Retry);
        }
        Ok(TransactionStatus::Success)
    }
}

struct Delivery;

#[async_trait]
impl Procedure<FakeConnection> for Delivery {
    fn name(&self) -> &str {
        "Delivery"
    }

    async fn execute(&self, conn: &mut FakeConnection) -> Result<TransactionStatus, ProcedureError> {
        conn.statements += 1;
        tokio::time::sleep(Duration::from_millis(20)).await;
        if conn.statements % 200 == 0 {
            return Err(ProcedureError::Driver("deadlock detected".into()));
        }
        Ok(TransactionStatus::Success)
    }
}

fn phase(id: u32) -> Phase {
    Phase::builder()
        .benchmark_name("tpcc")
        .id(id)
        .weights(vec![45.0, 43.0, 12.0])
        .build()
}

#[tokio::main]
async fn main() -> phasebench::Result<()> {
    setup_logging()?;

    let types = TransactionTypes::new(
        "tpcc",
        vec![
            TransactionType::<FakeConnection>::new(1, Arc::new(NewOrder)),
            TransactionType::new(2, Arc::new(Payment)),
            TransactionType::new(3, Arc::new(Delivery))
                .with_post_execution_delay(Duration::from_millis(5)),
        ],
    )?;

    let mut warm = phase(1);
    warm.duration = Some(Duration::from_secs(5));
    warm.warmup = Duration::from_secs(2);
    warm.rate = RateSpec::Limited(200.0);

    let mut open = phase(2);
    open.duration = Some(Duration::from_secs(5));
    open.rate = RateSpec::Limited(400.0);
    open.arrival = Arrival::Open;

    let mut paused = phase(3);
    paused.duration = Some(Duration::from_secs(5));
    paused.rate = RateSpec::Disabled;

    let mut drain = phase(4);
    drain.transaction_count = Some(500);
    drain.active_terminals = 4;

    let workload = WorkloadConfiguration::builder()
        .benchmark_name("tpcc")
        .database(
            DatabaseDescriptor::builder()
                .db_type("fake")
                .url("fake://localhost/tpcc")
                .build(),
        )
        .transaction_types(types)
        .phases(vec![warm, open, paused, drain])
        .terminals(8)
        .build();
    let database = Arc::new(FakeDatabase {
        opened: AtomicU64::new(0),
    });
    let connector: Arc<dyn Connector<FakeConnection>> = database.clone();
    let benchmark: Box<dyn Benchmark> = Box::new(BenchmarkModule::new(workload, connector));

    let config = ExecutionConfig::builder()
        .interval_monitor(Duration::from_secs(1))
        .window_size(Duration::from_secs(2))
        .build();
    let results = run_workload(vec![benchmark], config, None).await?;

    let summary = Summary::from(&results);
    StdoutReporter.report(&summary).await?;
    for row in results.configured_windows() {
        tracing::info!(
            "window {:>3} @ {:>6.1}s: {:>8.1} txn/s, {} errors",
            row.index,
            row.start.as_secs_f64(),
            row.throughput,
            row.errors
        );
    }
    println!("{}", summary.to_json()?);
    tracing::info!(
        "{} connections opened",
        database.opened.load(Ordering::Relaxed)
    );
    Ok(())
}
