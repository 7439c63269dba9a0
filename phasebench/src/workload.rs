//! One benchmark's workload and the glue that turns it into running terminals.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::{BoxFuture, try_join_all};
use typed_builder::TypedBuilder;

use crate::{
    config::DatabaseDescriptor,
    error::{Error, Result},
    executor::{TerminalWiring, Worker},
    metric::{Sample, TransactionKey},
    phase::{Phase, PhaseSchedule},
    transaction::{Connector, TransactionTypes},
};

/// Everything the engine needs to know about one benchmark. Read-only during a run.
#[derive(TypedBuilder)]
pub struct WorkloadConfiguration<C> {
    #[builder(setter(into))]
    pub benchmark_name: Arc<str>,
    #[builder(default)]
    pub database: DatabaseDescriptor,
    pub transaction_types: TransactionTypes<C>,
    pub phases: Vec<Phase>,
    #[builder(default = num_cpus::get())]
    pub terminals: usize,
}

impl<C> WorkloadConfiguration<C> {
    /// Validates the phases against the registry and the terminal count.
    pub fn schedule(&self) -> Result<PhaseSchedule> {
        if self.terminals == 0 {
            return Err(crate::error::invalid_config(
                &*self.benchmark_name,
                "at least one terminal is required",
            ));
        }
        PhaseSchedule::new(
            Arc::clone(&self.benchmark_name),
            self.phases.clone(),
            self.transaction_types.len(),
            self.terminals,
        )
    }

    /// Disabled phases included.
    pub fn number_of_phases(&self) -> usize {
        self.phases.len()
    }
}

/// What the coordinator needs from a benchmark, independent of its connection type.
#[async_trait]
pub trait Benchmark: Send + Sync {
    fn name(&self) -> &Arc<str>;

    fn terminals(&self) -> usize;

    fn schedule(&self) -> Result<PhaseSchedule>;

    fn transaction_keys(&self) -> Vec<TransactionKey>;

    fn database(&self) -> &DatabaseDescriptor;

    /// Connects every terminal and returns their loops, ready to be spawned.
    /// Any connection failure aborts the whole run.
    async fn make_workers(
        &self,
        wiring: TerminalWiring,
    ) -> Result<Vec<BoxFuture<'static, Vec<Sample>>>>;
}

/// A workload plus the connector its terminals open their connections with.
pub struct BenchmarkModule<C> {
    workload: Arc<WorkloadConfiguration<C>>,
    types: Arc<TransactionTypes<C>>,
    connector: Arc<dyn Connector<C>>,
}

impl<C> BenchmarkModule<C> {
    pub fn new(workload: WorkloadConfiguration<C>, connector: Arc<dyn Connector<C>>) -> Self {
        let types = Arc::new(workload.transaction_types.clone());
        Self {
            workload: Arc::new(workload),
            types,
            connector,
        }
    }

    pub fn workload(&self) -> &WorkloadConfiguration<C> {
        &self.workload
    }
}

#[async_trait]
impl<C: Send + 'static> Benchmark for BenchmarkModule<C> {
    fn name(&self) -> &Arc<str> {
        &self.workload.benchmark_name
    }

    fn terminals(&self) -> usize {
        self.workload.terminals
    }

    fn schedule(&self) -> Result<PhaseSchedule> {
        self.workload.schedule()
    }

    fn transaction_keys(&self) -> Vec<TransactionKey> {
        self.types.keys(self.name())
    }

    fn database(&self) -> &DatabaseDescriptor {
        &self.workload.database
    }

    async fn make_workers(
        &self,
        wiring: TerminalWiring,
    ) -> Result<Vec<BoxFuture<'static, Vec<Sample>>>> {
        let benchmark = self.name();
        let connections = try_join_all((0..self.terminals()).map(|terminal| {
            let connector = Arc::clone(&self.connector);
            async move {
                connector
                    .connect(&self.workload.database, terminal)
                    .await
                    .map_err(|source| Error::TerminalSetup {
                        benchmark: benchmark.to_string(),
                        terminal,
                        source,
                    })
            }
        }))
        .await?;

        Ok(connections
            .into_iter()
            .enumerate()
            .map(|(terminal, conn)| {
                let worker = Worker::new(
                    terminal,
                    benchmark,
                    conn,
                    Arc::clone(&self.types),
                    wiring.clone(),
                );
                Box::pin(worker.run()) as BoxFuture<'static, Vec<Sample>>
            })
            .collect())
    }
}
