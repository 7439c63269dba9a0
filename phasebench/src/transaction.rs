//! Transaction types and the traits the engine uses to talk to a database.
//!
//! The engine never speaks SQL itself. A benchmark supplies one [`Procedure`] per
//! transaction type and a [`Connector`] that opens one connection per terminal; the
//! engine treats `execute` as an opaque, possibly failing call of unknown duration.

use std::{collections::HashSet, fmt, sync::Arc, time::Duration};

use async_trait::async_trait;

use crate::{
    config::DatabaseDescriptor,
    error::{Result, invalid_config},
    metric::TransactionKey,
};

/// What a procedure reports about an attempt that reached the database.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransactionStatus {
    Success,
    /// Deliberate rollback; the message ends up in the run's abort messages
    UserAbort(String),
    Retry,
    RetryDifferent,
    /// The procedure itself cannot tell whether the transaction committed
    Unknown,
}

/// Driver-level failures raised by a procedure or connector.
#[derive(Debug, thiserror::Error)]
pub enum ProcedureError {
    #[error("driver error: {0}")]
    Driver(String),

    /// The connection went away mid-call, so the outcome is unknown
    #[error("connection lost: {0}")]
    ConnectionLost(String),
}

/// One transaction implementation, executed against a connection of type `C`.
///
/// # Example
/// ```rust
/// use async_trait::async_trait;
/// use phasebench::{Procedure, ProcedureError, TransactionStatus};
///
/// struct Ping;
///
/// #[async_trait]
/// impl Procedure<()> for Ping {
///     fn name(&self) -> &str {
///         "Ping"
///     }
///
///     async fn execute(&self, _conn: &mut ()) -> Result<TransactionStatus, ProcedureError> {
///         Ok(TransactionStatus::Success)
///     }
/// }
/// ```
#[async_trait]
pub trait Procedure<C>: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&self, conn: &mut C) -> Result<TransactionStatus, ProcedureError>;
}

/// Opens the connection a terminal owns for the whole run.
#[async_trait]
pub trait Connector<C>: Send + Sync {
    async fn connect(&self, database: &DatabaseDescriptor, terminal: usize)
    -> Result<C, ProcedureError>;
}

/// A registered transaction type: id, procedure handle and artificial delays.
pub struct TransactionType<C> {
    id: u32,
    name: Arc<str>,
    procedure: Arc<dyn Procedure<C>>,
    pre_execution_delay: Duration,
    post_execution_delay: Duration,
    supplemental: bool,
}

impl<C> TransactionType<C> {
    pub fn new(id: u32, procedure: Arc<dyn Procedure<C>>) -> Self {
        Self {
            id,
            name: procedure.name().into(),
            procedure,
            pre_execution_delay: Duration::ZERO,
            post_execution_delay: Duration::ZERO,
            supplemental: false,
        }
    }

    pub fn with_pre_execution_delay(mut self, delay: Duration) -> Self {
        self.pre_execution_delay = delay;
        self
    }

    pub fn with_post_execution_delay(mut self, delay: Duration) -> Self {
        self.post_execution_delay = delay;
        self
    }

    /// Supplemental types are registered but not part of the weighted mix.
    pub fn supplemental(mut self) -> Self {
        self.supplemental = true;
        self
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn procedure(&self) -> &Arc<dyn Procedure<C>> {
        &self.procedure
    }

    pub fn pre_execution_delay(&self) -> Duration {
        self.pre_execution_delay
    }

    pub fn post_execution_delay(&self) -> Duration {
        self.post_execution_delay
    }

    pub fn is_supplemental(&self) -> bool {
        self.supplemental
    }

    pub fn key(&self, benchmark: &Arc<str>) -> TransactionKey {
        TransactionKey {
            benchmark: Arc::clone(benchmark),
            id: self.id,
            name: Arc::clone(&self.name),
        }
    }
}

impl<C> Clone for TransactionType<C> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            name: Arc::clone(&self.name),
            procedure: Arc::clone(&self.procedure),
            pre_execution_delay: self.pre_execution_delay,
            post_execution_delay: self.post_execution_delay,
            supplemental: self.supplemental,
        }
    }
}

impl<C> fmt::Debug for TransactionType<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionType")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("pre_execution_delay", &self.pre_execution_delay)
            .field("post_execution_delay", &self.post_execution_delay)
            .field("supplemental", &self.supplemental)
            .finish()
    }
}

/// Ordered, immutable catalog of a benchmark's transaction types.
///
/// Iteration is in ascending id order; a phase's weight list lines up with it
/// position by position.
pub struct TransactionTypes<C> {
    types: Vec<TransactionType<C>>,
}

impl<C> TransactionTypes<C> {
    /// Builds the registry, rejecting ids below 1 and duplicates.
    pub fn new(benchmark: &str, mut types: Vec<TransactionType<C>>) -> Result<Self> {
        let mut seen = HashSet::new();
        for t in &types {
            if t.id == 0 {
                return Err(invalid_config(
                    benchmark,
                    format!("transaction `{}` has id 0, ids start at 1", t.name),
                ));
            }
            if !seen.insert(t.id) {
                return Err(invalid_config(
                    benchmark,
                    format!("duplicate transaction id {}", t.id),
                ));
            }
        }
        types.sort_by_key(|t| t.id);
        Ok(Self { types })
    }

    /// Assigns ids 1, 2, ... in declaration order.
    pub fn from_procedures(procedures: Vec<Arc<dyn Procedure<C>>>) -> Self {
        let types = procedures
            .into_iter()
            .zip(1..)
            .map(|(procedure, id)| TransactionType::new(id, procedure))
            .collect();
        Self { types }
    }

    pub fn get(&self, id: u32) -> Option<&TransactionType<C>> {
        self.types
            .binary_search_by_key(&id, |t| t.id)
            .ok()
            .map(|i| &self.types[i])
    }

    /// Positional access, aligned with phase weights.
    pub fn at(&self, index: usize) -> Option<&TransactionType<C>> {
        self.types.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TransactionType<C>> {
        self.types.iter()
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    pub fn keys(&self, benchmark: &Arc<str>) -> Vec<TransactionKey> {
        self.types.iter().map(|t| t.key(benchmark)).collect()
    }
}

impl<C> Clone for TransactionTypes<C> {
    fn clone(&self) -> Self {
        Self {
            types: self.types.clone(),
        }
    }
}

impl<C> fmt::Debug for TransactionTypes<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.types.iter()).finish()
    }
}
