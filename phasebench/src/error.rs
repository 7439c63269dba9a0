//! Errors that abort a whole run.
//!
//! Failures of individual transactions never surface here: they are classified into an
//! [`Outcome`](crate::metric::Outcome) at the terminal and recorded as samples. Only
//! setup-time problems (an unusable workload description, a terminal that cannot connect)
//! and coordinator failures are fatal.

use crate::transaction::ProcedureError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The workload description violates an invariant, e.g. a weight list that does not
    /// match the number of transaction types
    #[error("invalid configuration for benchmark `{benchmark}`: {message}")]
    InvalidConfiguration { benchmark: String, message: String },

    /// A terminal could not be constructed, usually because its connection failed
    #[error("failed to set up terminal {terminal} of benchmark `{benchmark}`: {source}")]
    TerminalSetup {
        benchmark: String,
        terminal: usize,
        #[source]
        source: ProcedureError,
    },

    /// A phase driver or another coordinator-owned task died
    #[error("coordinator task failed: {0}")]
    Coordinator(#[from] tokio::task::JoinError),

    #[error("failed to serialize report: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("failed to install the log subscriber: {0}")]
    Telemetry(#[from] tracing_subscriber::util::TryInitError),
}

pub(crate) fn invalid_config(benchmark: impl AsRef<str>, message: impl Into<String>) -> Error {
    Error::InvalidConfiguration {
        benchmark: benchmark.as_ref().to_owned(),
        message: message.into(),
    }
}
