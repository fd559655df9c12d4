//! Harness failure taxonomy.
//!
//! A divergence between servers is a result, not an error, and never appears
//! here. Everything in this module means the harness could not finish a run.

use crate::config::ConfigError;
use crate::endpoint::Endpoint;
use std::fmt;
use std::future::Future;
use std::io;
use std::time::Duration;

/// A failure that aborts a benchmark or comparison run.
#[derive(Debug)]
pub enum HarnessError {
    /// Endpoint unreachable, handshake rejected, or connection lost mid-run.
    Connection {
        endpoint: Endpoint,
        index: Option<usize>,
        source: io::Error,
    },
    /// No reply within the per-command bound.
    Timeout {
        endpoint: Endpoint,
        index: Option<usize>,
        after: Duration,
    },
    /// Reply bytes do not parse as RESP.
    Protocol {
        endpoint: Endpoint,
        index: Option<usize>,
        message: String,
    },
    /// The whole run exceeded its bound.
    RunTimeout { after: Duration },
    Config(ConfigError),
    /// Writing the report failed.
    Output(io::Error),
}

impl HarnessError {
    /// Attach the sequence index of the command being executed, unless one is
    /// already recorded.
    pub fn at_index(mut self, i: usize) -> Self {
        match &mut self {
            HarnessError::Connection { index, .. }
            | HarnessError::Timeout { index, .. }
            | HarnessError::Protocol { index, .. } => {
                index.get_or_insert(i);
            }
            HarnessError::RunTimeout { .. }
            | HarnessError::Config(_)
            | HarnessError::Output(_) => {}
        }
        self
    }

    /// Sequence index the failure is attributed to, if any.
    pub fn index(&self) -> Option<usize> {
        match self {
            HarnessError::Connection { index, .. }
            | HarnessError::Timeout { index, .. }
            | HarnessError::Protocol { index, .. } => *index,
            HarnessError::RunTimeout { .. }
            | HarnessError::Config(_)
            | HarnessError::Output(_) => None,
        }
    }
}

/// Bound a whole run by `limit`, if one is configured.
pub async fn bound_run<F, T>(limit: Option<Duration>, run: F) -> Result<T, HarnessError>
where
    F: Future<Output = Result<T, HarnessError>>,
{
    match limit {
        Some(after) => tokio::time::timeout(after, run)
            .await
            .unwrap_or_else(|_| Err(HarnessError::RunTimeout { after })),
        None => run.await,
    }
}

fn fmt_index(index: &Option<usize>) -> String {
    match index {
        Some(i) => format!(" at command #{i}"),
        None => String::new(),
    }
}

impl fmt::Display for HarnessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HarnessError::Connection {
                endpoint,
                index,
                source,
            } => write!(
                f,
                "Connection error on {endpoint}{}: {source}",
                fmt_index(index)
            ),
            HarnessError::Timeout {
                endpoint,
                index,
                after,
            } => write!(
                f,
                "Timed out on {endpoint}{} after {after:?} waiting for a reply",
                fmt_index(index)
            ),
            HarnessError::Protocol {
                endpoint,
                index,
                message,
            } => write!(
                f,
                "Protocol error from {endpoint}{}: {message}",
                fmt_index(index)
            ),
            HarnessError::RunTimeout { after } => {
                write!(f, "Run did not finish within {after:?}")
            }
            HarnessError::Config(e) => write!(f, "{e}"),
            HarnessError::Output(e) => write!(f, "Failed to write report: {e}"),
        }
    }
}

impl std::error::Error for HarnessError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            HarnessError::Connection { source, .. } => Some(source),
            HarnessError::Config(e) => Some(e),
            HarnessError::Output(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ConfigError> for HarnessError {
    fn from(e: ConfigError) -> Self {
        HarnessError::Config(e)
    }
}
