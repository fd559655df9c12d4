//! Differential comparator.
//!
//! Replays one command sequence against several endpoints and checks that
//! every endpoint gives the same reply to the same command. Each endpoint is
//! driven by its own task so network latency overlaps, but all tasks are
//! joined after every step, which keeps the endpoints index-aligned.
//!
//! ```text
//! Init -> Connected -> Executing -> Agreed
//!   |                      |
//!   +------> Aborted <-----+-----> Diverged
//! ```

use crate::bench::{effective_batch, reset_keys, ExecutionMode};
use crate::client::{Client, ClientOptions};
use crate::command::{Command, CommandSequence};
use crate::config::ConfigError;
use crate::endpoint::Endpoint;
use crate::error::{bound_run, HarnessError};
use crate::protocols::resp::Reply;
use std::io;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Per-run settings for a comparison.
#[derive(Debug, Clone)]
pub struct CompareOptions {
    pub client: ClientOptions,
    pub mode: ExecutionMode,
    /// Commands per pipeline batch; 0 sends the whole sequence at once
    pub batch_size: usize,
    /// DEL every key of the sequence on each endpoint before comparing
    pub reset_keys: bool,
    pub run_timeout: Option<Duration>,
}

impl Default for CompareOptions {
    fn default() -> Self {
        Self {
            client: ClientOptions::default(),
            mode: ExecutionMode::Serial,
            batch_size: 0,
            reset_keys: false,
            run_timeout: None,
        }
    }
}

/// Where a comparison run currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Init,
    Connected,
    Executing,
    Agreed,
    Diverged,
    Aborted,
}

/// The first command at which two endpoints disagreed.
#[derive(Debug, Clone, PartialEq)]
pub struct DivergenceReport {
    /// Position of the command in the sequence
    pub index: usize,
    pub command: Command,
    /// First configured endpoint and its reply
    pub baseline: (Endpoint, Reply),
    /// First endpoint whose reply differs from the baseline
    pub divergent: (Endpoint, Reply),
}

/// Terminal result of a comparison that ran to completion.
#[derive(Debug, Clone, PartialEq)]
pub enum ComparisonOutcome {
    /// Every reply matched across all endpoints.
    Agreed { commands: usize },
    Diverged(DivergenceReport),
}

/// Replies of one endpoint for one job, or the failure that ended it.
type JobResult = Result<Vec<Reply>, HarnessError>;

/// Task driving one endpoint's connection.
struct Worker {
    endpoint: Endpoint,
    jobs: mpsc::Sender<Range<usize>>,
    results: mpsc::Receiver<JobResult>,
    handle: JoinHandle<()>,
}

impl Worker {
    fn spawn(endpoint: Endpoint, sequence: Arc<CommandSequence>, options: &CompareOptions) -> Self {
        let (jobs, mut job_rx) = mpsc::channel::<Range<usize>>(1);
        let (result_tx, results) = mpsc::channel::<JobResult>(1);
        let client_options = options.client.clone();
        let reset = options.reset_keys;
        let ep = endpoint.clone();

        let handle = tokio::spawn(async move {
            // The first message reports whether the endpoint is ready.
            let mut client = match prepare(&ep, &sequence, &client_options, reset).await {
                Ok(client) => {
                    if result_tx.send(Ok(Vec::new())).await.is_err() {
                        return;
                    }
                    client
                }
                Err(e) => {
                    let _ = result_tx.send(Err(e)).await;
                    return;
                }
            };

            while let Some(range) = job_rx.recv().await {
                let result = execute_range(&mut client, &sequence, range).await;
                let failed = result.is_err();
                if result_tx.send(result).await.is_err() || failed {
                    return;
                }
            }
            client.close().await;
        });

        Worker {
            endpoint,
            jobs,
            results,
            handle,
        }
    }

    async fn submit(&self, range: Range<usize>) -> Result<(), HarnessError> {
        self.jobs
            .send(range)
            .await
            .map_err(|_| worker_gone(&self.endpoint))
    }

    async fn collect(&mut self) -> JobResult {
        match self.results.recv().await {
            Some(result) => result,
            None => Err(worker_gone(&self.endpoint)),
        }
    }

    /// Close the job queue and wait for the connection to shut down.
    async fn finish(self) {
        drop(self.jobs);
        if let Err(e) = self.handle.await {
            warn!(endpoint = %self.endpoint, error = %e, "Endpoint task failed");
        }
    }
}

fn worker_gone(endpoint: &Endpoint) -> HarnessError {
    HarnessError::Connection {
        endpoint: endpoint.clone(),
        index: None,
        source: io::Error::new(io::ErrorKind::BrokenPipe, "endpoint task stopped"),
    }
}

async fn prepare(
    endpoint: &Endpoint,
    sequence: &CommandSequence,
    options: &ClientOptions,
    reset: bool,
) -> Result<Client, HarnessError> {
    let mut client = Client::connect(endpoint, options).await?;
    if reset {
        reset_keys(&mut client, sequence).await?;
    }
    Ok(client)
}

/// Run `range` of the sequence on one connection. A single command is a plain
/// request/response; longer ranges are pipelined.
async fn execute_range(
    client: &mut Client,
    sequence: &CommandSequence,
    range: Range<usize>,
) -> JobResult {
    let commands = &sequence.as_slice()[range.clone()];
    if let [command] = commands {
        let reply = client
            .execute(command)
            .await
            .map_err(|e| e.at_index(range.start))?;
        return Ok(vec![reply]);
    }

    for (i, command) in range.clone().zip(commands) {
        client.send(command).await.map_err(|e| e.at_index(i))?;
    }
    let mut replies = Vec::with_capacity(commands.len());
    for i in range {
        replies.push(client.recv().await.map_err(|e| e.at_index(i))?);
    }
    Ok(replies)
}

/// Find the first index at which any endpoint's reply differs from the first
/// endpoint's. `replies[k]` holds endpoint `k`'s replies for commands
/// starting at `base`.
fn first_divergence(
    sequence: &CommandSequence,
    base: usize,
    endpoints: &[Endpoint],
    replies: &[Vec<Reply>],
) -> Option<DivergenceReport> {
    let (baseline, others) = replies.split_first()?;
    for (offset, expected) in baseline.iter().enumerate() {
        for (k, theirs) in others.iter().enumerate() {
            let actual = &theirs[offset];
            if actual != expected {
                let index = base + offset;
                return Some(DivergenceReport {
                    index,
                    command: sequence.get(index)?.clone(),
                    baseline: (endpoints[0].clone(), expected.clone()),
                    divergent: (endpoints[k + 1].clone(), actual.clone()),
                });
            }
        }
    }
    None
}

fn enter(phase: &mut Phase, next: Phase) {
    debug!(from = ?*phase, to = ?next, "Comparison phase");
    *phase = next;
}

/// Replay `sequence` against every endpoint and compare replies.
///
/// Stops at the first divergence. Harness failures (unreachable endpoint,
/// timeout, malformed reply) abort the run with an error instead.
pub async fn compare(
    endpoints: &[Endpoint],
    sequence: Arc<CommandSequence>,
    options: &CompareOptions,
) -> Result<ComparisonOutcome, HarnessError> {
    if endpoints.len() < 2 {
        return Err(ConfigError::Invalid(format!(
            "compare needs at least two endpoints, got {}",
            endpoints.len()
        ))
        .into());
    }

    let mut phase = Phase::Init;
    let run = run_comparison(endpoints, sequence, options, &mut phase);
    let result = bound_run(options.run_timeout, run).await;
    if result.is_err() {
        enter(&mut phase, Phase::Aborted);
    }
    result
}

async fn run_comparison(
    endpoints: &[Endpoint],
    sequence: Arc<CommandSequence>,
    options: &CompareOptions,
    phase: &mut Phase,
) -> Result<ComparisonOutcome, HarnessError> {
    let mut workers: Vec<Worker> = endpoints
        .iter()
        .map(|ep| Worker::spawn(ep.clone(), Arc::clone(&sequence), options))
        .collect();

    for worker in &mut workers {
        worker.collect().await?;
    }
    enter(phase, Phase::Connected);

    let len = sequence.len();
    let step = match options.mode {
        ExecutionMode::Serial => 1,
        ExecutionMode::Pipelined => effective_batch(options.batch_size, len),
    };
    info!(
        endpoints = endpoints.len(),
        commands = len,
        mode = %options.mode,
        "Comparing endpoints"
    );
    enter(phase, Phase::Executing);

    let mut start = 0;
    while start < len {
        let end = (start + step).min(len);
        for worker in &workers {
            worker.submit(start..end).await?;
        }

        let mut replies = Vec::with_capacity(workers.len());
        for worker in &mut workers {
            replies.push(worker.collect().await?);
        }

        if let Some(report) = first_divergence(&sequence, start, endpoints, &replies) {
            enter(phase, Phase::Diverged);
            info!(
                index = report.index,
                command = %report.command,
                endpoint = %report.divergent.0,
                "Endpoints diverged"
            );
            for worker in workers {
                worker.finish().await;
            }
            return Ok(ComparisonOutcome::Diverged(report));
        }
        start = end;
    }

    enter(phase, Phase::Agreed);
    info!(commands = len, "Endpoints agreed");
    for worker in workers {
        worker.finish().await;
    }
    Ok(ComparisonOutcome::Agreed { commands: len })
}
