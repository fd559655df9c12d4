//! Benchmark runner.
//!
//! Times a command sequence against one endpoint, either strictly
//! request/response (`Serial`) or by writing a batch of commands before
//! reading any reply (`Pipelined`). No correctness assertions are made here;
//! error replies are only counted.

use crate::client::{Client, ClientOptions};
use crate::command::{Command, CommandSequence};
use crate::endpoint::Endpoint;
use crate::error::{bound_run, HarnessError};
use crate::protocols::resp::Reply;
use serde::Deserialize;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace};

/// Runs shorter than this report throughput as not measurable.
pub const MIN_MEASURABLE: Duration = Duration::from_micros(1);

/// Whether replies are awaited one by one or in batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Wait for each reply before sending the next command
    Serial,
    /// Send a batch of commands, then read all their replies in order
    Pipelined,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionMode::Serial => write!(f, "serial"),
            ExecutionMode::Pipelined => write!(f, "pipelined"),
        }
    }
}

/// Number of commands per pipeline batch; 0 means the whole sequence.
pub(crate) fn effective_batch(batch_size: usize, len: usize) -> usize {
    if batch_size == 0 {
        len.max(1)
    } else {
        batch_size
    }
}

/// Timing of one benchmark run. Built once, never mutated.
#[derive(Debug, Clone, PartialEq)]
pub struct BenchmarkResult {
    descriptor: String,
    elapsed: Duration,
    operations: usize,
    error_replies: usize,
    throughput: Option<f64>,
}

impl BenchmarkResult {
    pub fn new(
        descriptor: String,
        elapsed: Duration,
        operations: usize,
        error_replies: usize,
    ) -> Self {
        let throughput = if operations == 0 || elapsed < MIN_MEASURABLE {
            None
        } else {
            Some(operations as f64 / elapsed.as_secs_f64())
        };
        BenchmarkResult {
            descriptor,
            elapsed,
            operations,
            error_replies,
            throughput,
        }
    }

    pub fn descriptor(&self) -> &str {
        &self.descriptor
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn operations(&self) -> usize {
        self.operations
    }

    pub fn error_replies(&self) -> usize {
        self.error_replies
    }

    /// Commands per second, or `None` when the run was empty or too short to
    /// time.
    pub fn throughput(&self) -> Option<f64> {
        self.throughput
    }
}

/// Per-run settings for the benchmark.
#[derive(Debug, Clone, Default)]
pub struct BenchOptions {
    pub client: ClientOptions,
    /// Commands per pipeline batch; 0 sends the whole sequence at once
    pub batch_size: usize,
    /// DEL every key of the sequence before the timer starts
    pub reset_keys: bool,
    pub run_timeout: Option<Duration>,
}

/// Execute `sequence` against `endpoint` in `mode` and time it.
///
/// The timer covers the first send through the last receive; connecting and
/// key reset happen before it starts.
pub async fn run(
    endpoint: &Endpoint,
    sequence: &CommandSequence,
    mode: ExecutionMode,
    options: &BenchOptions,
) -> Result<BenchmarkResult, HarnessError> {
    bound_run(options.run_timeout, async {
        let mut client = Client::connect(endpoint, &options.client).await?;
        if options.reset_keys {
            reset_keys(&mut client, sequence).await?;
        }

        let descriptor = match (mode, options.batch_size) {
            (ExecutionMode::Pipelined, n) if n > 0 => format!("{mode} (batch {n})"),
            _ => mode.to_string(),
        };
        info!(
            endpoint = %endpoint,
            mode = %descriptor,
            commands = sequence.len(),
            "Running benchmark"
        );

        let start = Instant::now();
        let error_replies = match mode {
            ExecutionMode::Serial => run_serial(&mut client, sequence).await?,
            ExecutionMode::Pipelined => {
                run_pipelined(&mut client, sequence, options.batch_size).await?
            }
        };
        let elapsed = start.elapsed();
        client.close().await;

        let result = BenchmarkResult::new(descriptor, elapsed, sequence.len(), error_replies);
        info!(
            endpoint = %endpoint,
            mode = %result.descriptor(),
            elapsed_ms = elapsed.as_millis() as u64,
            error_replies,
            "Benchmark finished"
        );
        Ok::<_, HarnessError>(result)
    })
    .await
}

async fn run_serial(
    client: &mut Client,
    sequence: &CommandSequence,
) -> Result<usize, HarnessError> {
    let mut errors = 0;
    for (i, command) in sequence.iter().enumerate() {
        let reply = client.execute(command).await.map_err(|e| e.at_index(i))?;
        if reply.is_error() {
            errors += 1;
        }
    }
    Ok(errors)
}

async fn run_pipelined(
    client: &mut Client,
    sequence: &CommandSequence,
    batch_size: usize,
) -> Result<usize, HarnessError> {
    let batch = effective_batch(batch_size, sequence.len());
    let mut errors = 0;
    for (b, chunk) in sequence.as_slice().chunks(batch).enumerate() {
        let base = b * batch;
        for (j, command) in chunk.iter().enumerate() {
            client.send(command).await.map_err(|e| e.at_index(base + j))?;
        }
        trace!(batch = b, pending = client.pending(), "Batch sent");
        for j in 0..chunk.len() {
            let reply = client.recv().await.map_err(|e| e.at_index(base + j))?;
            if reply.is_error() {
                errors += 1;
            }
        }
        debug!(batch = b, commands = chunk.len(), "Batch complete");
    }
    Ok(errors)
}

/// Delete every key the sequence touches, in a single DEL.
pub(crate) async fn reset_keys(
    client: &mut Client,
    sequence: &CommandSequence,
) -> Result<(), HarnessError> {
    let keys = sequence.keys();
    if keys.is_empty() {
        return Ok(());
    }
    let reply = client.execute(&Command::del(&keys)).await?;
    debug!(endpoint = %client.endpoint(), keys = keys.len(), %reply, "Reset keys");
    Ok(())
}

/// Read the current value of each key on a fresh connection.
pub async fn final_values(
    endpoint: &Endpoint,
    keys: &[String],
    options: &ClientOptions,
) -> Result<Vec<(String, Reply)>, HarnessError> {
    let mut client = Client::connect(endpoint, options).await?;
    for key in keys {
        client.send(&Command::get(key)).await?;
    }
    let mut values = Vec::with_capacity(keys.len());
    for key in keys {
        values.push((key.clone(), client.recv().await?));
    }
    client.close().await;
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{generate, SequenceSpec};
    use crate::testing::{Flavor, MockServer};
    use bytes::Bytes;
    use tokio_test::assert_err;

    fn options() -> BenchOptions {
        BenchOptions {
            client: ClientOptions {
                connect_timeout: Duration::from_millis(500),
                command_timeout: Duration::from_secs(2),
                connect_retries: 0,
            },
            ..BenchOptions::default()
        }
    }

    fn sequence(steps: &[&str]) -> CommandSequence {
        generate(&SequenceSpec {
            key_prefix: None,
            steps: steps.iter().map(|s| s.parse().unwrap()).collect(),
        })
    }

    #[test]
    fn test_throughput() {
        let result = BenchmarkResult::new("serial".into(), Duration::from_secs(2), 1000, 0);
        assert_eq!(result.throughput(), Some(500.0));
    }

    #[test]
    fn test_throughput_not_measurable() {
        let empty = BenchmarkResult::new("serial".into(), Duration::from_millis(5), 0, 0);
        assert_eq!(empty.throughput(), None);

        let instant = BenchmarkResult::new("pipelined".into(), Duration::ZERO, 20_000, 0);
        assert_eq!(instant.throughput(), None);
    }

    #[test]
    fn test_effective_batch() {
        assert_eq!(effective_batch(0, 10), 10);
        assert_eq!(effective_batch(0, 0), 1);
        assert_eq!(effective_batch(3, 10), 3);
    }

    #[tokio::test]
    async fn test_serial_and_pipelined_return_key_to_start() {
        let seq = generate(&SequenceSpec::incr_then_decr("a", 500).unwrap());

        for mode in [ExecutionMode::Serial, ExecutionMode::Pipelined] {
            let server = MockServer::start(Flavor::Standard).await;
            let result = run(&server.endpoint(), &seq, mode, &options()).await.unwrap();

            assert_eq!(result.operations(), 1000);
            assert_eq!(result.error_replies(), 0);
            assert_eq!(server.value("a").as_deref(), Some("0"));

            let values = final_values(&server.endpoint(), &seq.keys(), &options().client)
                .await
                .unwrap();
            assert_eq!(values, vec![("a".to_string(), Reply::Bulk(Bytes::from_static(b"0")))]);
        }
    }

    #[tokio::test]
    async fn test_pipelined_batches_cover_whole_sequence() {
        let server = MockServer::start(Flavor::Standard).await;
        let seq = sequence(&["incr:n*25"]);
        let opts = BenchOptions {
            batch_size: 7,
            ..options()
        };

        let result = run(&server.endpoint(), &seq, ExecutionMode::Pipelined, &opts)
            .await
            .unwrap();
        assert_eq!(result.descriptor(), "pipelined (batch 7)");
        assert_eq!(server.value("n").as_deref(), Some("25"));
    }

    #[tokio::test]
    async fn test_reset_keys_before_run() {
        let server = MockServer::start(Flavor::Standard).await;
        server.seed("a", "41");
        let opts = BenchOptions {
            reset_keys: true,
            ..options()
        };

        run(&server.endpoint(), &sequence(&["incr:a"]), ExecutionMode::Serial, &opts)
            .await
            .unwrap();
        assert_eq!(server.value("a").as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_error_replies_are_counted() {
        let server = MockServer::start(Flavor::Standard).await;
        let seq = sequence(&["set:a:text", "incr:a*3"]);

        let result = run(&server.endpoint(), &seq, ExecutionMode::Pipelined, &options())
            .await
            .unwrap();
        assert_eq!(result.error_replies(), 3);
    }

    #[tokio::test]
    async fn test_empty_sequence() {
        let server = MockServer::start(Flavor::Standard).await;
        let seq = CommandSequence::from(Vec::new());

        for mode in [ExecutionMode::Serial, ExecutionMode::Pipelined] {
            let result = run(&server.endpoint(), &seq, mode, &options()).await.unwrap();
            assert_eq!(result.operations(), 0);
            assert_eq!(result.throughput(), None);
        }
    }

    #[tokio::test]
    async fn test_timeout_reports_command_index() {
        let server = MockServer::start(Flavor::Stalls).await;
        let mut opts = options();
        opts.client.command_timeout = Duration::from_millis(100);

        let err = assert_err!(
            run(&server.endpoint(), &sequence(&["get:a*3"]), ExecutionMode::Serial, &opts).await
        );
        assert!(matches!(err, HarnessError::Timeout { index: Some(0), .. }), "{err}");
    }

    #[tokio::test]
    async fn test_run_timeout() {
        let server = MockServer::start(Flavor::Stalls).await;
        let opts = BenchOptions {
            run_timeout: Some(Duration::from_millis(100)),
            ..options()
        };

        let err = assert_err!(
            run(&server.endpoint(), &sequence(&["get:a"]), ExecutionMode::Pipelined, &opts).await
        );
        assert!(matches!(err, HarnessError::RunTimeout { .. }), "{err}");
    }
}
