//! resp-harness: differential compatibility and performance harness for
//! servers speaking the Redis RESP protocol
//!
//! Two run kinds:
//! - `bench`: time a command sequence against one endpoint, serially and
//!   pipelined, and report throughput
//! - `compare`: replay the same sequence against several endpoints and report
//!   the first reply that differs
//!
//! Exit status follows diff(1): 0 when the run completed (and endpoints
//! agreed), 1 when endpoints diverged, 2 when the harness itself failed.

mod bench;
mod client;
mod command;
mod compare;
mod config;
mod endpoint;
mod error;
mod protocols;
mod report;
#[cfg(test)]
mod testing;

use config::{Config, RunConfig};
use error::HarnessError;
use report::ReportSink;
use std::io::Write;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const EXIT_DIVERGED: u8 = 1;
const EXIT_FAILURE: u8 = 2;

/// How a run that did not fail ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunStatus {
    Completed,
    Diverged,
}

fn main() -> ExitCode {
    // Load configuration
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(EXIT_FAILURE);
        }
    };

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    info!(
        sequence = %config.sequence.describe(),
        run = ?config.run,
        "Starting resp-harness"
    );

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "Failed to build tokio runtime");
            return ExitCode::from(EXIT_FAILURE);
        }
    };

    let mut sink = ReportSink::stdout();
    match runtime.block_on(run(config, &mut sink)) {
        Ok(RunStatus::Completed) => ExitCode::SUCCESS,
        Ok(RunStatus::Diverged) => ExitCode::from(EXIT_DIVERGED),
        Err(e) => {
            error!(error = %e, index = ?e.index(), "Run failed");
            if let Err(write_err) = sink.failure(&e) {
                error!(error = %write_err, "Failed to write report");
            }
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

async fn run<W: Write>(
    config: Config,
    sink: &mut ReportSink<W>,
) -> Result<RunStatus, HarnessError> {
    let sequence = command::generate(&config.sequence);
    if sequence.is_empty() {
        warn!("Command sequence is empty");
    }

    match config.run {
        RunConfig::Bench {
            endpoint,
            modes,
            options,
        } => {
            sink.header(
                "benchmark",
                std::slice::from_ref(&endpoint),
                &config.sequence,
                sequence.len(),
            )
            .map_err(HarnessError::Output)?;

            for mode in modes {
                let result = bench::run(&endpoint, &sequence, mode, &options).await?;
                sink.benchmark(&result).map_err(HarnessError::Output)?;
            }

            let values = bench::final_values(&endpoint, &sequence.keys(), &options.client).await?;
            sink.final_values(&values).map_err(HarnessError::Output)?;
            Ok(RunStatus::Completed)
        }
        RunConfig::Compare { endpoints, options } => {
            sink.header("compare", &endpoints, &config.sequence, sequence.len())
                .map_err(HarnessError::Output)?;

            let outcome = compare::compare(&endpoints, Arc::new(sequence), &options).await?;
            sink.comparison(&outcome).map_err(HarnessError::Output)?;
            Ok(match outcome {
                compare::ComparisonOutcome::Agreed { .. } => RunStatus::Completed,
                compare::ComparisonOutcome::Diverged(_) => RunStatus::Diverged,
            })
        }
    }
}
