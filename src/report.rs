//! Human-readable output for benchmark and comparison runs.
//!
//! Formatting lives in free functions so it can be checked without I/O;
//! `ReportSink` only stamps a header and writes the lines out.

use crate::bench::BenchmarkResult;
use crate::command::SequenceSpec;
use crate::compare::ComparisonOutcome;
use crate::endpoint::Endpoint;
use crate::error::HarnessError;
use crate::protocols::resp::Reply;
use chrono::{SecondsFormat, Utc};
use std::io::{self, Write};

/// One line per benchmark run.
pub fn format_benchmark(result: &BenchmarkResult) -> String {
    let mut line = format!(
        "{}: {} commands in {:.6} seconds",
        result.descriptor(),
        result.operations(),
        result.elapsed().as_secs_f64()
    );
    match result.throughput() {
        Some(ops) => line.push_str(&format!(" ({ops:.0} ops/sec)")),
        None => line.push_str(" (elapsed too small to measure throughput)"),
    }
    if result.error_replies() > 0 {
        line.push_str(&format!(", {} error replies", result.error_replies()));
    }
    line
}

pub fn format_final_values(values: &[(String, Reply)]) -> Vec<String> {
    values
        .iter()
        .map(|(key, reply)| format!("{key} = {reply}"))
        .collect()
}

/// "agreed", or the full divergence: index, command and both replies.
pub fn format_comparison(outcome: &ComparisonOutcome) -> Vec<String> {
    match outcome {
        ComparisonOutcome::Agreed { commands } => {
            vec![format!("agreed: {commands} commands, all replies identical")]
        }
        ComparisonOutcome::Diverged(report) => {
            let (base_ep, base_reply) = &report.baseline;
            let (div_ep, div_reply) = &report.divergent;
            vec![
                format!("diverged at command #{}: {}", report.index, report.command),
                format!("  {base_ep}: {base_reply} [{}]", base_reply.kind()),
                format!("  {div_ep}: {div_reply} [{}]", div_reply.kind()),
            ]
        }
    }
}

pub fn format_failure(err: &HarnessError) -> String {
    format!("error: {err}")
}

/// Writes report lines to an output channel.
pub struct ReportSink<W: Write> {
    out: W,
}

impl ReportSink<io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write> ReportSink<W> {
    pub fn new(out: W) -> Self {
        ReportSink { out }
    }

    /// Timestamped header naming the run, its endpoints and the sequence.
    pub fn header(
        &mut self,
        run: &str,
        endpoints: &[Endpoint],
        spec: &SequenceSpec,
        commands: usize,
    ) -> io::Result<()> {
        let endpoints: Vec<String> = endpoints.iter().map(ToString::to_string).collect();
        writeln!(
            self.out,
            "# {run} {} against {}",
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            endpoints.join(", ")
        )?;
        writeln!(self.out, "# sequence: {} ({commands} commands)", spec.describe())
    }

    pub fn benchmark(&mut self, result: &BenchmarkResult) -> io::Result<()> {
        writeln!(self.out, "{}", format_benchmark(result))?;
        self.out.flush()
    }

    pub fn final_values(&mut self, values: &[(String, Reply)]) -> io::Result<()> {
        self.lines(format_final_values(values))
    }

    pub fn comparison(&mut self, outcome: &ComparisonOutcome) -> io::Result<()> {
        self.lines(format_comparison(outcome))
    }

    pub fn failure(&mut self, err: &HarnessError) -> io::Result<()> {
        self.lines(vec![format_failure(err)])
    }

    fn lines(&mut self, lines: Vec<String>) -> io::Result<()> {
        for line in lines {
            writeln!(self.out, "{line}")?;
        }
        self.out.flush()
    }

    #[cfg(test)]
    pub(crate) fn into_inner(self) -> W {
        self.out
    }
}
