//! Configuration module for resp-harness.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values, which take
//! precedence over built-in defaults.

use crate::bench::{BenchOptions, ExecutionMode};
use crate::client::ClientOptions;
use crate::command::{SequenceSpec, Step};
use crate::compare::CompareOptions;
use crate::endpoint::Endpoint;
use clap::{Args, Parser, Subcommand};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the harness
#[derive(Parser, Debug)]
#[command(name = "resp-harness")]
#[command(author = "resp-harness authors")]
#[command(version = "0.1.0")]
#[command(
    about = "Benchmark and cross-check servers that speak the Redis protocol",
    long_about = None
)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: RunCommand,
}

#[derive(Subcommand, Debug)]
pub enum RunCommand {
    /// Time a command sequence against one endpoint
    Bench(BenchArgs),
    /// Replay a command sequence against several endpoints and compare replies
    Compare(CompareArgs),
}

#[derive(Args, Debug)]
pub struct BenchArgs {
    /// Endpoint to benchmark (host:port)
    #[arg(short, long)]
    pub endpoint: Option<String>,

    /// Execution mode; repeat to run several modes in order
    #[arg(short = 'x', long = "exec", value_enum)]
    pub exec: Vec<ExecutionMode>,

    #[command(flatten)]
    pub run: RunArgs,
}

#[derive(Args, Debug)]
pub struct CompareArgs {
    /// Endpoint to compare (host:port); give at least two, the first is the baseline
    #[arg(short, long = "endpoint")]
    pub endpoints: Vec<String>,

    /// Execution mode
    #[arg(short = 'x', long = "exec", value_enum)]
    pub exec: Option<ExecutionMode>,

    #[command(flatten)]
    pub run: RunArgs,
}

/// Options shared by both subcommands
#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Sequence step, e.g. `incr:a*10000`; repeat to append steps in order
    #[arg(short, long = "step")]
    pub steps: Vec<String>,

    /// Commands per pipeline batch (0 = whole sequence)
    #[arg(short, long)]
    pub batch: Option<usize>,

    /// Prefix prepended to every key of the sequence
    #[arg(long)]
    pub key_prefix: Option<String>,

    /// DEL the sequence's keys on every endpoint before running
    #[arg(long)]
    pub reset_keys: bool,

    /// Bound on each TCP connect attempt, in milliseconds
    #[arg(long)]
    pub connect_timeout_ms: Option<u64>,

    /// Bound on waiting for any single reply, in milliseconds
    #[arg(long)]
    pub command_timeout_ms: Option<u64>,

    /// Bound on the whole run, in seconds (0 = unbounded)
    #[arg(long)]
    pub run_timeout_secs: Option<u64>,

    /// Extra connect attempts after a failure
    #[arg(long)]
    pub connect_retries: Option<u32>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub benchmark: BenchmarkConfig,
    #[serde(default)]
    pub compare: CompareConfig,
    #[serde(default)]
    pub sequence: SequenceConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Connection-related configuration
#[derive(Debug, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    /// Bound on the whole run in seconds (0 or absent = unbounded)
    pub run_timeout_secs: Option<u64>,
    #[serde(default = "default_connect_retries")]
    pub connect_retries: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            command_timeout_ms: default_command_timeout_ms(),
            run_timeout_secs: None,
            connect_retries: default_connect_retries(),
        }
    }
}

/// Benchmark-related configuration
#[derive(Debug, Deserialize)]
pub struct BenchmarkConfig {
    pub endpoint: Option<String>,
    #[serde(default = "default_bench_exec")]
    pub exec: Vec<ExecutionMode>,
    #[serde(default)]
    pub batch: usize,
}

impl Default for BenchmarkConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            exec: default_bench_exec(),
            batch: 0,
        }
    }
}

/// Comparison-related configuration
#[derive(Debug, Deserialize)]
pub struct CompareConfig {
    #[serde(default)]
    pub endpoints: Vec<String>,
    #[serde(default = "default_compare_exec")]
    pub exec: ExecutionMode,
    #[serde(default)]
    pub batch: usize,
}

impl Default for CompareConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            exec: default_compare_exec(),
            batch: 0,
        }
    }
}

/// Command sequence configuration
#[derive(Debug, Deserialize, Default)]
pub struct SequenceConfig {
    pub key_prefix: Option<String>,
    #[serde(default)]
    pub reset_keys: bool,
    #[serde(default)]
    pub steps: Vec<StepConfig>,
}

/// One `[[sequence.steps]]` table
#[derive(Debug, Deserialize)]
pub struct StepConfig {
    pub op: String,
    pub key: Option<String>,
    pub arg: Option<String>,
    #[serde(default = "default_count")]
    pub count: usize,
}

impl StepConfig {
    fn to_step(&self) -> Result<Step, String> {
        Step::new(self.op.parse()?, self.key.clone(), self.arg.clone(), self.count)
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_connect_timeout_ms() -> u64 {
    2000
}

fn default_command_timeout_ms() -> u64 {
    5000
}

fn default_connect_retries() -> u32 {
    2
}

fn default_bench_exec() -> Vec<ExecutionMode> {
    vec![ExecutionMode::Serial, ExecutionMode::Pipelined]
}

fn default_compare_exec() -> ExecutionMode {
    ExecutionMode::Serial
}

fn default_count() -> usize {
    1
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_bench_endpoint() -> Endpoint {
    Endpoint::new("127.0.0.1", crate::endpoint::DEFAULT_PORT)
}

/// Iterations per step of the built-in sequence.
const DEFAULT_SEQUENCE_COUNT: usize = 10_000;

/// What to run, fully resolved
#[derive(Debug, Clone)]
pub enum RunConfig {
    Bench {
        endpoint: Endpoint,
        modes: Vec<ExecutionMode>,
        options: BenchOptions,
    },
    Compare {
        endpoints: Vec<Endpoint>,
        options: CompareOptions,
    },
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub sequence: SequenceSpec,
    pub run: RunConfig,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::resolve(cli, toml_config)
    }

    /// Merge CLI args with TOML config (CLI takes precedence)
    pub fn resolve(cli: CliArgs, file: TomlConfig) -> Result<Self, ConfigError> {
        let log_level = cli.log_level.unwrap_or(file.logging.level);

        let (run_args, run) = match cli.command {
            RunCommand::Bench(args) => {
                let endpoint = match args.endpoint.or(file.benchmark.endpoint) {
                    Some(s) => parse_endpoint(&s)?,
                    None => default_bench_endpoint(),
                };
                let modes = if args.exec.is_empty() {
                    file.benchmark.exec
                } else {
                    args.exec
                };
                if modes.is_empty() {
                    return Err(ConfigError::Invalid(
                        "benchmark needs at least one execution mode".to_string(),
                    ));
                }
                let options = BenchOptions {
                    client: client_options(&args.run, &file.client),
                    batch_size: args.run.batch.unwrap_or(file.benchmark.batch),
                    reset_keys: args.run.reset_keys || file.sequence.reset_keys,
                    run_timeout: run_timeout(&args.run, &file.client),
                };
                let run = RunConfig::Bench {
                    endpoint,
                    modes,
                    options,
                };
                (args.run, run)
            }
            RunCommand::Compare(args) => {
                let raw = if args.endpoints.is_empty() {
                    file.compare.endpoints
                } else {
                    args.endpoints
                };
                let endpoints = raw
                    .iter()
                    .map(|s| parse_endpoint(s))
                    .collect::<Result<Vec<_>, _>>()?;
                if endpoints.len() < 2 {
                    return Err(ConfigError::Invalid(format!(
                        "compare needs at least two endpoints, got {}",
                        endpoints.len()
                    )));
                }
                let options = CompareOptions {
                    client: client_options(&args.run, &file.client),
                    mode: args.exec.unwrap_or(file.compare.exec),
                    batch_size: args.run.batch.unwrap_or(file.compare.batch),
                    reset_keys: args.run.reset_keys || file.sequence.reset_keys,
                    run_timeout: run_timeout(&args.run, &file.client),
                };
                let run = RunConfig::Compare { endpoints, options };
                (args.run, run)
            }
        };

        let sequence = sequence_spec(&run_args, &file.sequence)?;

        Ok(Config {
            log_level,
            sequence,
            run,
        })
    }
}

fn parse_endpoint(s: &str) -> Result<Endpoint, ConfigError> {
    s.parse()
        .map_err(|e| ConfigError::Invalid(format!("invalid endpoint: {e}")))
}

fn client_options(args: &RunArgs, file: &ClientConfig) -> ClientOptions {
    ClientOptions {
        connect_timeout: Duration::from_millis(
            args.connect_timeout_ms.unwrap_or(file.connect_timeout_ms),
        ),
        command_timeout: Duration::from_millis(
            args.command_timeout_ms.unwrap_or(file.command_timeout_ms),
        ),
        connect_retries: args.connect_retries.unwrap_or(file.connect_retries),
    }
}

fn run_timeout(args: &RunArgs, file: &ClientConfig) -> Option<Duration> {
    args.run_timeout_secs
        .or(file.run_timeout_secs)
        .filter(|&secs| secs > 0)
        .map(Duration::from_secs)
}

fn sequence_spec(args: &RunArgs, file: &SequenceConfig) -> Result<SequenceSpec, ConfigError> {
    let key_prefix = args.key_prefix.clone().or_else(|| file.key_prefix.clone());

    let steps = if !args.steps.is_empty() {
        args.steps
            .iter()
            .map(|s| s.parse::<Step>())
            .collect::<Result<Vec<_>, _>>()
    } else if !file.steps.is_empty() {
        file.steps.iter().map(StepConfig::to_step).collect()
    } else {
        SequenceSpec::incr_then_decr("a", DEFAULT_SEQUENCE_COUNT).map(|spec| spec.steps)
    }
    .map_err(|e| ConfigError::Invalid(format!("invalid sequence step: {e}")))?;

    let spec = SequenceSpec { key_prefix, steps };
    spec.total_commands().map_err(ConfigError::Invalid)?;
    Ok(spec)
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> CliArgs {
        CliArgs::try_parse_from(std::iter::once("resp-harness").chain(args.iter().copied()))
            .unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.client.connect_timeout_ms, 2000);
        assert_eq!(config.client.command_timeout_ms, 5000);
        assert_eq!(config.client.connect_retries, 2);
        assert_eq!(
            config.benchmark.exec,
            [ExecutionMode::Serial, ExecutionMode::Pipelined]
        );
        assert_eq!(config.compare.exec, ExecutionMode::Serial);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [client]
            connect_timeout_ms = 250
            run_timeout_secs = 60

            [benchmark]
            endpoint = "127.0.0.1:6380"
            exec = ["pipelined"]
            batch = 100

            [compare]
            endpoints = ["redis:6379", "rustdss:6379"]
            exec = "pipelined"

            [sequence]
            key_prefix = "ci:"
            reset_keys = true

            [[sequence.steps]]
            op = "incr"
            key = "a"
            count = 100000

            [[sequence.steps]]
            op = "decr"
            key = "a"
            count = 100000

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.client.connect_timeout_ms, 250);
        assert_eq!(config.client.command_timeout_ms, 5000);
        assert_eq!(config.client.run_timeout_secs, Some(60));
        assert_eq!(config.benchmark.exec, [ExecutionMode::Pipelined]);
        assert_eq!(config.benchmark.batch, 100);
        assert_eq!(config.compare.endpoints.len(), 2);
        assert_eq!(config.compare.exec, ExecutionMode::Pipelined);
        assert_eq!(config.sequence.steps.len(), 2);
        assert_eq!(config.sequence.steps[1].count, 100000);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_bench_defaults() {
        let config = Config::resolve(cli(&["bench"]), TomlConfig::default()).unwrap();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.sequence.describe(), "incr:a*10000, decr:a*10000");
        match config.run {
            RunConfig::Bench {
                endpoint,
                modes,
                options,
            } => {
                assert_eq!(endpoint.to_string(), "127.0.0.1:6379");
                assert_eq!(modes, [ExecutionMode::Serial, ExecutionMode::Pipelined]);
                assert_eq!(options.batch_size, 0);
                assert_eq!(options.run_timeout, None);
                assert_eq!(options.client, ClientOptions::default());
            }
            other => panic!("expected bench, got {other:?}"),
        }
    }

    #[test]
    fn test_cli_overrides_file() {
        let file: TomlConfig = toml::from_str(
            r#"
            [client]
            command_timeout_ms = 9000

            [compare]
            endpoints = ["a:1", "b:2"]
            batch = 50

            [[sequence.steps]]
            op = "get"
            key = "x"

            [logging]
            level = "warn"
            "#,
        )
        .unwrap();
        let args = cli(&[
            "--log-level",
            "trace",
            "compare",
            "-e",
            "c:3",
            "-e",
            "d:4",
            "-e",
            "e:5",
            "--exec",
            "pipelined",
            "--step",
            "incrby:k:2*5",
            "--command-timeout-ms",
            "100",
        ]);

        let config = Config::resolve(args, file).unwrap();
        assert_eq!(config.log_level, "trace");
        assert_eq!(config.sequence.describe(), "incrby:k:2*5");
        match config.run {
            RunConfig::Compare { endpoints, options } => {
                assert_eq!(endpoints.len(), 3);
                assert_eq!(endpoints[0].to_string(), "c:3");
                assert_eq!(options.mode, ExecutionMode::Pipelined);
                assert_eq!(options.batch_size, 50);
                assert_eq!(options.client.command_timeout, Duration::from_millis(100));
            }
            other => panic!("expected compare, got {other:?}"),
        }
    }

    #[test]
    fn test_file_sequence_used_without_cli_steps() {
        let file: TomlConfig = toml::from_str(
            r#"
            [sequence]
            key_prefix = "run1:"

            [[sequence.steps]]
            op = "set"
            key = "k"
            arg = "v"
            "#,
        )
        .unwrap();
        let config = Config::resolve(cli(&["bench", "-e", "localhost"]), file).unwrap();
        assert_eq!(config.sequence.describe(), "[run1:] set:k:v");
    }

    #[test]
    fn test_invalid_configs() {
        let err = Config::resolve(cli(&["compare", "-e", "a:1"]), TomlConfig::default());
        assert!(matches!(err, Err(ConfigError::Invalid(_))));

        let err = Config::resolve(
            cli(&["bench", "-e", "host:port"]),
            TomlConfig::default(),
        );
        assert!(matches!(err, Err(ConfigError::Invalid(_))));

        let err = Config::resolve(cli(&["bench", "-s", "incr"]), TomlConfig::default());
        assert!(matches!(err, Err(ConfigError::Invalid(_))));

        let half = format!("incr:a*{}", crate::command::MAX_SEQUENCE_LEN / 2 + 1);
        let args = cli(&["bench", "-s", half.as_str(), "-s", half.as_str()]);
        let err = Config::resolve(args, TomlConfig::default());
        assert!(matches!(err, Err(ConfigError::Invalid(_))));

        let huge = format!("incr:a*{}", usize::MAX);
        let err = Config::resolve(cli(&["bench", "-s", huge.as_str()]), TomlConfig::default());
        assert!(matches!(err, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_zero_run_timeout_is_unbounded() {
        let config = Config::resolve(
            cli(&["bench", "--run-timeout-secs", "0"]),
            TomlConfig::default(),
        )
        .unwrap();
        match config.run {
            RunConfig::Bench { options, .. } => assert_eq!(options.run_timeout, None),
            other => panic!("expected bench, got {other:?}"),
        }
    }
}
