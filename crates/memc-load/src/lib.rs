//! memc-load Library
//!
//! Loads gzip-compressed installed-apps logs into memcached, one key space
//! per device type.
//!
//! # Pipeline
//!
//! - **Coordinator**: finds input files, hands them to file loaders and
//!   dot-renames each file once it has been reported
//! - **File Loader**: streams one file at a time, parses lines and routes
//!   records to per-destination queues
//! - **Destination Writer**: writes records to one memcached server with
//!   retry and reports a tally at the end of every file
//!
//! # Example
//!
//! ```no_run
//! use memc_load::{Destinations, LoadCoordinator, LoaderConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = LoaderConfig::default();
//!     config.validate()?;
//!
//!     let destinations = Destinations::connect(&config);
//!     let summary = LoadCoordinator::new(config, destinations).run().await?;
//!     println!("{} files loaded", summary.accepted);
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod config;
pub mod coordinator;
pub mod decompression;
pub mod destination;
pub mod error;
pub mod loader;
pub mod parser;
pub mod record;
pub mod retry;
pub mod selftest;
pub mod store;
pub mod writer;

// Re-export commonly used types
pub use config::{ErrorPolicy, LoaderConfig};
pub use coordinator::LoadCoordinator;
pub use destination::Destinations;
pub use error::{LoadError, Result};
pub use record::{FileOutcome, FileReport, RunSummary};

use clap::Parser;
use config::{
    default_workers, DEFAULT_ADID_ADDR, DEFAULT_ATTEMPTS, DEFAULT_BUFFER, DEFAULT_DVID_ADDR,
    DEFAULT_ERROR_THRESHOLD, DEFAULT_GAID_ADDR, DEFAULT_IDFA_ADDR, DEFAULT_PATTERN,
    DEFAULT_RETRY_BACKOFF_MS, DEFAULT_STORE_TIMEOUT_MS,
};
use memc_common::logging::{LogConfig, LogFormat, LogLevel, LogOutput};
use retry::RetryPolicy;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Load installed-apps logs into memcached
#[derive(Parser, Debug)]
#[command(name = "memc-load")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Round-trip the built-in sample lines through the codec and exit
    #[arg(short = 't', long = "test")]
    pub self_test: bool,

    /// Write logs to this file instead of the console
    #[arg(short, long, env = "MEMC_LOG")]
    pub log: Option<PathBuf>,

    /// Log format
    #[arg(long, env = "MEMC_LOG_FORMAT", default_value = "text")]
    pub log_format: LogFormat,

    /// Log records instead of writing them to memcached
    ///
    /// Record lines are logged at debug level and stay visible even when
    /// LOG_LEVEL asks for less.
    #[arg(long, env = "MEMC_DRY")]
    pub dry: bool,

    /// Glob pattern selecting the input files
    #[arg(long, env = "MEMC_PATTERN", default_value = DEFAULT_PATTERN)]
    pub pattern: String,

    /// Memcached address for idfa devices
    #[arg(long, env = "MEMC_IDFA", default_value = DEFAULT_IDFA_ADDR)]
    pub idfa: String,

    /// Memcached address for gaid devices
    #[arg(long, env = "MEMC_GAID", default_value = DEFAULT_GAID_ADDR)]
    pub gaid: String,

    /// Memcached address for adid devices
    #[arg(long, env = "MEMC_ADID", default_value = DEFAULT_ADID_ADDR)]
    pub adid: String,

    /// Memcached address for dvid devices
    #[arg(long, env = "MEMC_DVID", default_value = DEFAULT_DVID_ADDR)]
    pub dvid: String,

    /// Files loaded concurrently (defaults to available CPUs + 1)
    #[arg(short, long, env = "MEMC_WORKERS")]
    pub workers: Option<usize>,

    /// Write attempts per record
    #[arg(short, long, env = "MEMC_ATTEMPTS", default_value_t = DEFAULT_ATTEMPTS)]
    pub attempts: u32,

    /// Capacity of every bounded queue
    #[arg(long, env = "MEMC_BUFFER", default_value_t = DEFAULT_BUFFER)]
    pub buffer: usize,

    /// Delay between write attempts in milliseconds
    #[arg(long, env = "MEMC_RETRY_BACKOFF_MS", default_value_t = DEFAULT_RETRY_BACKOFF_MS)]
    pub retry_backoff_ms: u64,

    /// Connect and write timeout for memcached in milliseconds
    #[arg(long, env = "MEMC_TIMEOUT_MS", default_value_t = DEFAULT_STORE_TIMEOUT_MS)]
    pub timeout_ms: u64,

    /// Error rate at or above which a file is rejected
    #[arg(long, env = "MEMC_ERROR_THRESHOLD", default_value_t = DEFAULT_ERROR_THRESHOLD)]
    pub error_threshold: f64,

    /// What to do when a file fails
    #[arg(long, env = "MEMC_ERROR_POLICY", value_enum, default_value_t = ErrorPolicy::Continue)]
    pub error_policy: ErrorPolicy,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,
}

impl Cli {
    /// Loader settings from the parsed flags; call [`LoaderConfig::validate`] before use
    pub fn loader_config(&self) -> LoaderConfig {
        let destinations: BTreeMap<String, String> = [
            ("idfa", &self.idfa),
            ("gaid", &self.gaid),
            ("adid", &self.adid),
            ("dvid", &self.dvid),
        ]
        .into_iter()
        .map(|(device_type, addr)| (device_type.to_string(), addr.clone()))
        .collect();

        LoaderConfig {
            pattern: self.pattern.clone(),
            destinations,
            dry_run: self.dry,
            workers: self.workers.unwrap_or_else(default_workers),
            buffer: self.buffer,
            retry: RetryPolicy::new(self.attempts, Duration::from_millis(self.retry_backoff_ms)),
            store_timeout: Duration::from_millis(self.timeout_ms),
            error_threshold: self.error_threshold,
            error_policy: self.error_policy,
        }
    }

    /// Logging settings before environment overrides
    ///
    /// `--log` switches output to the given file. Dry runs log at debug level
    /// so that every record shows up.
    pub fn log_config(&self) -> LogConfig {
        let level = if self.dry || self.verbose {
            LogLevel::Debug
        } else {
            LogLevel::Info
        };

        let mut builder = LogConfig::builder().level(level).format(self.log_format);
        if let Some(path) = &self.log {
            builder = builder.output(LogOutput::File).log_file(path.clone());
        }

        builder.build()
    }

    /// Keep dry-run record lines visible after environment overrides
    pub fn enforce_dry_run_logging(&self, mut config: LogConfig) -> LogConfig {
        if self.dry {
            config.filter_directives = Some(match config.filter_directives.take() {
                Some(existing) if !existing.trim().is_empty() => {
                    format!("{},{}", existing, DRY_RUN_DIRECTIVE)
                },
                _ => DRY_RUN_DIRECTIVE.to_string(),
            });
        }
        config
    }
}

const DRY_RUN_DIRECTIVE: &str = "memc_load::writer=debug";

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::try_parse_from(["memc-load"]).unwrap();
        assert!(!cli.self_test);
        assert!(!cli.dry);

        let config = cli.loader_config();
        config.validate().unwrap();
        assert_eq!(config.pattern, DEFAULT_PATTERN);
        assert_eq!(config.destinations["gaid"], DEFAULT_GAID_ADDR);
        assert_eq!(config.retry, RetryPolicy::default());
        assert_eq!(config.error_policy, ErrorPolicy::Continue);

        let log = cli.log_config();
        assert_eq!(log.level, LogLevel::Info);
        assert_eq!(log.output, LogOutput::Console);
    }

    #[test]
    fn test_dry_run_keeps_record_logging() {
        let quiet = LogConfig::builder().level(LogLevel::Warn).build();

        let cli = Cli::try_parse_from(["memc-load", "--dry"]).unwrap();
        let config = cli.enforce_dry_run_logging(quiet.clone());
        assert_eq!(config.level, LogLevel::Warn);
        assert_eq!(
            config.filter_directives.as_deref(),
            Some("memc_load::writer=debug")
        );

        let filtered = LogConfig::builder()
            .filter_directives("tokio=warn")
            .build();
        let config = cli.enforce_dry_run_logging(filtered);
        assert_eq!(
            config.filter_directives.as_deref(),
            Some("tokio=warn,memc_load::writer=debug")
        );

        let cli = Cli::try_parse_from(["memc-load"]).unwrap();
        assert_eq!(cli.enforce_dry_run_logging(quiet).filter_directives, None);
    }

    #[test]
    fn test_cli_overrides() {
        let cli = Cli::try_parse_from([
            "memc-load",
            "--dry",
            "--pattern",
            "/tmp/in/*.tsv.gz",
            "--idfa",
            "10.0.0.1:11211",
            "-w",
            "3",
            "--attempts",
            "5",
            "--retry-backoff-ms",
            "10",
            "--error-policy",
            "abort",
            "--log",
            "/tmp/memc.log",
            "--log-format",
            "json",
        ])
        .unwrap();

        let config = cli.loader_config();
        assert!(config.dry_run);
        assert_eq!(config.pattern, "/tmp/in/*.tsv.gz");
        assert_eq!(config.destinations["idfa"], "10.0.0.1:11211");
        assert_eq!(config.workers, 3);
        assert_eq!(config.retry, RetryPolicy::new(5, Duration::from_millis(10)));
        assert_eq!(config.error_policy, ErrorPolicy::Abort);

        let log = cli.log_config();
        assert_eq!(log.level, LogLevel::Debug);
        assert_eq!(log.output, LogOutput::File);
        assert_eq!(log.format, LogFormat::Json);
        assert_eq!(log.log_file, PathBuf::from("/tmp/memc.log"));
    }

    #[test]
    fn test_cli_self_test_short_flag() {
        let cli = Cli::try_parse_from(["memc-load", "-t"]).unwrap();
        assert!(cli.self_test);
    }

    #[test]
    fn test_cli_rejects_unknown_policy() {
        assert!(Cli::try_parse_from(["memc-load", "--error-policy", "ignore"]).is_err());
    }
}
