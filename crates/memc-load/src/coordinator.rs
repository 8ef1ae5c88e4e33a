//! Run coordinator
//!
//! Feeds matching files into a bounded queue shared by a pool of
//! [`FileLoader`] workers and renames each file once its report comes back.

use crate::config::{ErrorPolicy, LoaderConfig};
use crate::destination::Destinations;
use crate::error::{LoadError, Result};
use crate::loader::FileLoader;
use crate::record::{FileReport, RunSummary};
use glob::MatchOptions;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type FileQueue = Arc<Mutex<mpsc::Receiver<PathBuf>>>;

/// List the files matching `pattern` in lexicographic order
///
/// Dot-prefixed files are not matched by wildcards, so files renamed by a
/// previous run are skipped.
pub fn discover_files(pattern: &str) -> Result<Vec<PathBuf>> {
    let options = MatchOptions {
        require_literal_leading_dot: true,
        ..MatchOptions::new()
    };

    let entries = glob::glob_with(pattern, options).map_err(|source| LoadError::Pattern {
        pattern: pattern.to_string(),
        source,
    })?;

    let mut files = Vec::new();
    for entry in entries {
        match entry {
            Ok(path) if path.is_file() => files.push(path),
            Ok(path) => debug!("Skipping non-file match {}", path.display()),
            Err(e) => warn!("Skipping unreadable path {}: {}", e.path().display(), e.error()),
        }
    }

    files.sort();
    Ok(files)
}

/// `dir/name` -> `dir/.name`
pub fn dot_path(path: &Path) -> Option<PathBuf> {
    let name = path.file_name()?;
    let mut dotted = OsString::from(".");
    dotted.push(name);
    Some(path.with_file_name(dotted))
}

/// Hide a processed file from later runs
pub async fn dot_rename(path: &Path) -> Result<PathBuf> {
    let target = dot_path(path).ok_or_else(|| {
        LoadError::io(
            path,
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no file name"),
        )
    })?;

    tokio::fs::rename(path, &target)
        .await
        .map_err(|e| LoadError::io(path, e))?;

    Ok(target)
}

pub struct LoadCoordinator {
    config: Arc<LoaderConfig>,
    destinations: Arc<Destinations>,
    cancel: CancellationToken,
}

impl LoadCoordinator {
    pub fn new(config: LoaderConfig, destinations: Destinations) -> Self {
        Self {
            config: Arc::new(config),
            destinations: Arc::new(destinations),
            cancel: CancellationToken::new(),
        }
    }

    /// Token that stops the run when cancelled
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Load every matching file and rename it once its report arrives
    pub async fn run(&self) -> Result<RunSummary> {
        let files = discover_files(&self.config.pattern)?;
        let expected = files.len();
        if expected == 0 {
            info!("No files match {}", self.config.pattern);
            return Ok(RunSummary::default());
        }

        let workers = self.config.workers.min(expected);
        info!(
            files = expected,
            workers,
            dry_run = self.config.dry_run,
            "Starting load of {}",
            self.config.pattern
        );

        let (file_tx, file_rx) = mpsc::channel(self.config.buffer);
        let file_rx: FileQueue = Arc::new(Mutex::new(file_rx));
        let (report_tx, mut report_rx) = mpsc::channel(self.config.buffer);
        let mut tasks = JoinSet::new();

        let cancel = self.cancel.clone();
        tasks.spawn(async move {
            for path in files {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    sent = file_tx.send(path) => if sent.is_err() { break },
                }
            }
            Ok::<_, LoadError>(())
        });

        for id in 0..workers {
            let loader = FileLoader::start(
                id,
                self.config.clone(),
                self.destinations.clone(),
                self.cancel.clone(),
            );
            tasks.spawn(file_worker(
                loader,
                file_rx.clone(),
                report_tx.clone(),
                self.cancel.clone(),
            ));
        }
        drop(report_tx);

        let mut summary = RunSummary::default();
        let mut failure = None;
        let mut seen = 0;

        while seen < expected {
            let report = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                report = report_rx.recv() => report,
            };
            let Some(report) = report else {
                break;
            };
            seen += 1;

            let report = match report {
                Ok(report) => report,
                Err(e) => {
                    failure = Some(e);
                    break;
                },
            };

            summary.record(&report);
            if let Err(e) = self.finish_file(&report).await {
                if self.config.error_policy == ErrorPolicy::Abort {
                    failure = Some(e);
                    break;
                }
                error!("{}", e);
                summary.rename_failures += 1;
            }
        }

        if failure.is_some() || seen < expected {
            self.cancel.cancel();
        }
        drop(report_rx);

        while let Some(joined) = tasks.join_next().await {
            let result = joined.map_err(|e| LoadError::Worker(e.to_string())).and_then(|r| r);
            if let Err(e) = result {
                if !matches!(e, LoadError::Cancelled) {
                    error!("{}", e);
                }
                failure.get_or_insert(e);
            }
        }

        if let Some(e) = failure {
            return Err(e);
        }
        if seen < expected {
            return Err(LoadError::Cancelled);
        }

        info!(
            files = summary.files,
            accepted = summary.accepted,
            rejected_error_rate = summary.rejected_error_rate,
            rejected_no_records = summary.rejected_no_records,
            io_failures = summary.io_failures,
            rename_failures = summary.rename_failures,
            processed = summary.processed,
            errors = summary.errors,
            "Load finished"
        );

        Ok(summary)
    }

    async fn finish_file(&self, report: &FileReport) -> Result<()> {
        let target = dot_rename(&report.path).await?;
        debug!(
            outcome = %report.outcome,
            "Renamed {} to {}",
            report.path.display(),
            target.display()
        );
        Ok(())
    }
}

/// Pull files off the shared queue until it is empty or the run stops
async fn file_worker(
    mut loader: FileLoader,
    files: FileQueue,
    reports: mpsc::Sender<Result<FileReport>>,
    cancel: CancellationToken,
) -> Result<()> {
    loop {
        let next = {
            let mut files = files.lock().await;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                path = files.recv() => path,
            }
        };
        let Some(path) = next else {
            break;
        };

        let result = loader.load(&path).await;
        let stop = result.is_err();
        if reports.send(result).await.is_err() || stop {
            break;
        }
    }

    loader.shutdown().await
}
