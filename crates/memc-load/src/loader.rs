//! File loader: one input file at a time through a fixed set of writers
//!
//! A loader goes through the same steps for every file:
//!
//! 1. **Opening**: open and validate the gzip stream. Failure produces an
//!    I/O failure report without touching the writers.
//! 2. **Streaming**: on the blocking pool, read lines, parse them and route
//!    records to the destination queues. Full queues block the reader.
//! 3. **Draining**: send [`Job::EndOfBatch`] to every queue and collect
//!    exactly one tally per destination.
//! 4. **Evaluating**: combine local and writer counters and apply the
//!    error-rate gate.

use crate::config::{ErrorPolicy, LoaderConfig};
use crate::decompression::GzipLines;
use crate::destination::Destinations;
use crate::error::{LoadError, Result};
use crate::parser::parse_apps_installed;
use crate::record::{BatchTally, FileOutcome, FileReport, Job};
use crate::writer::DestinationWriter;
use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Counters gathered while streaming a file
#[derive(Debug, Default)]
struct StreamStats {
    /// Non-blank lines, including the ones that failed
    lines: u64,
    parse_errors: u64,
    unknown_devices: u64,
    /// Set when the abort policy stopped the stream on an unknown device type
    fatal_device_type: Option<String>,
    /// Set when decompression failed part way through
    read_error: Option<String>,
    /// Set when the queues closed under us
    interrupted: bool,
}

impl StreamStats {
    fn local_errors(&self) -> u64 {
        self.parse_errors + self.unknown_devices
    }
}

type Queues = BTreeMap<String, mpsc::Sender<Job>>;

pub struct FileLoader {
    id: usize,
    config: Arc<LoaderConfig>,
    queues: Queues,
    tallies: mpsc::Receiver<BatchTally>,
    writers: JoinSet<()>,
    cancel: CancellationToken,
}

impl FileLoader {
    /// Spawn one writer per destination
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        id: usize,
        config: Arc<LoaderConfig>,
        destinations: Arc<Destinations>,
        cancel: CancellationToken,
    ) -> Self {
        // Sized so that every writer can report without waiting on the loader.
        let (tally_tx, tallies) = mpsc::channel(destinations.len().max(1));
        let mut writers = JoinSet::new();
        let mut queues = Queues::new();

        for destination in destinations.iter() {
            let (tx, rx) = mpsc::channel(config.buffer);
            let writer = DestinationWriter::new(destination.clone(), &config, cancel.clone());
            writers.spawn(writer.run(rx, tally_tx.clone()));
            queues.insert(destination.device_type.clone(), tx);
        }

        Self {
            id,
            config,
            queues,
            tallies,
            writers,
            cancel,
        }
    }

    /// Load one file and report how it went
    ///
    /// Returns `Err` only for failures that should stop the run: cancellation,
    /// broken pipeline plumbing, or file failures escalated by
    /// [`ErrorPolicy::Abort`].
    pub async fn load(&mut self, path: &Path) -> Result<FileReport> {
        info!(worker = self.id, "Processing {}", path.display());

        let open_path = path.to_path_buf();
        let opened = tokio::task::spawn_blocking(move || GzipLines::open(open_path)).await;
        let lines = match opened {
            Ok(Ok(lines)) => lines,
            Ok(Err(e)) => {
                error!(worker = self.id, "Cannot read {}: {}", path.display(), e);
                return Ok(FileReport::io_failure(path, e.to_string()));
            },
            Err(e) => return Err(LoadError::Worker(e.to_string())),
        };

        let queues = self.queues.clone();
        let policy = self.config.error_policy;
        let cancel = self.cancel.clone();
        let stats =
            tokio::task::spawn_blocking(move || stream_lines(lines, &queues, policy, &cancel))
                .await
                .map_err(|e| LoadError::Worker(e.to_string()))?;

        if stats.interrupted {
            return Err(self.interrupted("destination queue"));
        }

        let (processed, write_errors) = self.drain().await?;
        self.evaluate(path, stats, processed, write_errors)
    }

    /// Mark the end of the batch on every queue and collect the tallies
    async fn drain(&mut self) -> Result<(u64, u64)> {
        for queue in self.queues.values() {
            if queue.send(Job::EndOfBatch).await.is_err() {
                return Err(self.interrupted("destination queue"));
            }
        }

        let mut processed = 0;
        let mut errors = 0;
        for _ in 0..self.queues.len() {
            let Some(batch) = self.tallies.recv().await else {
                return Err(self.interrupted("tally channel"));
            };
            debug!(
                worker = self.id,
                device_type = %batch.device_type,
                processed = batch.tally.processed,
                errors = batch.tally.errors,
                "Batch tally"
            );
            processed += batch.tally.processed;
            errors += batch.tally.errors;
        }

        Ok((processed, errors))
    }

    fn evaluate(
        &self,
        path: &Path,
        stats: StreamStats,
        processed: u64,
        write_errors: u64,
    ) -> Result<FileReport> {
        let errors = stats.local_errors() + write_errors;

        if self.config.error_policy == ErrorPolicy::Abort {
            if let Some(device_type) = stats.fatal_device_type {
                return Err(LoadError::UnknownDeviceType {
                    path: path.to_path_buf(),
                    device_type,
                });
            }
            if write_errors > 0 {
                return Err(LoadError::WriteExhausted {
                    path: path.to_path_buf(),
                    failures: write_errors,
                });
            }
        }

        let outcome = match stats.read_error {
            Some(reason) => FileOutcome::IoFailure { reason },
            None => FileOutcome::evaluate(processed, errors, self.config.error_threshold),
        };

        match &outcome {
            FileOutcome::Accepted { error_rate } => {
                info!(
                    worker = self.id,
                    processed,
                    errors,
                    "Acceptable error rate ({:.4}). Successful load of {}",
                    error_rate,
                    path.display()
                );
            },
            FileOutcome::RejectedErrorRate { error_rate } => {
                error!(
                    worker = self.id,
                    processed,
                    errors,
                    "High error rate ({:.4} >= {}). Failed load of {}",
                    error_rate,
                    self.config.error_threshold,
                    path.display()
                );
                if self.config.error_policy == ErrorPolicy::Abort {
                    return Err(LoadError::HighErrorRate {
                        path: path.to_path_buf(),
                        rate: *error_rate,
                        threshold: self.config.error_threshold,
                    });
                }
            },
            FileOutcome::RejectedNoRecords => {
                warn!(worker = self.id, errors, "No records loaded from {}", path.display());
            },
            FileOutcome::IoFailure { reason } => {
                error!(
                    worker = self.id,
                    processed,
                    errors,
                    "Read of {} stopped early: {}",
                    path.display(),
                    reason
                );
            },
        }

        Ok(FileReport {
            path: path.to_path_buf(),
            outcome,
            lines: stats.lines,
            processed,
            errors,
        })
    }

    fn interrupted(&self, channel: &'static str) -> LoadError {
        if self.cancel.is_cancelled() {
            LoadError::Cancelled
        } else {
            LoadError::ChannelClosed(channel)
        }
    }

    /// Close the queues and wait for the writers to finish
    pub async fn shutdown(self) -> Result<()> {
        let Self {
            queues,
            mut writers,
            ..
        } = self;
        drop(queues);

        while let Some(joined) = writers.join_next().await {
            joined.map_err(|e| LoadError::Worker(e.to_string()))?;
        }

        Ok(())
    }
}

fn stream_lines<R: Read>(
    lines: GzipLines<R>,
    queues: &Queues,
    policy: ErrorPolicy,
    cancel: &CancellationToken,
) -> StreamStats {
    let mut stats = StreamStats::default();

    for line in lines {
        if cancel.is_cancelled() {
            stats.interrupted = true;
            break;
        }

        let line = match line {
            Ok(line) => line,
            Err(e) => {
                stats.read_error = Some(e.to_string());
                break;
            },
        };

        let Ok(text) = std::str::from_utf8(&line) else {
            stats.lines += 1;
            stats.parse_errors += 1;
            continue;
        };
        if text.trim().is_empty() {
            continue;
        }
        stats.lines += 1;

        let record = match parse_apps_installed(text) {
            Ok(record) => record,
            Err(e) => {
                debug!("Skipping line {}: {}", stats.lines, e);
                stats.parse_errors += 1;
                continue;
            },
        };

        let Some(queue) = queues.get(&record.device_type) else {
            error!("Unknown device type: {}", record.device_type);
            stats.unknown_devices += 1;
            if policy == ErrorPolicy::Abort {
                stats.fatal_device_type = Some(record.device_type);
                break;
            }
            continue;
        };

        if queue.blocking_send(Job::Record(record)).is_err() {
            stats.interrupted = true;
            break;
        }
    }

    stats
}
