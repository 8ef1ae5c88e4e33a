//! Records and the messages passed between pipeline stages

use memc_common::UserApps;
use std::path::PathBuf;

/// One parsed installed-apps entry for a device
#[derive(Debug, Clone, PartialEq)]
pub struct AppsInstalled {
    pub device_type: String,
    pub device_id: String,
    pub lat: f64,
    pub lon: f64,
    pub apps: Vec<u32>,
}

impl AppsInstalled {
    /// Store key, `"{device_type}:{device_id}"`. Colons inside the id are kept as-is.
    pub fn key(&self) -> String {
        format!("{}:{}", self.device_type, self.device_id)
    }

    /// Value written under [`key`](Self::key)
    pub fn to_user_apps(&self) -> UserApps {
        UserApps::new(self.apps.clone(), self.lat, self.lon)
    }
}

/// Item on a destination queue
#[derive(Debug)]
pub enum Job {
    Record(AppsInstalled),
    /// No more records for the current file on this queue
    EndOfBatch,
}

/// Write counters for one (file, destination) pair
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tally {
    pub processed: u64,
    pub errors: u64,
}

impl Tally {
    pub fn record_success(&mut self) {
        self.processed += 1;
    }

    pub fn record_failure(&mut self) {
        self.errors += 1;
    }
}

/// Tally reported by a destination writer at the end of a batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchTally {
    pub device_type: String,
    pub tally: Tally,
}

/// How a file's load ended
#[derive(Debug, Clone, PartialEq)]
pub enum FileOutcome {
    /// Error rate below the threshold
    Accepted { error_rate: f64 },
    /// Error rate at or above the threshold
    RejectedErrorRate { error_rate: f64 },
    /// Not a single record was written
    RejectedNoRecords,
    /// The file could not be opened, decompressed or fully read
    IoFailure { reason: String },
}

impl FileOutcome {
    /// Apply the error-rate gate to a file's totals
    pub fn evaluate(processed: u64, errors: u64, threshold: f64) -> Self {
        if processed == 0 {
            return FileOutcome::RejectedNoRecords;
        }

        let error_rate = errors as f64 / processed as f64;
        if error_rate < threshold {
            FileOutcome::Accepted { error_rate }
        } else {
            FileOutcome::RejectedErrorRate { error_rate }
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, FileOutcome::Accepted { .. })
    }
}

impl std::fmt::Display for FileOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FileOutcome::Accepted { .. } => write!(f, "accepted"),
            FileOutcome::RejectedErrorRate { .. } => write!(f, "rejected-error-rate"),
            FileOutcome::RejectedNoRecords => write!(f, "rejected-no-records"),
            FileOutcome::IoFailure { .. } => write!(f, "io-failure"),
        }
    }
}

/// Completion signal sent from a file loader to the coordinator
#[derive(Debug, Clone, PartialEq)]
pub struct FileReport {
    pub path: PathBuf,
    pub outcome: FileOutcome,
    /// Non-blank lines read from the file
    pub lines: u64,
    /// Records written successfully across all destinations
    pub processed: u64,
    /// Parse errors, unknown device types and failed writes
    pub errors: u64,
}

impl FileReport {
    pub fn io_failure(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            outcome: FileOutcome::IoFailure {
                reason: reason.into(),
            },
            lines: 0,
            processed: 0,
            errors: 0,
        }
    }
}

/// Totals over every file of a run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub files: usize,
    pub accepted: usize,
    pub rejected_error_rate: usize,
    pub rejected_no_records: usize,
    pub io_failures: usize,
    pub rename_failures: usize,
    pub processed: u64,
    pub errors: u64,
}

impl RunSummary {
    pub fn record(&mut self, report: &FileReport) {
        self.files += 1;
        self.processed += report.processed;
        self.errors += report.errors;

        match report.outcome {
            FileOutcome::Accepted { .. } => self.accepted += 1,
            FileOutcome::RejectedErrorRate { .. } => self.rejected_error_rate += 1,
            FileOutcome::RejectedNoRecords => self.rejected_no_records += 1,
            FileOutcome::IoFailure { .. } => self.io_failures += 1,
        }
    }
}
