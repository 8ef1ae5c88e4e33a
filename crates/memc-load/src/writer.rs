//! Per-destination writer task
//!
//! Each file loader owns one writer per destination. A writer drains its
//! queue, writes records with retry and reports a [`BatchTally`] whenever it
//! sees [`Job::EndOfBatch`], which keeps tallies aligned with file
//! boundaries while the writer is reused across files.

use crate::config::LoaderConfig;
use crate::destination::Destination;
use crate::record::{AppsInstalled, BatchTally, Job, Tally};
use crate::retry::{RetryError, RetryPolicy};
use std::mem;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub struct DestinationWriter {
    destination: Destination,
    retry: RetryPolicy,
    dry_run: bool,
    cancel: CancellationToken,
    tally: Tally,
}

impl DestinationWriter {
    pub fn new(
        destination: Destination,
        config: &LoaderConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            destination,
            retry: config.retry,
            dry_run: config.dry_run,
            cancel,
            tally: Tally::default(),
        }
    }

    /// Consume jobs until the queue is closed or the run is cancelled
    pub async fn run(
        mut self,
        mut jobs: mpsc::Receiver<Job>,
        tallies: mpsc::Sender<BatchTally>,
    ) {
        loop {
            let job = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                job = jobs.recv() => job,
            };

            match job {
                Some(Job::Record(record)) => self.insert(&record).await,
                Some(Job::EndOfBatch) => {
                    let batch = BatchTally {
                        device_type: self.destination.device_type.clone(),
                        tally: mem::take(&mut self.tally),
                    };
                    if tallies.send(batch).await.is_err() {
                        break;
                    }
                },
                None => break,
            }
        }

        debug!(device_type = %self.destination.device_type, "Destination writer stopped");
    }

    async fn insert(&mut self, record: &AppsInstalled) {
        let store = &self.destination.store;
        let key = record.key();
        let value = record.to_user_apps();

        if self.dry_run {
            debug!("{} - {} -> {}", store.addr(), key, value);
            self.tally.record_success();
            return;
        }

        let packed = memc_common::codec::encode(&value);
        let result = self
            .retry
            .run(&self.cancel, |_| store.set(&key, &packed))
            .await;

        match result {
            Ok(()) => self.tally.record_success(),
            Err(RetryError::Exhausted { attempts, last }) => {
                warn!(
                    device_type = %self.destination.device_type,
                    attempts,
                    "Cannot write to memc {}: {}",
                    store.addr(),
                    last
                );
                self.tally.record_failure();
            },
            Err(RetryError::Cancelled) => {},
        }
    }
}
