use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::captioner::{read_image, Captioner};
use crate::config::BatchConfig;
use crate::error::{BatchError, CaptionError};
use crate::store::ProgressStore;
use crate::types::{BatchSummary, ImageRecord, ProgressEntry};

/// Result of working one item to a terminal state.
#[derive(Debug)]
pub struct ItemOutcome {
    pub result: Result<String, CaptionError>,
    /// Captioning calls made for this item (0 if the image could not be read).
    pub calls: u32,
}

/// Sequential, resumable captioning loop.
///
/// Items already `done` in the store are skipped. Every other item is
/// captioned with bounded retries and its outcome written to the store
/// before the next one starts, so killing the process at any point loses at
/// most the item in flight.
pub struct BatchRunner<C> {
    captioner: C,
    config: BatchConfig,
    cancel: Arc<AtomicBool>,
}

impl<C: Captioner> BatchRunner<C> {
    /// Fails on an invalid config before any work happens.
    pub fn new(captioner: C, config: BatchConfig) -> Result<Self, BatchError> {
        config.validate()?;
        Ok(Self {
            captioner,
            config,
            cancel: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Share an externally owned cancellation flag (e.g. set by a Ctrl-C handler).
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = flag;
        self
    }

    /// Setting this flag stops the run before the next item.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn captioner(&self) -> &C {
        &self.captioner
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Caption every record not yet `done` in `store`.
    ///
    /// Only store failures abort the run. Captioning failures are recorded
    /// as `failed` entries and counted in the summary.
    pub async fn run<S>(
        &self,
        records: &[ImageRecord],
        store: &mut S,
    ) -> Result<BatchSummary, BatchError>
    where
        S: ProgressStore + ?Sized,
    {
        let run_id = uuid::Uuid::new_v4().to_string();
        let mut summary = BatchSummary {
            run_id: run_id.clone(),
            started_at: chrono::Utc::now().to_rfc3339(),
            ..Default::default()
        };

        let done: HashSet<String> = store
            .load()?
            .into_iter()
            .filter(|e| e.is_done())
            .map(|e| e.id)
            .collect();

        let unique: BTreeMap<&str, &ImageRecord> =
            records.iter().map(|r| (r.id.as_str(), r)).collect();
        summary.discovered = unique.len();

        let pending: Vec<&ImageRecord> = unique
            .values()
            .filter(|r| !done.contains(&r.id))
            .copied()
            .collect();
        summary.skipped = summary.discovered - pending.len();

        tracing::info!(
            "Run {}: {} discovered, {} already done, {} to caption with {} -> {}",
            run_id,
            summary.discovered,
            summary.skipped,
            pending.len(),
            self.captioner.model(),
            store.location().display()
        );

        let total = pending.len();
        for (idx, record) in pending.iter().enumerate() {
            if self.cancel.load(Ordering::Relaxed) {
                summary.not_attempted = total - idx;
                tracing::warn!(
                    "Cancellation requested, leaving {} item(s) pending",
                    summary.not_attempted
                );
                break;
            }

            store.mark_in_progress(&record.id, &run_id)?;
            let outcome = self.process(record).await;
            summary.api_calls += outcome.calls;

            let entry = match outcome.result {
                Ok(caption) => {
                    tracing::info!("[{}/{}] {} done", idx + 1, total, record.id);
                    summary.done += 1;
                    ProgressEntry::done(&record.id, caption, outcome.calls, &run_id)
                }
                Err(e) => {
                    tracing::warn!(
                        "[{}/{}] {} failed after {} call(s): {}",
                        idx + 1,
                        total,
                        record.id,
                        outcome.calls,
                        e
                    );
                    summary.failed += 1;
                    summary.failed_ids.push(record.id.clone());
                    ProgressEntry::failed(&record.id, e.to_string(), outcome.calls, &run_id)
                }
            };
            store.record(&entry)?;

            if !self.config.pace.is_zero() && idx + 1 < total {
                tokio::time::sleep(self.config.pace).await;
            }
        }

        summary.finished_at = chrono::Utc::now().to_rfc3339();
        tracing::info!(
            "Run {} finished: {} done, {} failed, {} skipped, {} not attempted, {} API call(s)",
            run_id,
            summary.done,
            summary.failed,
            summary.skipped,
            summary.not_attempted,
            summary.api_calls
        );
        Ok(summary)
    }

    /// Read one image and caption it, retrying transient failures with backoff.
    pub async fn process(&self, record: &ImageRecord) -> ItemOutcome {
        let payload = match read_image(&record.path) {
            Ok(p) => p,
            Err(e) => {
                return ItemOutcome {
                    result: Err(e),
                    calls: 0,
                }
            }
        };

        let policy = &self.config.retry;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match tokio::time::timeout(
                self.config.call_timeout,
                self.captioner.caption(&payload),
            )
            .await
            {
                Ok(r) => r,
                Err(_) => Err(CaptionError::Timeout(self.config.call_timeout)),
            };

            match result {
                Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                    let delay = policy.delay_for(attempt);
                    tracing::warn!(
                        "{} attempt {}/{} failed: {} (retrying in {:?})",
                        record.id,
                        attempt,
                        policy.max_attempts,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                result => {
                    return ItemOutcome {
                        result,
                        calls: attempt,
                    }
                }
            }
        }
    }
}
