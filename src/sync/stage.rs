//! Per-stage state machine: fetch page N, filter, batch, process, repeat.
//!
//! Pages of one stage are strictly sequential because early termination
//! depends on what page N contained.

use std::panic::AssertUnwindSafe;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use super::batch::{process_batch, BatchContext};
use super::report::{StageReport, StageStatus, SyncCounts};
use super::SyncPipeline;
use crate::decider::Decider;
use crate::topology::{Funnel, Stage};

#[derive(Debug, Default, Clone, Copy)]
struct Progress {
    pages: u32,
    counts: SyncCounts,
}

/// Accumulated as the stage runs so a panic can still report what was done.
#[derive(Debug, Default)]
struct ProgressCell(Mutex<Progress>);

impl ProgressCell {
    fn update(&self, f: impl FnOnce(&mut Progress)) {
        let mut guard = self
            .0
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        f(&mut guard);
    }

    fn snapshot(&self) -> Progress {
        *self
            .0
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

async fn pause(delay: Duration) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

impl SyncPipeline {
    /// Run one stage to completion. Never returns an error: failures end the
    /// stage as `Failed` with whatever it had counted.
    pub(super) async fn run_stage(
        &self,
        funnel: &Funnel,
        stage: &Stage,
        now: DateTime<Utc>,
        shutdown: &CancellationToken,
    ) -> StageReport {
        let span = tracing::info_span!("stage", funnel_id = funnel.id, stage_id = stage.id);
        let progress = ProgressCell::default();

        let status = AssertUnwindSafe(self.stage_loop(funnel, stage, now, shutdown, &progress))
            .catch_unwind()
            .instrument(span.clone())
            .await
            .unwrap_or_else(|payload| {
                let msg = panic_message(payload.as_ref());
                span.in_scope(|| error!("Stage aborted by panic: {}", msg));
                StageStatus::Failed(format!("panic: {msg}"))
            });

        let Progress { pages, counts } = progress.snapshot();
        span.in_scope(|| match &status {
            StageStatus::Done => info!(pages, %counts, "Stage {} done", stage.name),
            StageStatus::Interrupted => info!(pages, %counts, "Stage {} interrupted", stage.name),
            StageStatus::Failed(reason) => {
                warn!(pages, %counts, "Stage {} failed: {}", stage.name, reason)
            }
        });

        StageReport {
            funnel_id: funnel.id,
            stage_id: stage.id,
            stage_name: stage.name.clone(),
            status,
            pages_fetched: pages,
            counts,
        }
    }

    async fn stage_loop(
        &self,
        funnel: &Funnel,
        stage: &Stage,
        now: DateTime<Utc>,
        shutdown: &CancellationToken,
        progress: &ProgressCell,
    ) -> StageStatus {
        let settings = &self.settings;
        let page_size = self.source.page_size();
        let ctx = BatchContext {
            destination: self.destination.as_ref(),
            decider: Decider::new(&self.cache, self.destination.as_ref(), settings.clock_skew),
            topology: &self.topology,
            drift: &self.drift,
            update_concurrency: settings.update_concurrency,
            dry_run: settings.dry_run,
        };

        let mut page = 0u32;
        let mut stale_pages = 0u32;
        loop {
            if shutdown.is_cancelled() {
                return StageStatus::Interrupted;
            }

            let records = match self.source.fetch_page(funnel.id, stage.id, page).await {
                Ok(records) => records,
                Err(e) => {
                    progress.update(|p| p.counts.errors += 1);
                    return StageStatus::Failed(format!("page {page}: {e}"));
                }
            };
            progress.update(|p| p.pages += 1);

            if records.is_empty() {
                debug!(page, "Empty page, stage exhausted");
                return StageStatus::Done;
            }

            let fetched = records.len();
            let recent = settings.recency.filter(records, now);
            debug!(page, fetched, recent = recent.len(), "Filtered page");

            if recent.is_empty() {
                if stale_pages >= settings.stale_page_tolerance {
                    debug!(page, "No recent records, stopping");
                    return StageStatus::Done;
                }
                stale_pages += 1;
            } else {
                stale_pages = 0;
                let batches = recent.chunks(settings.batch_size.max(1));
                let total = batches.len();
                for (k, batch) in batches.enumerate() {
                    if shutdown.is_cancelled() {
                        return StageStatus::Interrupted;
                    }
                    debug!(page, batch = k + 1, of = total, "Processing batch");
                    let counts = process_batch(&ctx, batch).await;
                    progress.update(|p| p.counts += counts);
                    if k + 1 < total {
                        pause(settings.page_delay).await;
                    }
                }
            }

            if fetched < page_size {
                debug!(page, fetched, "Short page, stage exhausted");
                return StageStatus::Done;
            }
            page += 1;
            pause(settings.page_delay).await;
        }
    }
}
