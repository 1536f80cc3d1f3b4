//! Run orchestration: funnels concurrently, stages in bounded groups, one
//! [`SyncResult`] at the end.

mod batch;
pub mod report;
mod stage;

pub use report::{StageStatus, SyncResult};

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::future::join_all;
use futures_util::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::cache::ExistenceCache;
use crate::crm::OpportunitySource;
use crate::destination::{Destination, SyncLogEntry};
use crate::drift::FieldDriftRecorder;
use crate::recency::RecencyWindow;
use crate::topology::{Funnel, Topology};
use report::FunnelReport;

/// Tuning knobs for one pipeline.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub recency: RecencyWindow,
    pub batch_size: usize,
    pub stage_concurrency: usize,
    pub update_concurrency: usize,
    pub cache_ttl: Duration,
    /// Pause between pages and between batches of one page.
    pub page_delay: Duration,
    /// Extra all-stale pages fetched before a stage is considered exhausted.
    pub stale_page_tolerance: u32,
    pub clock_skew: chrono::Duration,
    pub dry_run: bool,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            recency: RecencyWindow::hours(48),
            batch_size: 20,
            stage_concurrency: 3,
            update_concurrency: 10,
            cache_ttl: Duration::from_secs(300),
            page_delay: Duration::from_millis(200),
            stale_page_tolerance: 0,
            clock_skew: chrono::Duration::zero(),
            dry_run: false,
        }
    }
}

pub struct SyncPipeline {
    source: Arc<dyn OpportunitySource>,
    destination: Arc<dyn Destination>,
    topology: Topology,
    settings: SyncSettings,
    cache: ExistenceCache,
    drift: FieldDriftRecorder,
}

impl SyncPipeline {
    pub fn new(
        source: Arc<dyn OpportunitySource>,
        destination: Arc<dyn Destination>,
        topology: Topology,
        settings: SyncSettings,
    ) -> Self {
        let cache = ExistenceCache::new(settings.cache_ttl);
        Self {
            source,
            destination,
            topology,
            settings,
            cache,
            drift: FieldDriftRecorder::new(),
        }
    }

    /// One full sync pass over every funnel.
    ///
    /// Per-stage failures are contained in the result. After the timed part,
    /// unknown fields are flushed and the audit row is written; neither can
    /// change the result. Dry runs do neither.
    pub async fn run(&self, shutdown: &CancellationToken) -> SyncResult {
        self.cache.clear();
        let started_at = Utc::now();
        tracing::info!(
            funnels = self.topology.funnels().len(),
            stages = self.topology.stage_count(),
            dry_run = self.settings.dry_run,
            "Starting sync"
        );

        let funnels = join_all(
            self.topology
                .funnels()
                .iter()
                .map(|funnel| self.run_funnel(funnel, started_at, shutdown)),
        )
        .await;

        let result = SyncResult {
            started_at,
            finished_at: Utc::now(),
            funnels,
            dry_run: self.settings.dry_run,
            interrupted: shutdown.is_cancelled(),
        };
        log_summary(&result);
        tracing::debug!(cached_ids = self.cache.entry_count(), "Existence cache at end of run");

        if self.settings.dry_run {
            for field in self.drift.drain() {
                tracing::info!(field = %field.field_name, "[DRY RUN] Unknown custom field");
            }
        } else {
            self.drift.flush(self.destination.as_ref()).await;
            self.record_audit(&result).await;
        }
        result
    }

    async fn run_funnel(
        &self,
        funnel: &Funnel,
        now: chrono::DateTime<Utc>,
        shutdown: &CancellationToken,
    ) -> FunnelReport {
        let stages = stream::iter(&funnel.stages)
            .map(|stage| self.run_stage(funnel, stage, now, shutdown))
            .buffered(self.settings.stage_concurrency.max(1))
            .collect::<Vec<_>>()
            .await;

        let report = FunnelReport {
            funnel_id: funnel.id,
            funnel_name: funnel.name.clone(),
            stages,
        };
        tracing::info!(
            funnel_id = funnel.id,
            failed_stages = report.failed_stages(),
            "Funnel {} finished: {}",
            funnel.name,
            report.counts()
        );
        report
    }

    async fn record_audit(&self, result: &SyncResult) {
        let entry = SyncLogEntry {
            created_at: Utc::now(),
            data: result.started_at,
            descricao: result.summary_line(),
        };
        if let Err(e) = self.destination.record_sync_run(&entry).await {
            tracing::warn!("Failed to record sync run: {}", e);
        }
    }
}

fn log_summary(result: &SyncResult) {
    let counts = result.counts();
    if result.dry_run {
        tracing::info!("── Dry Run Summary ──");
        tracing::info!(
            "  {} would be inserted, {} would be updated",
            counts.inserted,
            counts.updated
        );
    } else {
        tracing::info!("── Summary ──");
    }
    tracing::info!("  {}", counts);
    tracing::info!("  elapsed: {}", report::format_duration(result.duration()));
    if result.interrupted {
        tracing::info!("  Interrupted by shutdown request");
    }
    for stage in result.funnels.iter().flat_map(|f| &f.stages) {
        if let StageStatus::Failed(reason) = &stage.status {
            tracing::warn!(
                funnel_id = stage.funnel_id,
                stage_id = stage.stage_id,
                pages = stage.pages_fetched,
                "  Stage {} failed: {}",
                stage.stage_name,
                reason
            );
        }
    }
    tracing::info!("{}", result.summary_line());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{recent_record, FakeDestination, FakePage, FakeSource};

    fn settings() -> SyncSettings {
        SyncSettings {
            page_delay: Duration::ZERO,
            ..SyncSettings::default()
        }
    }

    fn records(ids: std::ops::RangeInclusive<i64>, stage_id: u32) -> FakePage {
        FakePage::Records(ids.map(|id| recent_record(id, stage_id, 2)).collect())
    }

    fn build(
        source: FakeSource,
        settings: SyncSettings,
    ) -> (SyncPipeline, Arc<FakeSource>, Arc<FakeDestination>) {
        let source = Arc::new(source);
        let destination = Arc::new(FakeDestination::default());
        let pipeline = SyncPipeline::new(
            source.clone(),
            destination.clone(),
            Topology::builtin(),
            settings,
        );
        (pipeline, source, destination)
    }

    fn two_funnel_source() -> FakeSource {
        FakeSource::new(10)
            .with_pages(130, vec![records(1..=10, 130), records(11..=13, 130)])
            .with_pages(231, vec![records(100..=104, 231)])
            .with_pages(202, vec![records(200..=207, 202)])
    }

    #[tokio::test]
    async fn test_run_aggregates_all_funnels() {
        let (pipeline, source, destination) = build(two_funnel_source(), settings());

        let result = pipeline.run(&CancellationToken::new()).await;

        let counts = result.counts();
        assert_eq!(counts.processed, 26);
        assert_eq!(counts.inserted, 26);
        assert_eq!(counts.errors, 0);
        assert_eq!(destination.row_count(), 26);
        assert_eq!(result.funnels.len(), 2);
        // Every stage of both funnels was visited once.
        assert_eq!(source.pages_fetched(130), vec![0, 1]);
        assert_eq!(source.pages_fetched(232), vec![0]);
        assert_eq!(source.pages_fetched(230), vec![0]);
        assert!(result
            .funnels
            .iter()
            .flat_map(|f| &f.stages)
            .all(|s| s.status == StageStatus::Done));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stages_run_in_parallel_up_to_cap() {
        let source = FakeSource::new(10).with_latency(Duration::from_millis(50));
        let (pipeline, source, _) = build(
            source,
            SyncSettings {
                stage_concurrency: 2,
                ..settings()
            },
        );

        let result = pipeline.run(&CancellationToken::new()).await;

        assert_eq!(source.total_calls(), 14);
        assert_eq!(result.funnels.len(), 2);
        // Two stages at a time in each of the two funnels.
        assert_eq!(source.peak_in_flight(), 4);
    }

    #[tokio::test]
    async fn test_second_run_is_idempotent() {
        let (pipeline, _, destination) = build(two_funnel_source(), settings());

        pipeline.run(&CancellationToken::new()).await;
        let second = pipeline.run(&CancellationToken::new()).await;

        let counts = second.counts();
        assert_eq!(counts.inserted, 0);
        assert_eq!(counts.updated, 0);
        assert_eq!(counts.skipped, 26);
        assert_eq!(destination.row_count(), 26);
    }

    #[tokio::test]
    async fn test_run_clears_cache_between_runs() {
        let (pipeline, _, destination) = build(two_funnel_source(), settings());

        pipeline.run(&CancellationToken::new()).await;
        let after_first = destination.existence_queries().len();
        pipeline.run(&CancellationToken::new()).await;

        // A second run re-checks the destination instead of trusting the
        // previous run's cache.
        assert_eq!(destination.existence_queries().len(), after_first * 2);
    }

    #[tokio::test]
    async fn test_each_cycle_pipeline_starts_cold() {
        let (first, source, destination) = build(two_funnel_source(), settings());
        first.run(&CancellationToken::new()).await;
        let after_first = destination.existence_queries().len();

        let second = SyncPipeline::new(
            source.clone(),
            destination.clone(),
            Topology::builtin(),
            settings(),
        );
        assert_eq!(second.cache.entry_count(), 0);
        let result = second.run(&CancellationToken::new()).await;

        assert_eq!(destination.existence_queries().len(), after_first * 2);
        assert_eq!(result.counts().skipped, 26);
    }

    #[tokio::test]
    async fn test_failing_stage_does_not_affect_siblings() {
        let source = FakeSource::new(10)
            .with_pages(
                130,
                vec![records(1..=10, 130), records(11..=20, 130), FakePage::Fail],
            )
            .with_pages(231, vec![records(100..=104, 231)])
            .with_pages(202, vec![records(200..=207, 202)]);
        let (pipeline, _, _) = build(source, settings());

        let result = pipeline.run(&CancellationToken::new()).await;

        let failing = result.stage(130).unwrap();
        assert!(matches!(failing.status, StageStatus::Failed(_)));
        assert_eq!(failing.counts.inserted, 20);
        assert_eq!(result.stage(231).unwrap().counts.inserted, 5);
        assert_eq!(result.stage(202).unwrap().counts.inserted, 8);

        let counts = result.counts();
        assert_eq!(counts.inserted, 33);
        assert_eq!(counts.errors, 1);
    }

    #[tokio::test]
    async fn test_out_of_range_page_ends_stage_done() {
        // The real client maps the 400 on page 3 to an empty page.
        let source = FakeSource::new(5).with_pages(
            130,
            vec![records(1..=5, 130), records(6..=10, 130), records(11..=15, 130)],
        );
        let (pipeline, source, _) = build(source, settings());

        let result = pipeline.run(&CancellationToken::new()).await;

        assert_eq!(source.pages_fetched(130), vec![0, 1, 2, 3]);
        assert_eq!(result.stage(130).unwrap().status, StageStatus::Done);
        assert_eq!(result.stage(130).unwrap().counts.inserted, 15);
    }

    #[tokio::test]
    async fn test_audit_row_and_unknown_fields_written_after_run() {
        let mut record = recent_record(1, 130, 1);
        record
            .fields
            .insert("Campo Novo".into(), serde_json::json!("valor"));
        let source = FakeSource::new(10).with_pages(130, vec![FakePage::Records(vec![record])]);
        let (pipeline, _, destination) = build(source, settings());

        let result = pipeline.run(&CancellationToken::new()).await;

        let logs = destination.sync_logs();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].descricao, result.summary_line());
        assert_eq!(logs[0].data, result.started_at);
        let missing = destination.missing_fields();
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].field_name, "Campo Novo");
    }

    #[tokio::test]
    async fn test_failed_drift_flush_does_not_change_result() {
        let mut record = recent_record(1, 130, 1);
        record.fields.insert("Campo Novo".into(), serde_json::json!(1));
        let source = FakeSource::new(10).with_pages(130, vec![FakePage::Records(vec![record])]);
        let (pipeline, _, destination) = build(source, settings());
        destination.fail_missing_field_log();

        let result = pipeline.run(&CancellationToken::new()).await;

        assert_eq!(result.counts().errors, 0);
        assert_eq!(result.counts().inserted, 1);
    }

    #[tokio::test]
    async fn test_dry_run_writes_nothing() {
        let (pipeline, _, destination) = build(
            two_funnel_source(),
            SyncSettings {
                dry_run: true,
                ..settings()
            },
        );

        let result = pipeline.run(&CancellationToken::new()).await;

        assert_eq!(result.counts().inserted, 26);
        assert_eq!(destination.row_count(), 0);
        assert!(destination.sync_logs().is_empty());
        assert!(result.summary_line().starts_with("[DRY RUN]"));
    }

    #[tokio::test]
    async fn test_cancelled_run_reports_interrupted() {
        let (pipeline, source, destination) = build(two_funnel_source(), settings());
        let token = CancellationToken::new();
        token.cancel();

        let result = pipeline.run(&token).await;

        assert!(result.interrupted);
        assert_eq!(source.total_calls(), 0);
        assert_eq!(result.counts(), report::SyncCounts::default());
        // The audit row still records the interrupted run.
        assert_eq!(destination.sync_logs().len(), 1);
    }
}
