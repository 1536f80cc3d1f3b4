//! In-memory [`OpportunitySource`] and [`Destination`] for orchestration
//! tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};

use crate::crm::{CrmError, ExternalRecord, OpportunitySource};
use crate::destination::{
    Destination, DestinationError, ExistingRow, MissingField, SyncLogEntry,
};
use crate::mapper::DestinationRow;

/// A record in `stage_id` updated `hours_ago` hours before now.
pub fn recent_record(id: i64, stage_id: u32, hours_ago: i64) -> ExternalRecord {
    record_updated_at(id, stage_id, Utc::now() - Duration::hours(hours_ago))
}

pub fn record_updated_at(id: i64, stage_id: u32, at: DateTime<Utc>) -> ExternalRecord {
    ExternalRecord {
        id,
        title: Some(format!("Oportunidade {id}")),
        crm_column: Some(i64::from(stage_id)),
        update_date: Some(at.to_rfc3339_opts(SecondsFormat::Secs, true)),
        ..Default::default()
    }
}

/// Counts calls currently running and remembers the highest count seen.
#[derive(Debug, Default)]
pub struct InFlight {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl InFlight {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// Hold a call open for `latency` so overlapping calls are visible.
async fn hold(gauge: &InFlight, latency: Option<std::time::Duration>) {
    gauge.enter();
    match latency {
        Some(latency) => tokio::time::sleep(latency).await,
        None => tokio::task::yield_now().await,
    }
    gauge.exit();
}

#[derive(Debug, Clone)]
pub enum FakePage {
    Records(Vec<ExternalRecord>),
    /// Retries exhausted.
    Fail,
    Panic,
}

/// Pages keyed by stage. Pages past the scripted ones are empty, like the
/// 400 the real API answers with.
#[derive(Debug)]
pub struct FakeSource {
    page_size: usize,
    pages: Mutex<HashMap<u32, Vec<FakePage>>>,
    calls: Mutex<Vec<(u32, u32, u32)>>,
    latency: Option<std::time::Duration>,
    in_flight: InFlight,
}

impl FakeSource {
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size,
            pages: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            latency: None,
            in_flight: InFlight::default(),
        }
    }

    pub fn with_latency(mut self, latency: std::time::Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Most page fetches that were running at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.in_flight.peak()
    }

    pub fn with_pages(self, stage_id: u32, pages: Vec<FakePage>) -> Self {
        self.pages.lock().unwrap().insert(stage_id, pages);
        self
    }

    /// Page indices requested for `stage_id`, in request order.
    pub fn pages_fetched(&self, stage_id: u32) -> Vec<u32> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, s, _)| *s == stage_id)
            .map(|(_, _, p)| *p)
            .collect()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl OpportunitySource for FakeSource {
    async fn fetch_page(
        &self,
        funnel_id: u32,
        stage_id: u32,
        page: u32,
    ) -> Result<Vec<ExternalRecord>, CrmError> {
        self.calls.lock().unwrap().push((funnel_id, stage_id, page));
        hold(&self.in_flight, self.latency).await;
        let scripted = self
            .pages
            .lock()
            .unwrap()
            .get(&stage_id)
            .and_then(|pages| pages.get(page as usize).cloned());
        match scripted {
            Some(FakePage::Records(records)) => Ok(records),
            Some(FakePage::Fail) => Err(CrmError::HttpStatus {
                status: 502,
                stage_id,
                page,
            }),
            Some(FakePage::Panic) => panic!("scripted panic on stage {stage_id} page {page}"),
            None => Ok(Vec::new()),
        }
    }

    fn page_size(&self) -> usize {
        self.page_size
    }
}

#[derive(Debug, Default)]
struct DestinationState {
    rows: BTreeMap<i64, ExistingRow>,
    existence_queries: Vec<Vec<i64>>,
    inserts: Vec<Vec<DestinationRow>>,
    updates: Vec<DestinationRow>,
    missing_fields: Vec<MissingField>,
    sync_logs: Vec<SyncLogEntry>,
    fail_existence: bool,
    fail_inserts: bool,
    fail_updates: HashSet<i64>,
    fail_missing_field: bool,
    update_latency: Option<std::time::Duration>,
}

/// Table of `id -> timestamps` plus a log of every call.
#[derive(Debug, Default)]
pub struct FakeDestination {
    state: Mutex<DestinationState>,
    updates_in_flight: InFlight,
}

fn unavailable() -> DestinationError {
    DestinationError::HttpStatus {
        status: 503,
        body: "unavailable".into(),
    }
}

impl FakeDestination {
    fn state(&self) -> std::sync::MutexGuard<'_, DestinationState> {
        self.state.lock().unwrap()
    }

    pub fn seed(&self, id: i64, update_date: Option<DateTime<Utc>>) {
        self.state().rows.insert(
            id,
            ExistingRow {
                update_date,
                create_date: None,
            },
        );
    }

    pub fn fail_existence_checks(&self) {
        self.state().fail_existence = true;
    }

    pub fn fail_inserts(&self) {
        self.state().fail_inserts = true;
    }

    pub fn fail_update(&self, id: i64) {
        self.state().fail_updates.insert(id);
    }

    pub fn slow_updates(&self, latency: std::time::Duration) {
        self.state().update_latency = Some(latency);
    }

    /// Most updates that were running at the same time.
    pub fn peak_updates_in_flight(&self) -> usize {
        self.updates_in_flight.peak()
    }

    pub fn fail_missing_field_log(&self) {
        self.state().fail_missing_field = true;
    }

    pub fn row_count(&self) -> usize {
        self.state().rows.len()
    }

    pub fn stored(&self, id: i64) -> Option<ExistingRow> {
        self.state().rows.get(&id).copied()
    }

    pub fn existence_queries(&self) -> Vec<Vec<i64>> {
        self.state().existence_queries.clone()
    }

    pub fn insert_calls(&self) -> Vec<Vec<DestinationRow>> {
        self.state().inserts.clone()
    }

    pub fn updated_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.state().updates.iter().map(|r| r.id).collect();
        ids.sort_unstable();
        ids
    }

    pub fn missing_fields(&self) -> Vec<MissingField> {
        self.state().missing_fields.clone()
    }

    pub fn sync_logs(&self) -> Vec<SyncLogEntry> {
        self.state().sync_logs.clone()
    }
}

#[async_trait]
impl Destination for FakeDestination {
    async fn fetch_existing(
        &self,
        ids: &[i64],
    ) -> Result<HashMap<i64, ExistingRow>, DestinationError> {
        let mut state = self.state();
        state.existence_queries.push(ids.to_vec());
        if state.fail_existence {
            return Err(unavailable());
        }
        Ok(ids
            .iter()
            .filter_map(|id| state.rows.get(id).map(|row| (*id, *row)))
            .collect())
    }

    async fn insert_rows(&self, rows: &[DestinationRow]) -> Result<(), DestinationError> {
        let mut state = self.state();
        if state.fail_inserts {
            return Err(unavailable());
        }
        if let Some(dup) = rows.iter().find(|r| state.rows.contains_key(&r.id)) {
            return Err(DestinationError::HttpStatus {
                status: 409,
                body: format!("duplicate key {}", dup.id),
            });
        }
        for row in rows {
            state.rows.insert(
                row.id,
                ExistingRow {
                    update_date: row.update_date(),
                    create_date: None,
                },
            );
        }
        state.inserts.push(rows.to_vec());
        Ok(())
    }

    async fn update_row(&self, row: &DestinationRow) -> Result<(), DestinationError> {
        let latency = self.state().update_latency;
        hold(&self.updates_in_flight, latency).await;
        let mut state = self.state();
        if state.fail_updates.contains(&row.id) {
            return Err(unavailable());
        }
        state.rows.insert(
            row.id,
            ExistingRow {
                update_date: row.update_date(),
                create_date: None,
            },
        );
        state.updates.push(row.clone());
        Ok(())
    }

    async fn log_missing_field(&self, field: &MissingField) -> Result<(), DestinationError> {
        let mut state = self.state();
        if state.fail_missing_field {
            return Err(unavailable());
        }
        state.missing_fields.push(field.clone());
        Ok(())
    }

    async fn record_sync_run(&self, entry: &SyncLogEntry) -> Result<(), DestinationError> {
        self.state().sync_logs.push(entry.clone());
        Ok(())
    }
}
