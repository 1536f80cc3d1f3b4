//! Batch processor: classify a batch, one bulk insert, bounded parallel
//! updates.

use std::collections::HashMap;

use chrono::{DateTime, SecondsFormat, Utc};
use futures_util::stream::{self, StreamExt};
use serde_json::Value;
use tracing::{debug, warn};

use super::report::SyncCounts;
use crate::cache::Existence;
use crate::crm::ExternalRecord;
use crate::decider::{Decider, UpsertAction};
use crate::destination::{Destination, ExistingRow};
use crate::drift::FieldDriftRecorder;
use crate::mapper::{map_record, DestinationRow};
use crate::topology::Topology;

/// Everything a batch needs, borrowed from the running pipeline.
pub struct BatchContext<'a> {
    pub destination: &'a dyn Destination,
    pub decider: Decider<'a>,
    pub topology: &'a Topology,
    pub drift: &'a FieldDriftRecorder,
    pub update_concurrency: usize,
    pub dry_run: bool,
}

/// When an ID shows up twice in one batch, keep the copy with the newest
/// `updateDate`. The others count as skipped.
fn dedup_newest(records: &[ExternalRecord], topology: &Topology) -> (Vec<DestinationRow>, u64) {
    let mut newest: HashMap<i64, usize> = HashMap::with_capacity(records.len());
    let mut rows: Vec<DestinationRow> = Vec::with_capacity(records.len());
    let mut duplicates = 0;

    for record in records {
        let row = map_record(record, topology);
        match newest.get(&row.id) {
            Some(&idx) => {
                duplicates += 1;
                if row.update_date() > rows[idx].update_date() {
                    rows[idx] = row;
                }
            }
            None => {
                newest.insert(row.id, rows.len());
                rows.push(row);
            }
        }
    }
    (rows, duplicates)
}

fn stamp_synced_at(row: &mut DestinationRow, now: DateTime<Utc>) {
    row.set(
        "synced_at",
        Value::String(now.to_rfc3339_opts(SecondsFormat::Millis, true)),
    );
}

/// Process one batch. Never fails as a whole: a failed existence check or
/// write is counted against the records it covered.
pub async fn process_batch(ctx: &BatchContext<'_>, records: &[ExternalRecord]) -> SyncCounts {
    let mut counts = SyncCounts {
        processed: records.len() as u64,
        ..Default::default()
    };
    if records.is_empty() {
        return counts;
    }

    for record in records {
        ctx.drift.observe(record);
    }

    let ids: Vec<i64> = records.iter().map(|r| r.id).collect();
    let existence = match ctx.decider.lookup(&ids).await {
        Ok(existence) => existence,
        Err(e) => {
            warn!(count = records.len(), "Existence check failed, batch not written: {}", e);
            counts.errors += records.len() as u64;
            return counts;
        }
    };

    let (rows, duplicates) = dedup_newest(records, ctx.topology);
    counts.skipped += duplicates;

    let now = Utc::now();
    let mut inserts = Vec::new();
    let mut updates = Vec::new();
    for mut row in rows {
        let state = existence.get(&row.id).copied().unwrap_or(Existence::Absent);
        match ctx.decider.classify(row.update_date(), &state) {
            UpsertAction::Insert => {
                stamp_synced_at(&mut row, now);
                inserts.push(row);
            }
            UpsertAction::Update => {
                stamp_synced_at(&mut row, now);
                let create_date = match state {
                    Existence::Present(existing) => existing.create_date,
                    Existence::Absent => None,
                };
                updates.push((row, create_date));
            }
            UpsertAction::Skip => counts.skipped += 1,
        }
    }

    debug!(
        inserts = inserts.len(),
        updates = updates.len(),
        skipped = counts.skipped,
        "Classified batch"
    );

    if ctx.dry_run {
        for row in &inserts {
            debug!(id = row.id, "[DRY RUN] Would insert");
        }
        for (row, _) in &updates {
            debug!(id = row.id, "[DRY RUN] Would update");
        }
        counts.inserted += inserts.len() as u64;
        counts.updated += updates.len() as u64;
        return counts;
    }

    if !inserts.is_empty() {
        match ctx.destination.insert_rows(&inserts).await {
            Ok(()) => {
                counts.inserted += inserts.len() as u64;
                for row in &inserts {
                    ctx.decider.record_written(
                        row.id,
                        ExistingRow {
                            update_date: row.update_date(),
                            create_date: None,
                        },
                    );
                }
            }
            Err(e) => {
                warn!(count = inserts.len(), "Bulk insert failed: {}", e);
                counts.errors += inserts.len() as u64;
            }
        }
    }

    let destination = ctx.destination;
    let results: Vec<_> = stream::iter(updates)
        .map(|(row, create_date)| async move {
            let result = destination.update_row(&row).await;
            (row, create_date, result)
        })
        .buffer_unordered(ctx.update_concurrency.max(1))
        .collect()
        .await;

    for (row, create_date, result) in results {
        match result {
            Ok(()) => {
                counts.updated += 1;
                ctx.decider.record_written(
                    row.id,
                    ExistingRow {
                        update_date: row.update_date(),
                        create_date,
                    },
                );
            }
            Err(e) => {
                warn!(id = row.id, "Update failed: {}", e);
                counts.errors += 1;
            }
        }
    }

    counts
}
