//! Counters and per-stage/funnel/run reports.

use std::fmt::Write as _;
use std::iter::Sum;
use std::ops::AddAssign;
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Additive counters. Aggregation is plain addition, so the order in which
/// concurrent stages finish does not affect totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncCounts {
    pub processed: u64,
    pub inserted: u64,
    pub updated: u64,
    pub skipped: u64,
    pub errors: u64,
}

impl AddAssign for SyncCounts {
    fn add_assign(&mut self, rhs: Self) {
        self.processed += rhs.processed;
        self.inserted += rhs.inserted;
        self.updated += rhs.updated;
        self.skipped += rhs.skipped;
        self.errors += rhs.errors;
    }
}

impl Sum for SyncCounts {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::default(), |mut acc, c| {
            acc += c;
            acc
        })
    }
}

impl std::fmt::Display for SyncCounts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} processed, {} inserted, {} updated, {} skipped, {} errors",
            self.processed, self.inserted, self.updated, self.skipped, self.errors
        )
    }
}

/// Terminal state of one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageStatus {
    Done,
    /// Something stopped the stage early; counts are partial.
    Failed(String),
    /// Shutdown was requested before the stage finished.
    Interrupted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageReport {
    pub funnel_id: u32,
    pub stage_id: u32,
    pub stage_name: String,
    pub status: StageStatus,
    pub pages_fetched: u32,
    pub counts: SyncCounts,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunnelReport {
    pub funnel_id: u32,
    pub funnel_name: String,
    pub stages: Vec<StageReport>,
}

impl FunnelReport {
    pub fn counts(&self) -> SyncCounts {
        self.stages.iter().map(|s| s.counts).sum()
    }

    pub fn failed_stages(&self) -> usize {
        self.stages
            .iter()
            .filter(|s| matches!(s.status, StageStatus::Failed(_)))
            .count()
    }
}

/// Outcome of one full run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncResult {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub funnels: Vec<FunnelReport>,
    pub dry_run: bool,
    pub interrupted: bool,
}

impl SyncResult {
    pub fn counts(&self) -> SyncCounts {
        self.funnels.iter().map(FunnelReport::counts).sum()
    }

    pub fn duration(&self) -> Duration {
        (self.finished_at - self.started_at)
            .to_std()
            .unwrap_or_default()
    }

    pub fn stage(&self, stage_id: u32) -> Option<&StageReport> {
        self.funnels
            .iter()
            .flat_map(|f| &f.stages)
            .find(|s| s.stage_id == stage_id)
    }

    /// Single human-readable line, also stored as the audit row description.
    pub fn summary_line(&self) -> String {
        let counts = self.counts();
        let mut line = String::new();
        if self.dry_run {
            line.push_str("[DRY RUN] ");
        }
        let _ = write!(
            line,
            "Sync finished in {}: {}",
            format_duration(self.duration()),
            counts
        );
        let funnels: Vec<String> = self
            .funnels
            .iter()
            .map(|f| {
                let c = f.counts();
                let mut part = format!(
                    "{} #{}: {}/{}/{}/{}/{}",
                    f.funnel_name, f.funnel_id, c.processed, c.inserted, c.updated, c.skipped, c.errors
                );
                let failed = f.failed_stages();
                if failed > 0 {
                    let _ = write!(part, " ({failed} stage(s) failed)");
                }
                part
            })
            .collect();
        if !funnels.is_empty() {
            let _ = write!(line, " | {}", funnels.join("; "));
        }
        if self.interrupted {
            line.push_str(" | interrupted");
        }
        line
    }
}

pub fn format_duration(d: Duration) -> String {
    let total_secs = d.as_secs();
    let hours = total_secs / 3600;
    let mins = (total_secs % 3600) / 60;
    let secs = total_secs % 60;

    if hours > 0 {
        format!("{}h {:02}m {:02}s", hours, mins, secs)
    } else if mins > 0 {
        format!("{}m {:02}s", mins, secs)
    } else {
        format!("{}s", secs)
    }
}
