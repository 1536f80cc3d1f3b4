use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};
use chrono_tz::Tz;

use crate::cli::SyncArgs;
use crate::recency::RecencyWindow;
use crate::retry::RetryConfig;
use crate::sync::SyncSettings;

/// Hours of the day the sync is allowed to run, `start..end` in local time.
///
/// `end` is exclusive. A window whose start is after its end wraps midnight,
/// e.g. `22-6`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkingHours {
    pub start: u32,
    pub end: u32,
}

impl WorkingHours {
    pub fn contains(&self, hour: u32) -> bool {
        if self.start <= self.end {
            hour >= self.start && hour < self.end
        } else {
            hour >= self.start || hour < self.end
        }
    }

    pub fn contains_at(&self, now: DateTime<Utc>, tz: Tz) -> bool {
        self.contains(now.with_timezone(&tz).hour())
    }
}

impl FromStr for WorkingHours {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (start, end) = s
            .split_once('-')
            .ok_or_else(|| anyhow::anyhow!("Working hours must look like START-END, got '{}'", s))?;
        let parse = |part: &str| -> anyhow::Result<u32> {
            let hour: u32 = part
                .trim()
                .parse()
                .map_err(|_| anyhow::anyhow!("Invalid hour '{}' in working hours '{}'", part, s))?;
            if hour > 24 {
                anyhow::bail!("Hour {} out of range in working hours '{}'", hour, s);
            }
            Ok(hour)
        };
        let (start, end) = (parse(start)?, parse(end)?);
        if start == end {
            anyhow::bail!("Working hours '{}' describe an empty window", s);
        }
        Ok(Self { start, end })
    }
}

/// Validated application configuration.
pub struct Config {
    pub supabase_url: String,
    pub supabase_key: String,
    pub supabase_schema: String,
    pub opportunities_table: String,
    pub sync_log_table: String,
    pub sprinthub_base_url: String,
    pub sprinthub_instance: String,
    pub sprinthub_token: String,

    pub timezone: Tz,
    pub working_hours: WorkingHours,

    pub request_timeout: Duration,
    pub retry_delay: Duration,
    pub auth_retry_delay: Duration,
    pub watch_interval: Option<Duration>,

    pub page_size: usize,
    pub max_attempts: u32,

    pub sync: SyncSettings,

    pub force: bool,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("supabase_url", &self.supabase_url)
            .field("supabase_key", &"<redacted>")
            .field("supabase_schema", &self.supabase_schema)
            .field("opportunities_table", &self.opportunities_table)
            .field("sprinthub_base_url", &self.sprinthub_base_url)
            .field("sprinthub_instance", &self.sprinthub_instance)
            .field("sprinthub_token", &"<redacted>")
            .field("timezone", &self.timezone)
            .field("working_hours", &self.working_hours)
            .field("sync", &self.sync)
            .finish_non_exhaustive()
    }
}

fn required(value: Option<String>, name: &str) -> anyhow::Result<String> {
    match value.map(|v| v.trim().to_string()) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => anyhow::bail!("{} is required", name),
    }
}

fn non_zero(value: usize, name: &str) -> anyhow::Result<usize> {
    if value == 0 {
        anyhow::bail!("{} must be greater than zero", name);
    }
    Ok(value)
}

impl Config {
    pub fn from_cli(args: SyncArgs) -> anyhow::Result<Self> {
        let supabase_url = required(args.supabase_url, "SUPABASE_URL")?;
        let supabase_key = required(args.supabase_key, "SUPABASE_SERVICE_ROLE_KEY")?;
        let sprinthub_instance = required(args.sprinthub_instance, "SPRINTHUB_INSTANCE")?;
        let sprinthub_token = required(args.sprinthub_token, "SPRINTHUB_API_TOKEN")?;

        let page_size = non_zero(args.page_size, "--page-size")?;
        let batch_size = non_zero(args.batch_size, "--batch-size")?;
        let stage_concurrency = non_zero(args.stage_concurrency, "--stage-concurrency")?;
        let update_concurrency = non_zero(args.update_concurrency, "--update-concurrency")?;
        if args.max_attempts == 0 {
            anyhow::bail!("--max-attempts must be greater than zero");
        }
        if args.recency_hours == 0 {
            anyhow::bail!("--recency-hours must be greater than zero");
        }
        if args.watch_interval_secs == Some(0) {
            anyhow::bail!("--watch-interval-secs must be greater than zero");
        }

        let working_hours: WorkingHours = args.working_hours.parse()?;
        let timezone: Tz = args
            .timezone
            .parse()
            .map_err(|_| anyhow::anyhow!("Unknown timezone '{}'", args.timezone))?;
        let clock_skew = chrono::Duration::try_seconds(
            i64::try_from(args.clock_skew_secs).unwrap_or(i64::MAX),
        )
        .ok_or_else(|| anyhow::anyhow!("--clock-skew-secs is too large"))?;

        Ok(Self {
            supabase_url,
            supabase_key,
            supabase_schema: args.supabase_schema,
            opportunities_table: args.opportunities_table,
            sync_log_table: args.sync_log_table,
            sprinthub_base_url: args.sprinthub_base_url,
            sprinthub_instance,
            sprinthub_token,
            timezone,
            working_hours,
            request_timeout: Duration::from_secs(args.request_timeout_secs),
            retry_delay: Duration::from_millis(args.retry_delay_ms),
            auth_retry_delay: Duration::from_millis(args.auth_retry_delay_ms),
            watch_interval: args.watch_interval_secs.map(Duration::from_secs),
            page_size,
            max_attempts: args.max_attempts,
            sync: SyncSettings {
                recency: RecencyWindow::hours(args.recency_hours),
                batch_size,
                stage_concurrency,
                update_concurrency,
                cache_ttl: Duration::from_secs(args.cache_ttl_secs),
                page_delay: Duration::from_millis(args.page_delay_ms),
                stale_page_tolerance: args.stale_page_tolerance,
                clock_skew,
                dry_run: args.dry_run,
            },
            force: args.force,
        })
    }

    pub fn fetch_retry(&self) -> RetryConfig {
        RetryConfig::fetch(self.max_attempts, self.retry_delay, self.auth_retry_delay)
    }

    pub fn write_retry(&self) -> RetryConfig {
        RetryConfig::write(self.max_attempts, self.retry_delay)
    }

    /// Whether a run may start at `now`. `--force` always allows it.
    pub fn within_working_hours(&self, now: DateTime<Utc>) -> bool {
        self.force || self.working_hours.contains_at(now, self.timezone)
    }
}
