use clap::{Args, Parser, Subcommand};

use crate::types::*;

#[derive(Parser, Debug)]
#[command(
    name = "sprinthub-sync",
    version,
    about = "Incrementally sync SprintHub opportunities into Supabase"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub sync: SyncArgs,

    /// Log level (RUST_LOG takes precedence when set)
    #[arg(long, value_enum, default_value = "info", env = "SYNC_LOG_LEVEL", global = true)]
    pub log_level: LogLevel,

    /// Log output format
    #[arg(long, value_enum, default_value = "text", env = "SYNC_LOG_FORMAT", global = true)]
    pub log_format: LogFormat,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the sync (default when no subcommand is given)
    Sync(SyncArgs),
    /// Print the funnel/stage table and exit
    Topology,
}

impl Cli {
    pub fn effective_command(self) -> Command {
        self.command.unwrap_or(Command::Sync(self.sync))
    }
}

#[derive(Args, Debug, Clone)]
pub struct SyncArgs {
    /// Supabase project URL, e.g. https://xyz.supabase.co
    #[arg(long, env = "SUPABASE_URL")]
    pub supabase_url: Option<String>,

    /// Supabase service-role key.
    /// Prefer the environment variable: flags are visible in process listings.
    #[arg(long, env = "SUPABASE_SERVICE_ROLE_KEY", hide_env_values = true)]
    pub supabase_key: Option<String>,

    /// PostgREST schema selected via Accept-Profile/Content-Profile
    #[arg(long, env = "SUPABASE_SCHEMA", default_value = "api")]
    pub supabase_schema: String,

    /// Destination table for opportunities
    #[arg(long, env = "SYNC_OPPORTUNITIES_TABLE", default_value = "oportunidade_sprint")]
    pub opportunities_table: String,

    /// Table receiving one audit row per run
    #[arg(long, env = "SYNC_LOG_TABLE", default_value = "sincronizacao")]
    pub sync_log_table: String,

    /// SprintHub API base URL
    #[arg(
        long,
        env = "SPRINTHUB_BASE_URL",
        default_value = "https://sprinthub-api-master.sprinthub.app"
    )]
    pub sprinthub_base_url: String,

    /// SprintHub instance name (the `i` query parameter)
    #[arg(long, env = "SPRINTHUB_INSTANCE")]
    pub sprinthub_instance: Option<String>,

    /// SprintHub API token
    #[arg(long, env = "SPRINTHUB_API_TOKEN", hide_env_values = true)]
    pub sprinthub_token: Option<String>,

    /// Only records updated within this many hours are synced
    #[arg(long, env = "SYNC_RECENCY_HOURS", default_value_t = 48)]
    pub recency_hours: u32,

    /// Records requested per SprintHub page
    #[arg(long, env = "SYNC_PAGE_SIZE", default_value_t = 100)]
    pub page_size: usize,

    /// Records per existence check / bulk insert
    #[arg(long, env = "SYNC_BATCH_SIZE", default_value_t = 20)]
    pub batch_size: usize,

    /// Stages of one funnel processed concurrently
    #[arg(long, env = "SYNC_STAGE_CONCURRENCY", default_value_t = 3)]
    pub stage_concurrency: usize,

    /// Concurrent single-row updates per batch
    #[arg(long, env = "SYNC_UPDATE_CONCURRENCY", default_value_t = 10)]
    pub update_concurrency: usize,

    /// Existence cache lifetime in seconds
    #[arg(long, env = "SYNC_CACHE_TTL_SECS", default_value_t = 300)]
    pub cache_ttl_secs: u64,

    /// Total attempts per request, including the first
    #[arg(long, env = "SYNC_MAX_ATTEMPTS", default_value_t = 3)]
    pub max_attempts: u32,

    /// Base delay for linear backoff, in milliseconds
    #[arg(long, env = "SYNC_RETRY_DELAY_MS", default_value_t = 1000)]
    pub retry_delay_ms: u64,

    /// Fixed delay after a SprintHub 401/403/429, in milliseconds
    #[arg(long, env = "SYNC_AUTH_RETRY_DELAY_MS", default_value_t = 5000)]
    pub auth_retry_delay_ms: u64,

    /// Per-request timeout in seconds
    #[arg(long, env = "SYNC_REQUEST_TIMEOUT_SECS", default_value_t = 30)]
    pub request_timeout_secs: u64,

    /// Pause between pages and batches, in milliseconds
    #[arg(long, env = "SYNC_PAGE_DELAY_MS", default_value_t = 200)]
    pub page_delay_ms: u64,

    /// Extra pages with no recent records fetched before a stage stops
    #[arg(long, env = "SYNC_STALE_PAGE_TOLERANCE", default_value_t = 0)]
    pub stale_page_tolerance: u32,

    /// A record only overwrites the destination when newer by more than this
    #[arg(long, env = "SYNC_CLOCK_SKEW_SECS", default_value_t = 0)]
    pub clock_skew_secs: u64,

    /// Hours during which the sync runs, START-END (end exclusive)
    #[arg(long, env = "SYNC_WORKING_HOURS", default_value = "6-22")]
    pub working_hours: String,

    /// IANA timezone for the working-hours check
    #[arg(long, env = "SYNC_TIMEZONE", default_value = "America/Sao_Paulo")]
    pub timezone: String,

    /// Run even outside working hours
    #[arg(long, env = "FORCE_SYNC")]
    pub force: bool,

    /// Fetch and classify but write nothing
    #[arg(long, env = "SYNC_DRY_RUN")]
    pub dry_run: bool,

    /// Run continuously, waiting N seconds between runs
    #[arg(long, env = "SYNC_WATCH_INTERVAL_SECS")]
    pub watch_interval_secs: Option<u64>,
}
