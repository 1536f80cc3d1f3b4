//! sprinthub-sync: incremental SprintHub CRM → Supabase opportunity sync.
//!
//! Each run walks every stage of every configured funnel, keeps records
//! updated inside the recency window, and upserts them into a PostgREST table
//! with last-write-wins semantics. Meant to run from cron (one-shot) or as a
//! long-lived process (`--watch-interval-secs`).

#![warn(clippy::all)]

mod cache;
mod cli;
mod config;
mod crm;
mod decider;
mod destination;
mod drift;
mod mapper;
mod recency;
pub mod retry;
mod shutdown;
mod sync;
#[cfg(test)]
mod testing;
mod topology;
mod types;

use std::sync::Arc;

use chrono::Utc;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::{Command, SyncArgs};
use config::Config;
use crm::SprintHubClient;
use destination::PostgrestClient;
use sync::SyncPipeline;
use topology::Topology;
use types::{LogFormat, LogLevel};

fn init_logging(level: LogLevel, format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_filter()));
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

/// Print the funnel table and the stage → funnel lookup.
fn run_topology() {
    let topology = Topology::builtin();
    for funnel in topology.funnels() {
        println!("Funnel {} ({})", funnel.id, funnel.name);
        for stage in &funnel.stages {
            println!("  {:>5}  {}", stage.id, stage.name);
        }
        println!();
    }
    println!(
        "{} funnels, {} stages",
        topology.funnels().len(),
        topology.stage_count()
    );
}

/// HTTP clients shared by every cycle of a watch run.
struct Clients {
    source: Arc<SprintHubClient>,
    destination: Arc<PostgrestClient>,
}

impl Clients {
    fn new(config: &Config) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .user_agent(concat!("sprinthub-sync/", env!("CARGO_PKG_VERSION")))
            .build()?;

        let source = SprintHubClient::new(
            http.clone(),
            &config.sprinthub_base_url,
            &config.sprinthub_instance,
            &config.sprinthub_token,
            config.page_size,
            config.fetch_retry(),
        );
        let destination = PostgrestClient::new(
            http,
            &config.supabase_url,
            &config.supabase_key,
            &config.supabase_schema,
            &config.opportunities_table,
            &config.sync_log_table,
            config.write_retry(),
        );
        Ok(Self {
            source: Arc::new(source),
            destination: Arc::new(destination),
        })
    }

    /// A pipeline with its own cache and drift recorder, one per cycle.
    fn pipeline(&self, config: &Config) -> SyncPipeline {
        SyncPipeline::new(
            self.source.clone(),
            self.destination.clone(),
            Topology::builtin(),
            config.sync.clone(),
        )
    }
}

/// Run the sync command. Only configuration problems are errors; per-stage
/// failures end up in the run's counts.
async fn run_sync(args: SyncArgs) -> anyhow::Result<()> {
    let config = Config::from_cli(args)?;
    tracing::debug!(?config, "Loaded configuration");

    let clients = Clients::new(&config)?;
    let shutdown_token = shutdown::install_signal_handler()?;

    loop {
        if shutdown_token.is_cancelled() {
            tracing::info!("Shutdown requested, exiting...");
            break;
        }

        if config.within_working_hours(Utc::now()) {
            let result = clients.pipeline(&config).run(&shutdown_token).await;
            if result.counts().errors > 0 {
                tracing::warn!(
                    errors = result.counts().errors,
                    "Run finished with errors"
                );
            }
        } else {
            tracing::info!(
                start = config.working_hours.start,
                end = config.working_hours.end,
                timezone = %config.timezone,
                "Outside working hours, skipping run (FORCE_SYNC=true overrides)"
            );
        }

        let Some(interval) = config.watch_interval else {
            break;
        };
        if shutdown_token.is_cancelled() {
            tracing::info!("Shutdown requested, exiting...");
            break;
        }
        tracing::info!("Waiting {} seconds...", interval.as_secs());
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown_token.cancelled() => {
                tracing::info!("Shutdown during wait, exiting...");
                break;
            }
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();
    init_logging(cli.log_level, cli.log_format);

    match cli.effective_command() {
        Command::Topology => {
            run_topology();
            Ok(())
        }
        Command::Sync(args) => run_sync(args).await,
    }
}
