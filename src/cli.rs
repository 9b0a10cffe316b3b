//! Command-line interface
//!
//! Runs the HTTP server by default, or a single sync / refresh cycle for
//! cron jobs and manual maintenance.

use clap::{Parser, Subcommand};

use crate::{
    configuration::{get_configuration, set_configuration, Config, State},
    error::Error,
    model::SyncReport,
};

/// Auction bidder cache
#[derive(Parser)]
#[command(name = "auction-cache")]
#[command(about = "Stampede-safe cache in front of a slow analytics query", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Commands {
    /// Run the HTTP server (default if no command specified)
    Serve,

    /// Run one cancellation sync cycle and exit
    Sync,

    /// Run one cache lookup and print where the data came from
    Refresh {
        /// Refresh even when the cached entry is still fresh
        #[arg(long)]
        force: bool,
    },
}

/// Initialize configuration and return Config
pub fn init_config() -> Result<Config, Error> {
    set_configuration()?;
    get_configuration()
}

pub async fn run_sync(state: &State) -> Result<(), Error> {
    let Some(syncer) = &state.syncer else {
        return Err(Error::ConfigurationError(String::from(
            "RPC_URL is not set, cancellation sync disabled",
        )));
    };

    match syncer.try_sync().await? {
        SyncReport::Skipped => {
            tracing::info!("Another sync cycle holds the lock, nothing done");
        },
        SyncReport::UpToDate { next_block, head } => {
            tracing::info!("Up to date (next block {}, head {})", next_block, head);
        },
        SyncReport::Synced {
            from_block,
            next_block,
            chunks,
            events,
        } => {
            tracing::info!(
                "Synced blocks {}..{} in {} chunks, {} cancellations",
                from_block,
                next_block - 1,
                chunks,
                events
            );
        },
    }

    let counters = syncer.counters().await?;
    tracing::info!("{} bidders with cancellations", counters.len());

    Ok(())
}

pub async fn run_refresh(state: &State, force: bool) -> Result<(), Error> {
    let data = state
        .orchestrator
        .get_data(
            &state.config.cache_target(),
            &state.config.refresh_policy,
            force,
        )
        .await?;

    tracing::info!(
        source = ?data.source,
        rows = data.rows.len(),
        age_seconds = data.age_seconds,
        next_refresh_seconds = data.next_refresh_seconds,
        "cache lookup done"
    );

    if let Some(warning) = data.warning {
        tracing::warn!("{}", warning);
    }

    Ok(())
}
