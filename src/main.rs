use clap::Parser;
use tracing::{error, Level};

use auction_cache::{
    cli::{self, Cli, Commands},
    configuration::{AppState, State},
    error::Error,
    server,
};

#[tokio::main]
async fn main() -> Result<(), Error> {
    let result = app_main().await;

    if let Err(err) = &result {
        error!("{}", err);
    }

    result
}

async fn app_main() -> Result<(), Error> {
    let subscriber = tracing_subscriber::fmt()
        .compact()
        .with_level(true)
        .with_max_level({
            #[cfg(debug_assertions)]
            {
                Level::DEBUG
            }

            #[cfg(not(debug_assertions))]
            {
                Level::INFO
            }
        })
        .with_file(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    let command = Cli::parse().command.unwrap_or(Commands::Serve);

    let config = cli::init_config()?;
    let state = State::new(config).await?;

    match command {
        Commands::Serve => {
            let app_state = AppState::new(state);
            server::server_task(&app_state).await
        },
        Commands::Sync => cli::run_sync(&state).await,
        Commands::Refresh { force } => cli::run_refresh(&state, force).await,
    }
}
