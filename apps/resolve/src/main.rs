use resolve::arguments::{Arguments, default_log_dir};
use resolve::error::ResolveError;
use resolve::logger::initialize as LoggerInitialize;
use resolve::resolver::resolve_all;

use std::fs::create_dir_all;
use std::process::ExitCode;

use clap::Parser;
use log::{debug, error, info};

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), ResolveError> {
    // .env must be loaded before parsing so its credentials reach the env-backed flags
    let dotenv = dotenvy::dotenv();
    let arguments = Arguments::parse();

    let log_dir = arguments.log_dir.clone().unwrap_or_else(default_log_dir);
    create_dir_all(&log_dir)
        .map_err(|e| ResolveError::resolve(format!("Failed to create log directory: {e}")))?;

    // Initialize logger FIRST
    LoggerInitialize(&log_dir)?;
    info!("Log directory: {}", log_dir.display());

    match dotenv {
        Ok(path) => info!("Loaded environment from {}", path.display()),
        Err(e) => debug!("No .env file loaded: {e}"),
    }

    let client = arguments.client_builder().build().await?;
    let outcome = resolve_all(&client, &arguments.references).await;
    client.close().await;

    for value in outcome? {
        println!("{value}");
    }
    Ok(())
}
