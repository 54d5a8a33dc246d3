//! keystone-inspect binary: prints a JSON report about a database location.

use std::process::ExitCode;

use keystone_inspect::{config_path, inspect, load_config, InspectError};
use tracing_subscriber::EnvFilter;

fn run() -> Result<(), InspectError> {
    let (path, source) = config_path(std::env::args().nth(1), |key| std::env::var(key).ok());
    let config = load_config(&path)?;

    let filter =
        EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));

    // Logs go to stderr so stdout carries only the report.
    if config.logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    tracing::info!(path = %path, source = source.as_str(), "loaded configuration");

    let report = inspect(&config)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "inspection failed");
            eprintln!("keystone-inspect: {e}");
            ExitCode::FAILURE
        }
    }
}
