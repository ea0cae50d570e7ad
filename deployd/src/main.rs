//! deployd - Entry Point
//!
//! Deploys git branches onto remote servers and keeps a REVISION marker on
//! each target. Runs as a relay-connected daemon or performs a single
//! deployment from the command line.

use std::collections::HashMap;
use std::env;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use deployd::app::options::AppOptions;
use deployd::app::run::{deploy_once, run};
use deployd::deploy::RunOutcome;
use deployd::filesys::file::File;
use deployd::logs::{init_logging, LogOptions};
use deployd::storage::layout::StorageLayout;
use deployd::storage::settings::Settings;
use deployd::utils::version_info;

use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    // Parse command line arguments
    let args: Vec<String> = env::args().collect();
    let mut cli_args: HashMap<String, String> = HashMap::new();

    for arg in args.iter().skip(1) {
        if let Some((key, value)) = arg.split_once('=') {
            // Handle --key=value format
            let clean_key = key.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), value.to_string());
        } else if arg.starts_with("--") {
            // Handle standalone flags like --version
            let clean_key = arg.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), "true".to_string());
        }
    }

    // Print version and exit
    let version = version_info();
    if cli_args.contains_key("version") {
        match serde_json::to_string_pretty(&version) {
            Ok(json) => println!("{}", json),
            Err(_) => println!("{}", version.version),
        }
        return ExitCode::SUCCESS;
    }

    // Retrieve the settings file
    let default_layout = StorageLayout::default();
    let settings_file = match cli_args.get("settings") {
        Some(path) => File::new(path),
        None => default_layout.settings_file(),
    };
    let settings = match load_settings(&settings_file).await {
        Ok(settings) => Arc::new(settings),
        Err(e) => {
            eprintln!("Unable to read settings file: {:#}", e);
            return ExitCode::FAILURE;
        }
    };
    let layout = settings
        .storage_dir
        .clone()
        .map(StorageLayout::new)
        .unwrap_or(default_layout);

    // Initialize logging
    let log_options = LogOptions {
        log_level: settings.log_level.clone(),
        log_dir: settings.log_dir.clone(),
        json_format: settings.log_json,
        ..Default::default()
    };
    let _log_guard = match init_logging(log_options) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            None
        }
    };

    // Single deployment in the foreground
    if let Some(deployment_id) = cli_args.get("deploy") {
        let list_mode = cli_args.contains_key("list");
        return match deploy_once(settings, layout, deployment_id, list_mode).await {
            Ok(RunOutcome::ChangesListed(changes)) => {
                match serde_json::to_string_pretty(&changes) {
                    Ok(json) => println!("{}", json),
                    Err(e) => error!("Failed to serialize change list: {}", e),
                }
                ExitCode::SUCCESS
            }
            Ok(_) => ExitCode::SUCCESS,
            Err(e) => {
                error!("Deployment {} failed: {}", deployment_id, e);
                ExitCode::FAILURE
            }
        };
    }

    // Run the daemon
    let options = AppOptions::from_settings(&settings, layout);
    info!("Running deployd with options: {:?}", options);
    match run(version.version, options, settings, await_shutdown_signal()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Failed to run deployd: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn load_settings(file: &File) -> anyhow::Result<Settings> {
    file.read_json::<Settings>()
        .await
        .with_context(|| format!("reading {}", file.path().display()))
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
                _ => {
                    error!("Failed to install signal handlers, falling back to Ctrl+C");
                    let _ = tokio::signal::ctrl_c().await;
                    return;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down...");
            }
            _ = sigint.recv() => {
                info!("SIGINT received, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Ctrl+C received, shutting down...");
    }
}
