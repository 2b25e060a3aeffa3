//! Deployment Agent - Entry Point
//!
//! Runs on every fleet member, receives tasks from the manager through the
//! broker and reports their logs back.

use std::collections::HashMap;
use std::env;
use std::time::Duration;

use dt_agent::app::options::{AppOptions, StorageOptions};
use dt_agent::app::run::run;
use dt_agent::deploy::engine;
use dt_agent::errors::AgentError;
use dt_agent::storage::layout::StorageLayout;
use dt_agent::storage::settings::Settings;
use dt_agent::storage::state::Identity;
use dt_agent::workers::{listener, reporter};
use dt_common::logs::{init_logging, LogOptions};
use dt_common::transport::mqtt::{self, BrokerAddress};
use dt_common::transport::Role;
use dt_common::utils::version_info;

use tracing::{error, info};

#[tokio::main]
async fn main() {
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
            Err(e) => eprintln!("Failed to print version: {e}"),
        }
        return;
    }

    let layout = match cli_args.get("dir") {
        Some(dir) => StorageLayout::new(dir),
        None => StorageLayout::default(),
    };

    // Retrieve the settings file, defaults when absent
    let settings_file = layout.settings_file();
    let mut settings = if settings_file.exists().await {
        match settings_file.read_json::<Settings>().await {
            Ok(settings) => settings,
            Err(e) => {
                eprintln!("Unable to read settings file: {e}");
                std::process::exit(1);
            }
        }
    } else {
        Settings::default()
    };
    settings.apply_env();
    settings.resolve_key_paths(&layout);

    // Initialize logging
    let log_options = LogOptions {
        log_level: settings.log_level.clone(),
        json_format: settings.log_json,
        log_dir: settings
            .log_to_file
            .then(|| layout.logs_dir().path().to_path_buf()),
        file_prefix: "deployment-agent".to_string(),
        ..Default::default()
    };
    let _log_guard = match init_logging(log_options) {
        Ok(guard) => guard,
        Err(e) => {
            println!("Failed to initialize logging: {e}");
            None
        }
    };

    let options = match app_options(&settings, layout) {
        Ok(options) => options,
        Err(e) => {
            error!("Invalid settings: {e}");
            std::process::exit(1);
        }
    };

    info!("Running deployment agent {} ({})", version.version, version.git_hash);
    if let Err(e) = run(options, await_shutdown_signal()).await {
        error!("Failed to run the agent: {e}");
        std::process::exit(1);
    }
}

fn app_options(settings: &Settings, layout: StorageLayout) -> Result<AppOptions, AgentError> {
    Ok(AppOptions {
        storage: StorageOptions { layout },
        identity: Identity {
            id: settings.id.clone(),
            tags: settings.tags.clone(),
            location: settings.location,
        },
        transport: mqtt::Options {
            broker: BrokerAddress::parse(&settings.broker.url)?,
            namespace: settings.broker.namespace.clone(),
            role: Role::Agent,
            auth: settings.auth.clone(),
            ..Default::default()
        },
        engine: engine::Options {
            kill_grace: Duration::from_secs(settings.kill_grace_secs),
            ..Default::default()
        },
        listener: listener::Options {
            advertise_interval: Duration::from_secs(settings.advertise_interval_secs),
        },
        reporter: reporter::Options {
            memory_capacity: settings.memory_log_capacity,
            outgoing_capacity: settings.outgoing_log_capacity,
            flush_interval: Duration::from_secs(settings.flush_interval_secs),
        },
        ..Default::default()
    })
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
                _ => {
                    error!("Unable to install signal handlers, waiting for Ctrl+C only");
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
