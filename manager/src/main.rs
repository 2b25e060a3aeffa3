//! Deployment Manager - Entry Point

use std::collections::HashMap;
use std::env;
use std::time::Duration;

use dt_common::logs::{init_logging, LogOptions};
use dt_common::transport::mqtt::{self, BrokerAddress};
use dt_common::transport::Role;
use dt_common::utils::version_info;
use dt_manager::app::options::{AppOptions, ServerOptions};
use dt_manager::app::run::run;
use dt_manager::dispatch::dispatcher;
use dt_manager::errors::ManagerError;
use dt_manager::storage::layout::StorageLayout;
use dt_manager::storage::settings::Settings;

use tracing::{error, info};

#[tokio::main]
async fn main() {
    // Parse command line arguments
    let args: Vec<String> = env::args().collect();
    let mut cli_args: HashMap<String, String> = HashMap::new();

    for arg in args.iter().skip(1) {
        if let Some((key, value)) = arg.split_once('=') {
            let clean_key = key.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), value.to_string());
        } else if arg.starts_with("--") {
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
        file_prefix: "deployment-manager".to_string(),
        ..Default::default()
    };
    let _log_guard = match init_logging(log_options) {
        Ok(guard) => guard,
        Err(e) => {
            println!("Failed to initialize logging: {e}");
            None
        }
    };

    let options = match app_options(&settings) {
        Ok(options) => options,
        Err(e) => {
            error!("Invalid settings: {e}");
            std::process::exit(1);
        }
    };

    info!("Running deployment manager {} ({})", version.version, version.git_hash);
    if let Err(e) = run(options, await_shutdown_signal()).await {
        error!("Failed to run the manager: {e}");
        std::process::exit(1);
    }
}

fn app_options(settings: &Settings) -> Result<AppOptions, ManagerError> {
    Ok(AppOptions {
        server: ServerOptions {
            host: settings.http.host.clone(),
            port: settings.http.port,
        },
        transport: mqtt::Options {
            broker: BrokerAddress::parse(&settings.broker.url)?,
            namespace: settings.broker.namespace.clone(),
            role: Role::Manager,
            auth: settings.auth.clone(),
            ..Default::default()
        },
        dispatcher: dispatcher::Options {
            announce_delay: Duration::from_millis(settings.announce_delay_ms),
            resend_interval: Duration::from_secs(settings.resend_interval_secs),
            max_attempts: settings.max_attempts,
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
