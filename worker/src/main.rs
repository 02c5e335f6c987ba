//! Deploy Worker - Entry Point
//!
//! Runs one deployment: build, stream logs, upload artifacts, report status.
//! The process exit code mirrors the deployment outcome.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

use deploy_worker::app::options::AppOptions;
use deploy_worker::app::run::run;
use deploy_worker::app::settings::Settings;
use deploy_worker::logs::{init_logging, LogOptions};
use deploy_worker::utils::version_info;

use tracing::{error, info};

#[tokio::main]
async fn main() {
    let code = run_worker().await;
    std::process::exit(code);
}

async fn run_worker() -> i32 {
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
        return 0;
    }

    // Settings file (optional) plus environment overrides
    let settings_path = cli_args.get("config").map(PathBuf::from);
    let settings = match Settings::load(settings_path.as_deref()).await {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Unable to load settings: {}", e);
            return 1;
        }
    };

    // Initialize logging; the guard flushes the log file on drop
    let log_options = LogOptions {
        log_level: settings.log_level.clone(),
        log_dir: cli_args.get("log-dir").map(PathBuf::from),
        json_format: cli_args.contains_key("log-json"),
        ..Default::default()
    };
    let _log_guard = match init_logging(log_options) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            None
        }
    };

    if let Err(e) = settings.validate() {
        error!("Invalid settings: {}", e);
        return 1;
    }

    let options = AppOptions::from_settings(&settings);
    info!(
        version = %version.version,
        "Running Deploy Worker with options: {:?}",
        options
    );

    match run(options).await {
        Ok(report) => report.exit_code,
        Err(e) => {
            error!("Failed to run the worker: {e}");
            1
        }
    }
}
