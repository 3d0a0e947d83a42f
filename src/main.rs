mod config;
mod domain;
mod escalation;
mod host;
mod plugins;
mod policy;

use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::escalation::FailureLog;
use crate::host::{Host, HostError};

/// Used when no config path is given and the file exists.
const DEFAULT_CONFIG_PATH: &str = "config/host.toml";

fn print_help() {
    println!(
        "\
sandbox-host v{}

Runs an untrusted module inside a capability-restricted isolation domain
and contains the failures of the background work it leaves behind.

USAGE:
    sandbox-host [OPTIONS] [CONFIG_PATH]

ARGUMENTS:
    CONFIG_PATH    Path to TOML configuration file
                   [default: {DEFAULT_CONFIG_PATH} if present, built-in defaults otherwise]

OPTIONS:
    --simulate-host-fault    Fault a background unit in host context after
                             the domain is unloaded (the process aborts)
    -h, --help               Print this help message and exit
    -V, --version            Print version and exit

ENVIRONMENT VARIABLES:
    Variables are referenced in the config file via ${{VAR_NAME}} syntax.

    RUST_LOG    Log level filter for tracing
                (e.g. debug, sandbox_host=debug,warn)

EXIT STATUS:
    0      The module ran; every background failure was observed
    1      Invalid configuration or the domain could not be created
    abort  A finalization pass revealed an unobserved background failure

EXAMPLES:
    sandbox-host                          # uses {DEFAULT_CONFIG_PATH} or defaults
    sandbox-host --simulate-host-fault    # host-context failure, aborts
    RUST_LOG=debug sandbox-host           # with debug logging",
        env!("CARGO_PKG_VERSION"),
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut config_path = None;
    let mut simulate_host_fault = false;

    // Handle flags before anything else
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("sandbox-host v{}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--simulate-host-fault" => simulate_host_fault = true,
            other if other.starts_with('-') => {
                return Err(anyhow!("Unknown option: {other} (see --help)"));
            }
            _ => config_path = Some(arg.clone()),
        }
    }

    // Initialize logging (RUST_LOG=debug for debug mode). Failure blocks own stdout.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("sandbox_host=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut config = match config_path {
        Some(path) => {
            info!("Loading configuration from {path}");
            Config::load(&path)?
        }
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
            info!("Loading configuration from {DEFAULT_CONFIG_PATH}");
            Config::load(DEFAULT_CONFIG_PATH)?
        }
        None => {
            info!("No configuration file, using defaults");
            Config::default()
        }
    };
    if simulate_host_fault {
        config.host.simulate_host_fault = true;
    }

    info!("Domain: {}", config.domain.name);
    info!("Module: {}", config.domain.module_path.display());

    let catalog = plugins::catalog();
    if catalog.is_empty() {
        return Err(anyhow!("No modules are registered"));
    }
    info!("Modules: {} registered ({})", catalog.len(), catalog.names().join(", "));

    let host = Host::new(Arc::new(FailureLog::stdout()));
    match host.run(&config, Arc::new(catalog)).await {
        Ok(report) => {
            if report.execution_failed {
                info!("Module failed synchronously; the failure was contained");
            }
            Ok(())
        }
        Err(HostError::Fatal(unobserved)) => {
            error!("Terminating: {unobserved}");
            std::process::abort();
        }
        Err(e) => Err(anyhow!(e)),
    }
}
