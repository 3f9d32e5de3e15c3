// Bitcoin Sprint gateway node — entry point.

mod config;
mod supervisor;

use anyhow::Result;
use clap::{Parser, Subcommand};
use config::Config;
use supervisor::{wait_for_shutdown_signal, StartupError, Supervisor};
use tracing::{error, info};

// Exit codes, per the operational contract.
const EXIT_OK: i32 = 0;
const EXIT_CONFIG: i32 = 1;
const EXIT_UPSTREAM: i32 = 2;
const EXIT_BIND: i32 = 3;
const EXIT_ENTROPY: i32 = 4;

#[derive(Parser)]
#[clap(name = "sprint-node")]
#[clap(author, version, about = "Bitcoin Sprint - blockchain acceleration gateway", long_about = None)]
struct Cli {
    /// Configuration file path
    #[clap(short, long, value_name = "FILE", default_value = "config.toml")]
    config: String,

    /// Subcommand
    #[clap(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway
    Start,

    /// Write a default configuration file
    Init {
        /// Output configuration file path
        #[clap(short, long, default_value = "config.toml")]
        output: String,
    },
}

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    let cli = Cli::parse();

    let code = match cli.command {
        Some(Commands::Init { output }) => match init_config(&output) {
            Ok(()) => EXIT_OK,
            Err(e) => {
                eprintln!("failed to write config: {e}");
                EXIT_CONFIG
            }
        },
        Some(Commands::Start) | None => start_gateway(&cli.config).await,
    };

    std::process::exit(code);
}

/// Write a default configuration file
fn init_config(output: &str) -> Result<()> {
    let config = Config::default();
    config.to_file(output)?;
    println!("Configuration file created: {output}");
    println!("Edit the configuration and run: sprint-node start");
    Ok(())
}

/// Run the gateway until a shutdown signal arrives.
async fn start_gateway(config_path: &str) -> i32 {
    let config = if std::path::Path::new(config_path).exists() {
        match Config::from_file(config_path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("configuration error: {e}");
                return EXIT_CONFIG;
            }
        }
    } else {
        eprintln!("configuration file {config_path} not found, using defaults");
        Config::default()
    };

    if let Err(e) = init_logging(&config) {
        eprintln!("logging init failed: {e}");
        return EXIT_CONFIG;
    }

    if let Err(e) = config.validate() {
        error!("configuration invalid: {e}");
        return EXIT_CONFIG;
    }

    info!(version = env!("CARGO_PKG_VERSION"), "bitcoin sprint starting");

    let mut supervisor = match Supervisor::build(config) {
        Ok(supervisor) => supervisor,
        Err(StartupError::EntropyUnavailable(missing)) => {
            error!(?missing, "required entropy sources unavailable");
            return EXIT_ENTROPY;
        }
        Err(e) => {
            error!("startup failed: {e}");
            return EXIT_CONFIG;
        }
    };

    if let Err(e) = supervisor.start() {
        error!("component start failed: {e}");
        return EXIT_CONFIG;
    }

    if let Err(StartupError::UpstreamUnreachable) = supervisor.check_upstreams().await {
        error!("fail_fast: no upstream reachable");
        supervisor.stop().await;
        return EXIT_UPSTREAM;
    }

    let addr = match supervisor.api_addr() {
        Ok(addr) => addr,
        Err(e) => {
            error!("api address invalid: {e}");
            supervisor.stop().await;
            return EXIT_CONFIG;
        }
    };

    let shutdown = supervisor.shutdown_handler();
    let signal_handler = shutdown.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        signal_handler.shutdown();
    });

    let mut shutdown_rx = shutdown.subscribe();
    let serve_result = sprint_api::serve(supervisor.context(), addr, async move {
        let _ = shutdown_rx.recv().await;
    })
    .await;

    let code = match serve_result {
        Ok(()) => EXIT_OK,
        Err(sprint_api::ServeError::Bind { addr, source }) => {
            error!(%addr, error = %source, "bind failed");
            EXIT_BIND
        }
        Err(e) => {
            error!("server error: {e}");
            EXIT_CONFIG
        }
    };

    supervisor.stop().await;
    info!("bitcoin sprint stopped");
    code
}

/// Initialize logging
fn init_logging(config: &Config) -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));

    // Note: JSON formatting requires additional features
    // For now, use standard formatting
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    Ok(())
}
