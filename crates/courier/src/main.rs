#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

//! The log-courier binary: CLI surface, logging bootstrap, and signal
//! handling around the shipping pipeline.
//!
//! Exit codes: 0 on clean shutdown or a passing `--config-test`, 1 on a
//! configuration error, 2 on a fatal runtime error.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use courier_agent::config::Config;
use courier_agent::harvester::codec;
use courier_agent::logger;
use courier_agent::{Agent, AgentError, AgentOptions};

#[derive(Debug, Parser)]
#[command(
    name = "log-courier",
    version,
    about = "Ships log files to an upstream receiver with at-least-once delivery"
)]
struct Cli {
    /// Configuration file to load
    #[arg(
        long,
        value_name = "FILE",
        default_value = "/etc/log-courier/log-courier.yaml"
    )]
    config: PathBuf,

    /// Read events from stdin instead of the configured file groups
    #[arg(long)]
    stdin: bool,

    /// On first contact, read new files from the beginning instead of the end
    #[arg(long)]
    from_beginning: bool,

    /// Validate the configuration and exit
    #[arg(long)]
    config_test: bool,

    /// List supported codecs and exit
    #[arg(long)]
    list_supported_codecs: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.list_supported_codecs {
        println!("Available codecs:");
        for name in codec::supported() {
            println!("  {name}");
        }
        return ExitCode::SUCCESS;
    }

    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            return ExitCode::from(1);
        }
    };

    if cli.config_test {
        println!("Configuration OK");
        return ExitCode::SUCCESS;
    }

    init_logging(&config);

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("AGENT | failed to start runtime: {e}");
            return ExitCode::from(2);
        }
    };

    match runtime.block_on(run(Arc::new(config), &cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("AGENT | fatal: {e}");
            ExitCode::from(2)
        }
    }
}

fn init_logging(config: &Config) {
    let directives = format!("rustls=off,{}", config.log_level.as_directive());
    let filter = EnvFilter::try_new(directives)
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_directive()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .event_format(logger::Formatter)
        .init();
}

async fn run(config: Arc<Config>, cli: &Cli) -> Result<(), AgentError> {
    info!("AGENT | log-courier {} starting", env!("CARGO_PKG_VERSION"));

    let mut agent = Agent::new(
        Arc::clone(&config),
        AgentOptions {
            stdin: cli.stdin,
            from_beginning: cli.from_beginning,
        },
    )?;
    agent.start();

    spawn_signal_handler(&agent, cli.config.clone());
    agent.wait().await;
    Ok(())
}

/// Watches for SIGINT/SIGTERM (clean shutdown) and SIGHUP (configuration
/// reload). A reload that fails to parse keeps the running configuration.
fn spawn_signal_handler(agent: &Agent, config_path: PathBuf) {
    let shutdown = agent.shutdown_token();
    let config_tx = agent.config_sender();

    tokio::spawn(async move {
        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(hangup) => hangup,
            Err(e) => {
                error!("AGENT | failed to install SIGHUP handler: {e}");
                return;
            }
        };
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(terminate) => terminate,
            Err(e) => {
                error!("AGENT | failed to install SIGTERM handler: {e}");
                return;
            }
        };

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("AGENT | interrupt received, shutting down");
                    shutdown.cancel();
                    return;
                }
                _ = terminate.recv() => {
                    info!("AGENT | termination requested, shutting down");
                    shutdown.cancel();
                    return;
                }
                _ = hangup.recv() => {
                    match Config::load(&config_path) {
                        Ok(reloaded) => {
                            info!("AGENT | configuration reload successful");
                            let _ = config_tx.send(Arc::new(reloaded));
                        }
                        Err(e) => {
                            error!("AGENT | configuration reload failed, keeping previous: {e}");
                        }
                    }
                }
            }
        }
    });
}
