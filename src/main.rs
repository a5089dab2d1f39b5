mod config;
mod sandbox;
mod sentinel;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::sandbox::{Executor, HostExecutor};
use crate::sentinel::Sentinel;

fn print_help() {
    println!(
        "\
sandbox-sentinel v{}

Watches a sandbox directory, runs every artifact dropped into it once,
logs its combined output, then deletes it.

WARNING: artifacts run directly on this host, with the privileges,
working directory and environment of this process. There is no isolation.

USAGE:
    sandbox-sentinel [OPTIONS] [CONFIG_PATH]

ARGUMENTS:
    CONFIG_PATH    Path to TOML configuration file
                   [default: {} if present, otherwise built-in defaults]

OPTIONS:
    --once           Run a single cycle and exit
    -h, --help       Print this help message and exit
    -V, --version    Print version and exit

CONFIGURATION (all keys optional):
    watch_dir        Directory to watch            [default: ./sandbox]
    log_file         Audit log, append-only        [default: sandboxwatch.log]
    marker           Extension of executable files [default: .exe]
    interval_secs    Pause between scans           [default: 10]
    timeout_secs     Kill an artifact after this   [default: 300]

    Values may reference environment variables with ${{VAR_NAME}} syntax.

ENVIRONMENT VARIABLES:
    RUST_LOG         Log level filter for tracing
                     (e.g. debug, sandbox_sentinel=debug,warn)

EXAMPLES:
    sandbox-sentinel                            # ./sandbox, every 10s
    sandbox-sentinel /etc/sentinel/watch.toml   # custom config path
    sandbox-sentinel --once                     # one pass, e.g. in CI",
        env!("CARGO_PKG_VERSION"),
        config::DEFAULT_CONFIG_PATH,
    );
}

struct Args {
    config_path: Option<PathBuf>,
    once: bool,
}

fn parse_args() -> Result<Args> {
    let mut args = Args {
        config_path: None,
        once: false,
    };
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("sandbox-sentinel v{}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--once" => args.once = true,
            flag if flag.starts_with('-') => {
                return Err(anyhow!("Unknown option: {flag} (see --help)"));
            }
            path => {
                if args.config_path.is_some() {
                    return Err(anyhow!("Only one CONFIG_PATH may be given"));
                }
                args.config_path = Some(PathBuf::from(path));
            }
        }
    }
    Ok(args)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Handle --help / --version before anything else
    let args = parse_args()?;

    // Initialize logging (RUST_LOG=debug for debug mode)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("sandbox_sentinel=info")),
        )
        .init();

    info!("Sandbox Watcher Started.");

    let config = Config::resolve(args.config_path.as_deref())?;
    info!("Watch directory: {}", config.watch_dir.display());
    info!("Artifact marker: {}", config.marker);

    // The only fatal runtime error: without the directory there is nothing to watch
    sentinel::ensure_dir(&config.watch_dir)?;

    let executor: Arc<dyn Executor> = Arc::new(HostExecutor::new(config.timeout()));
    info!("Executor: {}", executor.description());
    warn!("Artifacts run unisolated on this host");

    let sentinel = Sentinel::new(config, executor);

    if args.once {
        let report = sentinel.run_cycle().await;
        info!(
            "Cycle complete: {} executed, {} failed, {} deleted, {} not deleted",
            report.executed, report.failed, report.deleted, report.delete_failed
        );
        return Ok(());
    }

    tokio::select! {
        _ = sentinel.run() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received, exiting");
        }
    }
    Ok(())
}
