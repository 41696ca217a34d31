use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::{error, info};

use certa::commons::clock::SystemClock;
use certa::config::Config;
use certa::constants::{CERTA_DEFAULT_CONFIG_FILE, CERTA_ENV_CONFIG, CERTA_SERVER_APP};
use certa::server::audit::LogAuditSink;
use certa::server::manager::CaManager;
use certa::server::scheduler::TokioScheduler;
use certa::server::store::MemoryCertStore;

/// The Certa certificate authority daemon.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Path to the config file.
    #[arg(short, long, env = CERTA_ENV_CONFIG, default_value = CERTA_DEFAULT_CONFIG_FILE)]
    config: PathBuf,
}

fn main() {
    let args = Args::parse();

    let config = match Config::read_config(&args.config).and_then(|config| config.verify().map(|_| config)) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Cannot use config file '{}': {e}", args.config.display());
            ::std::process::exit(1);
        }
    };

    if let Err(e) = config.init_logging() {
        eprintln!("{e}");
        ::std::process::exit(1);
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Cannot start runtime: {e}");
            ::std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run(config)) {
        error!("{CERTA_SERVER_APP} failed: {e}");
        ::std::process::exit(1);
    }
}

async fn run(config: Config) -> Result<(), String> {
    let clock = Arc::new(SystemClock);
    let manager = CaManager::build(
        &config,
        Arc::new(MemoryCertStore::new(clock.clone())),
        Arc::new(TokioScheduler::current()),
        Arc::new(LogAuditSink),
        clock,
    )
    .map_err(|e| format!("cannot start CAs: {e}"))?;

    info!("{CERTA_SERVER_APP} is running with CAs {}", manager.ca_names().join(", "));

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| format!("cannot wait for shutdown signal: {e}"))?;

    info!("Shutting down");
    manager
        .shutdown(Duration::from_secs(config.shutdown_grace_seconds))
        .await;
    Ok(())
}
