//! corrald — the corral communication manager daemon.
//!
//! ```text
//! corrald --config /etc/corral/cm.json
//! ```
//!
//! Exit codes: 0 on normal shutdown, 1 on unrecoverable init error,
//! 2 on bad configuration. SIGTERM triggers a graceful drain.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use corral_core::CmConfig;
use corrald::Core;

#[derive(Parser)]
#[command(name = "corrald", about = "corral communication manager daemon")]
struct Cli {
    /// Path to the daemon configuration file (JSON or YAML).
    #[arg(long, default_value = "/etc/corral/cm.json")]
    config: PathBuf,

    /// Emit logs as JSON.
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    init_tracing(cli.log_json);

    let config = match CmConfig::from_file(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "bad configuration");
            return ExitCode::from(2);
        }
    };

    let core = match Core::build(&config) {
        Ok(core) => core,
        Err(e) => {
            error!(error = %e, "initialization failed");
            return ExitCode::from(1);
        }
    };

    info!(config = %cli.config.display(), "corrald started");

    wait_for_terminate().await;

    core.shutdown().await;
    ExitCode::SUCCESS
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,corral=debug,corrald=debug".parse().unwrap());

    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn wait_for_terminate() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            error!(error = %e, "failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => info!("SIGTERM received"),
        result = tokio::signal::ctrl_c() => {
            if result.is_ok() {
                info!("interrupt received");
            }
        }
    }
}
