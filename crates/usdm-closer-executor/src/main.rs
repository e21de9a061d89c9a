/*
[INPUT]:  CLI arguments, YAML configuration, env credentials, OS signals
[OUTPUT]: Running closing executor with graceful shutdown
[POS]:    Binary entry point
[UPDATE]: When changing CLI flags, startup flow, or shutdown handling
*/

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use usdm_closer_executor::config::{AppConfig, EnvCredentials};
use usdm_closer_executor::Application;

#[derive(Parser, Debug)]
#[command(name = "usdm-closer", version, about = "Reduce-only closing executor for hedge-mode USD-M perpetuals")]
struct Cli {
    #[arg(long = "config", value_name = "PATH", default_value = "config.yaml")]
    config_path: PathBuf,
    #[arg(long = "log-level", value_name = "LEVEL", default_value = "info")]
    log_level: String,
    /// Validate configuration and exit without touching the exchange.
    #[arg(long = "dry-run")]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Cli::parse();
    let _log_guard = init_tracing(&args.log_level)?;

    info!(
        config_path = %args.config_path.display(),
        dry_run = args.dry_run,
        "starting usdm-closer"
    );

    let config = AppConfig::from_file(&args.config_path)?;
    info!(symbols = ?config.symbols(), "configuration loaded");

    if args.dry_run {
        info!("dry-run requested; configuration validated");
        return Ok(());
    }

    let credentials = EnvCredentials::from_env()?;
    let app = Application::new(config, credentials).context("initialize application")?;

    setup_signal_handlers(app.shutdown_token());

    app.run().await.context("run application")?;
    Ok(())
}

fn init_tracing(log_level: &str) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let filter = EnvFilter::try_new(log_level).context("invalid log level")?;

    if let Ok(log_dir) = std::env::var("USDM_CLOSER_LOG_DIR") {
        let appender = tracing_appender::rolling::daily(log_dir, "usdm-closer.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .with(fmt::layer().with_ansi(false).with_writer(writer))
            .try_init()
            .context("initialize tracing subscriber")?;
        return Ok(Some(guard));
    }

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init()
        .context("initialize tracing subscriber")?;
    Ok(None)
}

fn setup_signal_handlers(shutdown: CancellationToken) {
    let token = shutdown.clone();
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to install SIGINT handler");
            return;
        }
        info!("received SIGINT");
        token.cancel();
    });

    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let token = shutdown.clone();
        tokio::spawn(async move {
            match signal(SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                    info!("received SIGTERM");
                    token.cancel();
                }
                Err(err) => {
                    warn!(error = %err, "failed to install SIGTERM handler");
                }
            }
        });
    }
}
