mod config;

use clap::{Parser, Subcommand};
use config::{Config, ConfigError, LoggingConfig, MetricsConfig};
use exporter::SyncContext;
use metrics_exporter_statsd::StatsdBuilder;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "gtm-sync", about = "Sync tag manager configuration into the warehouse")]
struct Cli {
    /// YAML config file. Environment variables override its values.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Serve the HTTP trigger
    Serve,
    /// Run one sync and print its summary
    Run,
}

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("invalid sentry DSN: {0}")]
    SentryDsn(#[from] sentry::types::ParseDsnError),
    #[error("could not set up statsd: {0}")]
    Metrics(#[from] metrics_exporter_statsd::StatsdError),
    #[error(transparent)]
    Setup(#[from] exporter::SetupError),
    #[error("could not start runtime: {0}")]
    Runtime(#[from] std::io::Error),
    #[error(transparent)]
    Service(#[from] exporter::service::ServiceError),
    #[error(transparent)]
    Sync(#[from] exporter::SyncError),
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("gtm-sync: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), CliError> {
    let config = Config::load(cli.config.as_deref(), |var| std::env::var(var).ok())?;

    // Held until exit so buffered events are flushed.
    let _sentry = init_logging(config.common.logging.as_ref())?;
    if let Some(metrics) = &config.common.metrics {
        init_metrics(metrics)?;
    }

    let context = SyncContext::new(config.exporter)?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    match cli.command {
        CliCommand::Serve => {
            tracing::info!("Starting gtm-sync trigger");
            runtime.block_on(exporter::serve(context))?;
        }
        CliCommand::Run => {
            let summary = runtime.block_on(context.run())?;
            println!("{summary}");
        }
    }

    Ok(())
}

fn init_logging(
    logging: Option<&LoggingConfig>,
) -> Result<Option<sentry::ClientInitGuard>, CliError> {
    let guard = match logging {
        Some(logging) => Some(sentry::init(sentry::ClientOptions {
            dsn: Some(logging.sentry_dsn.parse()?),
            release: sentry::release_name!(),
            environment: logging.environment.clone().map(Into::into),
            ..Default::default()
        })),
        None => None,
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(guard.as_ref().map(|_| sentry::integrations::tracing::layer()))
        .init();

    Ok(guard)
}

fn init_metrics(config: &MetricsConfig) -> Result<(), CliError> {
    let recorder = StatsdBuilder::from(config.statsd_host.as_str(), config.statsd_port)
        .build(Some(config.prefix.as_str()))?;

    if metrics::set_global_recorder(recorder).is_err() {
        tracing::warn!("A metrics recorder was already installed");
    }
    shared::metrics_defs::describe_all(exporter::metrics_defs::ALL_METRICS);

    tracing::info!(
        host = %config.statsd_host,
        port = config.statsd_port,
        "Sending metrics to statsd"
    );
    Ok(())
}
