//! Command line interface.
//!
//! `run` starts the exporter, `version` prints build information and
//! `completion` generates shell completion scripts. Logging is configured
//! from global flags (or `RUST_LOG` when set).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::exporter::MetricsExporter;
use crate::server::MetricsServer;
use crate::systemd;

/// How often the liveness watchdog polls the exporter.
const ALIVE_CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// Task count above which the task sentinel reports unhealthy.
const TASK_THRESHOLD: usize = 100;

#[derive(Debug, Parser)]
#[command(
    name = "knx-exporter",
    version,
    about = "Exports values from the KNX bus as prometheus metrics"
)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the exporter which exports the received values from all
    /// configured group addresses to prometheus.
    Run(RunArgs),
    /// Print version information
    Version,
    /// Generate a shell completion script
    Completion {
        /// The shell to generate the script for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Debug, clap::Args)]
struct RunArgs {
    /// The port where all metrics should be exported.
    #[arg(short, long, default_value_t = 8080, env = "KNX_EXPORTER_PORT")]
    port: u16,

    /// The knx configuration file.
    #[arg(
        short = 'f',
        long,
        default_value = "config.yaml",
        env = "KNX_EXPORTER_CONFIG_FILE"
    )]
    config_file: PathBuf,

    /// The restart behaviour when liveness degrades.
    #[arg(short, long, value_enum, default_value_t = RestartPolicy::Health)]
    restart: RestartPolicy,

    /// Also export process metrics.
    #[arg(short = 'g', long, default_value_t = true, action = clap::ArgAction::Set)]
    with_process_metrics: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum RestartPolicy {
    /// Degraded liveness only shows up on /live; the supervisor acts.
    Health,
    /// Degraded liveness terminates the process.
    Exit,
}

/// Parse arguments and run the selected command.
pub async fn execute() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level, cli.log_format)?;

    match cli.command {
        Command::Run(args) => run(args).await,
        Command::Version => {
            println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Command::Completion { shell } => {
            let mut command = Cli::command();
            let name = command.get_name().to_owned();
            clap_complete::generate(shell, &mut command, name, &mut std::io::stdout());
            Ok(())
        }
    }
}

fn init_logging(level: &str, format: LogFormat) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .context("invalid log level")?;

    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
    Ok(())
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    let mut server = MetricsServer::new(args.port);
    if args.with_process_metrics {
        register_process_metrics(&server);
    }

    let exporter = Arc::new(
        MetricsExporter::from_file(&args.config_file, server.registry())
            .context("unable to init metrics exporter")?,
    );
    exporter
        .run(shutdown.child_token())
        .await
        .context("unable to connect to the knx bus")?;

    server.set_store(exporter.store());
    let liveness_exporter = Arc::clone(&exporter);
    server.add_liveness_check("knxConnection", move || liveness_exporter.is_alive());
    server.add_liveness_check("task-threshold", task_count_check);

    tokio::spawn(alive_watchdog(
        Arc::clone(&exporter),
        shutdown.clone(),
        args.restart,
    ));

    systemd::notify_ready();
    server
        .run(shutdown.clone())
        .await
        .context("can not run metrics server")?;

    info!("shutting down");
    exporter.close();
    Ok(())
}

/// Cancel the token on SIGINT or SIGTERM.
fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let interrupt = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut terminate =
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(signal) => signal,
                    Err(e) => {
                        error!(error = %e, "can not install SIGTERM handler");
                        let _ = interrupt.await;
                        shutdown.cancel();
                        return;
                    }
                };
            tokio::select! {
                _ = interrupt => {}
                _ = terminate.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = interrupt.await;
        }
        info!("received shutdown signal");
        shutdown.cancel();
    });
}

/// Periodically check the exporter and report degradation.
async fn alive_watchdog(
    exporter: Arc<MetricsExporter>,
    shutdown: CancellationToken,
    restart: RestartPolicy,
) {
    let mut ticker = tokio::time::interval(ALIVE_CHECK_INTERVAL);
    ticker.tick().await; // the first tick fires immediately
    loop {
        tokio::select! {
            () = shutdown.cancelled() => return,
            _ = ticker.tick() => {}
        }
        if let Err(e) = exporter.is_alive() {
            warn!(error = %e, "metrics exporter is not alive anymore");
            systemd::notify_degraded(&format!("Metrics Exporter is not alive anymore: {e}"));
            if restart == RestartPolicy::Exit {
                shutdown.cancel();
                return;
            }
        }
    }
}

/// Equivalent of a goroutine count sentinel: an ever growing number of tasks
/// points at a leak somewhere in the pipeline.
fn task_count_check() -> Result<(), String> {
    let handle = tokio::runtime::Handle::try_current()
        .map_err(|_| "not running inside a tokio runtime".to_owned())?;
    let tasks = handle.metrics().num_alive_tasks();
    if tasks > TASK_THRESHOLD {
        return Err(format!("too many alive tasks: {tasks} > {TASK_THRESHOLD}"));
    }
    Ok(())
}

/// Register collectors for the exporter process itself.
fn register_process_metrics(server: &MetricsServer) {
    #[cfg(target_os = "linux")]
    {
        use prometheus::process_collector::ProcessCollector;
        if let Err(e) = server
            .registry()
            .register(Box::new(ProcessCollector::for_self()))
        {
            warn!(error = %e, "can not register process metrics");
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = server;
        warn!("process metrics are only available on linux");
    }
}
