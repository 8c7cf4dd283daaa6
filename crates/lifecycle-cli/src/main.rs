use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use lifecycle_reconcile::{
    connect_store, handle_from_config, IncompletePass, ReconcileConfig, ReconcileSummary,
    Scheduler, Trigger,
};
use lifecycle_web::AppState;
use tokio::sync::watch;
use tracing::{debug, info};

#[derive(Debug, Parser)]
#[command(name = "lifecycle-cli")]
#[command(about = "Campaign lifecycle reconciler")]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// YAML file overriding environment configuration
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run a single reconciliation pass and exit
    Reconcile {
        /// Report planned status changes without writing them
        #[arg(long)]
        dry_run: bool,
    },
    /// Run the scheduler and the admin surface until interrupted
    Run,
    /// Apply database migrations
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = ReconcileConfig::from_env();
    if let Some(path) = &cli.config {
        config = config.with_file(path)?;
    }
    debug!(
        interval_secs = config.interval_secs,
        cron = ?config.cron,
        dry_run = config.dry_run,
        "configuration loaded"
    );

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Reconcile { dry_run } => {
            config.dry_run |= dry_run;
            let handle = handle_from_config(&config).await?;
            match handle.trigger(Trigger::Manual).await {
                Ok(summary) => print_summary(&summary),
                Err(err) => {
                    if let Some(partial) = IncompletePass::summary_of(&err) {
                        print_summary(partial);
                    }
                    return Err(err);
                }
            }
        }
        Commands::Run => run_service(config).await?,
        Commands::Migrate => {
            connect_store(&config)
                .await?
                .migrate()
                .await
                .context("applying migrations")?;
            println!("migrations applied");
        }
    }

    Ok(())
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(verbose >= 2)
        .init();
}

fn print_summary(summary: &ReconcileSummary) {
    println!(
        "reconcile complete: run_id={} updated={} skipped={} failed={} dry_run={}",
        summary.run_id,
        summary.rows_updated(),
        summary.rows_skipped(),
        summary.rows_failed(),
        summary.dry_run
    );
    if summary.dry_run {
        for t in summary
            .campaigns
            .transitions
            .iter()
            .chain(&summary.participations.transitions)
        {
            println!("  {}: {} -> {}", t.key, t.from, t.to);
        }
    }
}

async fn run_service(config: ReconcileConfig) -> Result<()> {
    let handle = handle_from_config(&config).await?;
    info!(
        zone = %handle.reconciler().zone(),
        cadence = ?config.cadence(),
        dry_run = config.dry_run,
        "starting reconciler"
    );

    let (stop_tx, stop_rx) = watch::channel(false);
    let scheduler = Scheduler::new(handle.clone(), config.cadence());
    let mut scheduler_task = tokio::spawn(scheduler.run_until(wait_for_stop(stop_rx.clone())));
    let mut web_task = tokio::spawn(lifecycle_web::serve(
        AppState::new(handle),
        config.web_port,
        wait_for_stop(stop_rx),
    ));

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("listening for ctrl-c")?;
            info!("shutdown requested");
        }
        joined = &mut scheduler_task => {
            joined.context("scheduler task panicked")??;
            bail!("scheduler stopped unexpectedly");
        }
        joined = &mut web_task => {
            joined.context("admin surface task panicked")??;
            bail!("admin surface stopped unexpectedly");
        }
    }

    let _ = stop_tx.send(true);
    scheduler_task.await.context("scheduler task panicked")??;
    web_task.await.context("admin surface task panicked")??;
    Ok(())
}

async fn wait_for_stop(mut stop: watch::Receiver<bool>) {
    // a dropped sender also counts as a stop
    let _ = stop.wait_for(|stopped| *stopped).await;
}
