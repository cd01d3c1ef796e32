use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "lset-cli")]
#[command(about = "Leak Site Entity Tracker command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Merge the staging set into the archive and reset staging.
    Reconcile,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Reconcile) {
        Commands::Reconcile => {
            info!("starting entity reconciliation");
            let summary = lset_sync::run_reconcile_from_env().await?;
            info!(
                run_id = %summary.run_id,
                staged = summary.staged,
                added = summary.added,
                updated = summary.updated,
                archive_total = summary.archive_total,
                "entity reconciliation completed successfully"
            );
            println!(
                "reconcile complete: run_id={} staged={} added={} updated={} archive_total={}",
                summary.run_id, summary.staged, summary.added, summary.updated, summary.archive_total
            );
        }
    }

    Ok(())
}
