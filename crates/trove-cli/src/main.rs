use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use trove_storage::migration::ProjectMigrator;
use trove_storage::{LocalAdminDirResolver, LocalProjectRegistry};

#[derive(Parser)]
#[command(name = "trove")]
#[command(about = "Trove - versioned on-disk store for agent collaboration state", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Migrate every project under a projects root to the current storage version
    Migrate {
        /// Projects root directory (holds projects.json)
        #[arg(long)]
        root: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Migrate { root } => migrate(root).await?,
    }

    Ok(())
}

async fn migrate(root: PathBuf) -> Result<()> {
    let resolver = Arc::new(LocalAdminDirResolver::new(root.clone()));
    let migrator = ProjectMigrator::new(
        Arc::new(LocalProjectRegistry::new(root.clone())),
        resolver.clone(),
        resolver,
    );

    let outcome = migrator
        .migrate_all_projects()
        .await
        .with_context(|| format!("migration over {} failed", root.display()))?;

    println!(
        "Migrated {} project(s): {} succeeded, {} failed",
        outcome.total,
        outcome.succeeded.len(),
        outcome.failed.len()
    );
    for (project_id, error) in &outcome.failed {
        println!("  {}: {}", project_id, error);
    }
    if !outcome.all_succeeded() {
        std::process::exit(1);
    }
    Ok(())
}
