//! slidesync - sync daemon and operator CLI
//!
//! `serve` runs the tier scheduler next to the admin API; the other
//! subcommands open the same stores for one-shot operator work.

mod config;
mod error;
mod output;
mod routes;

use std::io;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use slidesync_core::config::ConfigError;
use slidesync_core::db::ConflictFilter;
use slidesync_core::models::ConflictReason;
use slidesync_core::sync::Tier;
use slidesync_core::{EntityType, SyncEngine};
use thiserror::Error;

use config::AppConfig;
use routes::{app_router, AppState};

#[derive(Parser)]
#[command(name = "slidesync")]
#[command(about = "Keep the local, external and backup record stores in agreement")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Optional path to the local database file
    #[arg(long, value_name = "PATH", global = true)]
    db_path: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the tier scheduler and the admin API until interrupted (default)
    Serve,
    /// Run one sync cycle and exit
    Once {
        /// Only this entity type (e.g. `document`)
        #[arg(long, conflicts_with = "tier")]
        entity: Option<String>,
        /// Only the entity types of this tier (e.g. `critical`)
        #[arg(long)]
        tier: Option<String>,
        /// Propagate deletions on routes that allow it
        #[arg(long)]
        with_deletions: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show per-entity sync health
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Inspect or resolve ledger conflicts
    Conflicts {
        #[command(subcommand)]
        command: ConflictCommands,
    },
}

#[derive(Subcommand)]
enum ConflictCommands {
    /// List conflicts, newest first
    List {
        /// Filter by entity type
        #[arg(long)]
        entity: Option<String>,
        /// Filter by reason (e.g. `id_mapping_mismatch`)
        #[arg(long)]
        reason: Option<String>,
        /// Include resolved conflicts
        #[arg(long)]
        all: bool,
        /// Maximum number of entries
        #[arg(short, long, default_value = "50")]
        limit: u32,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Mark a conflict as resolved
    Resolve {
        /// Conflict ID
        id: i64,
    },
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Core(#[from] slidesync_core::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("Sync task failed: {0}")]
    SyncTask(String),
}

#[tokio::main]
async fn main() -> ExitCode {
    // Only load .env in development; production uses platform-native env injection.
    #[cfg(debug_assertions)]
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("slidesync=info".parse().expect("valid directive"))
                .add_directive("slidesync_core=info".parse().expect("valid directive")),
        )
        .with_writer(io::stderr)
        .init();

    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("Error: {error}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let config = AppConfig::from_env()?;
    let db_path = config.local_db_path(cli.db_path);
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let engine = config.engine.open_engine(&db_path).await?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            tracing::info!("Starting slidesync with config: {:?}", config);
            serve(&config, engine).await
        }
        Commands::Once {
            entity,
            tier,
            with_deletions,
            json,
        } => {
            let report = match tier {
                Some(tier) => {
                    let tier: Tier = tier.parse()?;
                    engine.run_tier_once(tier, with_deletions).await?
                }
                None => {
                    let entity = entity.map(|e| e.parse::<EntityType>()).transpose()?;
                    engine.trigger(entity, with_deletions).await?
                }
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                output::print_cycle(&report);
            }
            Ok(())
        }
        Commands::Status { json } => {
            let status = engine.status().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                output::print_status(&status);
            }
            Ok(())
        }
        Commands::Conflicts { command } => conflicts(&engine, command).await,
    }
}

async fn serve(config: &AppConfig, engine: SyncEngine) -> Result<(), CliError> {
    let listener = tokio::net::TcpListener::bind(&config.admin_bind_addr).await?;

    let runner = engine.clone();
    let sync_task = tokio::spawn(async move { runner.run_until_shutdown().await });

    let router = app_router(AppState::new(engine.clone(), config.admin_token.clone()));
    tracing::info!("slidesync admin API listening on {}", config.admin_bind_addr);

    let signalled = engine.clone();
    let served = axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            signalled.shutdown();
        })
        .await;

    // Stop the scheduler even when the listener failed.
    engine.shutdown();
    sync_task
        .await
        .map_err(|error| CliError::SyncTask(error.to_string()))?;
    served?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {error}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                tracing::error!("Failed to listen for SIGTERM: {error}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
    tracing::info!("Shutdown requested; finishing in-flight records");
}

async fn conflicts(engine: &SyncEngine, command: ConflictCommands) -> Result<(), CliError> {
    match command {
        ConflictCommands::List {
            entity,
            reason,
            all,
            limit,
            json,
        } => {
            let filter = ConflictFilter {
                entity_type: entity.map(|e| e.parse::<EntityType>()).transpose()?,
                reason: reason.map(|r| r.parse::<ConflictReason>()).transpose()?,
                include_resolved: all,
                limit: Some(limit),
            };
            let entries = engine.conflicts(&filter).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else {
                output::print_conflicts(&entries);
            }
        }
        ConflictCommands::Resolve { id } => {
            let entry = engine.resolve_conflict(id).await?;
            println!(
                "Resolved conflict #{} ({} '{}')",
                entry.id, entry.entity_type, entry.natural_key_attempted
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn serve_is_the_default_command() {
        let cli = Cli::parse_from(["slidesync"]);
        assert!(cli.command.is_none());
    }

    #[test]
    fn once_rejects_entity_and_tier_together() {
        let result = Cli::try_parse_from([
            "slidesync",
            "once",
            "--entity",
            "document",
            "--tier",
            "high",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn db_path_is_accepted_after_subcommand() {
        let cli = Cli::parse_from(["slidesync", "status", "--db-path", "/tmp/local.db"]);
        assert_eq!(cli.db_path, Some(PathBuf::from("/tmp/local.db")));
        assert!(matches!(cli.command, Some(Commands::Status { json: false })));
    }
}
