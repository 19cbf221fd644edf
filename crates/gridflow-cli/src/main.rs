mod config;
mod flow_cmds;
mod run_cmds;
mod serve_cmd;

#[cfg(test)]
mod test_util;

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use sqlx::PgPool;

use gridflow_bus::nats::NatsBus;
use gridflow_bus::EventBus;
use gridflow_core::{PgFlowCatalog, Scheduler};
use gridflow_db::pool;

use config::{CliOverrides, GridflowConfig};

#[derive(Parser)]
#[command(name = "gridflow", about = "Workflow execution engine: flow-run scheduling, task dispatch, and retry")]
struct Cli {
    /// PostgreSQL connection URL (overrides GRIDFLOW_DATABASE_URL / config file)
    #[arg(long, global = true)]
    database_url: Option<String>,
    /// NATS server URL (overrides GRIDFLOW_BUS_URL / config file)
    #[arg(long, global = true)]
    bus_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a gridflow config file (no database or bus required)
    Init {
        /// PostgreSQL connection URL
        #[arg(long, default_value = "postgresql://localhost:5432/gridflow")]
        db_url: String,
        /// NATS server URL
        #[arg(long, default_value = "nats://127.0.0.1:4222")]
        bus_url: String,
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
    /// Create the database (if missing) and run migrations
    DbInit,
    /// Flow template management
    Flow {
        #[command(subcommand)]
        command: FlowCommands,
    },
    /// Flow-run lifecycle: submit, inspect, cancel, retry
    Run {
        #[command(subcommand)]
        command: RunCommands,
    },
    /// Run the scheduler, callback router, and liveness manager in-process
    /// until interrupted
    Serve,
}

#[derive(Subcommand)]
enum FlowCommands {
    /// Register a flow template from a TOML definition file
    Register {
        /// Path to the flow definition TOML file
        file: String,
    },
    /// List every registered flow template
    List,
    /// Show details for one flow template
    Show {
        /// Flow ID
        flow_id: String,
    },
}

#[derive(Subcommand)]
enum RunCommands {
    /// Submit a new flow-run request
    Submit {
        /// Flow ID to run
        flow_id: String,
        /// Parameters as a JSON object (default: `{}`)
        #[arg(long, default_value = "{}")]
        parameters: String,
        /// Caller-supplied user ID, recorded on the flow-run
        #[arg(long)]
        user_id: Option<String>,
        /// Idempotency key: a second submit with the same ID is a no-op
        #[arg(long)]
        request_id: Option<String>,
    },
    /// Show a flow-run's status and per-task progress
    Status {
        /// Flow-run ID
        flow_run_id: String,
    },
    /// Show the flow_run_events audit trail for a flow-run
    Events {
        /// Flow-run ID
        flow_run_id: String,
    },
    /// Cancel a flow-run: stop pending tasks, signal running workers, fail the run
    Cancel {
        /// Flow-run ID
        flow_run_id: String,
        /// Caller-supplied user ID, recorded on the cancellation event
        #[arg(long)]
        user_id: Option<String>,
    },
    /// Retry a failed flow-run whose retry budget isn't exhausted
    Retry {
        /// Flow-run ID
        flow_run_id: String,
    },
}

/// `gridflow init`: write a config file.
fn cmd_init(db_url: &str, bus_url: &str, force: bool) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let cfg = config::ConfigFile {
        database: config::DatabaseSection {
            url: db_url.to_string(),
        },
        bus: config::BusSection {
            url: bus_url.to_string(),
        },
        scheduler: config::SchedulerSection::default(),
    };

    config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    println!("  database.url = {db_url}");
    println!("  bus.url = {bus_url}");
    println!();
    println!("Next: run `gridflow db-init` to create and migrate the database.");

    Ok(())
}

/// `gridflow db-init`: create the database if missing, then run migrations.
async fn cmd_db_init(resolved: &GridflowConfig) -> anyhow::Result<()> {
    println!("Initializing gridflow database...");

    pool::ensure_database_exists(&resolved.db_config).await?;
    let db_pool = pool::create_pool(&resolved.db_config).await?;

    let migrations_path = pool::default_migrations_path();
    pool::run_migrations(&db_pool, migrations_path).await?;

    let counts = pool::table_counts(&db_pool).await?;
    println!("Database ready. Tables:");
    for (table, count) in &counts {
        println!("  {table}: {count} rows");
    }

    db_pool.close().await;
    println!("gridflow db-init complete.");
    Ok(())
}

/// Builds a [`Scheduler`] backed by a real NATS connection, for the
/// `run submit`/`cancel`/`retry` commands that drive the scheduler
/// directly rather than only publishing a request for `gridflow serve` to
/// pick up later.
async fn build_scheduler(pool: PgPool, resolved: &GridflowConfig) -> anyhow::Result<Scheduler> {
    let bus: Arc<dyn EventBus> = Arc::new(
        NatsBus::connect(&resolved.bus_config.url)
            .await
            .with_context(|| format!("failed to connect to bus at {}", resolved.bus_config.url))?,
    );
    gridflow_core::streams::ensure_topology(
        bus.as_ref(),
        resolved.scheduler_config.ack_wait,
        resolved.scheduler_config.max_deliver,
    )
    .await
    .context("failed to provision bus topology")?;

    let catalog = Arc::new(PgFlowCatalog::new(pool.clone()));
    Ok(Scheduler::new(pool, bus, catalog, resolved.scheduler_config.clone()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let overrides = CliOverrides {
        database_url: cli.database_url.clone(),
        bus_url: cli.bus_url.clone(),
    };

    match cli.command {
        Commands::Init {
            db_url,
            bus_url,
            force,
        } => {
            cmd_init(&db_url, &bus_url, force)?;
        }
        Commands::DbInit => {
            let resolved = GridflowConfig::resolve(&overrides)?;
            cmd_db_init(&resolved).await?;
        }
        Commands::Flow { command } => {
            let resolved = GridflowConfig::resolve(&overrides)?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = match command {
                FlowCommands::Register { file } => flow_cmds::run_register(&db_pool, &file).await,
                FlowCommands::List => flow_cmds::run_list(&db_pool).await,
                FlowCommands::Show { flow_id } => flow_cmds::run_show(&db_pool, &flow_id).await,
            };
            db_pool.close().await;
            result?;
        }
        Commands::Run { command } => {
            let resolved = GridflowConfig::resolve(&overrides)?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = match command {
                RunCommands::Submit {
                    flow_id,
                    parameters,
                    user_id,
                    request_id,
                } => {
                    let parameters: serde_json::Value = serde_json::from_str(&parameters)
                        .context("--parameters must be valid JSON")?;
                    let scheduler = build_scheduler(db_pool.clone(), &resolved).await?;
                    run_cmds::run_submit(&scheduler, &flow_id, parameters, user_id, request_id)
                        .await
                }
                RunCommands::Status { flow_run_id } => {
                    run_cmds::run_status(&db_pool, &flow_run_id).await
                }
                RunCommands::Events { flow_run_id } => {
                    run_cmds::run_events(&db_pool, &flow_run_id).await
                }
                RunCommands::Cancel { flow_run_id, user_id } => {
                    let scheduler = build_scheduler(db_pool.clone(), &resolved).await?;
                    run_cmds::run_cancel(&scheduler, &flow_run_id, user_id).await
                }
                RunCommands::Retry { flow_run_id } => {
                    let scheduler = build_scheduler(db_pool.clone(), &resolved).await?;
                    run_cmds::run_retry(&scheduler, &flow_run_id).await
                }
            };
            db_pool.close().await;
            result?;
        }
        Commands::Serve => {
            let resolved = GridflowConfig::resolve(&overrides)?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result =
                serve_cmd::run_serve(db_pool.clone(), &resolved.bus_config.url, resolved.scheduler_config)
                    .await;
            db_pool.close().await;
            result?;
        }
    }

    Ok(())
}
