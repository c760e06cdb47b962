// ABOUTME: CLI entry point for crm-sync
// ABOUTME: Parses commands and routes to run, schedule, and status handlers

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crm_sync::checkpoint::{Checkpoint, Cursor};
use crm_sync::config::{DailyWindow, SyncConfig, SyncMode, SyncPolicy};
use crm_sync::crm::CrmClient;
use crm_sync::mapper::FieldMap;
use crm_sync::orchestrator::{Orchestrator, RunState};
use crm_sync::scheduler::Scheduler;
use crm_sync::sink::PostgresSink;
use crm_sync::{db, statedir};

#[derive(Parser)]
#[command(name = "crm-sync")]
#[command(about = "CRM-to-warehouse lead synchronization engine", long_about = None)]
#[command(version)]
struct Cli {
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ModeArg {
    /// Open-ended page iteration over the lead list endpoint
    Pages,
    /// Targeted re-fetch of ids referenced by the opportunities table
    ById,
}

impl From<ModeArg> for SyncMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Pages => SyncMode::Pages,
            ModeArg::ById => SyncMode::IdList,
        }
    }
}

#[derive(Args, Clone)]
struct RunArgs {
    /// CRM API base URL
    #[arg(long, env = "CRM_API_URL")]
    api_url: String,
    /// CRM API token (sent as header and query parameter)
    #[arg(long, env = "CRM_API_TOKEN", hide_env_values = true)]
    api_token: String,
    /// Destination warehouse connection string
    #[arg(long, env = "WAREHOUSE_URL")]
    warehouse: String,
    /// Schema-qualified destination table
    #[arg(long, default_value = "analytics.crm_leads")]
    dest_table: String,
    /// Schema-qualified read-only opportunities table (id universe for by-id mode)
    #[arg(long, default_value = "analytics.opportunities")]
    opportunities_table: String,
    #[arg(long, value_enum, default_value = "pages")]
    mode: ModeArg,
    /// Sync policy: default, conservative, or fast
    #[arg(long, default_value = "default")]
    policy: String,
    /// TOML file overriding the built-in field map
    #[arg(long)]
    field_map: Option<PathBuf>,
    /// Ignore any previous checkpoint and start a fresh run
    #[arg(long)]
    no_resume: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute one sync run to completion (exit 0 on drain, 1 on abort)
    Run {
        #[command(flatten)]
        args: RunArgs,
    },
    /// Run the hourly scheduler inside a daily window, one child run per slot
    Schedule {
        #[command(flatten)]
        args: RunArgs,
        /// Daily window opening time (HH:MM, local)
        #[arg(long, default_value = "06:00")]
        window_open: String,
        /// Daily window closing time (HH:MM, local)
        #[arg(long, default_value = "23:00")]
        window_close: String,
    },
    /// Show the persisted checkpoint for a sync flavor
    Status {
        #[arg(long, value_enum, default_value = "pages")]
        mode: ModeArg,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // RUST_LOG takes precedence over --log, which defaults to "info"
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    match cli.command {
        Commands::Run { args } => run(args).await,
        Commands::Schedule {
            args,
            window_open,
            window_close,
        } => schedule(args, &window_open, &window_close).await,
        Commands::Status { mode } => status(mode.into()).await,
    }
}

fn build_config(args: &RunArgs) -> Result<SyncConfig> {
    url::Url::parse(&args.api_url)
        .with_context(|| format!("Invalid CRM API URL '{}'", args.api_url))?;
    url::Url::parse(&args.warehouse)
        .context("Invalid warehouse connection URL")?;

    let mode: SyncMode = args.mode.into();
    let (dest_schema, dest_table) = split_qualified(&args.dest_table)?;
    let checkpoint_path = statedir::checkpoint_path(mode.flavor())?;

    Ok(SyncConfig {
        api_base_url: args.api_url.clone(),
        api_token: args.api_token.clone(),
        warehouse_url: args.warehouse.clone(),
        dest_schema,
        dest_table,
        opportunities_table: args.opportunities_table.clone(),
        mode,
        policy: SyncPolicy::by_name(&args.policy)?,
        checkpoint_path,
    })
}

fn split_qualified(qualified: &str) -> Result<(String, String)> {
    match qualified.split_once('.') {
        Some((schema, table)) if !schema.is_empty() && !table.is_empty() => {
            Ok((schema.to_string(), table.to_string()))
        }
        _ => bail!(
            "Destination table must be schema-qualified as 'schema.table', got '{}'",
            qualified
        ),
    }
}

fn load_field_map(path: Option<&PathBuf>) -> Result<FieldMap> {
    match path {
        Some(path) => {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read field map from {:?}", path))?;
            let map = FieldMap::from_toml(&contents)
                .with_context(|| format!("Failed to parse field map from {:?}", path))?;
            tracing::info!("Loaded field map v{} from {:?}", map.version, path);
            Ok(map)
        }
        None => Ok(FieldMap::default()),
    }
}

async fn run(args: RunArgs) -> Result<()> {
    let config = build_config(&args)?;
    let field_map = load_field_map(args.field_map.as_ref())?;

    if args.no_resume {
        Checkpoint::delete(&config.checkpoint_path)
            .await
            .context("Failed to discard previous checkpoint")?;
    }

    let warehouse = db::connect_with_retry(&config.warehouse_url)
        .await
        .context("Failed to connect to warehouse")?;

    // INIT: establish the id universe before handing the client to the sink.
    // A resumed run replaces the universe with its checkpoint cursor, so the
    // reference scan only runs when starting fresh.
    let universe = match config.mode {
        SyncMode::Pages => Cursor::first_page(),
        SyncMode::IdList => match Checkpoint::load(&config.checkpoint_path).await? {
            Some(existing) => {
                tracing::info!("Checkpoint present; skipping reference id scan");
                existing.cursor
            }
            None => {
                let ids = db::list_reference_ids(&warehouse, &config.opportunities_table).await?;
                tracing::info!(
                    "Id-list mode: {} distinct lead ids referenced by {}",
                    ids.len(),
                    config.opportunities_table
                );
                Cursor::id_list(ids)
            }
        },
    };

    let sink = PostgresSink::new(warehouse, &config.dest_schema, &config.dest_table);
    let source = CrmClient::new(&config.api_base_url, &config.api_token)?;

    // Signals log a clean shutdown; in-flight calls are not cancelled
    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel::<()>(1);
    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to listen for Ctrl+C");
        tracing::info!("Received shutdown signal");
        let _ = shutdown_tx.send(());
    });

    let mut orchestrator = Orchestrator::new(&config, source, sink, field_map);
    let summary = orchestrator.run(universe, shutdown_rx).await?;

    if summary.state != RunState::Drained {
        // Interrupted before drain: not a clean completion
        std::process::exit(1);
    }
    Ok(())
}

async fn schedule(args: RunArgs, window_open: &str, window_close: &str) -> Result<()> {
    let opens_at = parse_hhmm(window_open)?;
    let closes_at = parse_hhmm(window_close)?;
    let window = DailyWindow::new(opens_at, closes_at)?;

    // Validate the run configuration up front so a bad flag fails here
    // instead of inside every spawned child
    build_config(&args)?;

    let mut run_args = vec![
        "--api-url".to_string(),
        args.api_url.clone(),
        "--api-token".to_string(),
        args.api_token.clone(),
        "--warehouse".to_string(),
        args.warehouse.clone(),
        "--dest-table".to_string(),
        args.dest_table.clone(),
        "--opportunities-table".to_string(),
        args.opportunities_table.clone(),
        "--mode".to_string(),
        match args.mode {
            ModeArg::Pages => "pages".to_string(),
            ModeArg::ById => "by-id".to_string(),
        },
        "--policy".to_string(),
        args.policy.clone(),
    ];
    if let Some(path) = &args.field_map {
        run_args.push("--field-map".to_string());
        run_args.push(path.display().to_string());
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel::<()>(1);
    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to listen for Ctrl+C");
        tracing::info!("Received shutdown signal");
        let _ = shutdown_tx.send(());
    });

    Scheduler::new(window, run_args).run(shutdown_rx).await
}

fn parse_hhmm(value: &str) -> Result<chrono::NaiveTime> {
    chrono::NaiveTime::parse_from_str(value, "%H:%M")
        .with_context(|| format!("Invalid time '{}', expected HH:MM", value))
}

async fn status(mode: SyncMode) -> Result<()> {
    let path = statedir::checkpoint_path(mode.flavor())?;
    match Checkpoint::load(&path).await? {
        Some(cp) => {
            println!("Checkpoint for flavor '{}':", mode.flavor());
            println!("  File: {:?}", path);
            println!("  Cursor: {:?}", cp.cursor);
            println!(
                "  Counters: processed={} success={} errors={} skipped={}",
                cp.counters.processed, cp.counters.success, cp.counters.errors, cp.counters.skipped
            );
            println!("  Updated: {}", cp.updated_at);
        }
        None => {
            println!(
                "No checkpoint for flavor '{}' (last run drained cleanly or never ran)",
                mode.flavor()
            );
        }
    }
    Ok(())
}
