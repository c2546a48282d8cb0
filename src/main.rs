use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use cti_migrate::checkpoint::CheckpointStore;
use cti_migrate::config::{self, MigrateConfig};
use cti_migrate::migrate::{Migration, MigrationOptions};
use cti_migrate::publish::{AmqpBroker, BrokerEndpoint, Publisher};
use cti_migrate::source::GraphqlSource;
use cti_migrate::stage::Stage;
use std::process::ExitCode;
use std::time::Instant;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "cti-migrate")]
#[command(about = "Migrate a threat-intelligence knowledge base into STIX bundles over AMQP")]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Checkpoint file recording where to resume
    #[arg(long, global = true, env = "CTI_MIGRATE_STATE_FILE", default_value = config::DEFAULT_STATE_FILE)]
    state_file: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run (or resume) the migration
    Run(RunArgs),
    /// Show the stored checkpoint
    Status,
    /// Discard the checkpoint so the next run starts over
    Reset(ResetArgs),
}

#[derive(Args)]
struct RunArgs {
    /// GraphQL endpoint of the source platform
    #[arg(long, env = "CTI_MIGRATE_SOURCE_URL")]
    source_url: Option<String>,

    /// API token of the source platform
    #[arg(long, env = "CTI_MIGRATE_SOURCE_TOKEN", hide_env_values = true)]
    source_token: Option<String>,

    /// Connector identifier of the destination import connector
    #[arg(long, env = "CTI_MIGRATE_CONNECTOR_ID")]
    connector_id: Option<String>,

    #[arg(long, env = "CTI_MIGRATE_BROKER_HOST")]
    broker_host: Option<String>,

    #[arg(long, env = "CTI_MIGRATE_BROKER_PORT", default_value_t = config::DEFAULT_BROKER_PORT)]
    broker_port: u16,

    #[arg(long, env = "CTI_MIGRATE_BROKER_USER")]
    broker_user: Option<String>,

    #[arg(long, env = "CTI_MIGRATE_BROKER_PASSWORD", hide_env_values = true)]
    broker_password: Option<String>,

    /// Exchange the ingestion workers consume from
    #[arg(long, env = "CTI_MIGRATE_EXCHANGE", default_value = config::DEFAULT_PUSH_EXCHANGE)]
    exchange: String,

    /// Entities requested per page
    #[arg(long, default_value_t = config::DEFAULT_PAGE_SIZE)]
    page_size: u32,

    /// Stop after this many pages (for testing)
    #[arg(long)]
    max_pages: Option<u64>,

    /// Hide progress bars
    #[arg(long)]
    no_progress: bool,
}

#[derive(Args)]
struct ResetArgs {
    /// Confirm discarding the stored progress
    #[arg(long)]
    yes: bool,
}

fn run_migration(args: RunArgs, state_file: String) -> Result<()> {
    let config = MigrateConfig {
        source_url: args.source_url,
        source_token: args.source_token,
        connector_id: args.connector_id,
        broker_host: args.broker_host,
        broker_port: args.broker_port,
        broker_user: args.broker_user,
        broker_password: args.broker_password,
        exchange: args.exchange,
        state_file,
        page_size: args.page_size,
    }
    .validate()?;

    let options = MigrationOptions {
        page_size: config.page_size,
        max_pages: args.max_pages,
        show_progress: !args.no_progress,
    };

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    let start = Instant::now();
    let stats = rt.block_on(async {
        let source = GraphqlSource::new(&config.source_url, &config.source_token)
            .context("Failed to build source client")?;
        let endpoint = BrokerEndpoint {
            host: config.broker_host.clone(),
            port: config.broker_port,
            user: config.broker_user.clone(),
            password: config.broker_password.clone(),
        };
        let broker = AmqpBroker::connect(endpoint, &config.exchange)
            .await
            .context("Failed to connect to broker")?;
        let publisher = Publisher::new(broker, config.exchange.clone(), config.routing_key());
        let store = CheckpointStore::new(&config.state_file);

        let mut migration = Migration::new(&source, publisher, store, options);
        let stats = migration.run().await?;

        if let Err(e) = migration.into_publisher().into_broker().close().await {
            warn!(error = %e, "Failed to close broker connection");
        }
        anyhow::Ok(stats)
    })?;

    let elapsed = start.elapsed();
    println!();
    println!("=== Summary ===");
    println!("Total time:         {:.2}s", elapsed.as_secs_f64());
    println!("Stages completed:   {}", stats.stages_completed);
    println!("Pages processed:    {}", stats.pages_processed);
    println!("Entities fetched:   {}", stats.entities_fetched);
    println!("Bundles published:  {}", stats.bundles_published);
    println!("Publish retries:    {}", stats.publish_retries);
    println!("Entities skipped:   {}", stats.entities_skipped);
    if stats.halted {
        println!();
        println!("Stopped at page limit; run again to resume.");
    }

    Ok(())
}

fn show_status(state_file: &str) -> Result<()> {
    let path = std::path::Path::new(state_file);
    if !path.exists() {
        println!("No checkpoint at {state_file}; a run would start from the beginning.");
        return Ok(());
    }
    let state = CheckpointStore::new(path)
        .load()
        .with_context(|| format!("Failed to read checkpoint: {state_file}"))?;

    let stage = state.active_stage();
    println!("Checkpoint:  {state_file}");
    println!("Stage:       {stage}");
    println!("Cursor:      {}", state.cursor.as_deref().unwrap_or("(start)"));
    println!("Processed:   {}", state.processed_count);
    let remaining: Vec<String> = Stage::all()
        .iter()
        .filter(|s| s.step() > stage.step())
        .map(|s| s.label().to_string())
        .collect();
    if !remaining.is_empty() {
        println!("Then:        {}", remaining.join(", "));
    }
    Ok(())
}

fn reset_state(args: ResetArgs, state_file: &str) -> Result<()> {
    if !args.yes {
        bail!("Refusing to reset {state_file} without --yes");
    }
    CheckpointStore::new(state_file)
        .reset()
        .with_context(|| format!("Failed to reset checkpoint: {state_file}"))?;
    println!("Checkpoint reset: {state_file}");
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {e}");
    }

    let result = match cli.command {
        Commands::Run(args) => run_migration(args, cli.state_file),
        Commands::Status => show_status(&cli.state_file),
        Commands::Reset(args) => reset_state(args, &cli.state_file),
    };

    match result {
        Ok(()) => {
            info!("Completed successfully");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Error: {:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
