//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use enrichflow_clients::{EnrichmentClient, OpenRouterClient, StatusSink, WebhookSink};
use enrichflow_core::{
    IngestionConfig, IngestionConsumer, MemoryQueue, Pipeline, PipelineConfig, ReconcilerConfig,
    StatusReconciler, SubmissionQueue,
};
use enrichflow_shared::{
    AppConfig, ContentKey, init_config, load_config, load_config_from, validate_api_key,
};
use enrichflow_storage::{RecordStore, Storage};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// enrichflow: enrich content submissions and report their status.
#[derive(Parser)]
#[command(
    name = "enrichflow",
    version,
    about = "Ingest content submissions, enrich them with an LLM and report their status.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Config file (defaults to ~/.enrichflow/enrichflow.toml).
    #[arg(long, global = true, env = "ENRICHFLOW_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run the whole pipeline over a JSON-lines file of submissions until
    /// every record is enriched and reported.
    Run {
        /// One submission JSON object per line.
        #[arg(short, long)]
        input: PathBuf,
    },

    /// Ingest submissions into the store without enriching them.
    Ingest {
        /// One submission JSON object per line.
        #[arg(short, long)]
        input: PathBuf,
    },

    /// Push every unreported terminal status to the sink once.
    Sweep,

    /// Reset a record and enrich it again.
    Reprocess {
        /// Content id of the record.
        content_id: String,

        /// Content type; looked up by id when omitted.
        #[arg(short = 't', long)]
        content_type: Option<String>,
    },

    /// Print a stored record as JSON.
    Status {
        /// Content id of the record.
        content_id: String,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "enrichflow=info",
        1 => "enrichflow=debug",
        _ => "enrichflow=trace",
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.as_deref();
    match cli.command {
        Command::Run { input } => cmd_run(config_path, &input).await,
        Command::Ingest { input } => cmd_ingest(config_path, &input).await,
        Command::Sweep => cmd_sweep(config_path).await,
        Command::Reprocess {
            content_id,
            content_type,
        } => cmd_reprocess(config_path, &content_id, content_type.as_deref()).await,
        Command::Status { content_id } => cmd_status(config_path, &content_id).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show(config_path).await,
        },
    }
}

// ---------------------------------------------------------------------------
// Wiring helpers
// ---------------------------------------------------------------------------

fn resolve_config(path: Option<&Path>) -> Result<AppConfig> {
    let config = match path {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    Ok(config)
}

async fn open_store(config: &AppConfig) -> Result<Arc<dyn RecordStore>> {
    let path = config.store_path()?;
    info!(path = %path.display(), "opening record store");
    let storage = Storage::open(&path, config.store.change_feed_capacity).await?;
    Ok(Arc::new(storage))
}

fn build_client(config: &AppConfig) -> Result<Arc<dyn EnrichmentClient>> {
    let api_key = validate_api_key(config)?;
    let client = OpenRouterClient::from_config(&config.enrichment, api_key)?;
    Ok(Arc::new(client))
}

fn build_sink(config: &AppConfig) -> Result<Option<Arc<dyn StatusSink>>> {
    let sink = WebhookSink::from_config(&config.sink)?;
    Ok(sink.map(|sink| Arc::new(sink) as Arc<dyn StatusSink>))
}

fn load_queue(config: &AppConfig, input: &Path) -> Result<Arc<MemoryQueue>> {
    let content = std::fs::read_to_string(input)
        .map_err(|e| eyre!("cannot read {}: {e}", input.display()))?;
    let queue = MemoryQueue::new(config.queue.max_receive_count);
    let sent = queue.send_lines(&content)?;
    info!(messages = sent, input = %input.display(), "queued submissions");
    Ok(Arc::new(queue))
}

/// Cancel `token` on Ctrl-C.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, draining in-flight work");
            token.cancel();
        }
    });
}

fn print_dead_letters(queue: &MemoryQueue) {
    let dead = queue.dead_letters();
    if dead.is_empty() {
        return;
    }
    println!("  Dead-lettered messages:");
    for message in dead {
        println!("    {} ({} deliveries)", message.message_id, message.receive_count);
    }
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_run(config_path: Option<&Path>, input: &Path) -> Result<()> {
    let config = resolve_config(config_path)?;
    let client = build_client(&config)?;
    let sink = build_sink(&config)?;
    let store = open_store(&config).await?;
    let queue = load_queue(&config, input)?;

    let pipeline = Pipeline::new(
        store,
        queue.clone(),
        client,
        sink,
        PipelineConfig::from(&config),
    );

    let shutdown = CancellationToken::new();
    cancel_on_ctrl_c(shutdown.clone());
    let report = pipeline.run_until_idle(shutdown).await?;

    println!();
    println!("  Pipeline finished.");
    println!("  Batches:       {}", report.batches);
    println!("  Accepted:      {}", report.accepted);
    println!("  Rejected:      {}", report.rejected);
    println!("  Processed:     {}", report.processed);
    println!("  LLM errors:    {}", report.llm_errors);
    println!("  Store errors:  {}", report.dead_lettered);
    print_dead_letters(&queue);
    println!();

    Ok(())
}

async fn cmd_ingest(config_path: Option<&Path>, input: &Path) -> Result<()> {
    let config = resolve_config(config_path)?;
    let store = open_store(&config).await?;
    let queue = load_queue(&config, input)?;
    let consumer = IngestionConsumer::new(store, IngestionConfig::from(&config));

    let (mut inserted, mut updated, mut unchanged, mut rejected) = (0, 0, 0, 0);
    while queue.pending().await? > 0 {
        match consumer.drain_once(&*queue).await {
            Ok(Some(outcome)) => {
                inserted += outcome.inserted;
                updated += outcome.updated;
                unchanged += outcome.unchanged;
                rejected += outcome.failed.len();
            }
            Ok(None) => break,
            Err(e) => warn!(error = %e, "batch failed, retrying"),
        }
    }

    println!();
    println!("  Ingestion finished.");
    println!("  Inserted:  {inserted}");
    println!("  Updated:   {updated}");
    println!("  Unchanged: {unchanged}");
    println!("  Rejected:  {rejected}");
    print_dead_letters(&queue);
    println!();

    Ok(())
}

async fn cmd_sweep(config_path: Option<&Path>) -> Result<()> {
    let config = resolve_config(config_path)?;
    let sink = build_sink(&config)?
        .ok_or_else(|| eyre!("no status sink configured. Set sink.url in the config file."))?;
    let store = open_store(&config).await?;

    let reconciler = StatusReconciler::new(store, sink, ReconcilerConfig::from(&config));
    let report = reconciler.sweep().await?;

    println!();
    println!("  Sweep finished.");
    println!("  Examined: {}", report.examined);
    println!("  Reported: {}", report.reported);
    println!("  Failed:   {}", report.failed);
    println!("  Deferred: {}", report.deferred);
    println!("  Redriven: {}", report.redriven);
    println!();

    Ok(())
}

async fn cmd_reprocess(
    config_path: Option<&Path>,
    content_id: &str,
    content_type: Option<&str>,
) -> Result<()> {
    let config = resolve_config(config_path)?;
    let client = build_client(&config)?;
    let sink = build_sink(&config)?;
    let store = open_store(&config).await?;

    let key = match content_type {
        Some(content_type) => ContentKey::new(content_id, content_type),
        None => store
            .get_by_content_id(content_id)
            .await?
            .map(|record| record.key())
            .ok_or_else(|| eyre!("no record with content id '{content_id}'"))?,
    };

    let queue = Arc::new(MemoryQueue::new(config.queue.max_receive_count));
    let pipeline = Pipeline::new(store, queue, client, sink, PipelineConfig::from(&config));
    let outcome = pipeline.reprocess(&key).await?;

    println!("Reprocessed {key}: {outcome:?}");
    Ok(())
}

async fn cmd_status(config_path: Option<&Path>, content_id: &str) -> Result<()> {
    let config = resolve_config(config_path)?;
    let path = config.store_path()?;
    let storage = Storage::open_readonly(&path).await?;

    let record = storage
        .get_by_content_id(content_id)
        .await?
        .ok_or_else(|| eyre!("no record with content id '{content_id}'"))?;
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show(config_path: Option<&Path>) -> Result<()> {
    let config = resolve_config(config_path)?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}
