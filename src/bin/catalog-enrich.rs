//! catalog-enrich - checkpointed genre enrichment for one shard of the catalog.
//!
//! Each process owns a static id range and its own rate limiter; run several with
//! disjoint ranges (see `plan`) to scale out.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use enrich::store::{CheckpointStore, Sink, WorkItem};
use enrich::upstream::{FixtureTransport, HttpTransport, Transport};
use enrich::{
    plan_shards, prewarm_caches, shard_status, CheckpointedBatchProcessor, EnrichConfig,
    EnrichContext, RunState, ShardSpec, ShutdownSignal,
};
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

const IMPORT_CHUNK: usize = 1_000;

#[derive(Parser)]
#[command(name = "catalog-enrich")]
#[command(about = "Enrich catalog items with genre tags from a rate-limited metadata API")]
#[command(version)]
struct Cli {
    /// YAML configuration file
    #[arg(long, global = true, env = "ENRICH_CONFIG")]
    config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Args, Clone, Copy)]
struct ShardArgs {
    /// First id of this shard's range (inclusive)
    #[arg(long)]
    min_id: i64,

    /// Last id of this shard's range (inclusive)
    #[arg(long)]
    max_id: i64,

    /// Shard key; names the checkpoint and cache files
    #[arg(long, default_value_t = 0)]
    process_id: u32,
}

#[derive(Subcommand)]
enum Commands {
    /// Enrich one shard, resuming from its checkpoint.
    ///
    /// Shards running at the same time must share a postgres sink; redb and memory
    /// sinks belong to a single process.
    Run {
        #[command(flatten)]
        shard: ShardArgs,

        /// Concurrent items per window
        #[arg(long)]
        max_workers: Option<usize>,

        /// Ids per scan window
        #[arg(long)]
        batch_size: Option<i64>,

        /// Per-shard ceiling in calls per minute
        #[arg(long)]
        max_rate: Option<f64>,

        /// Answer upstream calls from a local fixture catalog instead of the network
        #[arg(long)]
        fixture: Option<PathBuf>,

        /// Start without the reachability probe
        #[arg(long)]
        skip_probe: bool,
    },

    /// Show a shard's checkpoint, caches and sink progress
    Status {
        #[command(flatten)]
        shard: ShardArgs,

        /// Skip the sink query and report local files only
        #[arg(long)]
        offline: bool,
    },

    /// Split an id range into shards and print one run command per shard.
    ///
    /// The commands are meant to run concurrently, which needs a postgres sink.
    Plan {
        #[arg(long)]
        min_id: i64,

        #[arg(long)]
        max_id: i64,

        #[arg(long)]
        shards: u32,

        /// Calls per minute allowed across all shards together
        #[arg(long)]
        global_rate: f64,
    },

    /// Copy one shard's hit cache into other shards' caches
    Prewarm {
        #[arg(long)]
        from_shard: u32,

        /// Comma-separated target shard ids
        #[arg(long, value_delimiter = ',', required = true)]
        to_shards: Vec<u32>,
    },

    /// Load work items from a JSON-lines file into the configured sink
    Import {
        #[arg(long)]
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is normal.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.log_format);

    let config = EnrichConfig::load(cli.config.as_deref()).context("failed to load configuration")?;

    match cli.command {
        Commands::Run {
            shard,
            max_workers,
            batch_size,
            max_rate,
            fixture,
            skip_probe,
        } => {
            let mut config = config;
            if let Some(workers) = max_workers {
                config.batch.max_workers = workers;
            }
            if let Some(batch_size) = batch_size {
                config.batch.batch_size = batch_size;
            }
            if let Some(rate) = max_rate {
                config.set_max_rate(rate);
            }
            config.validate().context("invalid settings")?;
            run(config, shard, fixture.as_deref(), skip_probe).await
        }
        Commands::Status { shard, offline } => {
            let range = ShardSpec::new(shard.process_id, shard.min_id, shard.max_id)?;
            let sink = if offline {
                None
            } else {
                Some(config.sink.build().await.context("failed to open sink")?)
            };
            let status = shard_status(&config.state_dir, &range, sink.as_deref()).await?;
            print!("{status}");
            Ok(())
        }
        Commands::Plan {
            min_id,
            max_id,
            shards,
            global_rate,
        } => {
            let plans = plan_shards(min_id, max_id, shards, global_rate)?;
            if plans.len() > 1 && !config.sink.is_shared() {
                tracing::warn!(
                    sink = config.sink.backend_name(),
                    "configured sink cannot be shared by concurrent shards; configure postgres before launching these"
                );
                println!(
                    "# warning: sink '{}' is single-process; these shards need a postgres sink",
                    config.sink.backend_name()
                );
            }
            println!(
                "# {} shards, {:.2}/min each, {:.2}/min aggregate ceiling",
                plans.len(),
                global_rate / f64::from(shards),
                global_rate
            );
            for plan in &plans {
                println!("# {plan}");
                println!("{}", plan.command_line("catalog-enrich"));
            }
            Ok(())
        }
        Commands::Prewarm {
            from_shard,
            to_shards,
        } => {
            let added = prewarm_caches(&config.state_dir, from_shard, &to_shards)?;
            for (shard, count) in added {
                println!("shard {shard}: {count} entries added");
            }
            Ok(())
        }
        Commands::Import { file } => {
            let sink = config.sink.build().await.context("failed to open sink")?;
            let imported = import(&*sink, &file).await?;
            tracing::info!(imported, file = %file.display(), "import finished");
            Ok(())
        }
    }
}

fn init_tracing(level: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn run(
    config: EnrichConfig,
    shard: ShardArgs,
    fixture: Option<&Path>,
    skip_probe: bool,
) -> Result<()> {
    let range = ShardSpec::new(shard.process_id, shard.min_id, shard.max_id)?;

    let transport: Arc<dyn Transport> = match fixture {
        Some(path) => {
            tracing::info!(fixture = %path.display(), "using fixture catalog, no network calls");
            Arc::new(FixtureTransport::from_path(path)?)
        }
        None => {
            let credentials = config.credentials();
            if credentials.is_none() {
                tracing::warn!("ENRICH_CLIENT_ID / ENRICH_CLIENT_SECRET not set, calling upstream unauthenticated");
            }
            Arc::new(HttpTransport::new(config.upstream.clone(), credentials)?)
        }
    };

    let ctx = EnrichContext::from_config(&config, range.process_id, transport).await?;
    tracing::info!(
        process_id = range.process_id,
        min_id = range.min_id,
        max_id = range.max_id,
        max_workers = config.batch.max_workers,
        batch_size = config.batch.batch_size,
        max_rate_per_minute = config.rate_limit.max_rate_per_minute,
        "shard starting; this ceiling is per shard, the aggregate is shards x max rate"
    );

    ctx.check_sink(&config.sink, &range).await?;

    if !skip_probe {
        ctx.client
            .probe()
            .await
            .context("upstream unreachable or credentials rejected")?;
    }

    let processor = CheckpointedBatchProcessor::new(
        ctx,
        config.batch.clone(),
        range,
        CheckpointStore::for_shard(&config.state_dir, range.process_id),
    )
    .with_shutdown(ShutdownSignal::from_os_signals());

    let summary = processor.run().await?;
    match summary.state {
        RunState::Completed => tracing::info!(
            completed = summary.completed,
            failed = summary.failed,
            "shard complete"
        ),
        RunState::Interrupted => tracing::info!(
            boundary_id = summary.boundary_id,
            "interrupted; rerun with the same arguments to resume"
        ),
    }
    Ok(())
}

async fn import(sink: &dyn Sink, path: &Path) -> Result<usize> {
    let file = std::fs::File::open(path).with_context(|| format!("cannot open {}", path.display()))?;
    let mut chunk = Vec::with_capacity(IMPORT_CHUNK);
    let mut imported = 0;

    for (line_no, line) in std::io::BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let item: WorkItem = serde_json::from_str(&line)
            .with_context(|| format!("{}:{}: invalid work item", path.display(), line_no + 1))?;
        chunk.push(item);
        if chunk.len() == IMPORT_CHUNK {
            imported += sink.import_items(std::mem::take(&mut chunk)).await?;
        }
    }
    if !chunk.is_empty() {
        imported += sink.import_items(chunk).await?;
    }
    Ok(imported)
}
