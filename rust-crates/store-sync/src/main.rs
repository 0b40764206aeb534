use anyhow::{
    Context,
    anyhow,
};
use clap::Parser;
use std::{
    fs,
    path::{
        Path,
        PathBuf,
    },
};
use store_sync::{
    IngestionPipeline,
    ProgressTracker,
    app::{
        RunState,
        SyncSession,
        channel_log_source::ChannelLogSource,
        file_log_source::FileLogSource,
        init_tracing,
        sled_storage::SledSnapshotStorage,
        snapshot_storage::{
            NoSnapshotStorage,
            SnapshotStorage,
        },
    },
    config::SyncConfig,
    schema::TableId,
};

#[derive(Parser, Debug)]
#[command(version, about = "Replay chain logs into a local table store", long_about = None)]
struct Args {
    #[arg(short, long)]
    config: PathBuf,

    /// JSON-lines file of `batch` and `latest_block` events.
    #[arg(short, long)]
    logs: PathBuf,

    /// Overrides `snapshot_dir` from the config.
    #[arg(long)]
    snapshot_dir: Option<PathBuf>,

    /// Print the records of `namespace__table` once the replay ends.
    #[arg(long)]
    dump: Option<String>,

    #[arg(short, long, default_value = "false")]
    tracing: bool,
}

async fn handle_interupt() {
    let res = tokio::signal::ctrl_c().await;
    match res {
        Ok(_) => {
            tracing::info!("Received interrupt, exiting");
        }
        Err(_) => {
            tracing::warn!("Received interrupt error, exiting anyway");
        }
    }
}

async fn replay<Snapshots: SnapshotStorage>(
    config: &SyncConfig,
    logs: &Path,
    snapshots: Snapshots,
    dump: Option<&TableId>,
) -> anyhow::Result<()> {
    let schema = config.schema().context("building schema from config")?;
    let pipeline = IngestionPipeline::with_snapshots(schema, snapshots).with_progress(
        ProgressTracker::new(config.progress.min_percentage_delta),
    );
    if let Some(table) = dump {
        if pipeline.schema().table(table).is_none() {
            return Err(anyhow!("--dump names unknown table {table}"));
        }
    }
    let file = FileLogSource::open(logs).await?;
    let (source, sender) = ChannelLogSource::from_config(config);
    let producer = tokio::spawn(sender.forward(file));
    let mut session = SyncSession::new(source, pipeline);
    let resume_from = session.start()?;
    tracing::info!(resume_from, logs = %logs.display(), "Starting replay");

    loop {
        let interrupt = handle_interupt();
        match session.run(interrupt).await? {
            RunState::Continue => continue,
            RunState::Halted => {
                let reason = session
                    .pipeline()
                    .halt_reason()
                    .unwrap_or("unknown error")
                    .to_string();
                return Err(anyhow!(
                    "replay halted, resume from block {}: {reason}",
                    session.resume_from()
                ));
            }
            RunState::Exit => break,
        }
    }

    producer.abort();
    match producer.await {
        Ok(forwarded) => {
            let forwarded = forwarded.context("reading log file")?;
            tracing::info!(forwarded, "log file fully queued");
        }
        Err(err) if err.is_cancelled() => {
            tracing::info!("stopped reading log file before the end");
        }
        Err(err) => return Err(err).context("log file reader task"),
    }

    let progress = session.pipeline().progress().snapshot();
    println!(
        "block {} of {} ({:.1}%), step {:?}, live {}",
        progress.current_block,
        progress.latest_block,
        progress.percentage,
        progress.step,
        progress.live
    );
    if let Some(table) = dump {
        let records = session.pipeline().reader().records(table);
        let json =
            serde_json::to_string_pretty(&records).context("serializing table dump")?;
        println!("{json}");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    if args.tracing {
        init_tracing();
    }
    let config = SyncConfig::load(&args.config)
        .with_context(|| format!("loading config {}", args.config.display()))?;
    let dump = args
        .dump
        .as_deref()
        .map(|raw| raw.parse::<TableId>().map_err(|e| anyhow!("parsing --dump: {e}")))
        .transpose()?;

    match args.snapshot_dir.or_else(|| config.snapshot_dir.clone()) {
        Some(path) => {
            fs::create_dir_all(&path)?;
            tracing::info!("Using sled storage directory {}", path.display());
            let snapshots = SledSnapshotStorage::open(&path)?;
            replay(&config, &args.logs, snapshots, dump.as_ref()).await
        }
        None => {
            replay(&config, &args.logs, NoSnapshotStorage, dump.as_ref()).await
        }
    }
}
