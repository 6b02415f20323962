use std::io::{self, Read, Write};
use std::path::Path;

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use dotenvy::dotenv;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;

use discoverer_client::WorkerControl;
use discoverer_core::traits::{
    ActivityStore, ArtifactSink, ArtifactStore, DistributedLock, PublicationStore, TaskQueue,
};
use discoverer_core::{
    ActivityInterceptor, ArtifactState, CsvOptions, DatasetCache, DatasetRequest,
    DbConfig, DiscovererConfig, ExportConfig, ExportService, LocalArtifactSink, Observation,
    PortalService, QueueWorkerPool, TaskRouter, TaskStatus, TracingIngestReporter,
    TracingWorkerReporter, VersionTokenCache, WorkerIdleController, WorkerService, load_config,
};
use discoverer_db::{
    ActivityRepository, ArtifactRepository, LockRepository, PortalRepository,
    PublicationRepository, TaskRepository, run_migrations,
};
use discoverer_cli::{Command, Config, LocksCommand};

type PgDatasetCache = DatasetCache<
    PortalRepository,
    PublicationRepository,
    ArtifactRepository,
    LockRepository,
    LocalArtifactSink,
>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set default tracing subscriber")?;

    let config = Config::parse();
    let settings = load_config(config.config.clone()).context("Failed to load configuration")?;

    info!("Connecting to database...");
    let db_config = DbConfig::default();
    let pool = PgPoolOptions::new()
        .max_connections(db_config.max_connections)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;
    run_migrations(&pool)
        .await
        .context("Failed to apply database schema")?;

    let datasets = dataset_cache(&pool, &settings);

    match config.command {
        Command::Ingest { input } => {
            ingest(&datasets, &settings, &input).await?;
        }
        Command::Publish { name } => {
            let name = name.unwrap_or_else(|| settings.index.name.clone());
            let publication = datasets.tokens().publish(&name).await?;
            println!(
                "Published {} {} ({} portals with guid)",
                publication.name(),
                publication.token.token,
                publication.document.keys.len()
            );
        }
        Command::Export {
            format,
            output,
            if_needed,
            force,
            title,
            region,
            since,
            delimiter,
        } => {
            let mut export_config = ExportConfig {
                csv: CsvOptions {
                    delimiter,
                    ..CsvOptions::default()
                },
                ..ExportConfig::default()
            };
            if let Some(title) = title {
                export_config = export_config.with_title(title);
            }
            if let Some(region) = region {
                export_config = export_config.with_region(region);
            }
            if let Some(since) = since {
                export_config = export_config.with_discovered_after(since);
            }
            let request = DatasetRequest::new(settings.index.name.clone(), format.into())
                .with_config(export_config);
            export(&datasets, &request, output.as_deref(), if_needed, force).await?;
        }
        Command::Worker { once } => {
            run_worker(pool, datasets, &settings, once).await?;
        }
        Command::Locks { command } => {
            let locks = LockRepository::new(pool);
            handle_locks(&locks, command).await?;
        }
        Command::Tasks { status, limit } => {
            list_tasks(&TaskRepository::new(pool), status, limit).await?;
        }
        Command::Status => {
            show_status(&pool, &settings).await?;
        }
    }

    Ok(())
}

fn dataset_cache(pool: &PgPool, settings: &DiscovererConfig) -> PgDatasetCache {
    let tokens = VersionTokenCache::new(
        PortalRepository::new(pool.clone()),
        PublicationRepository::new(pool.clone()),
    )
    .with_search_region(settings.index.search_region.clone());

    DatasetCache::new(
        tokens,
        ArtifactRepository::new(pool.clone()),
        LockRepository::new(pool.clone()),
        LocalArtifactSink::new(settings.export.artifact_dir.clone()),
    )
    .with_index_name(settings.index.name.clone())
}

// =============================================================================
// Ingest
// =============================================================================

async fn ingest(
    datasets: &PgDatasetCache,
    settings: &DiscovererConfig,
    input: &Path,
) -> anyhow::Result<()> {
    let raw = if input == Path::new("-") {
        let mut buf = String::new();
        io::stdin()
            .read_to_string(&mut buf)
            .context("Failed to read observations from stdin")?;
        buf
    } else {
        tokio::fs::read_to_string(input)
            .await
            .with_context(|| format!("Failed to read {}", input.display()))?
    };
    let batch: Vec<Observation> =
        serde_json::from_str(&raw).context("Observations must be a JSON array")?;

    let tokens = datasets.tokens().clone();
    let service = PortalService::new(tokens.portals().clone(), tokens, &settings.index.name);
    let report = service
        .ingest_with_reporter(batch, &TracingIngestReporter)
        .await?;
    let result = &report.result;

    eprintln!();
    eprintln!("  Inserted:   {}", result.inserted);
    eprintln!("  Modified:   {}", result.modified);
    eprintln!("  Unchanged:  {}", result.unchanged);
    eprintln!("  Rejected:   {}", result.rejected.len());
    for rejection in &result.rejected {
        eprintln!(
            "    #{:<5} {:<24} {:?}",
            rejection.index,
            rejection.guid.as_deref().unwrap_or("-"),
            rejection.reason
        );
    }
    if let Some(token) = &report.published {
        eprintln!("  Index token: {}", token.token);
    }
    eprintln!();

    Ok(())
}

// =============================================================================
// Export
// =============================================================================

async fn export(
    datasets: &PgDatasetCache,
    request: &DatasetRequest,
    output: Option<&Path>,
    if_needed: bool,
    force: bool,
) -> anyhow::Result<()> {
    let payload = if force {
        info!(format = %request.format, "Rendering dataset without the cache");
        let exporter = ExportService::new(datasets.tokens().portals().clone());
        exporter
            .render(request.format, &request.config, Utc::now())
            .await?
    } else {
        if if_needed && !datasets.is_dirty(request).await? {
            eprintln!("Dataset is up to date, nothing to do.");
            return Ok(());
        }

        let artifact = datasets.get_or_export(request).await?;
        let payload_ref = artifact.payload_ref.as_deref().ok_or_else(|| {
            anyhow::anyhow!(
                "Dataset {} is being built by another process, try again later",
                artifact.address()
            )
        })?;
        info!(address = %artifact.address(), token = %artifact.source_token, "Dataset ready");
        datasets.sink().open(payload_ref).await?
    };

    write_output(output, &payload)?;
    eprintln!("Wrote {} bytes of {}", payload.len(), request.format);
    Ok(())
}

fn write_output(output: Option<&Path>, payload: &[u8]) -> anyhow::Result<()> {
    match output {
        Some(path) => std::fs::write(path, payload)
            .with_context(|| format!("Failed to write {}", path.display())),
        None => {
            let mut stdout = io::stdout().lock();
            stdout.write_all(payload)?;
            stdout.flush()?;
            Ok(())
        }
    }
}

// =============================================================================
// Worker
// =============================================================================

async fn run_worker(
    pool: PgPool,
    datasets: PgDatasetCache,
    settings: &DiscovererConfig,
    once: bool,
) -> anyhow::Result<()> {
    let token = CancellationToken::new();
    let control = WorkerControl::from_heroku_env(
        std::env::var("HEROKU_API_KEY").ok().as_deref(),
        std::env::var("HEROKU_APP_NAME").ok().as_deref(),
        WorkerControl::local(token.clone()),
    )?;
    info!(control = control.name(), "Worker control configured");

    let queue = TaskRepository::new(pool.clone());
    let controller = WorkerIdleController::new(
        LockRepository::new(pool.clone()),
        ActivityRepository::new(pool),
        QueueWorkerPool::new(queue.clone(), control),
        queue.clone(),
        settings.worker.idle_config(),
    );
    let worker = WorkerService::new(
        queue,
        TaskRouter::new(datasets, controller.clone()),
        ActivityInterceptor::new(controller.clone()),
        settings.worker.worker_config(),
    );

    if once {
        let processed = worker.drain(&TracingWorkerReporter).await?;
        eprintln!("Processed {} tasks", processed);
        return Ok(());
    }

    // Starting counts as activity so an idle worker still gets shut down.
    controller.record_activity().await?;

    let signal_token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, stopping worker");
            signal_token.cancel();
        }
    });

    worker.run(token, &TracingWorkerReporter).await?;
    Ok(())
}

// =============================================================================
// Locks, tasks and status
// =============================================================================

async fn handle_locks(locks: &LockRepository, command: LocksCommand) -> anyhow::Result<()> {
    match command {
        LocksCommand::List => {
            let entries = locks.list().await?;
            if entries.is_empty() {
                println!("No locks held.");
            }
            for entry in entries {
                println!(
                    "{:<60} {:<38} {}",
                    entry.key,
                    entry.holder,
                    entry.acquired_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
        LocksCommand::Release { key } => {
            if locks.force_release(&key).await? {
                warn!(key, "Lock released regardless of holder");
                println!("Released {}", key);
            } else {
                println!("No lock held under {}", key);
            }
        }
    }
    Ok(())
}

async fn list_tasks(
    queue: &TaskRepository,
    status: Option<TaskStatus>,
    limit: usize,
) -> anyhow::Result<()> {
    let tasks = queue.list_tasks(status, limit).await?;
    if tasks.is_empty() {
        println!("No tasks.");
    }
    for task in tasks {
        println!(
            "{}  {:<14} {:<10} run_at {}  retries {}/{}{}",
            task.id,
            task.kind.as_str(),
            task.status,
            task.run_at.format("%Y-%m-%d %H:%M:%S"),
            task.retry_count,
            task.max_retries,
            task.error_message
                .map(|e| format!("  error: {}", e))
                .unwrap_or_default()
        );
    }
    Ok(())
}

async fn show_status(pool: &PgPool, settings: &DiscovererConfig) -> anyhow::Result<()> {
    let publications = PublicationRepository::new(pool.clone());
    let artifacts = ArtifactRepository::new(pool.clone());
    let activity = ActivityRepository::new(pool.clone());
    let queue = TaskRepository::new(pool.clone());

    let publication = publications.get(&settings.index.name).await?;
    let live_token = publication.as_ref().map(|p| p.token.token.clone());

    println!("\nIndex {}", settings.index.name);
    match &publication {
        Some(p) => println!(
            "  Token:        {} (minted {}, {} portals)",
            p.token.token,
            p.token.minted_at.format("%Y-%m-%d %H:%M:%S"),
            p.token.item_count
        ),
        None => println!("  Not published yet"),
    }

    println!("\nDatasets");
    let rows = artifacts.list().await?;
    if rows.is_empty() {
        println!("  None built yet");
    }
    for row in rows {
        let state = match &live_token {
            Some(token) => row.state(token),
            None => ArtifactState::Stale,
        };
        println!(
            "  {:<20} {:<4} {}  {:<8} updated {}",
            row.name,
            row.format,
            &row.config_hash[..row.config_hash.len().min(12)],
            state.as_str(),
            row.updated_at.format("%Y-%m-%d %H:%M:%S")
        );
    }

    let counts = queue.task_counts().await?;
    println!("\nWorker");
    println!("  State:        {}", activity.state().await?);
    match activity.last_activity().await? {
        Some(at) => println!("  Last active:  {}", at.format("%Y-%m-%d %H:%M:%S")),
        None => println!("  Last active:  never"),
    }
    println!(
        "  Tasks:        {} scheduled, {} due, {} running",
        counts.scheduled, counts.reserved, counts.active
    );
    println!();

    Ok(())
}

