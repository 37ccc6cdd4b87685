use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use dialectic_core::file_config::load_config;
use dialectic_core::{AppConfig, FileConfig, SourceType, WorkerDeps};
use dialectic_domains::search::ContentEmbedding;
use dialectic_domains::{
    recover_orphaned_runs, ContentSource, JobQueue, PgContentSource, WorkerRuntime,
};
use discourse_client::{DiscourseEngine, HttpDiscourseEngine};

#[derive(Parser)]
#[command(name = "dialectic-worker", about = "Argument analysis worker")]
struct Cli {
    /// Path to config TOML file. Built-in defaults apply when it is missing.
    #[arg(long, default_value = "./config/dialectic.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Recover orphaned runs, then process jobs until SIGINT/SIGTERM
    Run,
    /// Run crash recovery once and print the report
    Recover,
    /// List dead-lettered jobs
    DeadLetters {
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
    /// Re-queue a dead-lettered job with a fresh attempt budget
    RetryJob { id: Uuid },
    /// Queue the current content of a post or reply for re-analysis
    Requeue {
        #[arg(long)]
        source_type: SourceType,
        #[arg(long)]
        source_id: Uuid,
    },
    /// Semantic search over analysed content
    Search {
        query: String,
        #[arg(long, default_value_t = 10)]
        limit: i64,
        /// Minimum cosine similarity; defaults to [search] default_threshold
        #[arg(long)]
        threshold: Option<f64>,
    },
    /// Check that the discourse engine is up and its models are loaded
    Health,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let cli = Cli::parse();
    let file_config = Arc::new(read_file_config(&cli.config)?);
    let config = AppConfig::from_env()?;

    let engine: Arc<dyn DiscourseEngine> = {
        let http = HttpDiscourseEngine::with_timeout(
            config.discourse_engine_url.clone(),
            file_config.engine.embedding_dimension,
            Duration::from_secs(file_config.engine.timeout_secs),
        )?;
        let http = match config.discourse_engine_api_key.as_deref() {
            Some(key) => http.with_api_key(key),
            None => http,
        };
        Arc::new(http)
    };

    // Health needs only the engine, not the database.
    if matches!(cli.command, Some(Command::Health)) {
        return health(engine.as_ref()).await;
    }

    // Room for every job slot plus the poll loop and maintenance.
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(file_config.worker.concurrency as u32 + 4)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;
    tracing::info!("Connected to database");

    dialectic_domains::MIGRATOR.run(&pool).await?;
    tracing::info!("Migrations complete");

    let deps = Arc::new(WorkerDeps::new(
        pool.clone(),
        engine,
        config,
        file_config.clone(),
    ));
    let content = Arc::new(PgContentSource::new(pool.clone()));
    let queue = JobQueue::new(pool.clone(), file_config.queue.clone());

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(deps, content).await,
        Command::Recover => {
            let report = recover_orphaned_runs(&pool, &queue, content.as_ref()).await?;
            println!(
                "completed={} reset={} requeued={} skipped={}",
                report.completed.len(),
                report.reset.len(),
                report.requeued,
                report.skipped
            );
            for id in &report.completed {
                println!("completed {id}");
            }
            for id in &report.reset {
                println!("reset {id}");
            }
            Ok(())
        }
        Command::DeadLetters { limit } => {
            let jobs = queue.dead_letters(limit).await?;
            if jobs.is_empty() {
                println!("No dead-lettered jobs");
            }
            for job in jobs {
                println!(
                    "{}\t{}:{}\tattempts={}\tfinished={}\t{}",
                    job.id,
                    job.source_type,
                    job.source_id,
                    job.attempts,
                    job.finished_at
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "-".to_string()),
                    job.last_error.as_deref().unwrap_or("")
                );
            }
            Ok(())
        }
        Command::RetryJob { id } => {
            if !queue.retry_dead_letter(id).await? {
                bail!("Job {id} is not dead-lettered");
            }
            println!("Job {id} re-queued");
            Ok(())
        }
        Command::Requeue {
            source_type,
            source_id,
        } => {
            let Some(item) = content.fetch(source_type, source_id).await? else {
                bail!("{source_type} {source_id} not found or deleted");
            };
            let handle = queue.enqueue(source_type, source_id, &item.content).await?;
            if handle.created {
                println!("Queued job {}", handle.id);
            } else {
                println!("Job {} already queued for this content", handle.id);
            }
            Ok(())
        }
        Command::Search {
            query,
            limit,
            threshold,
        } => {
            let vectors = deps.engine.embed_content(&[query]).await?;
            discourse_client::check_embeddings(
                &vectors,
                1,
                file_config.engine.embedding_dimension,
            )?;
            let Some(vector) = vectors.first() else {
                bail!("Engine returned no embedding for the query");
            };
            let hits = match threshold {
                Some(threshold) => {
                    ContentEmbedding::semantic_search(vector, limit, threshold, &pool).await?
                }
                None => {
                    ContentEmbedding::semantic_search_default(
                        vector,
                        limit,
                        &file_config.search,
                        &pool,
                    )
                    .await?
                }
            };
            for hit in hits {
                println!(
                    "{:.4}\t{}:{}",
                    hit.similarity, hit.source_type, hit.source_id
                );
            }
            Ok(())
        }
        Command::Health => health(deps.engine.as_ref()).await,
    }
}

fn read_file_config(path: &Path) -> Result<FileConfig> {
    if path.exists() {
        tracing::info!(config = %path.display(), "Loading config");
        load_config(path)
    } else {
        tracing::warn!(config = %path.display(), "Config file not found, using defaults");
        Ok(FileConfig::default())
    }
}

async fn run(deps: Arc<WorkerDeps>, content: Arc<PgContentSource>) -> Result<()> {
    let mut runtime = WorkerRuntime::new(deps, content);
    let report = runtime.start().await?;
    tracing::info!(
        completed = report.completed.len(),
        reset = report.reset.len(),
        requeued = report.requeued,
        skipped = report.skipped,
        "Startup recovery finished"
    );

    shutdown_signal().await;
    runtime.shutdown().await
}

async fn health(engine: &dyn DiscourseEngine) -> Result<()> {
    let status = engine.health_check().await?;
    println!(
        "status={} models_loaded={}",
        status.status, status.models_loaded
    );
    if !status.is_ready() {
        bail!("Discourse engine is not ready");
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received ctrl-c"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}
