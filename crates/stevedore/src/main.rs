//! Stevedore worker daemon.
//!
//! Usage:
//!     stevedore-worker --database stevedore.db --storage ./storage
//!
//! Polls the queue with bounded backoff and runs up to
//! `worker_concurrency` jobs concurrently. Ctrl-C stops claiming new
//! entries; in-flight jobs finish their current run.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};

use stevedore::Config;
use stevedore_db::pool::{create_pool, DbConfig};
use stevedore_db::schema;
use stevedore_logging::{init_logging, LogConfig};
use stevedore_protocol::defaults::QUEUE_TOPIC;
use stevedore_storage::LocalStorage;
use stevedore_worker::{AbortSignal, WorkerContext};

/// Dispatch backoff base (ms) when the queue is empty.
const DISPATCH_BACKOFF_BASE_MS: u64 = 50;
/// Dispatch backoff max (ms).
const DISPATCH_BACKOFF_MAX_MS: u64 = 1_000;

#[derive(Parser, Debug)]
#[command(name = "stevedore-worker", about = "Job worker for Stevedore")]
struct Args {
    /// Database path (overrides STEVEDORE_DATABASE_URL)
    #[arg(long)]
    database: Option<String>,

    /// Storage root directory (overrides STEVEDORE_STORAGE_PATH)
    #[arg(long)]
    storage: Option<PathBuf>,

    /// Verbose logging
    #[arg(long, short)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = Config::from_env()?;
    if let Some(database) = args.database {
        config.database_url = database;
    }
    if let Some(storage) = args.storage {
        config.storage_path = storage;
    }

    init_logging(LogConfig {
        level: if args.verbose {
            Some("debug")
        } else {
            config.log_level.as_deref()
        },
        json: config.log_json,
    })?;

    let db_config = if config.database_url.starts_with("sqlite:") {
        DbConfig {
            url: config.database_url.clone(),
            max_connections: 5,
        }
    } else {
        DbConfig::sqlite(&config.database_url)
    };
    let pool = create_pool(db_config).await?;
    schema::bootstrap(&pool).await?;

    let context = Arc::new(WorkerContext::new(
        pool,
        LocalStorage::new(config.storage_path.clone()),
        config.worker_settings(),
    ));

    info!(
        concurrency = config.worker_concurrency,
        storage = %config.storage_path.display(),
        "starting stevedore worker"
    );

    let shutdown = AbortSignal::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown requested");
                shutdown.trigger();
            }
        });
    }

    let mut handles = Vec::with_capacity(config.worker_concurrency);
    for worker_id in 0..config.worker_concurrency {
        let context = context.clone();
        let shutdown = shutdown.clone();
        handles.push(tokio::spawn(worker_loop(context, shutdown, worker_id)));
    }
    for handle in handles {
        handle.await?;
    }

    info!("worker stopped");
    Ok(())
}

/// One polling loop: pop, run, complete or retry.
async fn worker_loop(context: Arc<WorkerContext>, shutdown: AbortSignal, worker_id: usize) {
    let mut backoff = DISPATCH_BACKOFF_BASE_MS;
    while !shutdown.is_aborted() {
        match context.queue.pop(QUEUE_TOPIC).await {
            Ok(Some(entry)) => {
                backoff = DISPATCH_BACKOFF_BASE_MS;
                info!(worker_id, job_id = %entry.job_id, "picked up job");
                match context.run_job(&entry.job_id).await {
                    Ok(row) => {
                        info!(worker_id, job_id = %entry.job_id, status = %row.status, "job done");
                        if let Err(err) = context.queue.complete(entry.id).await {
                            warn!(worker_id, %err, "failed to remove queue entry");
                        }
                    }
                    Err(err) if err.is_retriable() => {
                        warn!(worker_id, job_id = %entry.job_id, %err, "job failed, will retry");
                        if let Err(fail_err) = context.queue.fail(entry.id, &err.to_string()).await
                        {
                            warn!(worker_id, %fail_err, "failed to requeue entry");
                        }
                    }
                    Err(err) => {
                        // Terminal row is already written; retrying cannot help.
                        error!(worker_id, job_id = %entry.job_id, %err, "job failed");
                        if let Err(complete_err) = context.queue.complete(entry.id).await {
                            warn!(worker_id, %complete_err, "failed to remove queue entry");
                        }
                    }
                }
            }
            Ok(None) => {
                tokio::time::sleep(Duration::from_millis(backoff)).await;
                backoff = (backoff * 2).min(DISPATCH_BACKOFF_MAX_MS);
            }
            Err(err) => {
                error!(worker_id, %err, "queue poll failed");
                tokio::time::sleep(Duration::from_millis(DISPATCH_BACKOFF_MAX_MS)).await;
            }
        }
    }
}
