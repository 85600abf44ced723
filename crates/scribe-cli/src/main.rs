//! CLI binary for submitting outreach batches and running the queue worker.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Deserialize;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use scribe_pipeline::{
    standard_pipeline, AnthropicComposer, ArxivClient, Composer, GoogleSearchClient,
    OfflinePaperSource, OfflineSearchClient, PaperSource, PipelineEvent, PipelineRunner,
    SearchClient, TemplateComposer,
};
use scribe_queue::{
    db, ArtifactStore, Dispatcher, QueueService, QueueStore, Recipient, SqliteArtifactStore,
    SqliteQueueStore, StoreConfig, WorkerConfig,
};
use scribe_types::CancelOutcome;

#[derive(Parser)]
#[command(name = "scribe", version, about = "Queued generation of personalised outreach emails")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// SQLite database URL
    #[arg(long, global = true, env = "SCRIBE_DATABASE_URL", default_value = "sqlite:scribe.db")]
    database_url: String,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database schema
    Init,

    /// Submit a batch of recipients sharing one template
    Submit {
        /// Owner the items are submitted for
        #[arg(long)]
        owner: String,

        /// JSON file: {"template": "...", "recipients": [{"name": "...", "interest": "..."}]}
        #[arg(long)]
        batch: PathBuf,
    },

    /// List an owner's queue with positions
    List {
        #[arg(long)]
        owner: String,

        /// Print the listing as JSON
        #[arg(long)]
        json: bool,
    },

    /// Cancel a pending item
    Cancel {
        #[arg(long)]
        owner: String,

        /// Queue item id
        id: Uuid,
    },

    /// Print the generated email of a completed item
    Show {
        #[arg(long)]
        owner: String,

        /// Queue item id
        id: Uuid,
    },

    /// Run the worker loop until Ctrl-C
    Work {
        /// Worker identity; execution handles are prefixed with it
        #[arg(long, default_value = "worker-1")]
        worker_id: String,

        /// Use offline clients instead of Google, arXiv and Anthropic
        #[arg(long)]
        offline: bool,

        /// Wall-clock limit for one pipeline run
        #[arg(long, env = "SCRIBE_PIPELINE_TIMEOUT_SECS", default_value = "300")]
        pipeline_timeout_secs: u64,

        /// Idle poll interval when no wakeup arrives
        #[arg(long, env = "SCRIBE_POLL_INTERVAL_MS", default_value = "2000")]
        poll_interval_ms: u64,
    },

    /// Run a one-shot orphan scan
    Recover {
        /// Also reclaim every processing item handed out to this worker id
        #[arg(long)]
        worker_id: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    let store_config = StoreConfig::new(cli.database_url);

    match cli.command {
        Commands::Init => cmd_init(&store_config).await?,
        Commands::Submit { owner, batch } => cmd_submit(&store_config, &owner, &batch).await?,
        Commands::List { owner, json } => cmd_list(&store_config, &owner, json).await?,
        Commands::Cancel { owner, id } => cmd_cancel(&store_config, &owner, id).await?,
        Commands::Show { owner, id } => cmd_show(&store_config, &owner, id).await?,
        Commands::Work {
            worker_id,
            offline,
            pipeline_timeout_secs,
            poll_interval_ms,
        } => {
            let config = WorkerConfig {
                poll_interval: Duration::from_millis(poll_interval_ms),
                pipeline_timeout: Duration::from_secs(pipeline_timeout_secs),
                ..WorkerConfig::default()
            }
            .with_worker_id(worker_id);
            cmd_work(&store_config, config, offline).await?;
        }
        Commands::Recover { worker_id } => cmd_recover(&store_config, worker_id).await?,
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Batch files
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct BatchFile {
    template: String,
    recipients: Vec<Recipient>,
}

fn load_batch(path: &Path) -> anyhow::Result<BatchFile> {
    let source = std::fs::read_to_string(path)?;
    let batch: BatchFile = serde_json::from_str(&source)
        .map_err(|e| anyhow::anyhow!("{}: invalid batch file: {}", path.display(), e))?;
    Ok(batch)
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

async fn cmd_init(config: &StoreConfig) -> anyhow::Result<()> {
    db::connect(config).await?;
    println!("Database ready at {}", config.database_url);
    Ok(())
}

async fn cmd_submit(config: &StoreConfig, owner: &str, batch_path: &Path) -> anyhow::Result<()> {
    let batch = load_batch(batch_path)?;
    let store = SqliteQueueStore::open(config).await?;
    let service = QueueService::new(Arc::new(store));
    let ids = service
        .submit_template_batch(owner, &batch.template, &batch.recipients)
        .await?;

    println!("Submitted {} item(s)", ids.len());
    for (id, recipient) in ids.iter().zip(&batch.recipients) {
        println!("  {}  {}", id, recipient.name);
    }
    Ok(())
}

async fn cmd_list(config: &StoreConfig, owner: &str, json: bool) -> anyhow::Result<()> {
    let store = SqliteQueueStore::open(config).await?;
    let views = QueueService::new(Arc::new(store)).list_queue(owner).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&views)?);
        return Ok(());
    }
    if views.is_empty() {
        println!("Queue is empty");
        return Ok(());
    }

    for view in &views {
        let position = view
            .position
            .map(|p| format!("#{}", p))
            .unwrap_or_else(|| "-".to_string());
        let detail = match (&view.current_step, &view.error_message, &view.result_ref) {
            (_, Some(error), _) => error.clone(),
            (_, _, Some(result_ref)) => format!("result {}", result_ref),
            (Some(step), _, _) => format!("at {}", step),
            _ => String::new(),
        };
        println!(
            "{}  {:<10} {:>4}  {}  {}  {}",
            view.id,
            view.status.as_str(),
            position,
            view.created_at.format("%Y-%m-%d %H:%M:%S"),
            view.recipient_name,
            detail
        );
    }
    Ok(())
}

async fn cmd_cancel(config: &StoreConfig, owner: &str, id: Uuid) -> anyhow::Result<()> {
    let store = SqliteQueueStore::open(config).await?;
    match QueueService::new(Arc::new(store)).cancel(owner, id).await? {
        CancelOutcome::Canceled => println!("Canceled {}", id),
        CancelOutcome::Rejected(reason) => anyhow::bail!("Cannot cancel {}: {}", id, reason),
    }
    Ok(())
}

async fn cmd_show(config: &StoreConfig, owner: &str, id: Uuid) -> anyhow::Result<()> {
    let pool = db::connect(config).await?;
    let store = SqliteQueueStore::new(pool.clone()).await?;
    let artifacts = SqliteArtifactStore::new(pool);

    let item = match store.get(id).await? {
        Some(item) if item.owner_id == owner => item,
        _ => anyhow::bail!("No queue item {}", id),
    };
    let Some(result_ref) = item.result_ref.as_deref() else {
        anyhow::bail!("Item {} is {}, no email to show", id, item.status);
    };
    let Some(artifact) = artifacts.get(result_ref).await? else {
        anyhow::bail!("Result {} for item {} is missing", result_ref, id);
    };

    println!("To: {}\n", artifact.recipient_name);
    println!("{}", artifact.body);
    tracing::debug!(metadata = %artifact.metadata, "Artifact metadata");
    Ok(())
}

fn build_runner(offline: bool) -> anyhow::Result<PipelineRunner> {
    let (search, papers, composer): (Arc<dyn SearchClient>, Arc<dyn PaperSource>, Arc<dyn Composer>) =
        if offline {
            (
                Arc::new(OfflineSearchClient),
                Arc::new(OfflinePaperSource),
                Arc::new(TemplateComposer::new()),
            )
        } else {
            (
                Arc::new(GoogleSearchClient::from_env()?),
                Arc::new(ArxivClient::new()),
                Arc::new(AnthropicComposer::from_env()?),
            )
        };
    Ok(PipelineRunner::new(standard_pipeline(search, papers, composer)?))
}

async fn cmd_work(store_config: &StoreConfig, config: WorkerConfig, offline: bool) -> anyhow::Result<()> {
    let runner = build_runner(offline)?;
    let pool = db::connect(store_config).await?;
    let store = Arc::new(SqliteQueueStore::new(pool.clone()).await?);
    let artifacts = Arc::new(SqliteArtifactStore::new(pool));
    let dispatcher = Dispatcher::new(store, artifacts, runner, config);

    println!("Worker {} polling {}", dispatcher.config().worker_id, store_config.database_url);
    if offline {
        println!("(offline mode -- no external calls)");
    }

    let mut events = dispatcher.events().subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => print_event(&event),
                Err(RecvError::Lagged(skipped)) => println!("({} events skipped)", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("\nShutting down after the current item...");
            let _ = shutdown_tx.send(true);
        }
    });

    dispatcher.run(shutdown_rx).await?;
    printer.abort();
    println!("Worker stopped");
    Ok(())
}

fn print_event(event: &PipelineEvent) {
    match event {
        PipelineEvent::ItemClaimed { item_id, .. } => println!("[{}] claimed", item_id),
        PipelineEvent::Step(progress) => match progress.duration_ms {
            Some(ms) => println!(
                "[{}]   {} {} ({}ms)",
                progress.item_id,
                progress.step,
                progress.status.as_str(),
                ms
            ),
            None => println!("[{}]   {} {}", progress.item_id, progress.step, progress.status.as_str()),
        },
        PipelineEvent::ItemCompleted {
            item_id,
            result_ref,
            duration_ms,
        } => println!("[{}] completed in {}ms -> {}", item_id, duration_ms, result_ref),
        PipelineEvent::ItemFailed { item_id, error } => println!("[{}] failed: {}", item_id, error),
        PipelineEvent::ItemRecovered { item_id, requeued } => {
            let action = if *requeued { "requeued" } else { "failed" };
            println!("[{}] orphan {}", item_id, action);
        }
    }
}

async fn cmd_recover(store_config: &StoreConfig, worker_id: Option<String>) -> anyhow::Result<()> {
    let pool = db::connect(store_config).await?;
    let store = Arc::new(SqliteQueueStore::new(pool.clone()).await?);
    let artifacts: Arc<dyn ArtifactStore> = Arc::new(SqliteArtifactStore::new(pool));
    // The scan never runs a pipeline, so the offline steps are enough.
    let runner = build_runner(true)?;

    let owned = worker_id.is_some();
    let mut config = WorkerConfig::default();
    if let Some(id) = worker_id {
        config = config.with_worker_id(id);
    }
    let dispatcher = Dispatcher::new(store, artifacts, runner, config);

    let recovered = if owned {
        dispatcher.recover_owned().await?
    } else {
        dispatcher.recover_stale().await?
    };

    if recovered.is_empty() {
        println!("No orphaned items");
    }
    for r in &recovered {
        let action = if r.requeued { "requeued" } else { "failed (recovery exhausted)" };
        println!("{}  {}", r.id, action);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_file_is_parsed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("batch.json");
        std::fs::write(
            &path,
            r#"{
                "template": "Hi {{name}}, I enjoyed your work on {{research}}.",
                "recipients": [
                    {"name": "Jane Smith", "interest": "robot learning"},
                    {"name": "Ravi Rao", "interest": "compilers"}
                ]
            }"#,
        )
        .unwrap();

        let batch = load_batch(&path).unwrap();
        assert!(batch.template.contains("{{research}}"));
        assert_eq!(batch.recipients.len(), 2);
        assert_eq!(batch.recipients[1].interest, "compilers");
    }

    #[test]
    fn malformed_batch_file_names_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, r#"{"template": "x"}"#).unwrap();

        let err = load_batch(&path).unwrap_err().to_string();
        assert!(err.contains("broken.json"));
        assert!(err.contains("invalid batch file"));
    }

    #[tokio::test]
    async fn rejected_cancel_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::new(format!("sqlite://{}", dir.path().join("queue.db").display()));
        let store = Arc::new(SqliteQueueStore::open(&config).await.unwrap());
        let recipients = [Recipient {
            name: "Jane Smith".into(),
            interest: "robot learning".into(),
        }];
        let ids = QueueService::new(store.clone())
            .submit_template_batch("owner-a", "Hi {{name}}.", &recipients)
            .await
            .unwrap();
        store.claim_next("worker-1/run").await.unwrap();

        let err = cmd_cancel(&config, "owner-a", ids[0]).await.unwrap_err().to_string();
        assert!(err.starts_with(&format!("Cannot cancel {}", ids[0])), "{err}");
    }

    #[test]
    fn cli_flags_parse() {
        let cli = Cli::try_parse_from([
            "scribe",
            "--database-url",
            "sqlite::memory:",
            "work",
            "--offline",
            "--worker-id",
            "w7",
        ])
        .unwrap();
        assert_eq!(cli.database_url, "sqlite::memory:");
        match cli.command {
            Commands::Work {
                worker_id, offline, ..
            } => {
                assert_eq!(worker_id, "w7");
                assert!(offline);
            }
            _ => panic!("expected work"),
        }
    }
}
