//! Runs a local collaborative session: several replicas of one document
//! share an in-memory broker, each with one connected client, and the
//! clients take turns editing, snapshotting, and reverting.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use cowrite::broker::Broker;
use cowrite::broker::MemoryBroker;
use cowrite::config::Config;
use cowrite::coordinator::Coordinator;
use cowrite::coordinator::CoordinatorHandle;
use cowrite::key::ReplicaKey;
use tracing::info;
use tracing::warn;

#[derive(Parser, Debug)]
#[command(name = "cowrite")]
#[command(about = "Replicated text editing session over an in-memory broker")]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of replicas to run
    #[arg(short, long, default_value_t = 3)]
    replicas: usize,

    /// Document key (broker topic)
    #[arg(short, long, default_value = "notes")]
    document: String,

    /// Deliver every broker message twice
    #[arg(long)]
    duplicate: bool,
}

/// Poll until every replica shows the same text, or give up.
async fn settle(replicas: &[CoordinatorHandle]) -> cowrite::Result<String> {
    let mut last = String::new();
    for _ in 0..100 {
        let mut texts = Vec::with_capacity(replicas.len());
        for replica in replicas {
            texts.push(replica.current_text().await?);
        }
        last = texts[0].clone();
        if texts.iter().all(|t| *t == last) {
            return Ok(last);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    warn!(text = %last, "replicas did not settle");
    return Ok(last);
}

#[tokio::main]
async fn main() -> cowrite::Result<()> {
    let args = Args::parse();

    let (config, load_error) = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(config) => (config, None),
            Err(e) => (Config::default(), Some(e)),
        },
        None => (Config::default(), None),
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .init();

    if let Some(e) = load_error {
        warn!(%e, "config load failed, using defaults");
    }

    let memory = MemoryBroker::new();
    memory.set_duplicate(args.duplicate);
    let broker: Arc<dyn Broker> = Arc::new(memory);

    let count = args.replicas.max(1);
    let mut replicas = Vec::with_capacity(count);
    for _ in 0..count {
        let handle =
            Coordinator::spawn(args.document.clone(), ReplicaKey::generate(), broker.clone(), &config)
                .await;
        replicas.push(handle);
    }
    let mut clients = Vec::with_capacity(count);
    for (i, replica) in replicas.iter().enumerate() {
        clients.push(replica.connect(format!("client-{i}")).await?);
    }

    let first = &replicas[0];
    let last = &replicas[count - 1];

    first.edit("client-0", "hello", Some(5)).await?;
    let text = settle(&replicas).await?;
    info!(%text, "typed");

    let snapshot = first.request_snapshot().await?;
    info!(%snapshot, "snapshot taken");

    last.edit(format!("client-{}", count - 1), "hello world", Some(11)).await?;
    let text = settle(&replicas).await?;
    info!(%text, "appended");

    last.request_revert(None, snapshot).await?;
    let text = settle(&replicas).await?;
    info!(%text, "reverted");

    for replica in &replicas {
        let status = replica.status().await?;
        info!(
            replica = ?status.replica,
            len = status.len,
            log = status.log_len,
            pending = status.pending,
            "replica status"
        );
        replica.shutdown().await?;
    }
    drop(clients);
    return Ok(());
}
