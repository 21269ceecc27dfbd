//! Coordinator binary

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use minicoord::common::{parse_duration, Config};
use minicoord::coordinator::{FileOperationLog, StructuralChangeRequest};
use minicoord::node::{LoopbackChannel, StructuralExecutor};
use minicoord::protocol::StructuralChange;
use minicoord::{Coordinator, SessionOperationId};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "minicoord")]
#[command(about = "minicoord structural operation coordinator", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one structural change against an in-process cluster
    Simulate {
        /// Cluster members (comma-separated)
        #[arg(long, value_delimiter = ',', required = true)]
        members: Vec<String>,

        /// Node to add
        #[arg(long, conflicts_with = "remove", required_unless_present = "remove")]
        add: Option<String>,

        /// Node to remove
        #[arg(long)]
        remove: Option<String>,

        /// Members that silently drop requests (comma-separated)
        #[arg(long, value_delimiter = ',')]
        unreachable: Vec<String>,

        /// Per-operation timeout, e.g. 500ms or 2s
        #[arg(long)]
        timeout: Option<String>,

        /// Configuration file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Durable operation log
        #[arg(long)]
        oplog: Option<PathBuf>,
    },

    /// Print the records of a file operation log
    Oplog {
        /// Log file
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Simulate {
            members,
            add,
            remove,
            unreachable,
            timeout,
            config,
            oplog,
        } => {
            let mut config = match config {
                Some(path) => Config::load_from(&path)
                    .with_context(|| format!("loading {}", path.display()))?,
                None => Config::load()?,
            };
            init_tracing(&config.log_level);

            // CLI arguments take priority over the file
            if let Some(timeout) = timeout {
                config.coordinator.set_request_timeout(parse_duration(&timeout)?)?;
            }
            if oplog.is_some() {
                config.coordinator.oplog_path = oplog;
            }
            config.validate()?;

            let change = match (add, remove) {
                (Some(name), _) => StructuralChange::AddNode { name },
                (None, Some(name)) => StructuralChange::RemoveNode { name },
                (None, None) => anyhow::bail!("one of --add or --remove is required"),
            };

            simulate(&config, &members, &unreachable, change).await?;
        }
        Commands::Oplog { path } => {
            init_tracing("info");
            FileOperationLog::replay(&path, |record| {
                let at = DateTime::<Utc>::from_timestamp_millis(record.timestamp_ms as i64)
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| record.timestamp_ms.to_string());
                println!("{}\t{}", record.id, at);
                Ok(())
            })
            .with_context(|| format!("replaying {}", path.display()))?;
        }
    }

    Ok(())
}

fn init_tracing(default_level: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_level.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn simulate(
    config: &Config,
    members: &[String],
    unreachable: &[String],
    change: StructuralChange,
) -> anyhow::Result<()> {
    let coordinator = Coordinator::open(&config.coordinator)?;
    let (replies_tx, mut replies) = mpsc::unbounded_channel();

    let mut executors = Vec::with_capacity(members.len());
    let mut channels = Vec::with_capacity(members.len());
    for name in members {
        let executor = Arc::new(StructuralExecutor::new(members.iter().cloned()));
        let channel = LoopbackChannel::new(name.clone(), coordinator.clone(), executor.clone())
            .with_replies(replies_tx.clone());
        channel.set_reachable(!unreachable.contains(name));
        coordinator.join(channel.member());
        executors.push((name.clone(), executor));
        channels.push(channel);
    }

    let requester = channels
        .first()
        .context("at least one member is required")?
        .member();
    let session_id = SessionOperationId::new();
    requester.submit(session_id, Arc::new(StructuralChangeRequest::new(change)))?;

    // Prepare and commit may each run into the timeout
    let wait = config
        .coordinator
        .request_timeout()
        .saturating_mul(2)
        .saturating_add(Duration::from_secs(1));
    let reply = match tokio::time::timeout(wait, replies.recv()).await {
        Ok(Some(reply)) => Some(reply.response),
        Ok(None) => None,
        Err(_) => {
            tracing::warn!(%session_id, "No reply within {:?}", wait);
            None
        }
    };

    let hosts: serde_json::Map<String, serde_json::Value> = executors
        .iter()
        .map(|(name, executor)| (name.clone(), serde_json::json!(executor.hosts())))
        .collect();
    let report = serde_json::json!({
        "session_id": session_id,
        "reply": reply,
        "contexts": coordinator.contexts().await,
        "hosts": hosts,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    coordinator.close().await;
    Ok(())
}
