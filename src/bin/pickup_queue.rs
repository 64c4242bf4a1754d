use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use pickup_sync::config;
use pickup_sync::db::SqliteStore;
use pickup_sync::model::RequestDescriptor;
use pickup_sync::offline::OfflineCoordinator;
use pickup_sync::replay::HttpReplayer;
use pickup_sync::session::Session;
use pickup_sync::storage::PendingStore;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Inspect and drive the local offline request queue"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Store the bearer token used for the realtime channel
    Login {
        #[arg(long)]
        token: String,
    },
    /// Forget the session token and the realtime connection id
    Logout,
    /// Queue a request for later replay
    Enqueue {
        #[arg(long, default_value = "POST")]
        method: String,
        #[arg(long)]
        url: String,
        /// Repeatable `Name: value` header
        #[arg(long = "header")]
        headers: Vec<String>,
        /// JSON request body
        #[arg(long)]
        body: Option<String>,
    },
    /// Print pending requests as JSON lines
    List,
    /// Replay pending requests once and print the report
    Sync,
    /// Delete requests already marked as synced
    Purge,
}

fn parse_header(raw: &str) -> Result<(String, String)> {
    let (name, value) = raw
        .split_once(':')
        .ok_or_else(|| anyhow!("header must look like `Name: value`, got {raw:?}"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(anyhow!("empty header name in {raw:?}"));
    }
    Ok((name.to_string(), value.trim().to_string()))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let store = Arc::new(
        SqliteStore::open(&cfg.database_url())
            .await
            .context("failed to open local store")?,
    );
    let session = Session::new(store.clone());

    match args.command {
        Command::Login { token } => {
            session.set_token(token.trim()).await?;
            let connection_id = session.connection_id().await?;
            info!(%connection_id, "session stored");
        }
        Command::Logout => {
            session.logout().await?;
            info!("session cleared");
        }
        Command::Enqueue {
            method,
            url,
            headers,
            body,
        } => {
            let mut request = RequestDescriptor::new(&method, url);
            for raw in &headers {
                let (name, value) = parse_header(raw)?;
                request = request.with_header(name, value);
            }
            if let Some(body) = body {
                let body = serde_json::from_str(&body).context("--body must be valid JSON")?;
                request = request.with_body(body);
            }
            let id = store.enqueue(&request).await?;
            println!("{id}");
        }
        Command::List => {
            for record in store.list_pending().await? {
                println!("{}", serde_json::to_string(&record)?);
            }
        }
        Command::Sync => {
            let replayer = Arc::new(HttpReplayer::new(
                cfg.api_base_url()?,
                Duration::from_millis(cfg.api.timeout_ms),
            )?);
            let coordinator = OfflineCoordinator::new(Some(store.clone() as Arc<dyn PendingStore>), replayer);
            let report = coordinator.sync_pending_requests().await;
            if report.failed > 0 {
                warn!(
                    failed = report.failed,
                    remaining = report.remaining,
                    "some requests could not be replayed; they stay queued"
                );
            }
            println!("{}", serde_json::to_string(&report)?);
        }
        Command::Purge => {
            let purged = store.purge_synced().await?;
            info!(purged, "synced requests purged");
        }
    }

    Ok(())
}
