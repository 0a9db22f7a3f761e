//! Resolve a batch of vision-extracted items against the canonical store and
//! link the results to a user's shelf. Also carries small shelf maintenance
//! subcommands (list, unlink) and a credential preflight.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use shelfscan::config::PipelineConfig;
use shelfscan::env_boot::ensure_dotenv;
use shelfscan::model::{ExtractedItem, LinkTarget, ShelfType};
use shelfscan::orchestrator::{ItemOutcome, Orchestrator, ResolveRequest};
use shelfscan::store::sqlite::SqliteStore;
use shelfscan::store::CatalogStore;
use shelfscan::tracing::init_tracing;
use shelfscan::util::env::{preflight_check, store_url};
use std::path::PathBuf;
use tracing::info;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "resolve", about = "Resolve extracted items into the catalog")]
struct Cli {
    /// SQLite database URL; falls back to SHELFSCAN_DB / DATABASE_URL.
    #[arg(long, global = true)]
    db: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the resolution pipeline over a JSON file of extracted items.
    Run {
        /// JSON file: either a bare array of items or `{"items":[...]}`.
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        user: String,
        #[arg(long)]
        shelf: String,
        /// Shelf domain: books, movies, games, ...
        #[arg(long)]
        shelf_type: ShelfType,
    },
    /// List everything linked to a shelf.
    List {
        #[arg(long)]
        user: String,
        #[arg(long)]
        shelf: String,
    },
    /// Remove one item from a shelf.
    Unlink {
        #[arg(long)]
        user: String,
        #[arg(long)]
        shelf: String,
        /// Collectable (or, with --manual, manual entry) id.
        #[arg(long)]
        id: Uuid,
        #[arg(long, default_value_t = false)]
        manual: bool,
    },
    /// Validate configuration and print a redacted snapshot.
    Check,
}

#[derive(serde::Deserialize)]
#[serde(untagged)]
enum InputFile {
    Bare(Vec<ExtractedItem>),
    Wrapped { items: Vec<ExtractedItem> },
}

fn load_items(path: &PathBuf) -> Result<Vec<ExtractedItem>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading input file {}", path.display()))?;
    let parsed: InputFile =
        serde_json::from_str(&raw).context("input file is not a valid item list")?;
    Ok(match parsed {
        InputFile::Bare(items) => items,
        InputFile::Wrapped { items } => items,
    })
}

async fn open_store(db: Option<String>) -> Result<SqliteStore> {
    let url = match db {
        Some(url) => url,
        None => store_url()?,
    };
    SqliteStore::connect(&url, 5).await
}

#[tokio::main]
async fn main() -> Result<()> {
    ensure_dotenv();
    init_tracing("info,sqlx=warn")?;
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            input,
            user,
            shelf,
            shelf_type,
        } => {
            let items = load_items(&input)?;
            if items.is_empty() {
                info!("input contained no items, nothing to do");
                return Ok(());
            }
            let store = open_store(cli.db).await?;
            let cfg = PipelineConfig::from_env();
            let orchestrator = Orchestrator::from_env(&store, cfg);
            let summary = orchestrator
                .run(&ResolveRequest {
                    user_id: user,
                    shelf_id: shelf,
                    shelf_type,
                    items,
                })
                .await?;

            for r in &summary.results {
                let id = r
                    .collectable_id
                    .or(r.manual_id)
                    .map(|id| id.to_string())
                    .unwrap_or_else(|| "-".into());
                println!(
                    "{:>3}  {:<14} {:<14} {}  {}",
                    r.index,
                    r.outcome.as_str(),
                    r.resolved_by.unwrap_or("-"),
                    id,
                    r.title
                );
            }
            println!(
                "linked={} existing={} manual={}",
                summary.count(ItemOutcome::Linked),
                summary.count(ItemOutcome::Existing),
                summary.count(ItemOutcome::ManualAdded)
            );
        }
        Command::List { user, shelf } => {
            let store = open_store(cli.db).await?;
            let rows = store.list_shelf(&user, &shelf).await?;
            for row in &rows {
                let (kind, id) = match row.target {
                    LinkTarget::Collectable(id) => ("collectable", id),
                    LinkTarget::Manual(id) => ("manual", id),
                };
                println!("{kind:<12} {id}  {}", row.meta.position.as_deref().unwrap_or(""));
            }
            println!("{} item(s)", rows.len());
        }
        Command::Unlink {
            user,
            shelf,
            id,
            manual,
        } => {
            let store = open_store(cli.db).await?;
            let target = if manual {
                LinkTarget::Manual(id)
            } else {
                LinkTarget::Collectable(id)
            };
            let removed = store.unlink_user_collection(&user, &shelf, target).await?;
            println!("{}", if removed { "removed" } else { "not on shelf" });
        }
        Command::Check => {
            preflight_check(
                "shelfscan",
                &[],
                &[
                    "SHELFSCAN_DB",
                    "DATABASE_URL",
                    "TMDB_API_KEY",
                    "TWITCH_CLIENT_ID",
                    "TWITCH_CLIENT_SECRET",
                    "SHELFSCAN_AI_ENABLED",
                    "SHELFSCAN_AI_MODEL",
                    "SHELFSCAN_CONCURRENCY",
                ],
            )?;
            store_url().map(|_| ()).context(
                "no database configured; set SHELFSCAN_DB or DATABASE_URL",
            )?;
            println!("configuration ok");
        }
    }
    Ok(())
}
