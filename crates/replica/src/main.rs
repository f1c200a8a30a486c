//! Replica: command-line client for a reactive record cache
//!
//! Subcommands:
//! - `get`: Fetch one record
//! - `ids`: Fetch records by id
//! - `list`: Run a query
//! - `watch`: Print a live query view on every change
//! - `create` / `update` / `delete`: Remote writes

use std::sync::Arc;

use clap::{Parser, Subcommand};
use miette::Result;
use serde_json::{Map, Value};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use replica_cache::{
    DEFAULT_NAMESPACE, Order, QueryDescriptor, Record, RecordId, Repository, SyncState,
};
use replica_remote::{FeedClient, HttpDataSource};

#[derive(Parser)]
#[command(name = "replica")]
#[command(about = "Reactive record cache client", long_about = None)]
struct Cli {
    /// Base URL of the record API
    #[arg(long, env = "REPLICA_API_URL")]
    api_url: String,

    /// Bearer token for the record API
    #[arg(long, env = "REPLICA_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Namespace every collection lives in
    #[arg(long, env = "REPLICA_NAMESPACE", default_value = DEFAULT_NAMESPACE)]
    namespace: String,

    #[command(subcommand)]
    command: Commands,
}

/// Query options shared by `list` and `watch`.
#[derive(clap::Args)]
struct QueryArgs {
    /// Equality filter, as `field=value`; repeatable
    #[arg(long = "eq", value_parser = parse_filter)]
    filters: Vec<(String, Value)>,

    /// Field to order by
    #[arg(long)]
    order_by: Option<String>,

    /// Order descending instead of ascending
    #[arg(long)]
    desc: bool,

    /// Maximum number of rows to fetch
    #[arg(long)]
    limit: Option<usize>,
}

impl QueryArgs {
    fn descriptor(&self) -> QueryDescriptor {
        let mut query = QueryDescriptor::new();
        for (field, value) in &self.filters {
            query = query.eq(field.clone(), value.clone());
        }
        if let Some(field) = &self.order_by {
            let order = if self.desc {
                Order::Descending
            } else {
                Order::Ascending
            };
            query = query.order_by(field.clone(), order);
        }
        if let Some(limit) = self.limit {
            query = query.limit(limit);
        }
        query
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch one record
    Get {
        collection: String,
        #[arg(value_parser = parse_id)]
        id: RecordId,
    },

    /// Fetch several records; missing ids are skipped
    Ids {
        collection: String,
        #[arg(value_parser = parse_id, required = true)]
        ids: Vec<RecordId>,
    },

    /// Run a query and print the rows
    List {
        collection: String,
        #[command(flatten)]
        query: QueryArgs,
    },

    /// Follow a query view, printing it on every change until interrupted
    Watch {
        collection: String,

        /// WebSocket change feed URL
        #[arg(long, env = "REPLICA_FEED_URL")]
        feed_url: String,

        #[command(flatten)]
        query: QueryArgs,
    },

    /// Create a record from a JSON object
    Create {
        collection: String,
        #[arg(value_parser = parse_object)]
        fields: Map<String, Value>,
    },

    /// Patch a record with a JSON object
    Update {
        collection: String,
        #[arg(value_parser = parse_id)]
        id: RecordId,
        #[arg(value_parser = parse_object)]
        fields: Map<String, Value>,
    },

    /// Delete a record
    Delete {
        collection: String,
        #[arg(value_parser = parse_id)]
        id: RecordId,
    },
}

/// Integers are integer ids, anything else is a text id.
fn parse_id(s: &str) -> Result<RecordId, String> {
    if s.is_empty() {
        return Err("record id must not be empty".to_string());
    }
    Ok(s.parse::<i64>()
        .map(RecordId::Int)
        .unwrap_or_else(|_| RecordId::Text(s.to_string())))
}

/// Parse `field=value`. Values are read as JSON when they parse, as strings
/// otherwise, so `--eq done=true` and `--eq status=open` both work.
fn parse_filter(s: &str) -> Result<(String, Value), String> {
    let (field, raw) = s
        .split_once('=')
        .ok_or_else(|| format!("invalid filter '{}', expected field=value", s))?;
    if field.is_empty() {
        return Err(format!("invalid filter '{}', field name is empty", s));
    }
    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Ok((field.to_string(), value))
}

fn parse_object(s: &str) -> Result<Map<String, Value>, String> {
    match serde_json::from_str(s) {
        Ok(Value::Object(fields)) => Ok(fields),
        Ok(_) => Err("expected a JSON object".to_string()),
        Err(e) => Err(format!("invalid JSON: {}", e)),
    }
}

fn print_records(records: &[Record]) -> Result<()> {
    let rows: Vec<&Map<String, Value>> = records.iter().map(Record::fields).collect();
    let json = serde_json::to_string_pretty(&rows).map_err(|e| miette::miette!("{}", e))?;
    println!("{}", json);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "replica=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let mut remote = HttpDataSource::new(&cli.api_url).map_err(|e| miette::miette!("{}", e))?;
    if let Some(token) = &cli.token {
        remote = remote.with_bearer_token(token.clone());
    }
    let mut builder = Repository::builder(Arc::new(remote)).namespace(cli.namespace.clone());
    if let Commands::Watch {
        collection,
        feed_url,
        ..
    } = &cli.command
    {
        let feed = FeedClient::new(feed_url.clone())
            .with_namespace(cli.namespace.clone())
            .with_collection(collection.clone());
        builder = builder.event_source(Arc::new(feed));
    }
    let repo = builder
        .build()
        .map_err(|e| miette::miette!("failed to start repository: {}", e))?;

    let result = run(&repo, cli.command).await;
    repo.destroy();
    result
}

async fn run(repo: &Repository, command: Commands) -> Result<()> {
    match command {
        Commands::Get { collection, id } => {
            let record = repo
                .fetch_by_id(&collection, &id)
                .await
                .map_err(|e| miette::miette!("{}", e))?
                .ok_or_else(|| miette::miette!("{} {} not found", collection, id))?;
            print_records(&[record])
        }
        Commands::Ids { collection, ids } => {
            let records = repo
                .fetch_by_ids(&collection, &ids)
                .await
                .map_err(|e| miette::miette!("{}", e))?;
            if records.len() < ids.len() {
                warn!(
                    requested = ids.len(),
                    found = records.len(),
                    "some records were not found"
                );
            }
            print_records(&records)
        }
        Commands::List { collection, query } => {
            let records = repo
                .fetch_list(&collection, &query.descriptor())
                .await
                .map_err(|e| miette::miette!("{}", e))?;
            print_records(&records)
        }
        Commands::Watch {
            collection, query, ..
        } => watch(repo, &collection, &query.descriptor()).await,
        Commands::Create { collection, fields } => {
            let record = repo
                .create(&collection, fields)
                .await
                .map_err(|e| miette::miette!("{}", e))?;
            print_records(&[record])
        }
        Commands::Update {
            collection,
            id,
            fields,
        } => {
            let record = repo
                .update(&collection, &id, fields)
                .await
                .map_err(|e| miette::miette!("{}", e))?;
            print_records(&[record])
        }
        Commands::Delete { collection, id } => {
            repo.delete(&collection, &id)
                .await
                .map_err(|e| miette::miette!("{}", e))?;
            info!(collection = %collection, id = %id, "deleted");
            Ok(())
        }
    }
}

async fn watch(repo: &Repository, collection: &str, query: &QueryDescriptor) -> Result<()> {
    let mut view = repo
        .watch_list("cli", collection, query)
        .await
        .map_err(|e| miette::miette!("{}", e))?;
    let mut sync_state = repo.watch_sync_state();
    print_records(&view.current())?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, shutting down");
                return Ok(());
            }
            changed = view.changed() => {
                let records = changed.map_err(|e| miette::miette!("{}", e))?;
                print_records(&records)?;
            }
            changed = sync_state.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                let state = *sync_state.borrow_and_update();
                match state {
                    SyncState::Live => info!("change feed live"),
                    SyncState::Offline => warn!("change feed offline, view may go stale"),
                    SyncState::Halted => {
                        return Err(miette::miette!("change feed delivered a malformed event"));
                    }
                }
            }
        }
    }
}
