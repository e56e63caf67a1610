use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Parser, Subcommand};
use eventide::{BackendKind, Engine, EngineConfig, EventQuery};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "eventide", version, about = "Eventide CLI")]
struct Cli {
    /// Postgres connection string for a single shard. Falls back to DATABASE_URL.
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Shard connection strings (repeatable). Overrides --database-url.
    #[arg(long = "shard", action = ArgAction::Append)]
    shards: Vec<String>,

    /// Base schema holding the namespace registry (default: public)
    #[arg(long, default_value = "public")]
    schema: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List namespaces across all shards
    Namespaces,

    /// Create a namespace on the least loaded shard
    Create { namespace: String },

    /// Drop a namespace and all of its chunk tables
    Drop { namespace: String },

    /// Print matching events as JSON lines
    Get {
        namespace: String,
        #[arg(long)]
        start: i64,
        #[arg(long)]
        end: i64,
        /// Metadata predicate as key=query (repeatable)
        #[arg(long = "meta", action = ArgAction::Append)]
        metadata: Vec<String>,
        /// Dimension predicate as key=query (repeatable)
        #[arg(long = "dim", action = ArgAction::Append)]
        dimensions: Vec<String>,
        #[arg(long, default_value_t = 0)]
        limit: i64,
        #[arg(long)]
        descending: bool,
    },

    /// Archive [start, end) into DIR; nothing is written for an empty range
    Archive {
        namespace: String,
        #[arg(long)]
        start: i64,
        #[arg(long)]
        end: i64,
        #[arg(long)]
        dir: PathBuf,
        /// Window per archive entry in minutes (1-60)
        #[arg(long, default_value_t = 60)]
        window_minutes: u64,
        /// Delete the range after archiving it
        #[arg(long)]
        expire: bool,
    },

    /// Restore an archive file into a namespace
    Restore { namespace: String, file: PathBuf },
}

fn split_pair(raw: &str) -> eventide::Result<(String, String)> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| eventide::Error::InvalidQuery(format!("expected key=query, got `{raw}`")))
}

#[tokio::main]
async fn main() -> eventide::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let shards = if cli.shards.is_empty() {
        cli.database_url.into_iter().collect()
    } else {
        cli.shards
    };
    let mut config = if shards.is_empty() {
        EngineConfig::from_env()?
    } else {
        EngineConfig::postgres(shards)
    };
    config.base_schema = cli.schema;
    if config.backend == BackendKind::Memory {
        eprintln!("error: --database-url, --shard or EVENTIDE_SHARDS is required");
        std::process::exit(2);
    }

    let engine = Engine::open(config).await?;
    let events = engine.events();

    match cli.command {
        Commands::Namespaces => {
            for namespace in events.namespaces().await? {
                println!("{namespace}");
            }
        }
        Commands::Create { namespace } => {
            events.create(&namespace).await?;
            println!("Created {namespace}.");
        }
        Commands::Drop { namespace } => {
            events.drop_namespace(&namespace).await?;
            println!("Dropped {namespace}.");
        }
        Commands::Get {
            namespace,
            start,
            end,
            metadata,
            dimensions,
            limit,
            descending,
        } => {
            let mut query = EventQuery::new(namespace, start, end).limit(limit);
            if descending {
                query = query.descending();
            }
            for raw in &metadata {
                let (key, value) = split_pair(raw)?;
                query = query.metadata(key, value);
            }
            for raw in &dimensions {
                let (key, value) = split_pair(raw)?;
                query = query.dimension(key, value);
            }
            for event in events.get(&query).await? {
                println!("{}", serde_json::to_string(&event)?);
            }
        }
        Commands::Archive {
            namespace,
            start,
            end,
            dir,
            window_minutes,
            expire,
        } => {
            let query = EventQuery::new(namespace, start, end);
            let archiver = engine.archiver(dir);
            match archiver
                .archive(&query, Duration::from_secs(window_minutes * 60))
                .await?
            {
                Some(summary) => println!(
                    "Archived {} events in {} entries to {}",
                    summary.events,
                    summary.entries,
                    summary.path.display()
                ),
                None => println!("No events in range; no archive written."),
            }
            if expire && end > start {
                let mut range = query.clone();
                range.end = end - 1;
                let deleted = events.expire(&range).await?;
                println!("Expired {deleted} events.");
            }
        }
        Commands::Restore { namespace, file } => {
            let report = engine.archiver(".").restore(&namespace, &file).await?;
            println!(
                "Restored {} events from {} entries into {}",
                report.events, report.entries, report.namespace
            );
        }
    }

    Ok(())
}
