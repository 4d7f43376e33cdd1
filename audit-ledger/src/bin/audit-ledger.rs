//! Audit ledger command-line tool
//!
//! Runs one ledger operation against the configured store and prints the
//! result as JSON on stdout. Logs go to stderr.

use anyhow::{Context, Result};
use audit_ledger::{
    Backend, Config, EventQuery, IndexStrategy, Ledger, NewEvent, PageToken, Value,
};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;

/// Append-only audit ledger for application lifecycle events.
#[derive(Debug, Parser)]
#[command(name = "audit-ledger")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to a TOML configuration file.
    #[arg(long, global = true, env = "AUDIT_LEDGER_CONFIG")]
    config: Option<PathBuf>,

    /// Data directory (overrides the configuration file).
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Record store backend (memory or rocksdb).
    #[arg(long, global = true)]
    backend: Option<Backend>,

    /// History strategy (auto, maintained or scan).
    #[arg(long, global = true)]
    index_strategy: Option<IndexStrategy>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true, env = "AUDIT_LEDGER_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Register a new event.
    Register {
        /// Unique event id.
        #[arg(long)]
        id: String,

        /// Event type (e.g. CREACION, APROBACION).
        #[arg(long = "type")]
        event_type: String,

        /// Application the event belongs to.
        #[arg(long)]
        correlation_id: String,

        /// Acting user id.
        #[arg(long)]
        actor_id: String,

        /// Acting user display name.
        #[arg(long)]
        actor_name: String,

        /// Payload as a JSON object.
        #[arg(long, default_value = "{}")]
        payload: String,
    },

    /// Show one event.
    Get {
        /// Event id.
        id: String,
    },

    /// Check whether an event id is taken.
    Exists {
        /// Event id.
        id: String,
    },

    /// Show the history of one application, oldest first.
    History {
        /// Application id.
        correlation_id: String,
    },

    /// List all events, one page at a time.
    List {
        /// Token returned by the previous page.
        #[arg(long)]
        page_token: Option<String>,

        /// Events per page.
        #[arg(long, default_value_t = 50)]
        page_size: usize,
    },

    /// Filter events by application, type and time window.
    Query {
        /// Application id.
        #[arg(long)]
        correlation_id: Option<String>,

        /// Event type.
        #[arg(long = "type")]
        event_type: Option<String>,

        /// Earliest commit time (RFC 3339).
        #[arg(long)]
        from: Option<DateTime<Utc>>,

        /// Latest commit time (RFC 3339).
        #[arg(long)]
        until: Option<DateTime<Utc>>,

        /// Maximum number of events.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Check a stored record and print its content hash.
    Verify {
        /// Event id.
        id: String,
    },

    /// Check every record of one application and print a combined digest.
    VerifyHistory {
        /// Application id.
        correlation_id: String,
    },

    /// Show storage statistics.
    Stats,

    /// Write missing secondary index entries.
    RebuildIndex,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr);
    if cli.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    if let Err(e) = run(cli) {
        if let Some(err) = e.downcast_ref::<audit_ledger::Error>() {
            if !err.is_permanent() {
                tracing::warn!(error = %err, "Transient failure, the command may be retried");
            }
        }
        return Err(e);
    }

    Ok(())
}

fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli)?;
    let ledger = Ledger::open(config).context("failed to open ledger")?;

    match cli.command {
        Commands::Register {
            id,
            event_type,
            correlation_id,
            actor_id,
            actor_name,
            payload,
        } => {
            let payload = Value::parse_json(&payload)?;
            let event = NewEvent::new(id, event_type, correlation_id, actor_id, actor_name, payload);
            print_json(&ledger.register_event(event)?)
        }
        Commands::Get { id } => print_json(&ledger.get_event(&id)?),
        Commands::Exists { id } => print_json(&serde_json::json!({
            "id": id,
            "exists": ledger.exists(&id)?,
        })),
        Commands::History { correlation_id } => print_json(&ledger.get_history(&correlation_id)?),
        Commands::List {
            page_token,
            page_size,
        } => {
            let token = page_token.map(PageToken::from_opaque);
            print_json(&ledger.list_all(token.as_ref(), page_size)?)
        }
        Commands::Query {
            correlation_id,
            event_type,
            from,
            until,
            limit,
        } => {
            let mut query = EventQuery::new();
            if let Some(correlation_id) = correlation_id {
                query = query.correlation_id(correlation_id);
            }
            if let Some(event_type) = event_type {
                query = query.event_type(event_type.as_str());
            }
            if let Some(from) = from {
                query = query.from(from);
            }
            if let Some(until) = until {
                query = query.until(until);
            }
            if let Some(limit) = limit {
                query = query.limit(limit);
            }
            print_json(&ledger.query(&query)?)
        }
        Commands::Verify { id } => print_json(&serde_json::json!({
            "id": id,
            "hash": ledger.verify_event(&id)?,
        })),
        Commands::VerifyHistory { correlation_id } => {
            print_json(&ledger.verify_history(&correlation_id)?)
        }
        Commands::Stats => print_json(&ledger.stats()?),
        Commands::RebuildIndex => print_json(&serde_json::json!({
            "written": ledger.rebuild_index()?,
        })),
    }
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => Config::default(),
    };
    config.apply_env()?;

    if let Some(data_dir) = &cli.data_dir {
        config.data_dir = data_dir.clone();
    }
    if let Some(backend) = cli.backend {
        config.backend = backend;
    }
    if let Some(strategy) = cli.index_strategy {
        config.index.strategy = strategy;
    }

    Ok(config)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
