//! truenas-rpc
//!
//! Operator tool for a TrueNAS appliance: connectivity checks, ad-hoc
//! method calls, queries and job inspection over the JSON-RPC WebSocket.
//! Results are printed to stdout as JSON; logs go to stderr.

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use truenas_rpc::{CancellationToken, Client, ClientConfig, QueryParams};

// =============================================================================
// CLI Arguments
// =============================================================================

/// TrueNAS JSON-RPC client
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Appliance hostname or IP, optionally with :port
    #[arg(long, env = "TRUENAS_HOST")]
    host: Option<String>,

    /// API key created in the TrueNAS UI
    #[arg(long, env = "TRUENAS_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Verify the appliance's TLS certificate
    #[arg(long, env = "TRUENAS_VERIFY_SSL")]
    verify_ssl: Option<bool>,

    /// Per-call timeout in seconds
    #[arg(long, env = "TRUENAS_TIMEOUT")]
    timeout: Option<u64>,

    /// YAML configuration file; flags and env vars override its values
    #[arg(long, short = 'c', env = "TRUENAS_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "warn")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect, authenticate and ping the appliance
    Ping,

    /// Call any method with positional JSON parameters
    Call {
        /// Method name, e.g. system.info
        method: String,
        /// Parameters as a JSON array
        #[arg(default_value = "[]")]
        params: String,
    },

    /// List objects of a kind, e.g. pool.dataset
    Query {
        kind: String,
        /// Filter as field=value or field:op:value (repeatable)
        #[arg(long = "filter", short = 'f')]
        filters: Vec<String>,
        #[arg(long)]
        limit: Option<u64>,
        #[arg(long)]
        offset: Option<u64>,
        /// Return only the number of matches
        #[arg(long)]
        count: bool,
        /// Ordering field; prefix with - for descending (repeatable)
        #[arg(long = "order-by")]
        order_by: Vec<String>,
        /// Field to return (repeatable)
        #[arg(long)]
        select: Vec<String>,
    },

    /// Fetch one object by id
    Get { kind: String, id: String },

    /// Show a job, or wait for it to finish
    Job {
        id: i64,
        /// Poll until the job reaches a terminal state
        #[arg(long)]
        wait: bool,
        /// Maximum time to wait, in seconds
        #[arg(long, default_value = "600")]
        wait_timeout: u64,
    },
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let config = load_config(&args)?;
    debug!(?config, "Resolved configuration");

    let client = Client::new(config)?;
    let ctx = CancellationToken::new();

    let interrupt = ctx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling");
            interrupt.cancel();
        }
    });

    let outcome = run(&client, &ctx, args.command).await;
    client.close().await;

    let output = outcome?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn run(client: &Client, ctx: &CancellationToken, command: Command) -> anyhow::Result<Value> {
    match command {
        Command::Ping => {
            let started = std::time::Instant::now();
            let pong: Value = client.call(ctx, "core.ping", ()).await?;
            let elapsed = started.elapsed();
            info!(host = %client.config().host, ?elapsed, "Appliance answered");
            Ok(serde_json::json!({
                "host": client.config().host,
                "reply": pong,
                "elapsed_ms": elapsed.as_millis() as u64,
            }))
        }

        Command::Call { method, params } => {
            let params: Value =
                serde_json::from_str(&params).context("params must be a JSON array")?;
            anyhow::ensure!(params.is_array(), "params must be a JSON array");
            Ok(client.call(ctx, &method, params).await?)
        }

        Command::Query {
            kind,
            filters,
            limit,
            offset,
            count,
            order_by,
            select,
        } => {
            let mut query = QueryParams::new().order_by(order_by).select(select);
            for filter in &filters {
                let (field, op, value) = parse_filter(filter)?;
                query = query.filter(field, op, value);
            }
            if let Some(limit) = limit {
                query = query.limit(limit);
            }
            if let Some(offset) = offset {
                query = query.offset(offset);
            }
            if count {
                query = query.count();
            }
            Ok(client.query(ctx, &kind, Some(&query)).await?)
        }

        Command::Get { kind, id } => Ok(client.get_instance(ctx, &kind, parse_value(&id)).await?),

        Command::Job {
            id,
            wait,
            wait_timeout,
        } => {
            if wait {
                let result = client
                    .wait_for_job(ctx, id, Duration::from_secs(wait_timeout))
                    .await?;
                Ok(result)
            } else {
                Ok(serde_json::to_value(client.job(ctx, id).await?)?)
            }
        }
    }
}

// =============================================================================
// Configuration
// =============================================================================

fn load_config(args: &Args) -> anyhow::Result<ClientConfig> {
    let mut config = match &args.config {
        Some(path) => ClientConfig::from_yaml_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ClientConfig::default(),
    };

    if let Some(host) = &args.host {
        config.host = host.clone();
    }
    if let Some(api_key) = &args.api_key {
        config.api_key = api_key.clone();
    }
    if let Some(verify_ssl) = args.verify_ssl {
        config.verify_ssl = verify_ssl;
    }
    if let Some(secs) = args.timeout {
        config = config.with_timeout(Duration::from_secs(secs));
    }

    config.validate()?;
    Ok(config)
}

/// Parse a JSON scalar, falling back to a plain string
fn parse_value(text: &str) -> Value {
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}

/// `field=value` or `field:op:value`
fn parse_filter(text: &str) -> anyhow::Result<(String, String, Value)> {
    if let Some((field, value)) = text.split_once('=') {
        if !field.contains(':') {
            return Ok((field.to_string(), "=".to_string(), parse_value(value)));
        }
    }
    let mut parts = text.splitn(3, ':');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(field), Some(op), Some(value)) if !field.is_empty() && !op.is_empty() => {
            Ok((field.to_string(), op.to_string(), parse_value(value)))
        }
        _ => anyhow::bail!("invalid filter {:?}: expected field=value or field:op:value", text),
    }
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["tungstenite=warn", "tokio_tungstenite=warn", "rustls=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}
