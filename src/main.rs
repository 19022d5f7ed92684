use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use resource_governor::config::GovernorConfig;
use resource_governor::ratelimit::{Clock, ManualClock, SystemClock};
use resource_governor::{Context, Decision, MemoryStorage, ResourceGovernor};

/// Dry-run a cost rule set against a simulated, in-memory budget.
#[derive(Parser, Debug)]
#[command(name = "resource-governor", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Evaluate consecutive requests from one tenant
    Check(CheckArgs),
    /// Print the rule table in resolution order
    Rules {
        /// Governor configuration file
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[derive(Args, Debug)]
struct CheckArgs {
    /// Governor configuration file; defaults apply when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Tenant issuing the requests
    #[arg(short, long)]
    tenant: String,

    /// HTTP method
    #[arg(short, long, default_value = "GET")]
    method: String,

    /// Request path
    #[arg(short, long)]
    path: String,

    /// Request header as name=value; repeatable
    #[arg(short = 'H', long = "header", value_parser = parse_header)]
    headers: Vec<(String, String)>,

    /// Number of requests to send
    #[arg(short = 'n', long, default_value_t = 1)]
    count: u32,

    /// Simulated milliseconds between requests
    #[arg(long, default_value_t = 0)]
    interval_ms: u64,

    /// Print one JSON object per decision
    #[arg(long)]
    json: bool,
}

#[derive(Serialize)]
struct Report<'a> {
    request: u32,
    tenant: &'a str,
    cost: u64,
    #[serde(flatten)]
    decision: Decision,
    retry_after_secs: u64,
}

fn parse_header(raw: &str) -> Result<(String, String), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got {:?}", raw))?;
    if name.is_empty() {
        return Err("header name is empty".to_string());
    }
    Ok((name.to_string(), value.to_string()))
}

fn load_config(path: Option<&Path>) -> anyhow::Result<GovernorConfig> {
    let config = match path {
        Some(path) => GovernorConfig::load(path)?,
        None => GovernorConfig::default(),
    };
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Check(args) => check(args).await,
        Command::Rules { config } => rules(&config),
    }
}

async fn check(args: CheckArgs) -> anyhow::Result<()> {
    let config = load_config(args.config.as_deref())?;

    let clock = Arc::new(ManualClock::new(SystemClock.now_nanos()));
    let governor = ResourceGovernor::from_config(Arc::new(MemoryStorage::new()), &config)?
        .with_clock(clock.clone());
    info!(
        refill_rate = config.limits.refill_rate,
        burst_capacity = config.limits.burst_capacity,
        routes = config.routes.len(),
        "Simulating requests"
    );

    let headers: HashMap<String, String> = args.headers.into_iter().collect();
    let cost = governor.resolve_cost(&args.method, &args.path, &headers);
    let ctx = Context::background();

    for request in 1..=args.count {
        let decision = governor
            .allow(&ctx, &args.tenant, &args.method, &args.path, &headers)
            .await?;

        if args.json {
            let report = Report {
                request,
                tenant: &args.tenant,
                cost,
                decision,
                retry_after_secs: decision.retry_after_secs(),
            };
            println!("{}", serde_json::to_string(&report)?);
        } else if decision.allowed {
            println!("#{} allowed cost={} remaining={}", request, cost, decision.remaining);
        } else {
            println!(
                "#{} rejected cost={} remaining={} wait={:?} retry-after={}s",
                request,
                cost,
                decision.remaining,
                decision.wait,
                decision.retry_after_secs()
            );
        }

        clock.advance(Duration::from_millis(args.interval_ms));
    }

    Ok(())
}

fn rules(path: &Path) -> anyhow::Result<()> {
    let config = GovernorConfig::load(path)?;
    let governor = ResourceGovernor::from_config(Arc::new(MemoryStorage::new()), &config)?;

    for rule in governor.engine().rules().iter() {
        println!("{:>6}  {}", rule.specificity(), rule);
    }
    Ok(())
}
