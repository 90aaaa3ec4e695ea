use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use clap::{Args, Parser, Subcommand};

use flight_routes::{
    load_config, models::DEFAULT_LIMIT, telemetry::init_tracing, RequestContext, ReqwestTransport,
    RouteAggregator, RouteCache, RouteFilters,
};

#[derive(Parser)]
#[command(name = "flight-routes", version, about = "Query flight routes across upstream providers")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "flight-routes.toml")]
    config: PathBuf,

    /// Deadline for the whole request in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch, merge and filter routes from every enabled provider
    Routes(RoutesArgs),
    /// Probe every enabled provider
    Health,
}

#[derive(Args)]
struct RoutesArgs {
    #[arg(long)]
    airline: Option<String>,

    #[arg(long)]
    source: Option<String>,

    #[arg(long)]
    destination: Option<String>,

    #[arg(long)]
    max_stops: Option<u32>,

    #[arg(long, default_value_t = DEFAULT_LIMIT)]
    limit: usize,

    #[arg(long, default_value_t = 0)]
    offset: usize,
}

impl From<RoutesArgs> for RouteFilters {
    fn from(args: RoutesArgs) -> Self {
        RouteFilters {
            airline: args.airline,
            source_airport: args.source,
            destination_airport: args.destination,
            max_stops: args.max_stops,
            limit: args.limit,
            offset: args.offset,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = load_config(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    init_tracing(&config.log)?;

    tracing::info!(
        providers = config.enabled_providers().count(),
        cache_enabled = config.cache.enabled,
        "configuration loaded"
    );

    let cache_config = config.cache.to_cache_config();
    let route_cache = Arc::new(RouteCache::new(cache_config.clone()));
    let _sweeper = cache_config
        .enabled
        .then(|| route_cache.spawn_cleanup(cache_config.cleanup_interval));

    let transport = Arc::new(ReqwestTransport::new()?);
    let aggregator = RouteAggregator::from_config(&config, transport, route_cache)?;

    let mut ctx = RequestContext::default();
    if let Some(ms) = cli.timeout_ms {
        ctx = ctx.with_timeout(Duration::from_millis(ms));
    }
    let (ctx, cancel) = ctx.cancellable();

    tokio::spawn(cancel.cancel_on(tokio::signal::ctrl_c()));

    let output = match cli.command {
        Command::Routes(args) => {
            let result = aggregator.get_routes(&ctx, &args.into()).await?;
            serde_json::to_string_pretty(&result)?
        }
        Command::Health => {
            let report = aggregator.get_health(&ctx).await?;
            serde_json::to_string_pretty(&report)?
        }
    };

    println!("{}", output);
    Ok(())
}
