use clap::Parser;
use futures::stream::{self, StreamExt};
use serde_json::json;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use floodgate::config::{ClockSource, Dimension, LimiterConfig, LimiterType, PluginConfig, TimeUnit};
use floodgate::plugin::PluginRegistry;
use floodgate::ratelimit::LimiterService;
use floodgate::store::{MemoryStore, RedisStore, ScriptStore};

/// Fire a burst of requests at a limiter and print every decision.
#[derive(Parser, Debug)]
#[command(name = "floodgate")]
#[command(version)]
#[command(about = "Exercise a rate limiter against a shared store", long_about = None)]
struct Args {
    /// Redis connection URL
    #[arg(long, env = "REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    redis_url: String,

    /// Use an in-process store instead of Redis
    #[arg(long)]
    memory: bool,

    /// Algorithm: counter, sliding_window, token_bucket, leaky_bucket
    #[arg(short = 't', long = "type", default_value = "counter")]
    limiter_type: LimiterType,

    /// Maximum rate per time unit
    #[arg(short = 'r', long, default_value_t = 10)]
    max_rate: u64,

    /// Time unit of the rate: s, m, h, d
    #[arg(short = 'u', long, default_value = "s")]
    unit: TimeUnit,

    /// Key dimension: global, user, ip, api
    #[arg(short, long, default_value = "global")]
    dimension: Dimension,

    /// Key prefix
    #[arg(long, default_value = "ratelimit")]
    prefix: String,

    /// Key to limit
    #[arg(short, long, default_value = "demo")]
    key: String,

    /// Number of requests to send
    #[arg(short = 'n', long, default_value_t = 20)]
    requests: usize,

    /// Tokens per request
    #[arg(long, default_value_t = 1)]
    tokens: u64,

    /// Requests in flight at once
    #[arg(short, long, default_value_t = 1)]
    concurrency: usize,

    /// Keys that bypass the limit
    #[arg(long = "allow", value_delimiter = ',')]
    allow_list: Vec<String>,

    /// Use the store's clock instead of this host's
    #[arg(long)]
    store_clock: bool,

    /// Per-call store deadline in milliseconds
    #[arg(long)]
    store_timeout_ms: Option<u64>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.json_logs);

    info!("Starting Floodgate");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let store: Arc<dyn ScriptStore> = if args.memory {
        info!("Using in-process store");
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(RedisStore::connect(&args.redis_url).await?)
    };

    let mut config = LimiterConfig::new(args.limiter_type, args.max_rate, args.unit)
        .with_key_prefix(args.prefix.clone())
        .with_dimension(args.dimension);
    if args.store_clock {
        config = config.with_clock_source(ClockSource::Store);
    }
    config.store_timeout_ms = args.store_timeout_ms;
    if !args.allow_list.is_empty() {
        config = config.with_plugin(PluginConfig::new(
            "allowlist",
            json!({ "allowlist": args.allow_list }),
        ));
    }

    let service = LimiterService::new(store, Arc::new(PluginRegistry::with_builtins()));
    let limiter = service.create_limiter(config)?;

    info!(
        limiter = %args.limiter_type,
        key = %args.key,
        requests = args.requests,
        concurrency = args.concurrency,
        "Sending requests"
    );

    let key = args.key.as_str();
    let tokens = args.tokens;
    let mut decisions = stream::iter(0..args.requests)
        .map(|index| {
            let limiter = limiter.clone();
            async move { (index, limiter.allow(key, tokens).await) }
        })
        .buffer_unordered(args.concurrency.max(1));

    let mut admitted = 0usize;
    while let Some((index, decision)) = decisions.next().await {
        let result = decision?;
        if result.allowed {
            admitted += 1;
        }
        println!("{}", json!({ "request": index, "key": key, "result": result }));
    }

    info!(
        admitted = admitted,
        denied = args.requests - admitted,
        "Run finished"
    );
    Ok(())
}

fn init_tracing(json_logs: bool) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(std::io::stderr);

    if json_logs {
        builder.json().init();
    } else {
        builder.init();
    }
}
