use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use turnstile::config::{GateConfig, LogConfig};
use turnstile::ratelimit::{Decision, RateLimiter, RuleSet};
use turnstile::reload::{ConfigStore, ConfigWatcher};
use turnstile::store::{CounterStore, MemoryStore, RedisStore};

/// How often in-memory counters are swept for expired windows.
const MEMORY_PURGE_INTERVAL: Duration = Duration::from_secs(30);

/// Rule-based rate limiting gate for HTTP API proxies.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Settings file (YAML, TOML or JSON); `TURNSTILE_*` variables override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Rules file, overriding `rules_path` from settings
    #[arg(short, long, global = true)]
    rules: Option<PathBuf>,

    /// Redis URL, overriding `redis.url` from settings
    #[arg(long, global = true)]
    redis_url: Option<String>,

    /// Count in process memory instead of Redis
    #[arg(long, global = true)]
    memory: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Load rules, connect to the counting store and keep rules in sync with the file
    Serve,
    /// Parse the rules file and print the rules that would be enforced
    Validate {
        /// Print the accepted rules as JSON
        #[arg(long)]
        json: bool,
    },
    /// Evaluate requests against the configured rules and store
    Check {
        /// Client address
        #[arg(long)]
        ip: String,
        /// Request path
        #[arg(long)]
        path: String,
        /// Number of requests to send
        #[arg(long, default_value_t = 1)]
        repeat: u32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = GateConfig::load(cli.config.as_deref()).context("Failed to load settings")?;
    if let Some(rules) = cli.rules {
        config.rules_path = rules;
    }
    if let Some(url) = cli.redis_url {
        config.redis.url = url;
    }

    init_tracing(&config.log);

    match cli.command {
        Command::Serve => serve(&config, cli.memory).await,
        Command::Validate { json } => validate(&config, json),
        Command::Check { ip, path, repeat } => {
            if cli.memory {
                let limiter = build_limiter(&config, Arc::new(MemoryStore::new()))?;
                check(&limiter, &ip, &path, repeat).await;
            } else {
                let store = connect_redis(&config).await?;
                let limiter = build_limiter(&config, Arc::new(store))?;
                check(&limiter, &ip, &path, repeat).await;
            }
            Ok(())
        }
    }
}

fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    if log.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn serve(config: &GateConfig, memory: bool) -> anyhow::Result<()> {
    info!("Starting Turnstile rate limiting gate");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    if memory {
        warn!("Using in-memory counters; limits are not shared between instances");
        let store = Arc::new(MemoryStore::new());
        let limiter = build_limiter(config, store.clone())?;
        let purger = spawn_purger(store, MEMORY_PURGE_INTERVAL);
        let result = run_until_shutdown(config, &limiter).await;
        purger.abort();
        result
    } else {
        let store = connect_redis(config).await?;
        let limiter = build_limiter(config, Arc::new(store))?;
        run_until_shutdown(config, &limiter).await
    }
}

async fn run_until_shutdown<S: CounterStore>(
    config: &GateConfig,
    limiter: &RateLimiter<S>,
) -> anyhow::Result<()> {
    let watcher = if config.reload.enabled {
        Some(ConfigWatcher::start(limiter.config().clone(), config.reload.debounce())?)
    } else {
        info!("Rules hot reload disabled");
        None
    };

    info!(
        rules = limiter.config().current().len(),
        path = %config.rules_path.display(),
        "Rate limiter ready"
    );

    shutdown_signal().await;

    if let Some(watcher) = watcher {
        watcher.stop().await;
    }

    info!("Turnstile stopped");
    Ok(())
}

fn build_limiter<S: CounterStore>(
    config: &GateConfig,
    store: Arc<S>,
) -> anyhow::Result<RateLimiter<S>> {
    let rules = ConfigStore::open(&config.rules_path).with_context(|| {
        format!(
            "Failed to load rate limit rules from {}",
            config.rules_path.display()
        )
    })?;

    let limiter =
        RateLimiter::new(Arc::new(rules), store).with_store_timeout(config.redis.timeout());
    Ok(match &config.key_namespace {
        Some(namespace) => limiter.with_namespace(namespace.clone()),
        None => limiter,
    })
}

fn spawn_purger(store: Arc<MemoryStore>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            let purged = store.purge_expired();
            if purged > 0 {
                debug!(purged, remaining = store.len(), "Purged expired counters");
            }
        }
    })
}

async fn connect_redis(config: &GateConfig) -> anyhow::Result<RedisStore> {
    let store = RedisStore::connect(&config.redis.url)
        .await
        .context("Failed to connect to Redis")?;
    store.ping().await.context("Redis is not reachable")?;
    Ok(store)
}

fn validate(config: &GateConfig, json: bool) -> anyhow::Result<()> {
    let rules = RuleSet::from_file(&config.rules_path).with_context(|| {
        format!(
            "Failed to load rate limit rules from {}",
            config.rules_path.display()
        )
    })?;

    if json {
        println!("{}", serde_json::to_string_pretty(&rules)?);
    } else {
        println!(
            "{}: {} rule(s)",
            config.rules_path.display(),
            rules.len()
        );
        for (index, rule) in rules.iter().enumerate() {
            println!("  {index}: {rule}  [{}]", rule.key());
        }
    }
    Ok(())
}

async fn check<S: CounterStore>(limiter: &RateLimiter<S>, ip: &str, path: &str, repeat: u32) {
    for n in 1..=repeat {
        let verdict = match limiter.check(ip, path).await {
            Decision::Admitted => "admitted".to_string(),
            Decision::Denied { key, count, .. } => format!("denied ({key} at {count})"),
            Decision::FailedOpen { error, .. } => format!("admitted, store failed: {error}"),
        };
        println!("{n}: {ip} {path} -> {verdict}");
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
