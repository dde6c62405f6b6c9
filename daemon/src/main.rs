//! Palisade daemon — entry point for running the RPC proxy.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use palisade_admission::{IpBlacklist, RejectLog};
use palisade_aggregator::{run_flush_loop, FlushConfig, NullDemandSink, UsageAggregator};
use palisade_limiter::poll::LimiterPoller;
use palisade_limiter::{RateLimitConfig, RateLimiter};
use palisade_server::{build_router, tls, ProxyConfig, ProxyMetrics, ProxyState};
use palisade_store::CounterStore;
use palisade_store_postgres::PostgresCounterStore;
use palisade_upstream::{
    BreakerConfig, CircuitBreaker, Dispatcher, DispatcherConfig, LogAlertSink,
};
use palisade_utils::ShutdownController;

#[derive(Parser)]
#[command(name = "palisade-daemon", about = "TLS-terminating JSON-RPC proxy")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "palisade.toml")]
    config: PathBuf,

    /// Primary upstream RPC node.
    #[arg(long, env = "PALISADE_PRIMARY_URL")]
    primary_url: Option<String>,

    /// Fallback upstream RPC node.
    #[arg(long, env = "PALISADE_FALLBACK_URL")]
    fallback_url: Option<String>,

    /// Postgres connection string for the counter store.
    #[arg(long, env = "PALISADE_DATABASE_URL")]
    database_url: Option<String>,

    /// Admin endpoint key.
    #[arg(long, env = "PALISADE_ADMIN_API_KEY")]
    admin_api_key: Option<String>,

    /// Listen port override.
    #[arg(long)]
    port: Option<u16>,
}

fn load_config(cli: &Cli) -> anyhow::Result<ProxyConfig> {
    let mut config = if cli.config.exists() {
        ProxyConfig::from_toml_file(&cli.config.to_string_lossy())?
    } else {
        ProxyConfig::default()
    };
    if let Some(url) = &cli.primary_url {
        config.primary_url = url.clone();
    }
    if let Some(url) = &cli.fallback_url {
        config.fallback_url = Some(url.clone());
    }
    if let Some(url) = &cli.database_url {
        config.database_url = url.clone();
    }
    if let Some(key) = &cli.admin_api_key {
        config.admin_api_key = Some(key.clone());
    }
    if let Some(port) = cli.port {
        config.listen_port = port;
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    palisade_utils::logging::init_tracing_with(&config.log_format, &config.log_level);

    // TLS material is read before anything else starts; a bad path is
    // fatal here, not after the loops are already running.
    let tls_material = tls::load_tls(&config).await?;

    let store: Arc<dyn CounterStore> = Arc::new(
        PostgresCounterStore::connect(&config.database_url, config.db_pool_size).await?,
    );

    let breaker = Arc::new(CircuitBreaker::new(
        BreakerConfig {
            failure_threshold: config.failure_threshold,
            reset_timeout: Duration::from_secs(config.breaker_reset_timeout_secs),
            has_fallback: config.fallback_url.is_some(),
        },
        Box::new(LogAlertSink),
    ));
    let dispatcher = Arc::new(Dispatcher::new(
        DispatcherConfig {
            primary_url: config.primary_url.clone(),
            fallback_url: config.fallback_url.clone(),
            request_timeout: Duration::from_secs(config.request_timeout_secs),
            fallback_timeout: Duration::from_secs(config.fallback_timeout_secs),
            accept_invalid_certs: config.accept_invalid_upstream_certs,
        },
        Arc::clone(&breaker),
    )?);

    let limiter = Arc::new(RateLimiter::new(RateLimitConfig {
        origin_hourly_limit: config.origin_hourly_limit,
        ip_hourly_limit: config.ip_hourly_limit,
        origin_daily_limit: config.origin_daily_limit,
        ip_daily_limit: config.ip_daily_limit,
        poll_interval_secs: config.rate_limit_poll_interval_secs,
    }));
    let blacklist = Arc::new(IpBlacklist::new(config.blacklist_path.clone()));
    let aggregator = Arc::new(UsageAggregator::new(config.synthetic_origins.clone()));

    let shutdown = Arc::new(ShutdownController::new());
    let reject_log = match &config.reject_log_path {
        Some(path) => RejectLog::spawn(path.clone(), shutdown.subscribe()),
        None => RejectLog::disabled(),
    };

    // Supervised background loops: blacklist watcher, limiter poll,
    // aggregator flush. Each is single-flight and owns its own errors.
    tokio::spawn(Arc::clone(&blacklist).run(shutdown.subscribe()));
    let poller = Arc::new(LimiterPoller::new(Arc::clone(&limiter), Arc::clone(&store)));
    tokio::spawn(poller.run(shutdown.subscribe()));
    tokio::spawn(run_flush_loop(
        Arc::clone(&aggregator),
        Arc::clone(&store),
        Arc::new(NullDemandSink),
        None,
        FlushConfig {
            interval: Duration::from_secs(config.background_tasks_interval_secs),
        },
        shutdown.subscribe(),
    ));

    let state = Arc::new(ProxyState {
        upstream: dispatcher,
        breaker,
        limiter,
        blacklist,
        aggregator,
        reject_log,
        metrics: Arc::new(ProxyMetrics::new()),
        admin_key: config.admin_api_key.clone(),
        started_at: palisade_utils::time::unix_now(),
    });
    let router = build_router(state);

    let signal_controller = Arc::clone(&shutdown);
    tokio::spawn(async move { signal_controller.wait_for_signal().await });

    let mut stopping = shutdown.subscribe();
    tokio::select! {
        result = tls::serve(router, &config, tls_material) => result?,
        _ = stopping.recv() => {
            tracing::info!("shutting down; draining background loops");
            // Give the flush loop and reject log a beat to drain.
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    Ok(())
}
