use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, RwLock};

use anthropic_lb::configuration::{Config, LogFormat, LoggingConfig};
use anthropic_lb::metric::Metrics;
use anthropic_lb::proxy::Dispatcher;
use anthropic_lb::server::{self, AppState};
use anthropic_lb::storage::{self, UsageStorage};
use anthropic_lb::tracker::SubscriptionTracker;
use anthropic_lb::upstream::UpstreamClient;
use clap::Parser;

#[derive(Parser)]
#[command(about = "Load-balancing reverse proxy for the Anthropic API")]
struct Args {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,
}

fn setup_logging(config: &LoggingConfig) {
    let level = log::LevelFilter::from_str(&config.level).unwrap_or(log::LevelFilter::Info);
    let mut builder = env_logger::Builder::new();
    builder
        .filter_level(level)
        .filter_module("hyper", log::LevelFilter::Warn)
        .filter_module("reqwest", log::LevelFilter::Warn);
    if config.format == LogFormat::Json {
        builder.format(|buf, record| {
            writeln!(
                buf,
                "{}",
                serde_json::json!({
                    "ts": chrono::Utc::now().to_rfc3339(),
                    "lvl": record.level().to_string(),
                    "target": record.target(),
                    "msg": record.args().to_string(),
                })
            )
        });
    }
    let _ = builder.try_init();
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            eprintln!(
                "copy config.example.yaml to {} and configure your subscriptions",
                args.config.display()
            );
            std::process::exit(1);
        }
    };
    setup_logging(&config.logging);

    log::info!("anthropic load balancer starting up");
    for sub in &config.subscriptions {
        log::info!(
            "  subscription '{}': max_concurrent={}, priority={}, {}",
            sub.name,
            sub.max_concurrent,
            sub.priority,
            if sub.enabled { "enabled" } else { "disabled" }
        );
    }

    let metrics = Arc::new(Metrics::new());
    let tracker = Arc::new(SubscriptionTracker::new(
        config.subscriptions.clone(),
        config.rate_limit.cooldown_seconds,
        metrics.clone(),
    ));

    let upstream = match UpstreamClient::new(&config.upstream) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            log::error!("failed to build upstream client: {e}");
            std::process::exit(1);
        }
    };

    let storage = match UsageStorage::open(&config.storage.path) {
        Ok(storage) => Arc::new(storage),
        Err(e) => {
            log::error!(
                "failed to open usage storage at {}: {e}",
                config.storage.path.display()
            );
            std::process::exit(1);
        }
    };
    let usage_tx = storage::start_writer(storage.clone());

    let dispatcher = Arc::new(Dispatcher::new(
        tracker.clone(),
        upstream,
        metrics,
        &config.upstream.base_url,
        Some(usage_tx),
    ));

    let addr = SocketAddr::new(
        config.server.host.parse().unwrap_or_else(|e| {
            log::error!("invalid server.host '{}': {e}", config.server.host);
            std::process::exit(1);
        }),
        config.server.port,
    );

    let state = AppState {
        config: Arc::new(RwLock::new(Arc::new(config))),
        config_path: Arc::new(args.config),
        tracker,
        dispatcher,
        storage,
    };

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            log::error!("failed to bind {addr}: {e}");
            std::process::exit(1);
        }
    };
    log::info!("server listening on {addr}");

    if let Err(e) = server::run(state, listener).await {
        log::error!("server error: {e}");
        std::process::exit(1);
    }
    log::info!("shutdown complete");
}
