//! Lantern Server
//!
//! Wires the whole system together: engine, batcher, network
//! collectors, continuous-query scheduler and the HTTP API, with
//! graceful shutdown on SIGINT/SIGTERM.

use clap::Parser;
use lantern::api::{self, AppState};
use lantern::config::{generate_default_config, Config};
use lantern::cq::CqService;
use lantern::engine::{Batcher, Engine, EngineConfig, Searcher};
use lantern::input;
use lantern::meta::MetaStore;
use lantern::observe::Stats;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "lantern", version, about = "Time-partitioned syslog search engine")]
struct Args {
    /// Path to a TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the data directory.
    #[arg(long)]
    data_dir: Option<String>,

    /// Print a commented default configuration and exit.
    #[arg(long)]
    print_default_config: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    if args.print_default_config {
        print!("{}", generate_default_config());
        return;
    }

    let mut config = match &args.config {
        Some(path) => match Config::load_with_env(path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("{}", e);
                std::process::exit(1);
            }
        },
        None => Config::from_env(),
    };
    if let Some(dir) = args.data_dir {
        config.engine.data_dir = dir;
    }

    init_logging(&config);

    if let Err(e) = run(config).await {
        tracing::error!("fatal: {}", e);
        std::process::exit(1);
    }
}

fn init_logging(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| format!("lantern={}", config.logging.level)),
    );
    if config.logging.format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!("lantern v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("data directory: {}", config.engine.data_dir);

    let stats = Arc::new(Stats::new());
    let shutdown = CancellationToken::new();

    let mut engine_cfg = EngineConfig::new(&config.engine.data_dir);
    engine_cfg.num_shards = config.engine.num_shards;
    engine_cfg.num_caches = config.engine.num_caches;
    engine_cfg.index_duration = Duration::from_secs(config.engine.index_duration_secs.max(1));
    engine_cfg.retention_period = Duration::from_secs(config.engine.retention_period_secs);
    engine_cfg.retention_check_interval =
        Duration::from_secs(config.engine.retention_check_interval_secs.max(1));
    engine_cfg.stats = Arc::clone(&stats);
    let engine = Engine::open(engine_cfg)?;

    let meta = Arc::new(MetaStore::new(
        Path::new(&config.engine.data_dir).join("meta"),
    ));
    meta.load()?;

    let batcher = Batcher::start(
        Arc::clone(&engine),
        config.batch.size,
        Duration::from_millis(config.batch.duration_ms.max(1)),
        config.batch.max_outstanding,
        None,
    );

    if !config.input.tcp_bind.is_empty() {
        let tls = match (&config.input.tls_cert, &config.input.tls_key) {
            (Some(cert), Some(key)) => {
                Some(input::load_tls_acceptor(Path::new(cert), Path::new(key))?)
            }
            _ => None,
        };
        input::start_tcp(
            &config.input.tcp_bind,
            &config.input.format,
            tls,
            batcher.sender(),
            Arc::clone(&stats),
            shutdown.clone(),
        )
        .await?;
    }
    if !config.input.udp_bind.is_empty() {
        input::start_udp(
            &config.input.udp_bind,
            &config.input.format,
            batcher.sender(),
            Arc::clone(&stats),
            shutdown.clone(),
        )
        .await?;
    }

    let cq_handle = if config.cq.enabled {
        let service = Arc::new(CqService::new(
            engine.clone() as Arc<dyn Searcher>,
            Arc::clone(&meta),
            Duration::from_secs(config.cq.run_interval_secs.max(1)),
            Arc::clone(&stats),
        ));
        Some(tokio::spawn(service.run(shutdown.clone())))
    } else {
        None
    };

    let state = AppState::new(
        engine.clone() as Arc<dyn Searcher>,
        Arc::clone(&meta),
        batcher.sender(),
        Arc::clone(&stats),
    );
    let http_bind = config.http.bind.clone();
    let http_shutdown = shutdown.clone();
    let mut http =
        tokio::spawn(async move { api::serve(state, &http_bind, http_shutdown).await });

    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received, stopping");
        }
        result = &mut http => {
            shutdown.cancel();
            batcher.stop().await;
            engine.close().await;
            match result {
                Ok(Ok(())) => return Err("http server exited unexpectedly".into()),
                Ok(Err(e)) => return Err(Box::new(e)),
                Err(e) => return Err(Box::new(e)),
            }
        }
    }

    shutdown.cancel();
    batcher.stop().await;
    if let Some(handle) = cq_handle {
        let _ = handle.await;
    }
    match http.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!("http server: {}", e),
        Err(e) => tracing::warn!("http task: {}", e),
    }
    engine.close().await;

    tracing::info!("lantern shutdown complete");
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
