use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use application::{DeviceManager, RuntimeSettings};
use engine_server::{api, setup_app_state};
use infrastructure::{EngineConfig, MetricsSink, ModelStore};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to config directory (optional)
    #[arg(long, default_value = "config")]
    config_dir: String,

    /// Override API port
    #[arg(long)]
    api_port: Option<u16>,

    /// Override the device model directory
    #[arg(long)]
    model_dir: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "info,engine_server=debug,application=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("🛰️ Device Engine starting...");

    let args = Args::parse();
    let mut config = EngineConfig::load(&args.config_dir)?;
    if let Some(port) = args.api_port {
        config.api.port = port;
    }
    if let Some(dir) = args.model_dir {
        config.model_dir = Some(dir);
    }

    info!(model_dir = %config.model_dir(), "📂 Model directory");

    // 1. Metrics sink (fire-and-forget writer; devices never block on it)
    let sink = MetricsSink::start(config.sink.clone());

    // 2. Device manager + persisted models
    let settings = RuntimeSettings {
        connect_timeout: Duration::from_millis(config.timeouts.connect_ms),
        publish_timeout: Duration::from_millis(config.timeouts.publish_ms),
        queue_capacity: config.limits.publish_queue_capacity,
        graceful_stop: Duration::from_millis(config.timeouts.graceful_stop_ms),
        default_broker_host: config.broker.host.clone(),
    };
    let manager = DeviceManager::new(
        ModelStore::new(config.model_dir()),
        sink.clone(),
        settings,
        config.limits.max_group_size,
    );
    let model_count = manager.load_models().await?;
    info!(models = model_count, "✅ Models loaded");

    // 3. Engine stats cadence
    let stats_cancel = CancellationToken::new();
    let stats_task = manager.spawn_stats_task(
        Duration::from_secs(config.timeouts.stats_interval_secs),
        stats_cancel.clone(),
    );

    // 4. Control plane
    let state = setup_app_state(manager.clone());
    let app = api::create_router(state);
    let addr = format!("{}:{}", config.api.host, config.api.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("🚀 API listening on http://{}", listener.local_addr()?);

    tokio::select! {
        result = axum::serve(listener, app) => {
            if let Err(e) = result {
                warn!(error = %e, "API server exited");
            }
        }
        signal = tokio::signal::ctrl_c() => {
            match signal {
                Ok(()) => info!("🛑 Shutting down..."),
                Err(e) => warn!(error = %e, "Unable to listen for shutdown signal"),
            }
        }
    }

    // Graceful shutdown: devices first, then flush the sink.
    manager.shutdown().await;
    stats_cancel.cancel();
    let _ = stats_task.await;
    sink.shutdown().await;

    info!("👋 Good bye!");
    Ok(())
}
