//! Messaging gateway server
//!
//! Receives webhook callbacks, queues them on Redis Streams, serves them to
//! workers, and periodically discards entries nobody finished.
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | GATEWAY_CONFIG_FILE | - | Optional TOML file, read before env overrides |
//! | APP_NAME | messaging-gateway | Reported by `GET /` |
//! | HTTP_PORT | 3000 | Listen port |
//! | LOG_LEVEL | info | error, warn, info, http, verbose, debug, silly |
//! | LOG_FORMAT | pretty | pretty or json |
//! | RUST_LOG | - | Overrides LOG_LEVEL with an EnvFilter directive |
//! | REDIS_HOST | 127.0.0.1 | Redis host |
//! | REDIS_PORT | 6379 | Redis port |
//! | REDIS_MAX_RETRIES_PER_REQUEST | 3 | Reconnect attempts |
//! | REDIS_COMMAND_TIMEOUT_MS | 5000 | Per-command timeout |
//! | REDIS_STREAM_PREFIX_FOR_LINE | line | Stream key prefix |
//! | REDIS_GROUP_NAME_FOR_LINE | line-webhook | Consumer group |
//! | CLEANER_CONSUMER | cleaner | Consumer name the reaper claims as |
//! | CLEANER_MIN_IDLE_TIME_MS | 86400000 | Idle time before an entry is discarded |
//! | CLEANER_BATCH_SIZE | 100 | Entries reclaimed per stream per sweep |
//! | CLEANER_INTERVAL_MS | 60000 | Sweep period |

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use messaging_gateway::config::GatewayConfig;
use messaging_gateway::http::{build_router, AppState};
use messaging_gateway::observability::init_tracing;
use messaging_gateway::queue::{Reaper, WebhookQueue};
use messaging_gateway::store::RedisLogStore;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config = GatewayConfig::from_env()?;
    init_tracing(&config.log)?;

    let redis_config = config.redis_store_config();
    info!(url = %redis_config.url(), "connecting to redis");
    let store = Arc::new(RedisLogStore::connect(&redis_config).await?);

    let queue = WebhookQueue::new(
        Arc::clone(&store),
        config.redis.stream_prefix_for_line.clone(),
        config.redis.group_name_for_line.clone(),
    );

    let shutdown = CancellationToken::new();
    let reaper = Arc::new(Reaper::new(Arc::clone(&store), config.reaper_config()));
    let reaper_handle = tokio::spawn(reaper.run(shutdown.clone()));

    let app = build_router(AppState::new(config.app_name.clone(), queue));
    let addr = format!("0.0.0.0:{}", config.http_port);
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, app_name = %config.app_name, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutdown signal received, stopping reaper");
    shutdown.cancel();
    if let Err(e) = reaper_handle.await {
        error!(error = %e, "reaper task failed");
    }

    info!("server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
