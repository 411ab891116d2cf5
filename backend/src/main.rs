use std::{net::SocketAddr, sync::Arc, time::Duration};

use sstube_backend::{
    api::{self, AppState},
    config::{Config, DeliveryMode},
    engine::YtDlpEngine,
    error::ApiError,
    rate_limit::RateLimiter,
    retention::{self, RetentionManager},
};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[tokio::main]
async fn main() {
    if let Err(error) = dotenvy::dotenv()
        && !error.not_found()
    {
        eprintln!("Could not read .env file: {error}");
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "sstube_backend=info,tower_http=info".to_string()),
        )
        .init();

    if let Err(error) = run().await {
        eprintln!("Server error: {}", error.message);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), ApiError> {
    let config = Config::from_env();

    tokio::fs::create_dir_all(&config.download_dir)
        .await
        .map_err(|error| {
            ApiError::internal(format!(
                "Could not create download directory {:?}: {error}",
                config.download_dir
            ))
        })?;

    if !config.trust_proxy_headers {
        warn!("TRUST_PROXY_HEADERS=false: rate limiting uses the socket peer address.");
    }
    match &config.cookies_file {
        Some(path) if !path.is_file() => {
            warn!("YT_DLP_COOKIES_FILE {:?} does not exist, the engine may reject it", path)
        }
        Some(_) => info!("Forwarding a cookies file to the engine."),
        None => {}
    }
    if config.delivery_mode == DeliveryMode::Streaming {
        info!("Streaming delivery enabled for video downloads.");
    }
    if config.allowed_domains.is_empty() {
        info!("ALLOWED_DOMAINS is empty, any http(s) host is accepted.");
    }

    let removed = retention::sweep_stale(&config.download_dir, config.stale_artifact_age).await;
    if removed > 0 {
        info!("Removed {removed} stale artifact(s) left by a previous run");
    }

    let engine = Arc::new(YtDlpEngine::new(&config.engine_program));
    let state = AppState::new(&config, engine, RetentionManager::start());
    spawn_maintenance(&config, Arc::clone(&state.limiter));

    let app = api::router(state);

    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .map_err(|error| {
            ApiError::internal(format!("Could not bind {}: {error}", config.bind_addr))
        })?;

    info!("Backend listening on http://{}", config.bind_addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .map_err(|error| ApiError::internal(format!("HTTP server error: {error}")))
}

/// Periodically forgets idle rate-limit clients and removes artifacts whose
/// deletion timer never fired.
fn spawn_maintenance(config: &Config, limiter: Arc<RateLimiter>) {
    let download_dir = config.download_dir.clone();
    let stale_age = config.stale_artifact_age;

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(MAINTENANCE_INTERVAL);
        interval.tick().await;

        loop {
            interval.tick().await;
            let forgotten = limiter.sweep().await;
            let removed = retention::sweep_stale(&download_dir, stale_age).await;
            debug!("Maintenance: {forgotten} idle client(s), {removed} stale artifact(s)");
        }
    });
}
