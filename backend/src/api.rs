use std::{net::SocketAddr, sync::Arc};

use axum::{
    Json, Router,
    extract::{ConnectInfo, Query, State},
    http::HeaderMap,
    response::Response,
    routing::get,
};
use serde::Deserialize;
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::{
    config::{Config, DeliveryMode},
    delivery,
    engine::Engine,
    error::ApiError,
    format,
    job::{JobRunner, JobRunnerSettings},
    metadata::{Metadata, MetadataProbe},
    rate_limit::RateLimiter,
    request::RequestValidator,
    retention::RetentionManager,
};

#[derive(Clone)]
pub struct AppState {
    pub limiter: Arc<RateLimiter>,
    pub validator: Arc<RequestValidator>,
    pub jobs: Arc<JobRunner>,
    pub probe: Arc<MetadataProbe>,
    pub delivery_mode: DeliveryMode,
    pub trust_proxy_headers: bool,
}

impl AppState {
    pub fn new(config: &Config, engine: Arc<dyn Engine>, retention: RetentionManager) -> Self {
        let jobs = JobRunner::new(
            Arc::clone(&engine),
            retention,
            JobRunnerSettings {
                download_dir: config.download_dir.clone(),
                cookies_file: config.cookies_file.clone(),
                job_timeout: config.job_timeout,
                retention_delay: config.retention,
                max_concurrent_jobs: config.max_concurrent_downloads,
            },
        );
        let probe = MetadataProbe::new(
            engine,
            config.cookies_file.clone(),
            config.max_duration,
            config.job_timeout,
            jobs.capacity(),
        );

        Self {
            limiter: Arc::new(RateLimiter::new(config.rate_limit)),
            validator: Arc::new(RequestValidator::new(config.allowed_domains.clone())),
            jobs: Arc::new(jobs),
            probe: Arc::new(probe),
            delivery_mode: config.delivery_mode,
            trust_proxy_headers: config.trust_proxy_headers,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct MetaQuery {
    url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DownloadQuery {
    url: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    /// Older clients send the media type as `format`.
    format: Option<String>,
    quality: Option<String>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/meta", get(meta))
        .route("/download", get(download))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn root() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok", "service": "sstube-backend"}))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

/// Probes count against engine capacity but not against the download
/// allowance; clients already over it are refused here too.
async fn meta(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<MetaQuery>,
) -> Result<Json<Metadata>, ApiError> {
    let client_key = client_ip_for_request(&state, &headers, addr);
    state.limiter.check(&client_key).await?;

    let url = state.validator.validate_url(query.url.as_deref())?;
    let metadata = state.probe.probe(&url).await?;
    Ok(Json(metadata))
}

async fn download(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<DownloadQuery>,
) -> Result<Response, ApiError> {
    let client_key = client_ip_for_request(&state, &headers, addr);

    // Over-limit clients are turned away before their input is even looked
    // at; malformed input from everyone else costs no slot.
    state.limiter.check(&client_key).await?;
    let request = state.validator.validate(
        query.url.as_deref(),
        query.kind.as_deref().or(query.format.as_deref()),
        query.quality.as_deref(),
        &client_key,
    )?;
    state.limiter.admit(&client_key).await?;

    state.probe.probe(&request.url).await?;

    let spec = format::select(&request);
    if state.delivery_mode == DeliveryMode::Streaming && spec.supports_streaming() {
        debug!("Streaming {} to {client_key}", request.url);
        let live = state.jobs.run_streaming(&request, spec).await?;
        return delivery::streaming(live).await;
    }

    let artifact = state.jobs.run_buffered(&request, spec).await?;
    delivery::buffered(artifact, state.jobs.retention()).await
}

fn extract_client_ip(headers: &HeaderMap) -> Option<String> {
    let header = |key: &str| {
        headers
            .get(key)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
    };

    header("x-forwarded-for")
        .and_then(|forwarded| forwarded.split(',').map(str::trim).find(|ip| !ip.is_empty()))
        .or_else(|| header("cf-connecting-ip"))
        .or_else(|| header("x-real-ip"))
        .map(ToString::to_string)
}

fn client_ip_for_request(state: &AppState, headers: &HeaderMap, addr: SocketAddr) -> String {
    state
        .trust_proxy_headers
        .then(|| extract_client_ip(headers))
        .flatten()
        .unwrap_or_else(|| addr.ip().to_string())
}
