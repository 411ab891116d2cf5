use std::{path::PathBuf, time::Duration};

use tracing::warn;

use crate::rate_limit::RateLimitPolicy;

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8787";
const DEFAULT_ENGINE_PROGRAM: &str = "yt-dlp";
const DEFAULT_RATE_LIMIT_WINDOW_SECONDS: u64 = 60;
const DEFAULT_RATE_LIMIT_MAX: usize = 10;
const DEFAULT_MAX_DURATION_SECONDS: u64 = 30 * 60;
const DEFAULT_JOB_TIMEOUT_SECONDS: u64 = 180;
const DEFAULT_RETENTION_SECONDS: u64 = 10 * 60;
const DEFAULT_STALE_ARTIFACT_SECONDS: u64 = 2 * 60 * 60;
const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    Buffered,
    Streaming,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub download_dir: PathBuf,
    pub engine_program: PathBuf,
    pub cookies_file: Option<PathBuf>,
    pub rate_limit: RateLimitPolicy,
    pub allowed_domains: Vec<String>,
    pub max_duration: Duration,
    pub job_timeout: Duration,
    pub retention: Duration,
    pub stale_artifact_age: Duration,
    pub max_concurrent_downloads: usize,
    pub delivery_mode: DeliveryMode,
    pub trust_proxy_headers: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            download_dir: std::env::temp_dir().join("sstube-downloads"),
            engine_program: PathBuf::from(DEFAULT_ENGINE_PROGRAM),
            cookies_file: None,
            rate_limit: RateLimitPolicy::SlidingWindow {
                window: Duration::from_secs(DEFAULT_RATE_LIMIT_WINDOW_SECONDS),
                max_requests: DEFAULT_RATE_LIMIT_MAX,
            },
            allowed_domains: Vec::new(),
            max_duration: Duration::from_secs(DEFAULT_MAX_DURATION_SECONDS),
            job_timeout: Duration::from_secs(DEFAULT_JOB_TIMEOUT_SECONDS),
            retention: Duration::from_secs(DEFAULT_RETENTION_SECONDS),
            stale_artifact_age: Duration::from_secs(DEFAULT_STALE_ARTIFACT_SECONDS),
            max_concurrent_downloads: DEFAULT_MAX_CONCURRENT_DOWNLOADS,
            delivery_mode: DeliveryMode::Buffered,
            trust_proxy_headers: false,
        }
    }
}

impl Config {
    /// Builds the configuration from the process environment.
    ///
    /// Unset variables keep their defaults; malformed ones are reported and
    /// ignored so a typo never prevents the service from starting.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let window_seconds = read_u64_env("RATE_LIMIT_WINDOW_SECONDS")
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_RATE_LIMIT_WINDOW_SECONDS);
        let rate_limit = rate_limit_policy(
            read_string_env("RATE_LIMIT_POLICY").as_deref(),
            Duration::from_secs(window_seconds),
            read_usize_env("RATE_LIMIT_MAX")
                .filter(|value| *value > 0)
                .unwrap_or(DEFAULT_RATE_LIMIT_MAX),
        );

        let delivery_mode = match read_string_env("DELIVERY_MODE").as_deref() {
            Some("streaming") => DeliveryMode::Streaming,
            Some("buffered") | None => DeliveryMode::Buffered,
            Some(other) => {
                warn!("DELIVERY_MODE={other:?} is not recognised, using buffered delivery");
                DeliveryMode::Buffered
            }
        };

        Self {
            bind_addr: resolve_bind_addr(),
            download_dir: read_string_env("DOWNLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.download_dir),
            engine_program: read_string_env("YT_DLP_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.engine_program),
            cookies_file: read_string_env("YT_DLP_COOKIES_FILE").map(PathBuf::from),
            rate_limit,
            allowed_domains: read_string_env("ALLOWED_DOMAINS")
                .map(|value| parse_domain_list(&value))
                .unwrap_or_default(),
            max_duration: read_seconds_env("MAX_DURATION_SECONDS").unwrap_or(defaults.max_duration),
            job_timeout: read_seconds_env("JOB_TIMEOUT_SECONDS").unwrap_or(defaults.job_timeout),
            retention: read_seconds_env("ARTIFACT_RETENTION_SECONDS").unwrap_or(defaults.retention),
            stale_artifact_age: read_seconds_env("STALE_ARTIFACT_SECONDS")
                .unwrap_or(defaults.stale_artifact_age),
            max_concurrent_downloads: read_usize_env("MAX_CONCURRENT_DOWNLOADS")
                .filter(|value| *value > 0)
                .unwrap_or(DEFAULT_MAX_CONCURRENT_DOWNLOADS),
            delivery_mode,
            trust_proxy_headers: read_bool_env("TRUST_PROXY_HEADERS").unwrap_or(false),
        }
    }
}

fn rate_limit_policy(name: Option<&str>, window: Duration, max_requests: usize) -> RateLimitPolicy {
    match name {
        Some("cooldown") => RateLimitPolicy::Cooldown { min_gap: window },
        Some("sliding") | None => RateLimitPolicy::SlidingWindow {
            window,
            max_requests,
        },
        Some(other) => {
            warn!("RATE_LIMIT_POLICY={other:?} is not recognised, using sliding window");
            RateLimitPolicy::SlidingWindow {
                window,
                max_requests,
            }
        }
    }
}

pub fn parse_domain_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|domain| !domain.is_empty())
        .map(|domain| domain.trim_start_matches('.').to_ascii_lowercase())
        .collect()
}

fn resolve_bind_addr() -> String {
    if let Some(configured) = read_string_env("APP_ADDR") {
        return configured;
    }

    if let Some(port) = read_string_env("PORT").and_then(|value| value.parse::<u16>().ok()) {
        return format!("0.0.0.0:{port}");
    }

    DEFAULT_BIND_ADDR.to_string()
}

fn read_string_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn read_bool_env(name: &str) -> Option<bool> {
    let value = read_string_env(name)?;
    match parse_bool(&value) {
        Some(parsed) => Some(parsed),
        None => {
            warn!("{name}={value:?} is not a boolean, ignoring");
            None
        }
    }
}

fn read_u64_env(name: &str) -> Option<u64> {
    let value = read_string_env(name)?;
    match value.parse::<u64>() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            warn!("{name}={value:?} is not a non-negative integer, ignoring");
            None
        }
    }
}

fn read_usize_env(name: &str) -> Option<usize> {
    read_u64_env(name).and_then(|value| usize::try_from(value).ok())
}

fn read_seconds_env(name: &str) -> Option<Duration> {
    read_u64_env(name).map(Duration::from_secs)
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
