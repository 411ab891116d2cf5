use std::{path::PathBuf, sync::Arc, time::Duration};

use serde::Serialize;
use tokio::{sync::Semaphore, time::timeout};
use tracing::{debug, warn};
use url::Url;

use crate::{
    engine::{Engine, EngineError, RawMetadata},
    error::ServiceError,
    job::diagnostic,
};

const UNTITLED: &str = "Untitled";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Metadata {
    pub title: String,
    pub thumbnail: Option<String>,
    pub author: Option<String>,
    /// Whole seconds; `None` for sources that do not report a length.
    pub duration: Option<u64>,
    pub platform: Option<String>,
}

impl From<RawMetadata> for Metadata {
    fn from(raw: RawMetadata) -> Self {
        Self {
            title: raw
                .title
                .and_then(non_empty)
                .unwrap_or_else(|| UNTITLED.to_string()),
            thumbnail: raw.thumbnail.and_then(non_empty),
            author: raw.uploader.and_then(non_empty).or_else(|| raw.channel.and_then(non_empty)),
            duration: raw
                .duration
                .filter(|seconds| seconds.is_finite() && *seconds >= 0.0)
                .map(|seconds| seconds.round() as u64),
            platform: raw
                .extractor_key
                .and_then(non_empty)
                .or_else(|| raw.extractor.and_then(non_empty)),
        }
    }
}

/// Read-only pre-flight query: asks the engine to describe a URL without
/// downloading anything. Each probe holds one engine capacity permit.
pub struct MetadataProbe {
    engine: Arc<dyn Engine>,
    cookies_file: Option<PathBuf>,
    max_duration: Duration,
    probe_timeout: Duration,
    capacity: Arc<Semaphore>,
}

impl MetadataProbe {
    pub fn new(
        engine: Arc<dyn Engine>,
        cookies_file: Option<PathBuf>,
        max_duration: Duration,
        probe_timeout: Duration,
        capacity: Arc<Semaphore>,
    ) -> Self {
        Self {
            engine,
            cookies_file,
            max_duration,
            probe_timeout,
            capacity,
        }
    }

    pub async fn probe(&self, url: &Url) -> Result<Metadata, ServiceError> {
        let _permit = self.capacity.acquire().await.map_err(|_| {
            ServiceError::EngineUnavailable("Could not reserve engine capacity.".into())
        })?;

        let raw = timeout(
            self.probe_timeout,
            self.engine
                .extract_metadata(url.as_str(), self.cookies_file.as_deref()),
        )
        .await
        .map_err(|_| ServiceError::Timeout)?
        .map_err(|error| {
            warn!("Metadata probe failed for {url}: {error}");
            match error {
                EngineError::InvalidMetadata(message) => {
                    ServiceError::EngineFailure(diagnostic(message.as_bytes()))
                }
                other => other.into(),
            }
        })?;

        let metadata = Metadata::from(raw);
        self.enforce_duration(&metadata)?;
        debug!("Probed {url}: {:?}", metadata.title);
        Ok(metadata)
    }

    fn enforce_duration(&self, metadata: &Metadata) -> Result<(), ServiceError> {
        let max_seconds = self.max_duration.as_secs();
        match metadata.duration {
            Some(duration_seconds) if duration_seconds > max_seconds => {
                Err(ServiceError::VideoTooLong {
                    duration_seconds,
                    max_seconds,
                })
            }
            _ => Ok(()),
        }
    }
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::engine::fake::FakeEngine;

    fn probe_over(engine: Arc<FakeEngine>, permits: usize) -> MetadataProbe {
        MetadataProbe::new(
            engine,
            None,
            Duration::from_secs(1800),
            Duration::from_secs(5),
            Arc::new(Semaphore::new(permits)),
        )
    }

    fn probe_with(raw: RawMetadata) -> MetadataProbe {
        probe_over(Arc::new(FakeEngine::with_metadata(raw)), 3)
    }

    fn url() -> Url {
        Url::parse("https://youtu.be/abc123").unwrap()
    }

    #[tokio::test]
    async fn maps_engine_fields() {
        let probe = probe_with(RawMetadata {
            title: Some("A talk".into()),
            thumbnail: Some("https://i.ytimg.com/vi/abc123/hq.jpg".into()),
            uploader: None,
            channel: Some("Conference".into()),
            duration: Some(612.4),
            extractor_key: Some("Youtube".into()),
            extractor: Some("youtube".into()),
        });

        let metadata = probe.probe(&url()).await.unwrap();

        assert_eq!(
            metadata,
            Metadata {
                title: "A talk".into(),
                thumbnail: Some("https://i.ytimg.com/vi/abc123/hq.jpg".into()),
                author: Some("Conference".into()),
                duration: Some(612),
                platform: Some("Youtube".into()),
            }
        );
    }

    #[tokio::test]
    async fn rejects_sources_over_the_ceiling() {
        let probe = probe_with(RawMetadata {
            duration: Some(7200.0),
            ..RawMetadata::default()
        });

        match probe.probe(&url()).await {
            Err(error @ ServiceError::VideoTooLong { .. }) => {
                assert_eq!(error.to_string(), "Video too long")
            }
            other => panic!("expected duration rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_duration_passes() {
        let probe = probe_with(RawMetadata {
            title: Some("  ".into()),
            ..RawMetadata::default()
        });

        let metadata = probe.probe(&url()).await.unwrap();
        assert_eq!(metadata.title, UNTITLED);
        assert_eq!(metadata.duration, None);
    }

    #[tokio::test]
    async fn engine_errors_are_engine_failures() {
        let probe = probe_over(Arc::new(FakeEngine::default()), 3);

        match probe.probe(&url()).await {
            Err(ServiceError::EngineFailure(message)) => {
                assert_eq!(message, "Unsupported or invalid URL for download.")
            }
            other => panic!("expected engine failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn concurrent_probes_respect_engine_capacity() {
        let engine = Arc::new(FakeEngine::with_metadata(RawMetadata::default()));
        *engine.metadata_delay.lock().unwrap() = Some(Duration::from_millis(20));
        let probe = Arc::new(probe_over(engine.clone(), 3));

        let handles = (0..20)
            .map(|_| {
                let probe = probe.clone();
                tokio::spawn(async move { probe.probe(&url()).await.is_ok() })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            assert!(handle.await.unwrap());
        }

        assert_eq!(engine.metadata_peak.load(Ordering::SeqCst), 3);
    }
}
