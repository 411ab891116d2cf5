//! Turns finished or live jobs into HTTP responses.
//!
//! Bodies own the guards that release the artifact, so cleanup happens when
//! the body is dropped: after the last byte, or as soon as the client leaves.

use std::{io, path::Path};

use async_stream::stream;
use axum::{
    body::Body,
    http::{
        HeaderMap, HeaderName, HeaderValue,
        header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE},
    },
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures::StreamExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use crate::{
    engine::EngineStream,
    error::{ApiError, ServiceError},
    job::{CompletedArtifact, JobState, LiveStream, diagnostic},
    request::MediaKind,
    retention::RetentionManager,
};

pub const FILENAME_HEADER: &str = "x-download-filename";

/// Sends a finished artifact. The file is only opened once the job has
/// confirmed it exists.
pub async fn buffered(
    artifact: CompletedArtifact,
    retention: &RetentionManager,
) -> Result<Response, ApiError> {
    let release = retention.release_on_drop(&artifact.path);

    let file = tokio::fs::File::open(&artifact.path)
        .await
        .map_err(ServiceError::from)?;
    let length = file.metadata().await.map_err(ServiceError::from)?.len();
    let (filename, content_type) = naming_for(artifact.job.kind, &artifact.path);

    let mut reader = ReaderStream::new(file);
    let body = stream! {
        let _release = release;
        while let Some(chunk) = reader.next().await {
            yield chunk;
        }
    };

    let headers = attachment_headers(&filename, content_type, Some(length))?;
    Ok((headers, Body::from_stream(body)).into_response())
}

/// Pipes engine output to the client as it is produced.
///
/// The first chunk is awaited before answering so an engine that fails
/// without writing anything still yields an error status. Dropping the body
/// kills the engine.
pub async fn streaming(live: LiveStream) -> Result<Response, ApiError> {
    let LiveStream {
        mut job,
        stream:
            EngineStream {
                stdout,
                exit,
                cancel,
            },
        cleanup,
        slot,
        permit,
    } = live;
    let kill_on_drop = cancel.drop_guard();
    let mut reader = ReaderStream::new(stdout);

    let first = match reader.next().await {
        Some(Ok(chunk)) => chunk,
        Some(Err(error)) => {
            job.finish(JobState::Failed);
            return Err(ServiceError::from(error).into());
        }
        None => {
            job.finish(JobState::Failed);
            let message = match exit.await {
                Ok(outcome) if !outcome.success() => diagnostic(&outcome.stderr),
                _ => ServiceError::ResolutionFailure.to_string(),
            };
            return Err(ServiceError::EngineFailure(message).into());
        }
    };

    let kind = job.kind;
    let body = stream! {
        let _kill_on_drop = kill_on_drop;
        let _cleanup = cleanup;
        let _slot = slot;
        let _permit = permit;

        let mut sent = first.len() as u64;
        yield Ok::<Bytes, io::Error>(first);

        let mut interrupted = None;
        while let Some(chunk) = reader.next().await {
            match chunk {
                Ok(chunk) => {
                    sent += chunk.len() as u64;
                    yield Ok(chunk);
                }
                Err(error) => {
                    interrupted = Some(error.to_string());
                    break;
                }
            }
        }

        if interrupted.is_none() {
            interrupted = match exit.await {
                Ok(outcome) if outcome.success() => None,
                Ok(outcome) => Some(diagnostic(&outcome.stderr)),
                Err(_) => Some("engine exited without reporting a status".to_string()),
            };
        }

        match interrupted {
            None => {
                debug!("Streamed {sent} bytes for job {}", job.id);
                job.finish(JobState::Succeeded);
            }
            Some(reason) => {
                warn!("Streaming job {} interrupted after {sent} bytes: {reason}", job.id);
                job.finish(JobState::Failed);
                yield Err(io::Error::other(ServiceError::DeliveryInterrupted(reason)));
            }
        }
    };

    let headers = attachment_headers(&kind.suggested_filename(), kind.content_type(), None)?;
    Ok((headers, Body::from_stream(body)).into_response())
}

/// Suggested filename and content type. The requested kind wins unless the
/// engine fell back to another container.
fn naming_for(kind: MediaKind, path: &Path) -> (String, &'static str) {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    if extension == kind.extension() {
        return (kind.suggested_filename(), kind.content_type());
    }

    let stem = match kind {
        MediaKind::Video => "video",
        MediaKind::Audio => "audio",
    };
    (
        format!("{stem}.{extension}"),
        content_type_for_extension(&extension),
    )
}

fn content_type_for_extension(extension: &str) -> &'static str {
    match extension {
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "mp3" => "audio/mpeg",
        "m4a" => "audio/mp4",
        "opus" => "audio/ogg",
        _ => "application/octet-stream",
    }
}

fn attachment_headers(
    filename: &str,
    content_type: &'static str,
    content_length: Option<u64>,
) -> Result<HeaderMap, ApiError> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));

    if let Some(length) = content_length {
        headers.insert(CONTENT_LENGTH, HeaderValue::from(length));
    }

    headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_str(&build_content_disposition(filename))
            .map_err(|_| ApiError::internal("Could not build the download header."))?,
    );
    headers.insert(
        HeaderName::from_static(FILENAME_HEADER),
        HeaderValue::from_str(&sanitize_ascii_filename(filename))
            .map_err(|_| ApiError::internal("Could not build the file name header."))?,
    );

    Ok(headers)
}

fn build_content_disposition(filename: &str) -> String {
    format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        sanitize_ascii_filename(filename),
        urlencoding::encode(filename)
    )
}

fn sanitize_ascii_filename(value: &str) -> String {
    let sanitized = value
        .chars()
        .map(|character| {
            if character.is_ascii_alphanumeric() || matches!(character, '.' | '-' | '_' | ' ') {
                character
            } else {
                '_'
            }
        })
        .collect::<String>();

    match sanitized.trim() {
        "" => "download.bin".to_string(),
        compact => compact.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::{path::PathBuf, sync::Arc, time::Duration};

    use axum::body::to_bytes;
    use tempfile::TempDir;

    use super::*;
    use crate::{
        engine::fake::{FakeEngine, RunScript, StreamScript},
        format,
        job::{JobRunner, JobRunnerSettings},
        request::{DownloadRequest, Quality},
    };

    fn runner(engine: FakeEngine, dir: &TempDir) -> JobRunner {
        runner_for(Arc::new(engine), dir, Duration::from_secs(5))
    }

    fn runner_for(engine: Arc<FakeEngine>, dir: &TempDir, job_timeout: Duration) -> JobRunner {
        JobRunner::new(
            engine,
            RetentionManager::start(),
            JobRunnerSettings {
                download_dir: dir.path().to_path_buf(),
                cookies_file: None,
                job_timeout,
                retention_delay: Duration::from_secs(600),
                max_concurrent_jobs: 2,
            },
        )
    }

    fn request(kind: MediaKind) -> DownloadRequest {
        DownloadRequest {
            url: url::Url::parse("https://youtu.be/abc123").unwrap(),
            kind,
            quality: Quality::Best,
            client_key: "127.0.0.1".to_string(),
        }
    }

    #[tokio::test]
    async fn buffered_delivery_sends_file_then_releases_it() {
        let dir = TempDir::new().unwrap();
        let runner = runner(FakeEngine::with_run(RunScript::produces("mp3", b"ID3 audio")), &dir);
        let request = request(MediaKind::Audio);
        let artifact = runner
            .run_buffered(&request, format::select(&request))
            .await
            .unwrap();
        let path = artifact.path.clone();

        let response = buffered(artifact, runner.retention()).await.unwrap();
        assert_eq!(response.headers()[CONTENT_TYPE], "audio/mpeg");
        assert_eq!(response.headers()[CONTENT_LENGTH], "9");
        assert!(
            response.headers()[CONTENT_DISPOSITION]
                .to_str()
                .unwrap()
                .contains("filename=\"audio.mp3\"")
        );
        assert!(path.exists());

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"ID3 audio");

        assert_eq!(runner.retention().pending_count().await, 0);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn abandoned_body_still_releases_the_artifact() {
        let dir = TempDir::new().unwrap();
        let runner = runner(FakeEngine::with_run(RunScript::produces("mp4", b"video")), &dir);
        let request = request(MediaKind::Video);
        let artifact = runner
            .run_buffered(&request, format::select(&request))
            .await
            .unwrap();
        let path: PathBuf = artifact.path.clone();

        let response = buffered(artifact, runner.retention()).await.unwrap();
        drop(response);

        assert_eq!(runner.retention().pending_count().await, 0);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn streaming_forwards_engine_output() {
        let dir = TempDir::new().unwrap();
        let runner = runner(
            FakeEngine::with_stream(StreamScript {
                body: b"progressive mp4 bytes".to_vec(),
                exit_code: Some(0),
                stderr: String::new(),
                stall: false,
            }),
            &dir,
        );
        let request = request(MediaKind::Video);
        let live = runner
            .run_streaming(&request, format::select(&request))
            .await
            .unwrap();
        assert_eq!(runner.active_jobs().len(), 1);

        let response = streaming(live).await.unwrap();
        assert_eq!(response.headers()[CONTENT_TYPE], "video/mp4");
        assert!(response.headers().get(CONTENT_LENGTH).is_none());

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"progressive mp4 bytes");
        assert!(runner.active_jobs().is_empty());
    }

    #[tokio::test]
    async fn streaming_engine_failure_after_output_aborts_the_body() {
        let dir = TempDir::new().unwrap();
        let runner = runner(
            FakeEngine::with_stream(StreamScript {
                body: b"partial".to_vec(),
                exit_code: None,
                stderr: "ERROR: killed".to_string(),
                stall: false,
            }),
            &dir,
        );
        let request = request(MediaKind::Video);
        let live = runner
            .run_streaming(&request, format::select(&request))
            .await
            .unwrap();

        let response = streaming(live).await.unwrap();
        assert!(to_bytes(response.into_body(), usize::MAX).await.is_err());
    }

    fn stalled_stream(body: &[u8]) -> Arc<FakeEngine> {
        Arc::new(FakeEngine::with_stream(StreamScript {
            body: body.to_vec(),
            stall: true,
            ..StreamScript::default()
        }))
    }

    #[tokio::test]
    async fn client_disconnect_kills_the_engine_and_releases_files() {
        let dir = TempDir::new().unwrap();
        let engine = stalled_stream(b"first chunk");
        let runner = runner_for(engine.clone(), &dir, Duration::from_secs(60));
        let request = request(MediaKind::Video);
        let live = runner
            .run_streaming(&request, format::select(&request))
            .await
            .unwrap();
        let side_file = dir.path().join(format!("{}.f137.mp4.part", live.job.id));
        std::fs::write(&side_file, b"fragment").unwrap();

        let response = streaming(live).await.unwrap();
        let mut body = response.into_body().into_data_stream();
        assert_eq!(&body.next().await.unwrap().unwrap()[..], b"first chunk");
        let token = engine.last_stream_token();
        assert!(!token.is_cancelled());

        drop(body);

        assert!(token.is_cancelled());
        assert!(runner.active_jobs().is_empty());
        runner.retention().pending_count().await;
        assert!(!side_file.exists());
    }

    #[tokio::test]
    async fn stalled_stream_is_cancelled_by_the_job_timeout() {
        let dir = TempDir::new().unwrap();
        let engine = stalled_stream(b"header bytes");
        let runner = runner_for(engine.clone(), &dir, Duration::from_millis(50));
        let request = request(MediaKind::Video);
        let live = runner
            .run_streaming(&request, format::select(&request))
            .await
            .unwrap();

        let response = streaming(live).await.unwrap();
        let token = engine.last_stream_token();
        let body = tokio::time::timeout(
            Duration::from_secs(5),
            to_bytes(response.into_body(), usize::MAX),
        )
        .await
        .expect("watchdog never fired");

        assert!(token.is_cancelled());
        assert!(body.is_err());
        assert!(runner.active_jobs().is_empty());
    }

    #[tokio::test]
    async fn streaming_without_output_is_an_error_response() {
        let dir = TempDir::new().unwrap();
        let runner = runner(
            FakeEngine::with_stream(StreamScript {
                body: Vec::new(),
                exit_code: Some(1),
                stderr: "ERROR: Unsupported URL: https://youtu.be/abc123".to_string(),
                stall: false,
            }),
            &dir,
        );
        let request = request(MediaKind::Video);
        let live = runner
            .run_streaming(&request, format::select(&request))
            .await
            .unwrap();

        let error = streaming(live).await.unwrap_err();
        assert_eq!(error.status, axum::http::StatusCode::BAD_REQUEST);
        assert_eq!(error.message, "Unsupported or invalid URL for download.");
        assert!(runner.active_jobs().is_empty());
    }

    #[test]
    fn fallback_container_keeps_honest_naming() {
        assert_eq!(
            naming_for(MediaKind::Video, Path::new("/d/id.mp4")),
            ("video.mp4".to_string(), "video/mp4")
        );
        assert_eq!(
            naming_for(MediaKind::Video, Path::new("/d/id.webm")),
            ("video.webm".to_string(), "video/webm")
        );
    }

    #[test]
    fn content_disposition_is_ascii_safe() {
        assert_eq!(
            build_content_disposition("vidéo \"1\".mp4"),
            "attachment; filename=\"vid_o _1_.mp4\"; filename*=UTF-8''vid%C3%A9o%20%221%22.mp4"
        );
        assert_eq!(sanitize_ascii_filename("  "), "download.bin");
    }
}
