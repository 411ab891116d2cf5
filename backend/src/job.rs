//! Job execution.
//!
//! One job is one engine invocation. Every job gets a fresh identifier that
//! names all of its files, so concurrent jobs never share an output path.

use std::{
    collections::HashSet,
    path::PathBuf,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use chrono::{DateTime, Utc};
use tokio::{
    sync::{OwnedSemaphorePermit, Semaphore},
    time::timeout,
};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    engine::{Engine, EngineStream, Invocation, OutputTarget},
    error::ServiceError,
    format::FormatSpec,
    request::{DownloadRequest, MediaKind},
    resolver::OutputResolver,
    retention::{ReleaseGuard, RetentionManager},
};

pub const MAX_DIAGNOSTIC_CHARS: usize = 300;
const DEFAULT_DIAGNOSTIC: &str = "Download failed";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug)]
pub struct Job {
    pub id: Uuid,
    pub kind: MediaKind,
    pub format: FormatSpec,
    pub output: OutputTarget,
    pub started_at: DateTime<Utc>,
    pub state: JobState,
}

impl Job {
    pub fn finish(&mut self, state: JobState) {
        self.state = state;
        let elapsed_ms = (Utc::now() - self.started_at).num_milliseconds();
        match state {
            JobState::Succeeded => info!("Job {} succeeded in {elapsed_ms} ms", self.id),
            JobState::Failed => warn!("Job {} failed after {elapsed_ms} ms", self.id),
            JobState::Running => {}
        }
    }
}

/// A finished job whose artifact is on disk and registered for deletion.
#[derive(Debug)]
pub struct CompletedArtifact {
    pub job: Job,
    pub path: PathBuf,
}

/// A job whose output is still being produced on the engine's stdout.
pub struct LiveStream {
    pub job: Job,
    pub stream: EngineStream,
    pub cleanup: ReleaseGuard,
    pub slot: ActiveJob,
    pub permit: OwnedSemaphorePermit,
}

/// Identifiers of jobs currently in flight.
#[derive(Clone, Default)]
pub struct ActiveJobs {
    ids: Arc<Mutex<HashSet<Uuid>>>,
}

impl ActiveJobs {
    /// Reserves an identifier no other in-flight job holds.
    pub fn reserve(&self) -> ActiveJob {
        let mut ids = self.ids.lock().unwrap_or_else(PoisonError::into_inner);
        let mut id = Uuid::new_v4();
        while !ids.insert(id) {
            id = Uuid::new_v4();
        }
        ActiveJob {
            id,
            ids: Arc::clone(&self.ids),
        }
    }

    pub fn len(&self) -> usize {
        self.ids.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct ActiveJob {
    id: Uuid,
    ids: Arc<Mutex<HashSet<Uuid>>>,
}

impl ActiveJob {
    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl Drop for ActiveJob {
    fn drop(&mut self) {
        self.ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

pub struct JobRunner {
    engine: Arc<dyn Engine>,
    resolver: OutputResolver,
    download_dir: PathBuf,
    cookies_file: Option<PathBuf>,
    job_timeout: Duration,
    retention_delay: Duration,
    retention: RetentionManager,
    active: ActiveJobs,
    capacity: Arc<Semaphore>,
}

pub struct JobRunnerSettings {
    pub download_dir: PathBuf,
    pub cookies_file: Option<PathBuf>,
    pub job_timeout: Duration,
    pub retention_delay: Duration,
    pub max_concurrent_jobs: usize,
}

impl JobRunner {
    pub fn new(
        engine: Arc<dyn Engine>,
        retention: RetentionManager,
        settings: JobRunnerSettings,
    ) -> Self {
        Self {
            engine,
            resolver: OutputResolver::new(&settings.download_dir),
            download_dir: settings.download_dir,
            cookies_file: settings.cookies_file,
            job_timeout: settings.job_timeout,
            retention_delay: settings.retention_delay,
            retention,
            active: ActiveJobs::default(),
            capacity: Arc::new(Semaphore::new(settings.max_concurrent_jobs.max(1))),
        }
    }

    pub fn active_jobs(&self) -> &ActiveJobs {
        &self.active
    }

    pub fn retention(&self) -> &RetentionManager {
        &self.retention
    }

    /// Permits bounding concurrent engine processes. Shared with anything
    /// else that starts the engine.
    pub fn capacity(&self) -> Arc<Semaphore> {
        Arc::clone(&self.capacity)
    }

    /// Waits for the engine to exit, then locates the artifact it wrote.
    /// Any failure or cancellation releases every file the job left behind.
    pub async fn run_buffered(
        &self,
        request: &DownloadRequest,
        spec: FormatSpec,
    ) -> Result<CompletedArtifact, ServiceError> {
        let _permit = self.acquire_capacity().await?;
        let slot = self.active.reserve();
        let mut job = self.begin(
            &slot,
            request,
            spec,
            OutputTarget::Template(self.resolver.template_for(slot.id())),
        );
        let invocation = self.invocation(request, &job);
        // Fires if this future is dropped mid-run, e.g. when the client
        // disconnects, so partial files never wait for the stale sweep.
        let cleanup = self
            .retention
            .release_job_on_drop(&self.download_dir, job.id);

        match self.execute_buffered(&job, &invocation).await {
            Ok(path) => {
                cleanup.disarm();
                job.finish(JobState::Succeeded);
                Ok(CompletedArtifact { job, path })
            }
            Err(error) => {
                drop(cleanup);
                job.finish(JobState::Failed);
                Err(error)
            }
        }
    }

    async fn execute_buffered(
        &self,
        job: &Job,
        invocation: &Invocation,
    ) -> Result<PathBuf, ServiceError> {
        let outcome = timeout(self.job_timeout, self.engine.run(invocation))
            .await
            .map_err(|_| {
                warn!("Job {} timed out after {:?}", job.id, self.job_timeout);
                ServiceError::Timeout
            })??;

        if !outcome.success() {
            warn!("Job {} engine exited with {:?}", job.id, outcome.code);
            return Err(ServiceError::EngineFailure(diagnostic(&outcome.stderr)));
        }

        let resolved = self.resolver.resolve(job.id, job.kind).await?;
        for extra in resolved.extras {
            self.retention.release_now(extra);
        }
        self.retention.schedule(&resolved.path, self.retention_delay);

        Ok(resolved.path)
    }

    /// Starts the engine with its output piped back. The returned stream owns
    /// the job slot and capacity permit until it is dropped.
    pub async fn run_streaming(
        &self,
        request: &DownloadRequest,
        spec: FormatSpec,
    ) -> Result<LiveStream, ServiceError> {
        let permit = self.acquire_capacity().await?;
        let slot = self.active.reserve();
        let mut job = self.begin(&slot, request, spec, OutputTarget::Stdout);
        let cleanup = self
            .retention
            .release_job_on_drop(&self.download_dir, job.id);
        let invocation = self.invocation(request, &job);

        let stream = match self.engine.spawn_stream(&invocation).await {
            Ok(stream) => stream,
            Err(error) => {
                job.finish(JobState::Failed);
                return Err(error.into());
            }
        };

        let watchdog = stream.cancel.clone();
        let job_timeout = self.job_timeout;
        let job_id = job.id;
        tokio::spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(job_timeout) => {
                    warn!("Streaming job {job_id} timed out after {job_timeout:?}");
                    watchdog.cancel();
                }
                () = watchdog.cancelled() => {}
            }
        });

        Ok(LiveStream {
            job,
            stream,
            cleanup,
            slot,
            permit,
        })
    }

    fn begin(
        &self,
        slot: &ActiveJob,
        request: &DownloadRequest,
        format: FormatSpec,
        output: OutputTarget,
    ) -> Job {
        info!(
            "Job {} started: {} {:?} quality={}",
            slot.id(),
            request.url,
            request.kind,
            request.quality
        );
        Job {
            id: slot.id(),
            kind: request.kind,
            format,
            output,
            started_at: Utc::now(),
            state: JobState::Running,
        }
    }

    fn invocation(&self, request: &DownloadRequest, job: &Job) -> Invocation {
        Invocation {
            url: request.url.to_string(),
            format: job.format.clone(),
            output: job.output.clone(),
            cookies_file: self.cookies_file.clone(),
        }
    }

    async fn acquire_capacity(&self) -> Result<OwnedSemaphorePermit, ServiceError> {
        Arc::clone(&self.capacity)
            .acquire_owned()
            .await
            .map_err(|_| ServiceError::EngineUnavailable("Could not reserve download capacity.".into()))
    }
}

/// Turns captured engine stderr into a short message fit for a client.
pub fn diagnostic(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let line = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
        .unwrap_or(DEFAULT_DIAGNOSTIC);
    let line = line.strip_prefix("ERROR:").map_or(line, str::trim);
    let lower = line.to_ascii_lowercase();

    let message = if lower.contains("unsupported url") {
        "Unsupported or invalid URL for download."
    } else if lower.contains("video unavailable") || lower.contains("private video") {
        "This video is unavailable."
    } else if lower.contains("sign in to confirm") {
        "The source requires a signed-in session to download this video."
    } else {
        line
    };

    truncate_chars(message, MAX_DIAGNOSTIC_CHARS)
}

fn truncate_chars(value: &str, max_chars: usize) -> String {
    match value.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &value[..cut]),
        None => value.to_string(),
    }
}
