//! Eventual deletion of temporary artifacts.
//!
//! A single background task owns every pending deletion. Request handlers only
//! enqueue commands, so no response ever waits on the filesystem for cleanup.

use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap},
    io::ErrorKind,
    path::{Path, PathBuf},
    time::Duration,
};

use tokio::{
    sync::{mpsc, oneshot},
    time::{Instant, sleep_until},
};
use tracing::{debug, info, warn};
use uuid::Uuid;

const IDLE_WAKEUP: Duration = Duration::from_secs(3600);

enum Command {
    Schedule { path: PathBuf, delay: Duration },
    ReleaseNow { path: PathBuf },
    ReleaseJob { dir: PathBuf, job_id: Uuid },
    PendingCount(oneshot::Sender<usize>),
}

#[derive(Clone)]
pub struct RetentionManager {
    commands: mpsc::UnboundedSender<Command>,
}

impl RetentionManager {
    /// Spawns the deletion task on the current runtime. It stops, deleting
    /// everything still pending, once the last handle is dropped.
    pub fn start() -> Self {
        let (commands, receiver) = mpsc::unbounded_channel();
        tokio::spawn(run(receiver));
        Self { commands }
    }

    /// Deletes `path` after `delay`. Scheduling an already pending path keeps
    /// the earlier deadline.
    pub fn schedule(&self, path: impl Into<PathBuf>, delay: Duration) {
        self.send(Command::Schedule {
            path: path.into(),
            delay,
        });
    }

    pub fn release_now(&self, path: impl Into<PathBuf>) {
        self.send(Command::ReleaseNow { path: path.into() });
    }

    /// Deletes every file in `dir` whose name starts with the job identifier,
    /// including partial downloads the engine left behind.
    pub fn release_job(&self, dir: impl Into<PathBuf>, job_id: Uuid) {
        self.send(Command::ReleaseJob {
            dir: dir.into(),
            job_id,
        });
    }

    /// Number of deletions still waiting for their deadline. Commands are
    /// handled in order, so this also waits for earlier releases to finish.
    pub async fn pending_count(&self) -> usize {
        let (reply, response) = oneshot::channel();
        self.send(Command::PendingCount(reply));
        response.await.unwrap_or_default()
    }

    /// Releases `path` when the returned guard is dropped.
    pub fn release_on_drop(&self, path: impl Into<PathBuf>) -> ReleaseGuard {
        ReleaseGuard {
            retention: self.clone(),
            command: Some(Command::ReleaseNow { path: path.into() }),
        }
    }

    /// Releases every file of `job_id` when the returned guard is dropped.
    pub fn release_job_on_drop(&self, dir: impl Into<PathBuf>, job_id: Uuid) -> ReleaseGuard {
        ReleaseGuard {
            retention: self.clone(),
            command: Some(Command::ReleaseJob {
                dir: dir.into(),
                job_id,
            }),
        }
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            warn!("Retention task is gone, artifact left for the stale sweep");
        }
    }
}

/// Sends its release command exactly once, when dropped. Response bodies
/// hold one so cleanup follows delivery whether it completes or the client
/// goes away.
pub struct ReleaseGuard {
    retention: RetentionManager,
    command: Option<Command>,
}

impl ReleaseGuard {
    /// Drops the guard without releasing anything. Used once ownership of the
    /// files has passed to a scheduled deletion.
    pub fn disarm(mut self) {
        self.command = None;
    }
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        if let Some(command) = self.command.take() {
            self.retention.send(command);
        }
    }
}

async fn run(mut commands: mpsc::UnboundedReceiver<Command>) {
    let mut queue: BinaryHeap<Reverse<(Instant, PathBuf)>> = BinaryHeap::new();
    let mut pending: HashMap<PathBuf, Instant> = HashMap::new();

    loop {
        let next_deadline = queue.peek().map(|Reverse((deadline, _))| *deadline);

        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else { break };
                match command {
                    Command::Schedule { path, delay } => {
                        let deadline = Instant::now() + delay;
                        let current = pending.get(&path).copied();
                        if current.is_none_or(|existing| deadline < existing) {
                            pending.insert(path.clone(), deadline);
                            queue.push(Reverse((deadline, path)));
                        }
                    }
                    Command::ReleaseNow { path } => {
                        pending.remove(&path);
                        remove_artifact(&path).await;
                    }
                    Command::ReleaseJob { dir, job_id } => {
                        for path in job_files(&dir, job_id).await {
                            pending.remove(&path);
                            remove_artifact(&path).await;
                        }
                    }
                    Command::PendingCount(reply) => {
                        let _ = reply.send(pending.len());
                    }
                }
            }
            () = sleep_until(next_deadline.unwrap_or_else(|| Instant::now() + IDLE_WAKEUP)),
                if next_deadline.is_some() =>
            {
                let now = Instant::now();
                while let Some(Reverse((deadline, _))) = queue.peek() {
                    if *deadline > now {
                        break;
                    }
                    let Some(Reverse((deadline, path))) = queue.pop() else { break };
                    // Superseded entries stay in the heap until popped.
                    if pending.get(&path) == Some(&deadline) {
                        pending.remove(&path);
                        remove_artifact(&path).await;
                    }
                }
            }
        }
    }

    if !pending.is_empty() {
        info!("Deleting {} pending artifact(s) on shutdown", pending.len());
        for path in pending.into_keys() {
            remove_artifact(&path).await;
        }
    }
}

async fn job_files(dir: &Path, job_id: Uuid) -> Vec<PathBuf> {
    let prefix = job_id.to_string();
    let mut matches = Vec::new();

    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(error) => {
            if error.kind() != ErrorKind::NotFound {
                warn!("Could not open download directory {:?}: {error}", dir);
            }
            return matches;
        }
    };

    loop {
        match entries.next_entry().await {
            Ok(Some(entry)) => {
                if entry.file_name().to_string_lossy().starts_with(&prefix) {
                    matches.push(entry.path());
                }
            }
            Ok(None) => break,
            Err(error) => {
                warn!("Could not list download directory {:?}: {error}", dir);
                break;
            }
        }
    }

    matches
}

async fn remove_artifact(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!("Deleted temporary artifact {:?}", path),
        Err(error) if error.kind() == ErrorKind::NotFound => {}
        Err(error) => warn!("Could not delete temporary artifact {:?}: {error}", path),
    }
}

/// Removes files in `dir` last modified more than `older_than` ago. Catches
/// artifacts whose deletion timer was lost to a restart.
pub async fn sweep_stale(dir: &Path, older_than: Duration) -> usize {
    if older_than.is_zero() {
        return 0;
    }

    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(error) => {
            if error.kind() != ErrorKind::NotFound {
                warn!("Could not open download directory for sweeping: {error}");
            }
            return 0;
        }
    };

    let now = std::time::SystemTime::now();
    let mut removed = 0;

    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(error) => {
                warn!("Could not iterate download directory for sweeping: {error}");
                break;
            }
        };

        let path = entry.path();
        let metadata = match entry.metadata().await {
            Ok(metadata) => metadata,
            Err(error) => {
                warn!("Could not read metadata of {:?}: {error}", path);
                continue;
            }
        };
        if !metadata.is_file() {
            continue;
        }

        let age = metadata
            .modified()
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .unwrap_or_default();
        if age < older_than {
            continue;
        }

        match tokio::fs::remove_file(&path).await {
            Ok(()) => removed += 1,
            Err(error) if error.kind() == ErrorKind::NotFound => {}
            Err(error) => warn!("Could not delete stale artifact {:?}: {error}", path),
        }
    }

    if removed > 0 {
        info!("Swept {removed} stale artifact(s) from {:?}", dir);
    }
    removed
}
