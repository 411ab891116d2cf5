use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use tracing::warn;
use uuid::Uuid;

use crate::{error::ServiceError, request::MediaKind};

/// Containers the engine may fall back to when the requested one is not
/// available for a source.
pub const CANDIDATE_EXTENSIONS: [&str; 6] = ["mp4", "mkv", "webm", "m4a", "mp3", "opus"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedArtifact {
    pub path: PathBuf,
    /// Other candidates that also exist for the same job. They are never
    /// served and should be released straight away.
    pub extras: Vec<PathBuf>,
}

pub struct OutputResolver {
    download_dir: PathBuf,
}

impl OutputResolver {
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
        }
    }

    pub fn template_for(&self, job_id: Uuid) -> String {
        format!("{}/{job_id}.%(ext)s", self.download_dir.to_string_lossy())
    }

    pub fn candidate_paths(&self, job_id: Uuid, expected: MediaKind) -> Vec<PathBuf> {
        let preferred = expected.extension();
        std::iter::once(preferred)
            .chain(
                CANDIDATE_EXTENSIONS
                    .into_iter()
                    .filter(move |extension| *extension != preferred),
            )
            .map(|extension| self.download_dir.join(format!("{job_id}.{extension}")))
            .collect()
    }

    /// Returns the first candidate that exists as a non-empty regular file
    /// inside the download directory, probing the requested extension first.
    pub async fn resolve(
        &self,
        job_id: Uuid,
        expected: MediaKind,
    ) -> Result<ResolvedArtifact, ServiceError> {
        let canonical_dir = tokio::fs::canonicalize(&self.download_dir).await?;

        let mut found = Vec::new();
        for candidate in self.candidate_paths(job_id, expected) {
            if let Some(path) = existing_file_within(&canonical_dir, &candidate).await? {
                found.push(path);
            }
        }

        if found.is_empty() {
            return Err(ServiceError::ResolutionFailure);
        }

        let path = found.remove(0);
        if !found.is_empty() {
            warn!(
                "Job {job_id} produced {} extra candidate(s), serving {:?}",
                found.len(),
                path
            );
        }

        Ok(ResolvedArtifact {
            path,
            extras: found,
        })
    }
}

async fn existing_file_within(
    canonical_dir: &Path,
    candidate: &Path,
) -> Result<Option<PathBuf>, ServiceError> {
    let metadata = match tokio::fs::metadata(candidate).await {
        Ok(metadata) => metadata,
        Err(error) if error.kind() == ErrorKind::NotFound => return Ok(None),
        Err(error) => return Err(error.into()),
    };

    if !metadata.is_file() || metadata.len() == 0 {
        return Ok(None);
    }

    let canonical = tokio::fs::canonicalize(candidate).await?;
    if !canonical.starts_with(canonical_dir) {
        warn!("Ignoring artifact outside the download directory: {:?}", canonical);
        return Ok(None);
    }

    Ok(Some(canonical))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn prefers_requested_extension() {
        let dir = TempDir::new().unwrap();
        let job = Uuid::new_v4();
        std::fs::write(dir.path().join(format!("{job}.mp4")), b"video").unwrap();

        let resolver = OutputResolver::new(dir.path());
        let artifact = resolver.resolve(job, MediaKind::Video).await.unwrap();

        assert_eq!(artifact.path.file_name().unwrap(), format!("{job}.mp4").as_str());
        assert!(artifact.extras.is_empty());
    }

    #[tokio::test]
    async fn falls_back_to_container_the_engine_chose() {
        let dir = TempDir::new().unwrap();
        let job = Uuid::new_v4();
        std::fs::write(dir.path().join(format!("{job}.webm")), b"video").unwrap();

        let resolver = OutputResolver::new(dir.path());
        let artifact = resolver.resolve(job, MediaKind::Video).await.unwrap();

        assert_eq!(artifact.path.extension().unwrap(), "webm");
    }

    #[tokio::test]
    async fn reports_extra_candidates() {
        let dir = TempDir::new().unwrap();
        let job = Uuid::new_v4();
        std::fs::write(dir.path().join(format!("{job}.m4a")), b"a").unwrap();
        std::fs::write(dir.path().join(format!("{job}.mp3")), b"b").unwrap();

        let resolver = OutputResolver::new(dir.path());
        let artifact = resolver.resolve(job, MediaKind::Audio).await.unwrap();

        assert_eq!(artifact.path.extension().unwrap(), "mp3");
        assert_eq!(artifact.extras.len(), 1);
        assert_eq!(artifact.extras[0].extension().unwrap(), "m4a");
    }

    #[tokio::test]
    async fn missing_or_foreign_files_do_not_resolve() {
        let dir = TempDir::new().unwrap();
        let job = Uuid::new_v4();
        std::fs::write(dir.path().join(format!("{}.mp4", Uuid::new_v4())), b"x").unwrap();
        std::fs::write(dir.path().join(format!("{job}.mp4.part")), b"x").unwrap();
        std::fs::create_dir(dir.path().join(format!("{job}.mkv"))).unwrap();
        std::fs::write(dir.path().join(format!("{job}.webm")), b"").unwrap();

        let resolver = OutputResolver::new(dir.path());
        assert!(matches!(
            resolver.resolve(job, MediaKind::Video).await,
            Err(ServiceError::ResolutionFailure)
        ));
    }

    #[test]
    fn template_and_candidates_share_the_job_id() {
        let resolver = OutputResolver::new("/downloads");
        let job = Uuid::new_v4();

        assert_eq!(resolver.template_for(job), format!("/downloads/{job}.%(ext)s"));
        let candidates = resolver.candidate_paths(job, MediaKind::Audio);
        assert_eq!(candidates.len(), CANDIDATE_EXTENSIONS.len());
        assert_eq!(candidates[0], PathBuf::from(format!("/downloads/{job}.mp3")));
    }
}
