// Filesystem artifact store
// <root>/<project>/<job>/<ref>/v<N>/{record.json, files/...}, published by staging then renaming

use crate::artifacts::{
    ArtifactError, ArtifactFiles, ArtifactHandle, ArtifactRecord, ArtifactStore, Clock,
    SystemClock,
};

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::sync::Mutex;

const RECORD_FILE: &str = "record.json";
const FILES_DIR: &str = "files";
const STAGING_DIR: &str = ".staging";

/// Artifact store on the local filesystem, scoped to one project
#[derive(Debug)]
pub struct FsArtifactStore {
    root: PathBuf,
    project: String,
    clock: Arc<dyn Clock>,
    /// Serializes version assignment
    publish_lock: Mutex<()>,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>, project: impl Into<String>) -> Self {
        Self::with_clock(root, project, Arc::new(SystemClock))
    }

    pub fn with_clock(
        root: impl Into<PathBuf>,
        project: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            root: root.into(),
            project: project.into(),
            clock,
            publish_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    fn project_dir(&self) -> PathBuf {
        self.root.join(encode_component(&self.project))
    }

    fn ref_dir(&self, job: &str, git_ref: &str) -> PathBuf {
        self.project_dir()
            .join(encode_component(job))
            .join(encode_component(git_ref))
    }

    fn version_dir(&self, handle: &ArtifactHandle) -> PathBuf {
        self.ref_dir(&handle.job, &handle.git_ref)
            .join(format!("v{}", handle.version))
    }

    async fn versions(&self, job: &str, git_ref: &str) -> Result<Vec<u64>, ArtifactError> {
        let mut versions = Vec::new();
        let mut entries = match fs::read_dir(self.ref_dir(job, git_ref)).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(versions),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if let Some(version) = name
                .to_str()
                .and_then(|n| n.strip_prefix('v'))
                .and_then(|n| n.parse::<u64>().ok())
            {
                versions.push(version);
            }
        }
        versions.sort_unstable();
        Ok(versions)
    }

    async fn read_record(&self, dir: &Path) -> Result<Option<ArtifactRecord>, ArtifactError> {
        match fs::read(dir.join(RECORD_FILE)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Every version directory with its record
    async fn records(&self) -> Result<Vec<(PathBuf, ArtifactRecord)>, ArtifactError> {
        let mut records = Vec::new();
        for job_dir in subdirectories(&self.project_dir()).await? {
            for ref_dir in subdirectories(&job_dir).await? {
                for version_dir in subdirectories(&ref_dir).await? {
                    if let Some(record) = self.read_record(&version_dir).await? {
                        records.push((version_dir, record));
                    }
                }
            }
        }
        records.sort_by(|(_, a), (_, b)| a.created_at.cmp(&b.created_at));
        Ok(records)
    }

    /// Write files and record under `staging`, then move it to the next version
    async fn commit_staged(
        &self,
        staging: &Path,
        job: &str,
        git_ref: &str,
        files: &ArtifactFiles,
        retention: chrono::Duration,
    ) -> Result<(ArtifactHandle, usize, u64), ArtifactError> {
        let files_dir = staging.join(FILES_DIR);
        fs::create_dir_all(&files_dir).await?;
        let mut size = 0u64;
        for (path, contents) in files {
            let target = files_dir.join(path);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).await?;
            }
            fs::write(&target, contents).await?;
            size += contents.len() as u64;
        }

        let _guard = self.publish_lock.lock().await;
        let version = self
            .versions(job, git_ref)
            .await?
            .last()
            .map_or(1, |latest| latest + 1);
        let handle = ArtifactHandle {
            project: self.project.clone(),
            job: job.to_string(),
            git_ref: git_ref.to_string(),
            version,
        };

        let created_at = self.clock.now();
        let record = ArtifactRecord {
            handle: handle.clone(),
            files: files.keys().cloned().collect(),
            size,
            created_at,
            expires_at: created_at
                .checked_add_signed(retention)
                .unwrap_or(chrono::DateTime::<chrono::Utc>::MAX_UTC),
        };
        fs::write(staging.join(RECORD_FILE), serde_json::to_vec_pretty(&record)?).await?;

        let target = self.version_dir(&handle);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(staging, &target).await?;
        Ok((handle, record.files.len(), size))
    }

    fn not_found(job: &str, git_ref: &str) -> ArtifactError {
        ArtifactError::NotFound(format!("job '{}' on ref '{}'", job, git_ref))
    }
}

#[async_trait::async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn publish(
        &self,
        job: &str,
        git_ref: &str,
        files: ArtifactFiles,
        retention: Duration,
    ) -> Result<ArtifactHandle, ArtifactError> {
        if retention.is_zero() {
            return Err(ArtifactError::InvalidRetention(
                "retention must be greater than zero".to_string(),
            ));
        }
        let retention = chrono::Duration::from_std(retention)
            .map_err(|e| ArtifactError::InvalidRetention(e.to_string()))?;
        for path in files.keys() {
            validate_relative(path)?;
        }

        // Write everything outside the version tree first
        let staging = self
            .root
            .join(STAGING_DIR)
            .join(uuid::Uuid::new_v4().to_string());
        let (handle, count, size) = match self
            .commit_staged(&staging, job, git_ref, &files, retention)
            .await
        {
            Ok(published) => published,
            Err(e) => {
                if let Err(cleanup) = fs::remove_dir_all(&staging).await {
                    if cleanup.kind() != std::io::ErrorKind::NotFound {
                        tracing::warn!(path = %staging.display(), error = %cleanup, "failed to remove staged artifact");
                    }
                }
                return Err(e);
            }
        };

        tracing::debug!(
            artifact = %handle,
            files = count,
            size,
            "artifact published"
        );
        Ok(handle)
    }

    async fn fetch(&self, handle: &ArtifactHandle) -> Result<ArtifactFiles, ArtifactError> {
        if handle.project != self.project {
            return Err(ArtifactError::NotFound(handle.to_string()));
        }
        let dir = self.version_dir(handle);
        let record = self
            .read_record(&dir)
            .await?
            .filter(|record| !record.is_expired(self.clock.now()))
            .ok_or_else(|| ArtifactError::NotFound(handle.to_string()))?;

        let mut files = ArtifactFiles::new();
        for path in record.files {
            let contents = fs::read(dir.join(FILES_DIR).join(&path)).await?;
            files.insert(path, contents);
        }
        Ok(files)
    }

    async fn latest(&self, job: &str, git_ref: &str) -> Result<ArtifactHandle, ArtifactError> {
        let now = self.clock.now();
        for version in self.versions(job, git_ref).await?.into_iter().rev() {
            let handle = ArtifactHandle {
                project: self.project.clone(),
                job: job.to_string(),
                git_ref: git_ref.to_string(),
                version,
            };
            if let Some(record) = self.read_record(&self.version_dir(&handle)).await? {
                if !record.is_expired(now) {
                    return Ok(handle);
                }
            }
        }
        Err(Self::not_found(job, git_ref))
    }

    async fn list(&self) -> Result<Vec<ArtifactRecord>, ArtifactError> {
        Ok(self
            .records()
            .await?
            .into_iter()
            .map(|(_, record)| record)
            .collect())
    }

    async fn reap_expired(&self) -> Result<usize, ArtifactError> {
        let now = self.clock.now();
        let mut removed = 0;
        for (dir, record) in self.records().await? {
            if record.is_expired(now) {
                fs::remove_dir_all(&dir).await?;
                tracing::debug!(artifact = %record.handle, "expired artifact removed");
                removed += 1;
            }
        }
        Ok(removed)
    }
}

async fn subdirectories(dir: &Path) -> Result<Vec<PathBuf>, ArtifactError> {
    let mut dirs = Vec::new();
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(dirs),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            dirs.push(entry.path());
        }
    }
    Ok(dirs)
}

/// Percent-encode a name so it is a single safe path component
fn encode_component(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{:02X}", byte));
        }
    }
    if out.is_empty() {
        out.push('%');
    }
    out
}

fn validate_relative(path: &str) -> Result<(), ArtifactError> {
    let valid = !path.is_empty()
        && Path::new(path)
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if valid {
        Ok(())
    } else {
        Err(ArtifactError::InvalidPath(path.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::ManualClock;

    const WEEK: Duration = Duration::from_secs(7 * 24 * 60 * 60);

    fn files(pairs: &[(&str, &str)]) -> ArtifactFiles {
        pairs
            .iter()
            .map(|(path, contents)| (path.to_string(), contents.as_bytes().to_vec()))
            .collect()
    }

    fn store(dir: &Path) -> (FsArtifactStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        (
            FsArtifactStore::with_clock(dir, "dolfiny", clock.clone()),
            clock,
        )
    }

    #[tokio::test]
    async fn test_publish_and_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = store(dir.path());

        let published = files(&[("dist/pkg.whl", "wheel"), ("report.xml", "<ok/>")]);
        let handle = store
            .publish("wheel", "master", published.clone(), WEEK)
            .await
            .unwrap();

        assert_eq!(handle.version, 1);
        assert_eq!(store.fetch(&handle).await.unwrap(), published);
        assert!(!dir.path().join(STAGING_DIR).read_dir().unwrap().any(|_| true));
    }

    #[tokio::test]
    async fn test_versions_increase_and_latest() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = store(dir.path());

        store.publish("wheel", "master", files(&[("a", "1")]), WEEK).await.unwrap();
        let second = store.publish("wheel", "master", files(&[("a", "2")]), WEEK).await.unwrap();
        store.publish("wheel", "feature/x", files(&[("a", "3")]), WEEK).await.unwrap();

        assert_eq!(second.version, 2);
        assert_eq!(store.latest("wheel", "master").await.unwrap(), second);
        assert_eq!(store.fetch(&second).await.unwrap(), files(&[("a", "2")]));
        assert_eq!(store.list().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_never_published_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = store(dir.path());

        let err = store.latest("wheel", "master").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_expired_artifacts_not_found_and_reaped() {
        let dir = tempfile::tempdir().unwrap();
        let (store, clock) = store(dir.path());

        let handle = store
            .publish("docs", "master", files(&[("index.html", "<html/>")]), Duration::from_secs(3600))
            .await
            .unwrap();
        clock.advance(Duration::from_secs(3599));
        assert!(store.fetch(&handle).await.is_ok());

        clock.advance(Duration::from_secs(1));
        assert!(store.fetch(&handle).await.unwrap_err().is_not_found());
        assert!(store.latest("docs", "master").await.unwrap_err().is_not_found());

        assert_eq!(store.reap_expired().await.unwrap(), 1);
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejects_escaping_paths_and_zero_retention() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = store(dir.path());

        let err = store
            .publish("job", "main", files(&[("../x", "x")]), WEEK)
            .await
            .unwrap_err();
        assert!(matches!(err, ArtifactError::InvalidPath(_)));

        let err = store
            .publish("job", "main", files(&[("x", "x")]), Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, ArtifactError::InvalidRetention(_)));
    }

    #[tokio::test]
    async fn test_failed_publish_leaves_no_staging() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = store(dir.path());

        // `out` is written as a file, so `out/log` cannot be created under it
        let result = store
            .publish("job", "main", files(&[("out", "x"), ("out/log", "y")]), WEEK)
            .await;

        assert!(matches!(result, Err(ArtifactError::Io(_))));
        assert!(!dir.path().join(STAGING_DIR).read_dir().unwrap().any(|_| true));
        assert!(store.latest("job", "main").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_fetch_other_project_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = store(dir.path());

        let mut handle = store
            .publish("wheel", "master", files(&[("a", "1")]), WEEK)
            .await
            .unwrap();
        handle.project = "other".to_string();
        assert!(store.fetch(&handle).await.unwrap_err().is_not_found());
    }

    #[test]
    fn test_encode_component() {
        assert_eq!(encode_component("feature/x"), "feature%2Fx");
        assert_eq!(encode_component(".."), "%2E%2E");
        assert_eq!(encode_component("image: [arm64]"), "image%3A%20%5Barm64%5D");
    }
}
