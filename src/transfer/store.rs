//! Resumable job state on disk: one JSON document per FILE job under
//! `<state_dir>/jobs/`, written to a synced temp file and renamed into place.

use std::io::{self, ErrorKind};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use log::warn;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::job::{ChunkBitmap, Direction, JobId, JobState, RetryState, TransferJob};
use super::messages::TransferHeader;
use crate::identity::PeerId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedJob {
    pub direction: Direction,
    pub peer: PeerId,
    /// Last address the peer was reached at, for sender-side resume.
    pub address: Option<SocketAddr>,
    pub header: TransferHeader,
    /// Chunk bitmap, hex encoded.
    pub completed: String,
    pub state: JobState,
    /// Source file (send) or final destination (receive).
    pub path: PathBuf,
}

impl PersistedJob {
    pub fn from_job(job: &TransferJob, address: Option<SocketAddr>, path: PathBuf) -> Self {
        Self {
            direction: job.direction,
            peer: job.peer,
            address,
            header: job.header.clone(),
            completed: job.completed.to_hex(),
            state: job.state,
            path,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.header.job_id
    }

    /// Rebuild the in-memory job. Anything that was running when the process
    /// stopped comes back PAUSED.
    pub fn into_job(self, retry: RetryState) -> Option<TransferJob> {
        let completed = ChunkBitmap::from_hex(self.header.total_chunks(), &self.completed)?;
        let mut job = TransferJob::new(self.header, self.direction, self.peer, retry);
        job.completed = completed;
        job.state = match self.state {
            JobState::Pending | JobState::InProgress => JobState::Paused,
            other => other,
        };
        if self.direction == Direction::Receive {
            job.destination = Some(self.path);
        }
        Some(job)
    }
}

pub struct JobStore {
    dir: PathBuf,
    /// Keeps temp names of concurrent saves apart.
    writes: AtomicU64,
}

impl JobStore {
    pub async fn open(state_dir: impl AsRef<Path>) -> io::Result<Self> {
        let dir = state_dir.as_ref().join("jobs");
        fs::create_dir_all(&dir).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700)).await?;
        }

        Ok(Self {
            dir,
            writes: AtomicU64::new(0),
        })
    }

    fn path_for(&self, job_id: &JobId) -> PathBuf {
        self.dir.join(format!("{job_id}.json"))
    }

    /// Write the document in full, flush it to disk, then rename it over the
    /// previous one. A reader sees the old or the new state, never a mix.
    pub async fn save(&self, job: &PersistedJob) -> io::Result<()> {
        let path = self.path_for(&job.job_id());
        let n = self.writes.fetch_add(1, Ordering::Relaxed);
        let temp = self.dir.join(format!("{}.{n}.tmp", job.job_id()));
        let json = serde_json::to_vec_pretty(job)?;

        let written = async {
            let mut file = fs::File::create(&temp).await?;
            file.write_all(&json).await?;
            file.sync_all().await?;
            fs::rename(&temp, &path).await
        }
        .await;
        if written.is_err() {
            let _ = fs::remove_file(&temp).await;
        }
        written
    }

    pub async fn load(&self, job_id: &JobId) -> io::Result<Option<PersistedJob>> {
        match fs::read(self.path_for(job_id)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn remove(&self, job_id: &JobId) -> io::Result<()> {
        match fs::remove_file(self.path_for(job_id)).await {
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    /// Every readable job document. Corrupt files are skipped with a warning.
    pub async fn load_all(&self) -> io::Result<Vec<PersistedJob>> {
        let mut jobs = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let parsed = fs::read(&path)
                .await
                .map_err(|e| e.to_string())
                .and_then(|bytes| serde_json::from_slice::<PersistedJob>(&bytes).map_err(|e| e.to_string()));
            match parsed {
                Ok(job) => jobs.push(job),
                Err(e) => warn!("Skipping unreadable job state {}: {}", path.display(), e),
            }
        }
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::FINGERPRINT_SIZE;
    use crate::transfer::job::{PayloadKind, JOB_ID_SIZE};
    use std::time::Duration;

    fn job() -> TransferJob {
        let header = TransferHeader {
            job_id: JobId([5; JOB_ID_SIZE]),
            kind: PayloadKind::File,
            total_size: 10_000,
            content_hash: [1; 32],
            chunk_size: 1000,
            name: "big.bin".into(),
        };
        let mut job = TransferJob::new(
            header,
            Direction::Receive,
            PeerId([2; FINGERPRINT_SIZE]),
            RetryState::new(Duration::from_secs(1), 3),
        );
        job.transition(JobState::InProgress).unwrap();
        job.completed.insert(0);
        job.completed.insert(3);
        job
    }

    #[tokio::test]
    async fn test_save_and_load_all() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::open(dir.path()).await.unwrap();
        let mut job = job();
        let record = PersistedJob::from_job(&job, None, dir.path().join("big.bin"));
        store.save(&record).await.unwrap();
        job.completed.insert(7);
        let updated = PersistedJob::from_job(&job, None, dir.path().join("big.bin"));
        store.save(&updated).await.unwrap();

        let loaded = store.load_all().await.unwrap();
        assert_eq!(loaded, vec![updated.clone()]);
        assert_eq!(store.load(&job.id()).await.unwrap(), Some(updated));

        // Only the document is left behind.
        let names: Vec<_> = std::fs::read_dir(dir.path().join("jobs"))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from(format!("{}.json", job.id()))]);
    }

    #[test]
    fn test_running_job_restores_as_paused() {
        let dir = tempfile::tempdir().unwrap();
        let record = PersistedJob::from_job(&job(), None, dir.path().join("big.bin"));
        let restored = record
            .into_job(RetryState::new(Duration::from_secs(1), 3))
            .unwrap();
        assert_eq!(restored.state, JobState::Paused);
        assert_eq!(restored.completed.count(), 2);
        assert!(restored.completed.contains(3));
        assert_eq!(restored.destination, Some(dir.path().join("big.bin")));
    }

    #[tokio::test]
    async fn test_remove_and_corrupt_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::open(dir.path()).await.unwrap();
        let job = job();
        store
            .save(&PersistedJob::from_job(&job, None, "x".into()))
            .await
            .unwrap();
        std::fs::write(dir.path().join("jobs").join("garbage.json"), b"{not json").unwrap();

        assert_eq!(store.load_all().await.unwrap().len(), 1);
        store.remove(&job.id()).await.unwrap();
        store.remove(&job.id()).await.unwrap();
        assert!(store.load_all().await.unwrap().is_empty());
        assert!(store.load(&job.id()).await.unwrap().is_none());
    }
}
