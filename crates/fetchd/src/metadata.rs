use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::debug;
use uuid::Uuid;

use crate::job::Job;

/// Extension of committed snapshot files
pub const SNAPSHOT_EXTENSION: &str = "json";
/// Extension of in-flight snapshot writes
pub const TEMP_EXTENSION: &str = "tmp";

/// Job ids become file names, so only allow characters that cannot escape the directory
pub fn is_valid_job_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Durable per-job JSON snapshots, one file per job id
#[derive(Debug, Clone)]
pub struct MetadataStore {
    dir: PathBuf,
}

impl MetadataStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Get the path of the snapshot file for a job id
    pub fn snapshot_path(&self, id: &str) -> Result<PathBuf> {
        if !is_valid_job_id(id) {
            anyhow::bail!("Invalid job id: {:?}", id);
        }
        Ok(self.dir.join(format!("{}.{}", id, SNAPSHOT_EXTENSION)))
    }

    /// Overwrite the snapshot for `job`. The file is written under a unique
    /// temp name and renamed into place, so readers only ever see a whole file.
    pub fn put(&self, job: &Job) -> Result<()> {
        let path = self.snapshot_path(&job.id)?;
        let temp_path = self.dir.join(format!(".{}.{}.{}", job.id, Uuid::new_v4().simple(), TEMP_EXTENSION));

        let json = serde_json::to_vec(job)
            .with_context(|| format!("Failed to serialize job {}", job.id))?;

        let write = || -> Result<()> {
            let mut file = fs::File::create(&temp_path)
                .with_context(|| format!("Failed to create snapshot temp file: {}", temp_path.display()))?;
            file.write_all(&json)
                .with_context(|| format!("Failed to write snapshot temp file: {}", temp_path.display()))?;
            file.sync_all()
                .with_context(|| format!("Failed to sync snapshot temp file: {}", temp_path.display()))?;
            drop(file);
            fs::rename(&temp_path, &path)
                .with_context(|| format!("Failed to move snapshot into place: {}", path.display()))?;
            Ok(())
        };

        if let Err(e) = write() {
            let _ = fs::remove_file(&temp_path); // Best-effort cleanup
            return Err(e);
        }

        debug!("Job {}: snapshot written ({}, {}%)", job.id, job.status, job.progress);
        Ok(())
    }

    /// Load a snapshot. Unknown or malformed ids are simply absent.
    pub fn get(&self, id: &str) -> Result<Option<Job>> {
        let path = match self.snapshot_path(id) {
            Ok(p) => p,
            Err(_) => return Ok(None),
        };

        let content = match fs::read(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read snapshot: {}", path.display()))
            }
        };

        let job: Job = serde_json::from_slice(&content)
            .with_context(|| format!("Failed to parse snapshot: {}", path.display()))?;
        Ok(Some(job))
    }

    /// Remove a snapshot. Returns whether a file was actually deleted.
    pub fn delete(&self, id: &str) -> Result<bool> {
        let path = self.snapshot_path(id)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).with_context(|| format!("Failed to delete snapshot: {}", path.display())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{AudioFormat, AudioQuality, JobStatus};
    use chrono::{DateTime, TimeZone, Utc};
    use proptest::prelude::*;
    use std::sync::Arc;

    fn store() -> (tempfile::TempDir, MetadataStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::new(dir.path());
        (dir, store)
    }

    fn test_job() -> Job {
        Job::new("https://www.youtube.com/watch?v=dQw4w9WgXcQ", AudioFormat::Wav, AudioQuality::Kbps128)
    }

    #[test]
    fn test_put_get_delete() {
        let (_dir, store) = store();
        let mut job = test_job();
        job.start();
        store.put(&job).unwrap();

        let loaded = store.get(&job.id).unwrap().unwrap();
        assert_eq!(loaded, job);

        job.record_finished();
        store.put(&job).unwrap();
        assert_eq!(store.get(&job.id).unwrap().unwrap().progress, 95);

        assert!(store.delete(&job.id).unwrap());
        assert!(!store.delete(&job.id).unwrap());
        assert!(store.get(&job.id).unwrap().is_none());
    }

    #[test]
    fn test_snapshot_field_names() {
        let (_dir, store) = store();
        let job = test_job();
        store.put(&job).unwrap();

        let raw = fs::read_to_string(store.snapshot_path(&job.id).unwrap()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["status"], "queued");
        assert_eq!(value["format"], "wav");
        assert_eq!(value["quality"], "128");
        assert_eq!(value["video_id"], "dQw4w9WgXcQ");
        assert!(value["expires_at"].is_null());
    }

    #[test]
    fn test_path_escape_is_rejected() {
        let (_dir, store) = store();
        assert!(store.snapshot_path("../etc/passwd").is_err());
        assert!(store.get("../etc/passwd").unwrap().is_none());
        assert!(store.delete("").is_err());
    }

    #[test]
    fn test_corrupt_snapshot_is_an_error() {
        let (_dir, store) = store();
        let job = test_job();
        fs::write(store.snapshot_path(&job.id).unwrap(), b"{\"id\": ").unwrap();
        assert!(store.get(&job.id).is_err());
    }

    #[test]
    fn test_concurrent_puts_never_expose_partial_files() {
        let (_dir, store) = store();
        let store = Arc::new(store);
        let job = test_job();
        store.put(&job).unwrap();

        let writers: Vec<_> = (0..4u8)
            .map(|n| {
                let store = store.clone();
                let mut job = job.clone();
                std::thread::spawn(move || {
                    for i in 0..50u8 {
                        job.progress = (n * 20 + i % 20).min(90);
                        job.title = Some("x".repeat(i as usize * 37));
                        store.put(&job).unwrap();
                    }
                })
            })
            .collect();

        for _ in 0..200 {
            let loaded = store.get(&job.id).unwrap().expect("snapshot present");
            assert_eq!(loaded.id, job.id);
        }
        for w in writers {
            w.join().unwrap();
        }

        let leftovers = fs::read_dir(store.dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().and_then(|s| s.to_str()) == Some(TEMP_EXTENSION))
            .count();
        assert_eq!(leftovers, 0);
    }

    fn arb_status() -> impl Strategy<Value = JobStatus> {
        prop_oneof![
            Just(JobStatus::Queued),
            Just(JobStatus::Processing),
            Just(JobStatus::Extracting),
            Just(JobStatus::Converting),
            Just(JobStatus::Optimizing),
            Just(JobStatus::Completed),
            Just(JobStatus::Failed),
        ]
    }

    fn arb_time() -> impl Strategy<Value = DateTime<Utc>> {
        (0i64..4_000_000_000, 0u32..1_000_000_000)
            .prop_map(|(secs, nanos)| Utc.timestamp_opt(secs, nanos).unwrap())
    }

    prop_compose! {
        fn arb_job()(
            format in prop_oneof![Just(AudioFormat::Mp3), Just(AudioFormat::M4a), Just(AudioFormat::Wav)],
            quality in prop_oneof![Just(AudioQuality::Kbps128), Just(AudioQuality::Kbps192), Just(AudioQuality::Kbps320)],
            status in arb_status(),
            progress in 0u8..=100,
            text in proptest::option::of("[ -~]{0,40}"),
            unicode_title in proptest::option::of("\\PC{0,20}"),
            duration in proptest::option::of(0u32..100_000),
            created_at in arb_time(),
            expires_at in proptest::option::of(arb_time()),
            file_size in proptest::option::of(any::<u64>()),
        ) -> Job {
            let mut job = Job::new("https://youtu.be/dQw4w9WgXcQ", format, quality);
            job.status = status;
            job.progress = progress;
            job.filename = text.clone();
            job.title = unicode_title;
            job.thumbnail = text.clone();
            job.duration = duration.map(|d| d as f64 / 4.0);
            job.error = text.clone();
            job.created_at = created_at;
            job.expires_at = expires_at;
            job.file_size = file_size;
            job.artist = text;
            job
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn test_snapshot_round_trip(job in arb_job()) {
            let (_dir, store) = store();
            store.put(&job).unwrap();
            let loaded = store.get(&job.id).unwrap().unwrap();
            prop_assert_eq!(loaded, job);
        }
    }
}
