use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;

use crate::job::Job;

/// Live state of one job. The owning coordinator publishes whole values with
/// `send_modify`; everyone else reads a cloned snapshot.
pub type JobCell = Arc<watch::Sender<Job>>;

/// In-memory index of live jobs, keyed by job id
#[derive(Debug, Clone, Default)]
pub struct JobRegistry {
    jobs: Arc<Mutex<HashMap<String, JobCell>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, JobCell>> {
        // The map holds no invariants a panicking holder could break
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new job and return the cell its coordinator will write to
    pub fn insert(&self, job: Job) -> JobCell {
        let id = job.id.clone();
        let (tx, _rx) = watch::channel(job);
        let cell = Arc::new(tx);
        self.lock().insert(id, cell.clone());
        cell
    }

    pub fn get(&self, id: &str) -> Option<JobCell> {
        self.lock().get(id).cloned()
    }

    /// Consistent copy of the job's current state
    pub fn snapshot(&self, id: &str) -> Option<Job> {
        let cell = self.get(id)?;
        let job = cell.borrow().clone();
        Some(job)
    }

    /// Receiver that observes every published update; closes once the job is
    /// removed and its coordinator has finished
    pub fn subscribe(&self, id: &str) -> Option<watch::Receiver<Job>> {
        self.get(id).map(|cell| cell.subscribe())
    }

    /// Drop a job from the index. Returns whether it was present.
    pub fn remove(&self, id: &str) -> bool {
        self.lock().remove(id).is_some()
    }

    /// Drop a job only if it has reached COMPLETED or FAILED
    pub fn remove_terminal(&self, id: &str) -> bool {
        let mut jobs = self.lock();
        let terminal = jobs.get(id).map_or(false, |cell| cell.borrow().is_terminal());
        terminal && jobs.remove(id).is_some()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Snapshots of every live job, in no particular order
    pub fn snapshots(&self) -> Vec<Job> {
        let cells: Vec<JobCell> = self.lock().values().cloned().collect();
        cells.iter().map(|c| c.borrow().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{AudioFormat, AudioQuality, JobStatus};

    fn test_job() -> Job {
        Job::new("https://youtu.be/dQw4w9WgXcQ", AudioFormat::Mp3, AudioQuality::Kbps192)
    }

    #[test]
    fn test_insert_snapshot_remove() {
        let registry = JobRegistry::new();
        let job = test_job();
        let id = job.id.clone();

        let cell = registry.insert(job);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.snapshot(&id).unwrap().status, JobStatus::Queued);

        cell.send_modify(|j| {
            j.start();
        });
        assert_eq!(registry.snapshot(&id).unwrap().status, JobStatus::Processing);

        assert!(registry.remove(&id));
        assert!(!registry.remove(&id));
        assert!(registry.snapshot(&id).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_remove_terminal_spares_live_jobs() {
        let registry = JobRegistry::new();
        let job = test_job();
        let id = job.id.clone();
        let cell = registry.insert(job);

        assert!(!registry.remove_terminal(&id));
        cell.send_modify(|j| {
            j.start();
        });
        assert!(!registry.remove_terminal(&id));
        cell.send_modify(|j| {
            j.fail("ERROR: Video unavailable");
        });
        assert!(registry.remove_terminal(&id));
        assert!(!registry.contains(&id));
        assert!(!registry.remove_terminal(&id));
    }

    #[test]
    fn test_snapshot_is_detached_from_later_updates() {
        let registry = JobRegistry::new();
        let job = test_job();
        let id = job.id.clone();
        let cell = registry.insert(job);

        let before = registry.snapshot(&id).unwrap();
        cell.send_modify(|j| {
            j.start();
            j.record_download(Some(50));
        });
        assert_eq!(before.progress, 0);
        assert_eq!(registry.snapshot(&id).unwrap().progress, 50);
    }

    #[tokio::test]
    async fn test_subscriber_sees_updates_and_closes_on_removal() {
        let registry = JobRegistry::new();
        let job = test_job();
        let id = job.id.clone();
        let cell = registry.insert(job);
        let mut rx = registry.subscribe(&id).unwrap();

        cell.send_modify(|j| {
            j.start();
        });
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().status, JobStatus::Processing);

        registry.remove(&id);
        drop(cell);
        assert!(rx.changed().await.is_err());
    }

    #[test]
    fn test_concurrent_inserts_and_removes() {
        let registry = JobRegistry::new();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        let job = test_job();
                        let id = job.id.clone();
                        registry.insert(job);
                        assert!(registry.snapshot(&id).is_some());
                        assert!(registry.remove(&id));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(registry.is_empty());
    }
}
