use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use walkdir::WalkDir;

use crate::config::FetchConfig;
use crate::metadata::{MetadataStore, SNAPSHOT_EXTENSION, TEMP_EXTENSION};
use crate::registry::JobRegistry;

#[derive(Debug, Clone)]
struct Scheduled {
    deadline: Instant,
    filename: String,
}

#[derive(Debug, Default)]
struct QueueState {
    heap: BinaryHeap<Reverse<(Instant, String)>>,
    entries: HashMap<String, Scheduled>,
}

impl QueueState {
    /// Earliest deadline that still has a live entry, discarding cancelled heap items
    fn next_deadline(&mut self) -> Option<Instant> {
        loop {
            let (deadline, live) = match self.heap.peek() {
                Some(Reverse((deadline, id))) => (
                    *deadline,
                    self.entries.get(id).map_or(false, |s| s.deadline == *deadline),
                ),
                None => return None,
            };
            if live {
                return Some(deadline);
            }
            self.heap.pop();
        }
    }

    fn pop_due(&mut self, now: Instant) -> Vec<(String, Scheduled)> {
        let mut due = Vec::new();
        while let Some(deadline) = self.next_deadline() {
            if deadline > now {
                break;
            }
            if let Some(Reverse((_, id))) = self.heap.pop() {
                if let Some(s) = self.entries.remove(&id) {
                    due.push((id, s));
                }
            }
        }
        due
    }
}

/// Per-job deletion deadlines, drained by one reaper task
#[derive(Debug, Clone)]
pub struct ExpiryQueue {
    state: Arc<Mutex<QueueState>>,
    wake: Arc<Notify>,
    downloads_dir: PathBuf,
    store: MetadataStore,
    registry: JobRegistry,
}

impl ExpiryQueue {
    pub fn new(downloads_dir: impl Into<PathBuf>, store: MetadataStore, registry: JobRegistry) -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState::default())),
            wake: Arc::new(Notify::new()),
            downloads_dir: downloads_dir.into(),
            store,
            registry,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Arm the deadline for a completed job. A job can only be armed once;
    /// returns false if it already is.
    pub fn schedule(&self, job_id: &str, filename: &str, after: Duration) -> bool {
        let deadline = Instant::now() + after;
        {
            let mut state = self.lock();
            if state.entries.contains_key(job_id) {
                return false;
            }
            state.entries.insert(
                job_id.to_string(),
                Scheduled { deadline, filename: filename.to_string() },
            );
            state.heap.push(Reverse((deadline, job_id.to_string())));
        }
        self.wake.notify_one();
        info!("Job {}: '{}' available for {}s", job_id, filename, after.as_secs());
        true
    }

    /// Disarm a pending deadline. Returns whether one was pending.
    pub fn cancel(&self, job_id: &str) -> bool {
        let removed = self.lock().entries.remove(job_id).is_some();
        if removed {
            self.wake.notify_one();
        }
        removed
    }

    pub fn deadline(&self, job_id: &str) -> Option<Instant> {
        self.lock().entries.get(job_id).map(|s| s.deadline)
    }

    pub fn is_scheduled(&self, job_id: &str) -> bool {
        self.lock().entries.contains_key(job_id)
    }

    /// Number of armed deadlines
    pub fn pending(&self) -> usize {
        self.lock().entries.len()
    }

    /// Expire everything due at `now`. Returns how many jobs were reclaimed.
    pub fn fire_due(&self, now: Instant) -> usize {
        let due = self.lock().pop_due(now);
        for (id, scheduled) in &due {
            self.expire(id, &scheduled.filename);
        }
        due.len()
    }

    /// Delete output file, snapshot and registry entry, in that order. Each
    /// step is attempted regardless of the others.
    fn expire(&self, job_id: &str, filename: &str) {
        let output = self.downloads_dir.join(filename);
        match std::fs::remove_file(&output) {
            Ok(()) => info!("Job {}: 🗑️  File '{}' was auto-deleted", job_id, filename),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("Job {}: output '{}' already gone", job_id, filename)
            }
            Err(e) => error!("Job {}: Error deleting file {}: {}", job_id, output.display(), e),
        }

        match self.store.delete(job_id) {
            Ok(true) => debug!("Job {}: snapshot deleted", job_id),
            Ok(false) => debug!("Job {}: snapshot already gone", job_id),
            Err(e) => error!("Job {}: Error deleting snapshot: {:#}", job_id, e),
        }

        if !self.registry.remove(job_id) {
            debug!("Job {}: not in registry at expiry", job_id);
        }
    }

    /// Run the reaper loop until the task is aborted
    pub fn spawn(&self) -> JoinHandle<()> {
        let queue = self.clone();
        tokio::spawn(async move {
            loop {
                let next = queue.lock().next_deadline();
                match next {
                    Some(deadline) => {
                        tokio::select! {
                            _ = tokio::time::sleep_until(deadline) => {
                                queue.fire_due(Instant::now());
                            }
                            _ = queue.wake.notified() => {}
                        }
                    }
                    None => queue.wake.notified().await,
                }
            }
        })
    }
}

/// Directories and ages the periodic sweep works with
#[derive(Debug, Clone)]
pub struct SweepSettings {
    pub downloads_dir: PathBuf,
    pub metadata_dir: PathBuf,
    pub download_max_age: Duration,
    pub metadata_max_age: Duration,
    pub interval: Duration,
}

impl SweepSettings {
    pub fn from_config(cfg: &FetchConfig) -> Self {
        Self {
            downloads_dir: cfg.downloads_dir.clone(),
            metadata_dir: cfg.metadata_dir.clone(),
            download_max_age: cfg.download_max_age(),
            metadata_max_age: cfg.metadata_max_age(),
            interval: cfg.sweep_interval(),
        }
    }
}

/// Outcome of one sweep pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub downloads_removed: usize,
    pub metadata_removed: usize,
    /// Terminal jobs dropped from the registry along with their snapshot
    pub jobs_released: usize,
    pub errors: usize,
}

/// One pass over both directories, treating `now` as the current time. A
/// terminal job whose snapshot is swept leaves the registry too; jobs that
/// are still running keep their entry.
pub fn sweep_once(settings: &SweepSettings, registry: &JobRegistry, now: SystemTime) -> SweepReport {
    let mut report = SweepReport::default();

    report.downloads_removed = sweep_dir(
        &settings.downloads_dir,
        settings.download_max_age,
        now,
        |_| true,
        &mut report.errors,
    )
    .len();
    let snapshots = sweep_dir(
        &settings.metadata_dir,
        settings.metadata_max_age,
        now,
        |path| {
            matches!(
                path.extension().and_then(|s| s.to_str()),
                Some(ext) if ext == SNAPSHOT_EXTENSION || ext == TEMP_EXTENSION
            )
        },
        &mut report.errors,
    );
    report.metadata_removed = snapshots.len();

    for path in &snapshots {
        if path.extension().and_then(|s| s.to_str()) != Some(SNAPSHOT_EXTENSION) {
            continue;
        }
        let Some(job_id) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if registry.remove_terminal(job_id) {
            debug!("Job {}: released from registry by sweep", job_id);
            report.jobs_released += 1;
        }
    }

    if report.downloads_removed > 0 || report.metadata_removed > 0 {
        info!(
            "Cleanup sweep removed {} download(s) and {} snapshot(s), released {} job(s)",
            report.downloads_removed, report.metadata_removed, report.jobs_released
        );
    } else {
        debug!("Cleanup sweep found nothing expired");
    }
    report
}

fn sweep_dir(
    dir: &Path,
    max_age: Duration,
    now: SystemTime,
    wanted: impl Fn(&Path) -> bool,
    errors: &mut usize,
) -> Vec<PathBuf> {
    let mut removed = Vec::new();
    if !dir.exists() {
        debug!("Sweep skipped, directory does not exist: {}", dir.display());
        return removed;
    }

    for entry in WalkDir::new(dir).min_depth(1).max_depth(1).follow_links(false) {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!("Error reading directory entry in {}: {}", dir.display(), e);
                *errors += 1;
                continue;
            }
        };
        let path = entry.path();
        if !entry.file_type().is_file() || !wanted(path) {
            continue;
        }

        let modified = match entry.metadata().ok().and_then(|m| m.modified().ok()) {
            Some(m) => m,
            None => continue, // Gone already, or no mtime support
        };
        // Future mtimes (clock skew) count as fresh
        let age = now.duration_since(modified).unwrap_or(Duration::ZERO);
        if age <= max_age {
            continue;
        }

        match std::fs::remove_file(path) {
            Ok(()) => {
                info!("🗑️  Cleaned up expired file: {}", path.display());
                removed.push(path.to_path_buf());
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                error!("Error deleting expired file {}: {}", path.display(), e);
                *errors += 1;
            }
        }
    }
    removed
}

/// Run `sweep_once` every `settings.interval`, starting immediately
pub fn spawn_sweeper(settings: SweepSettings, registry: JobRegistry) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(settings.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let pass = settings.clone();
            let registry = registry.clone();
            let result =
                tokio::task::spawn_blocking(move || sweep_once(&pass, &registry, SystemTime::now())).await;
            if let Err(e) = result {
                error!("Error in cleanup task: {}", e);
            }
        }
    })
}
