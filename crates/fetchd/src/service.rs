use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use log::{info, warn};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::FetchConfig;
use crate::coordinator::Coordinator;
use crate::error::{JobError, JobResult};
use crate::expiry::{spawn_sweeper, sweep_once, ExpiryQueue, SweepReport, SweepSettings};
use crate::extractor::{Extractor, ProbeInfo};
use crate::job::{is_supported_source, AudioFormat, AudioQuality, Job, JobStatus};
use crate::limiter::ConcurrencyLimiter;
use crate::metadata::MetadataStore;
use crate::registry::JobRegistry;

/// A finished output file ready to hand to a client
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Artifact {
    pub path: PathBuf,
    pub suggested_filename: String,
    pub mime_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SupportedFormats {
    pub formats: Vec<AudioFormat>,
    pub qualities: Vec<AudioQuality>,
    pub default_format: AudioFormat,
    pub default_quality: AudioQuality,
}

pub struct JobService {
    config: FetchConfig,
    extractor: Arc<dyn Extractor>,
    registry: JobRegistry,
    store: MetadataStore,
    limiter: ConcurrencyLimiter,
    coordinator: Arc<Coordinator>,
    reaper: JoinHandle<()>,
}

impl JobService {
    /// Wire up the components and start the expiry reaper. Must be called
    /// from within a tokio runtime.
    pub fn new(config: FetchConfig, extractor: Arc<dyn Extractor>) -> anyhow::Result<Self> {
        config.ensure_dirs()?;

        let registry = JobRegistry::new();
        let store = MetadataStore::new(&config.metadata_dir);
        let limiter = ConcurrencyLimiter::new(config.max_concurrent_jobs);
        let expiry = ExpiryQueue::new(&config.downloads_dir, store.clone(), registry.clone());
        let coordinator = Arc::new(Coordinator::new(
            extractor.clone(),
            store.clone(),
            limiter.clone(),
            expiry.clone(),
            &config.downloads_dir,
            config.retention(),
            config.progress_buffer,
        ));
        let reaper = expiry.spawn();

        info!(
            "Job service ready: {} slots, {}s retention, downloads in {}",
            limiter.capacity(),
            config.retention_secs,
            config.downloads_dir.display()
        );

        Ok(Self {
            config,
            extractor,
            registry,
            store,
            limiter,
            coordinator,
            reaper,
        })
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    /// Start the periodic orphan sweep. The caller owns the handle.
    pub fn start_sweeper(&self) -> JoinHandle<()> {
        spawn_sweeper(SweepSettings::from_config(&self.config), self.registry.clone())
    }

    /// One sweep pass right now
    pub fn sweep_now(&self) -> SweepReport {
        self.sweep_at(SystemTime::now())
    }

    /// One sweep pass, judging file ages against `now`
    pub fn sweep_at(&self, now: SystemTime) -> SweepReport {
        sweep_once(&SweepSettings::from_config(&self.config), &self.registry, now)
    }

    /// Validate a request, register the job and start it in the background.
    /// Returns the new job id without waiting for any work.
    pub fn submit(&self, url: &str, format: &str, quality: &str) -> JobResult<String> {
        let url = url.trim();
        if url.is_empty() {
            return Err(JobError::InvalidArgument("URL is required".to_string()));
        }
        if !is_supported_source(url) {
            return Err(JobError::InvalidArgument(format!("unsupported source URL: {}", url)));
        }
        let format: AudioFormat = format.parse()?;
        let quality: AudioQuality = quality.parse()?;

        let job = Job::new(url, format, quality);
        let id = job.id.clone();
        if let Err(e) = self.store.put(&job) {
            warn!("Job {}: persistence failure: {:#}", id, e);
        }
        let cell = self.registry.insert(job);
        self.coordinator.spawn(cell);

        info!("Job {}: queued {} as {} @ {}k", id, url, format, quality);
        Ok(id)
    }

    /// Current state of a job: the live value if registered, otherwise the
    /// last persisted snapshot
    pub fn status(&self, id: &str) -> JobResult<Job> {
        if let Some(job) = self.registry.snapshot(id) {
            return Ok(job);
        }
        match self.store.get(id) {
            Ok(Some(job)) => Ok(job),
            Ok(None) => Err(JobError::NotFound(format!("job {}", id))),
            Err(e) => Err(JobError::PersistenceFailure(format!("{:#}", e))),
        }
    }

    /// Locate the finished file for a job
    pub fn fetch_artifact(&self, id: &str) -> JobResult<Artifact> {
        let job = self.status(id)?;
        if job.status != JobStatus::Completed {
            return Err(JobError::NotReady { status: job.status, progress: job.progress });
        }

        let filename = job
            .filename
            .as_deref()
            .ok_or_else(|| JobError::NotFound(format!("job {} has no output file", id)))?;
        let path = self.config.downloads_dir.join(filename);
        if !path.is_file() {
            return Err(JobError::NotFound(format!("output file for job {} has expired", id)));
        }

        Ok(Artifact {
            path,
            suggested_filename: job.suggested_filename(),
            mime_type: job.format.mime_type(),
        })
    }

    pub fn supported_formats(&self) -> SupportedFormats {
        SupportedFormats {
            formats: AudioFormat::ALL.to_vec(),
            qualities: AudioQuality::ALL.to_vec(),
            default_format: AudioFormat::DEFAULT,
            default_quality: AudioQuality::DEFAULT,
        }
    }

    /// Resolve source metadata without creating a job
    pub async fn probe_info(&self, url: &str) -> JobResult<ProbeInfo> {
        let url = url.trim();
        if !is_supported_source(url) {
            return Err(JobError::InvalidArgument(format!("unsupported source URL: {}", url)));
        }
        self.extractor
            .probe(url)
            .await
            .map_err(|e| JobError::ExtractionFailure(format!("{:#}", e)))
    }

    /// Follow a live job's updates
    pub fn subscribe(&self, id: &str) -> JobResult<watch::Receiver<Job>> {
        self.registry
            .subscribe(id)
            .ok_or_else(|| JobError::NotFound(format!("job {}", id)))
    }

    /// Jobs currently in the registry
    pub fn job_count(&self) -> usize {
        self.registry.len()
    }

    /// Jobs admitted past the limiter and not yet terminal
    pub fn active_count(&self) -> usize {
        self.registry.snapshots().iter().filter(|j| j.status.is_active()).count()
    }

    pub fn available_slots(&self) -> usize {
        self.limiter.available()
    }
}

impl Drop for JobService {
    fn drop(&mut self) {
        self.reaper.abort();
    }
}
