use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::expiry::ExpiryQueue;
use crate::extractor::{DownloadRequest, ExtractionEvent, Extractor};
use crate::job::{Job, OUTPUT_NOT_FOUND};
use crate::limiter::ConcurrencyLimiter;
use crate::metadata::MetadataStore;
use crate::registry::JobCell;

/// Sole writer of a job's state once submitted. Every transition is
/// persisted; tool failures end the job FAILED and never escape the task.
pub struct Coordinator {
    extractor: Arc<dyn Extractor>,
    store: MetadataStore,
    limiter: ConcurrencyLimiter,
    expiry: ExpiryQueue,
    downloads_dir: PathBuf,
    retention: Duration,
    progress_buffer: usize,
}

impl Coordinator {
    pub fn new(
        extractor: Arc<dyn Extractor>,
        store: MetadataStore,
        limiter: ConcurrencyLimiter,
        expiry: ExpiryQueue,
        downloads_dir: impl Into<PathBuf>,
        retention: Duration,
        progress_buffer: usize,
    ) -> Self {
        Self {
            extractor,
            store,
            limiter,
            expiry,
            downloads_dir: downloads_dir.into(),
            retention,
            progress_buffer: progress_buffer.max(1),
        }
    }

    /// Run the job on its own task. A panic inside the run still leaves the
    /// job FAILED; the slot is released by unwinding.
    pub fn spawn(self: &Arc<Self>, cell: JobCell) -> JoinHandle<()> {
        let coordinator = self.clone();
        tokio::spawn(async move {
            let inner = tokio::spawn({
                let coordinator = coordinator.clone();
                let cell = cell.clone();
                async move { coordinator.run(&cell).await }
            });
            if let Err(e) = inner.await {
                let job_id = cell.borrow().id.clone();
                error!("Job {}: ❌ worker task aborted: {}", job_id, e);
                coordinator.update(&cell, |job| job.fail(format!("worker task aborted: {}", e)));
            }
        })
    }

    /// Wait for a slot, then run the job to a terminal state
    pub async fn run(&self, cell: &JobCell) {
        let job_id = cell.borrow().id.clone();

        let _slot = match self.limiter.acquire().await {
            Ok(slot) => slot,
            Err(e) => {
                error!("Job {}: could not acquire a worker slot: {:#}", job_id, e);
                self.update(cell, |job| job.fail(format!("{:#}", e)));
                return;
            }
        };
        info!(
            "Job {}: admitted ({} of {} slots in use)",
            job_id,
            self.limiter.in_use(),
            self.limiter.capacity()
        );

        self.update(cell, Job::start);

        if let Err(e) = self.extract(cell).await {
            error!("Job {}: ❌ extraction failed: {:#}", job_id, e);
            self.update(cell, |job| job.fail(format!("{:#}", e)));
        }
    }

    async fn extract(&self, cell: &JobCell) -> Result<()> {
        let request = {
            let job = cell.borrow();
            DownloadRequest {
                job_id: job.id.clone(),
                url: job.url.clone(),
                format: job.format,
                quality: job.quality,
                output_dir: self.downloads_dir.clone(),
            }
        };

        let info = self.extractor.probe(&request.url).await?;
        self.update(cell, |job| job.apply_probe(&info));
        debug!("Job {}: probed '{}'", request.job_id, info.title.as_deref().unwrap_or("?"));

        let (tx, mut rx) = mpsc::channel(self.progress_buffer);
        let download = self.extractor.download(&request, tx);
        let drain = async {
            while let Some(event) = rx.recv().await {
                self.apply_event(cell, &event);
            }
        };
        let (result, ()) = tokio::join!(download, drain);
        result?;

        match locate_output(&self.downloads_dir, &request)? {
            Some((filename, size)) => {
                let expires_at = Utc::now()
                    + chrono::Duration::from_std(self.retention).context("retention window out of range")?;
                self.update(cell, |job| job.complete(filename.clone(), size, expires_at));
                self.expiry.schedule(&request.job_id, &filename, self.retention);
                info!("Job {}: ✅ completed: {} ({} bytes)", request.job_id, filename, size);
            }
            None => {
                warn!("Job {}: no output file matching {}*.{}", request.job_id, request.output_prefix(), request.format);
                self.update(cell, |job| job.fail(OUTPUT_NOT_FOUND));
            }
        }
        Ok(())
    }

    fn apply_event(&self, cell: &JobCell, event: &ExtractionEvent) {
        match event {
            ExtractionEvent::Downloading { .. } => {
                let progress = event.progress();
                self.update(cell, |job| job.record_download(progress));
            }
            ExtractionEvent::Finished => {
                self.update(cell, Job::record_finished);
            }
        }
    }

    /// Apply a transition and persist the result. Persistence failures are
    /// logged; the in-memory state stays authoritative.
    fn update(&self, cell: &JobCell, f: impl FnOnce(&mut Job) -> bool) -> bool {
        if !cell.send_if_modified(f) {
            return false;
        }
        let snapshot = cell.borrow().clone();
        if let Err(e) = self.store.put(&snapshot) {
            warn!("Job {}: persistence failure: {:#}", snapshot.id, e);
        }
        true
    }
}

/// Find the file the tool produced for this request: `<job id>_*.<ext>` in
/// `dir`, first in name order
pub fn locate_output(dir: &Path, request: &DownloadRequest) -> Result<Option<(String, u64)>> {
    let prefix = request.output_prefix();
    let suffix = format!(".{}", request.format.extension());

    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read downloads directory: {}", dir.display()))
        }
    };

    let mut matches: Vec<(String, u64)> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let name = entry.file_name().into_string().ok()?;
            if !name.starts_with(&prefix) || !name.ends_with(&suffix) {
                return None;
            }
            let meta = entry.metadata().ok()?;
            meta.is_file().then(|| (name, meta.len()))
        })
        .collect();
    matches.sort();
    Ok(matches.into_iter().next())
}
