use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use crate::extractor::{DownloadRequest, ExtractionEvent, Extractor, ProbeInfo};

/// What one download invocation does
#[derive(Debug, Clone, Default)]
pub struct Script {
    events: Vec<(u64, u64)>,
    write_output: bool,
    probe_error: Option<String>,
    download_error: Option<String>,
    panic: bool,
    gated: bool,
}

impl Script {
    /// Report each `(downloaded, total)` pair, write the output file, finish
    pub fn success(events: Vec<(u64, u64)>) -> Self {
        Self { events, write_output: true, ..Self::default() }
    }

    /// Exit cleanly without leaving a file behind
    pub fn no_output() -> Self {
        Self::default()
    }

    pub fn download_error(message: &str) -> Self {
        Self { events: vec![(10, 100)], download_error: Some(message.to_string()), ..Self::default() }
    }

    pub fn probe_error(message: &str) -> Self {
        Self { probe_error: Some(message.to_string()), ..Self::default() }
    }

    pub fn panics() -> Self {
        Self { panic: true, ..Self::default() }
    }

    /// Hold every download after it starts until [`FakeExtractor::release`]
    pub fn gated(mut self) -> Self {
        self.gated = true;
        self
    }
}

#[derive(Debug, Default)]
struct FakeState {
    started: HashSet<String>,
    released: HashSet<String>,
    running: usize,
    peak: usize,
}

#[derive(Debug, Clone)]
pub struct FakeExtractor {
    script: Script,
    state: Arc<Mutex<FakeState>>,
    changed: Arc<watch::Sender<u64>>,
}

impl FakeExtractor {
    pub const OUTPUT_BYTES: &'static [u8] = b"ID3 fake audio payload";
    pub const TITLE: &'static str = "Fake Song";

    pub fn new(script: Script) -> Self {
        let (changed, _rx) = watch::channel(0);
        Self {
            script,
            state: Arc::new(Mutex::new(FakeState::default())),
            changed: Arc::new(changed),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn modify(&self, f: impl FnOnce(&mut FakeState)) {
        f(&mut self.lock());
        self.changed.send_modify(|v| *v += 1);
    }

    async fn wait_for(&self, done: impl Fn(&FakeState) -> bool) {
        let mut rx = self.changed.subscribe();
        loop {
            let ready = done(&self.lock());
            if ready {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Resolves once the download for `job_id` has begun
    pub async fn wait_started(&self, job_id: &str) {
        self.wait_for(|s| s.started.contains(job_id)).await
    }

    /// Resolves once `n` downloads are running at the same time
    pub async fn wait_running(&self, n: usize) {
        self.wait_for(|s| s.running >= n).await
    }

    pub fn release(&self, job_id: &str) {
        self.modify(|s| {
            s.released.insert(job_id.to_string());
        });
    }

    pub fn started(&self, job_id: &str) -> bool {
        self.lock().started.contains(job_id)
    }

    pub fn running(&self) -> usize {
        self.lock().running
    }

    pub fn peak_running(&self) -> usize {
        self.lock().peak
    }
}

#[async_trait]
impl Extractor for FakeExtractor {
    async fn probe(&self, _url: &str) -> Result<ProbeInfo> {
        if let Some(message) = &self.script.probe_error {
            return Err(anyhow!("{}", message));
        }
        Ok(ProbeInfo {
            title: Some(Self::TITLE.to_string()),
            thumbnail: Some("https://i.ytimg.com/vi/fake/hqdefault.jpg".to_string()),
            duration: Some(213.0),
            uploader: Some("Fake Uploader".to_string()),
            artist: None,
            view_count: Some(42),
            upload_date: Some("20091025".to_string()),
            video_id: Some("dQw4w9WgXcQ".to_string()),
        })
    }

    async fn download(&self, request: &DownloadRequest, events: mpsc::Sender<ExtractionEvent>) -> Result<()> {
        if self.script.panic {
            panic!("extraction tool crashed");
        }

        let job_id = request.job_id.clone();
        self.modify(|s| {
            s.started.insert(job_id.clone());
            s.running += 1;
            s.peak = s.peak.max(s.running);
        });
        if self.script.gated {
            self.wait_for(|s| s.released.contains(&job_id)).await;
        }

        let result = self.play(request, &events).await;
        self.modify(|s| s.running -= 1);
        result
    }
}

impl FakeExtractor {
    async fn play(&self, request: &DownloadRequest, events: &mpsc::Sender<ExtractionEvent>) -> Result<()> {
        for &(downloaded, total) in &self.script.events {
            let _ = events
                .send(ExtractionEvent::Downloading { downloaded, total: Some(total), estimate: None })
                .await;
        }
        if let Some(message) = &self.script.download_error {
            return Err(anyhow!("{}", message));
        }
        if self.script.write_output {
            let name = format!("{}{}.{}", request.output_prefix(), Self::TITLE, request.format.extension());
            std::fs::write(request.output_dir.join(name), Self::OUTPUT_BYTES)?;
        }
        let _ = events.send(ExtractionEvent::Finished).await;
        Ok(())
    }
}
