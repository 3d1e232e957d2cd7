use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::job::{download_progress, AudioFormat, AudioQuality};

/// Progress reported by the tool for one invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractionEvent {
    /// Cumulative byte count with an exact and/or estimated total
    Downloading {
        downloaded: u64,
        total: Option<u64>,
        estimate: Option<u64>,
    },
    /// Transfer done; post-processing may still be running
    Finished,
}

impl ExtractionEvent {
    /// Percentage for a `Downloading` event, preferring the exact total
    pub fn progress(&self) -> Option<u8> {
        match self {
            ExtractionEvent::Downloading { downloaded, total, estimate } => total
                .filter(|t| *t > 0)
                .or(estimate.filter(|t| *t > 0))
                .and_then(|t| download_progress(*downloaded, t)),
            ExtractionEvent::Finished => None,
        }
    }
}

/// Source metadata resolved without downloading
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProbeInfo {
    pub title: Option<String>,
    pub thumbnail: Option<String>,
    pub duration: Option<f64>,
    pub uploader: Option<String>,
    #[serde(default, skip_serializing)]
    pub artist: Option<String>,
    pub view_count: Option<u64>,
    pub upload_date: Option<String>,
    #[serde(alias = "id")]
    pub video_id: Option<String>,
}

/// Everything the tool needs to produce one output file
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub job_id: String,
    pub url: String,
    pub format: AudioFormat,
    pub quality: AudioQuality,
    pub output_dir: PathBuf,
}

impl DownloadRequest {
    /// Prefix every output file for this job starts with
    pub fn output_prefix(&self) -> String {
        format!("{}_", self.job_id)
    }
}

/// External fetch + transcode tool. A download reports progress over the
/// channel and leaves at most one `<job id>_<title>.<ext>` file behind.
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Resolve title, thumbnail, duration and uploader for a source
    async fn probe(&self, url: &str) -> Result<ProbeInfo>;

    /// Fetch and transcode, sending progress into `events`. Returning `Ok`
    /// means the tool exited cleanly, not that an output file exists.
    async fn download(
        &self,
        request: &DownloadRequest,
        events: mpsc::Sender<ExtractionEvent>,
    ) -> Result<()>;
}
