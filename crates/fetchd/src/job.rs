use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::JobError;
use crate::extractor::ProbeInfo;

/// Progress ceiling while bytes are still arriving; the tail is reserved for finalization
pub const DOWNLOAD_PROGRESS_CAP: u8 = 90;
/// Progress reported once the tool says the download finished
pub const FINISHED_PROGRESS: u8 = 95;
/// Error recorded when the tool returns but no output file can be found
pub const OUTPUT_NOT_FOUND: &str = "output file not found after download";
/// Title used when the probe step does not report one
pub const UNKNOWN_TITLE: &str = "Unknown Title";

static SOURCE_URL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(https?://)?(www\.|m\.|music\.)?(youtube\.com|youtu\.be)/.+$")
        .expect("source url pattern is valid")
});

static VIDEO_ID_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:youtube\.com/(?:[^/\n\s]+/\S+/|(?:v|e(?:mbed)?|shorts)/|\S*?[?&]v=)|youtu\.be/)([a-zA-Z0-9_-]{11})")
        .expect("video id pattern is valid")
});

/// Lifecycle state of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Processing,
    Extracting,
    Converting,
    Optimizing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Admitted and not yet terminal
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            JobStatus::Processing | JobStatus::Extracting | JobStatus::Converting | JobStatus::Optimizing
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Extracting => "extracting",
            JobStatus::Converting => "converting",
            JobStatus::Optimizing => "optimizing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Phase shown while the tool is running; a presentation of the percentage
pub fn status_for_progress(progress: u8) -> JobStatus {
    if progress < 30 {
        JobStatus::Extracting
    } else if progress < 60 {
        JobStatus::Converting
    } else {
        JobStatus::Optimizing
    }
}

/// Percentage for a byte count, scaled into 0..=90. `None` when the total is unknown.
pub fn download_progress(downloaded: u64, total: u64) -> Option<u8> {
    if total == 0 {
        return None;
    }
    let scaled = downloaded as u128 * DOWNLOAD_PROGRESS_CAP as u128 / total as u128;
    Some(scaled.min(DOWNLOAD_PROGRESS_CAP as u128) as u8)
}

/// Output audio container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    Mp3,
    M4a,
    Wav,
}

impl AudioFormat {
    pub const ALL: [AudioFormat; 3] = [AudioFormat::Mp3, AudioFormat::M4a, AudioFormat::Wav];
    pub const DEFAULT: AudioFormat = AudioFormat::Mp3;

    /// File extension, also the name yt-dlp expects for `--audio-format`
    pub fn extension(&self) -> &'static str {
        match self {
            AudioFormat::Mp3 => "mp3",
            AudioFormat::M4a => "m4a",
            AudioFormat::Wav => "wav",
        }
    }

    pub fn mime_type(&self) -> String {
        format!("audio/{}", self.extension())
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for AudioFormat {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase();
        AudioFormat::ALL
            .into_iter()
            .find(|f| f.extension() == wanted)
            .ok_or_else(|| {
                JobError::InvalidArgument(format!(
                    "invalid format '{}'; allowed formats: {}",
                    s,
                    AudioFormat::ALL.map(|f| f.extension()).join(", ")
                ))
            })
    }
}

/// Target bitrate in kbps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AudioQuality {
    #[serde(rename = "128")]
    Kbps128,
    #[serde(rename = "192")]
    Kbps192,
    #[serde(rename = "320")]
    Kbps320,
}

impl AudioQuality {
    pub const ALL: [AudioQuality; 3] = [AudioQuality::Kbps128, AudioQuality::Kbps192, AudioQuality::Kbps320];
    pub const DEFAULT: AudioQuality = AudioQuality::Kbps192;

    pub fn as_str(&self) -> &'static str {
        match self {
            AudioQuality::Kbps128 => "128",
            AudioQuality::Kbps192 => "192",
            AudioQuality::Kbps320 => "320",
        }
    }
}

impl fmt::Display for AudioQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AudioQuality {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().trim_end_matches(&['k', 'K'][..]);
        AudioQuality::ALL
            .into_iter()
            .find(|q| q.as_str() == wanted)
            .ok_or_else(|| {
                JobError::InvalidArgument(format!(
                    "invalid quality '{}'; allowed qualities: {}",
                    s,
                    AudioQuality::ALL.map(|q| q.as_str()).join(", ")
                ))
            })
    }
}

/// Whether a locator looks like something the extractor accepts
pub fn is_supported_source(url: &str) -> bool {
    SOURCE_URL_RE.is_match(url.trim())
}

/// Best-effort 11 character video id from a watch, short, embed or youtu.be URL
pub fn extract_video_id(url: &str) -> Option<String> {
    VIDEO_ID_RE
        .captures(url)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// One request to convert one source into one audio file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub url: String,
    pub format: AudioFormat,
    pub quality: AudioQuality,
    pub status: JobStatus,
    pub progress: u8,
    pub filename: Option<String>,
    pub title: Option<String>,
    pub thumbnail: Option<String>,
    /// Seconds, as reported by the probe
    pub duration: Option<f64>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub file_size: Option<u64>,
    pub artist: Option<String>,
    pub video_id: Option<String>,
}

impl Job {
    pub fn new(url: impl Into<String>, format: AudioFormat, quality: AudioQuality) -> Self {
        let url = url.into();
        let video_id = extract_video_id(&url);
        Self {
            id: Uuid::new_v4().to_string(),
            url,
            format,
            quality,
            status: JobStatus::Queued,
            progress: 0,
            filename: None,
            title: None,
            thumbnail: None,
            duration: None,
            error: None,
            created_at: Utc::now(),
            expires_at: None,
            file_size: None,
            artist: None,
            video_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Admission: PROCESSING at 0%
    pub fn start(&mut self) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.status = JobStatus::Processing;
        self.progress = 0;
        true
    }

    /// Copy probe results onto the job so they are visible mid-download
    pub fn apply_probe(&mut self, info: &ProbeInfo) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.title = Some(info.title.clone().unwrap_or_else(|| UNKNOWN_TITLE.to_string()));
        self.thumbnail = info.thumbnail.clone();
        self.duration = info.duration;
        self.artist = info.artist.clone().or_else(|| info.uploader.clone());
        true
    }

    /// Apply a byte-count percentage. Progress never moves backwards; an unknown
    /// percentage only refreshes the derived phase. Returns whether anything changed.
    pub fn record_download(&mut self, progress: Option<u8>) -> bool {
        if self.is_terminal() {
            return false;
        }
        let before = (self.progress, self.status);
        if let Some(p) = progress {
            self.progress = self.progress.max(p.min(DOWNLOAD_PROGRESS_CAP));
        }
        self.status = status_for_progress(self.progress);
        (self.progress, self.status) != before
    }

    /// The tool reported the transfer done; COMPLETED still waits for the file check
    pub fn record_finished(&mut self) -> bool {
        if self.is_terminal() {
            return false;
        }
        let before = (self.progress, self.status);
        self.progress = self.progress.max(FINISHED_PROGRESS);
        self.status = JobStatus::Optimizing;
        (self.progress, self.status) != before
    }

    pub fn complete(&mut self, filename: String, file_size: u64, expires_at: DateTime<Utc>) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.filename = Some(filename);
        self.file_size = Some(file_size);
        self.status = JobStatus::Completed;
        self.progress = 100;
        self.expires_at = Some(expires_at);
        self.error = None;
        true
    }

    pub fn fail(&mut self, error: impl Into<String>) -> bool {
        if self.is_terminal() {
            return false;
        }
        let mut error = error.into();
        if error.trim().is_empty() {
            error = "unknown extraction error".to_string();
        }
        self.status = JobStatus::Failed;
        self.error = Some(error);
        true
    }

    /// Download name offered to clients: title plus extension, stripped of
    /// characters that are unsafe in a file name
    pub fn suggested_filename(&self) -> String {
        let title = self.title.as_deref().unwrap_or(UNKNOWN_TITLE);
        format!("{}.{}", title, self.format.extension())
            .chars()
            .filter(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | '.' | ' '))
            .collect()
    }
}
