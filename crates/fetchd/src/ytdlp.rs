use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::{debug, warn};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::config::FetchConfig;
use crate::extractor::{DownloadRequest, ExtractionEvent, Extractor, ProbeInfo};

/// Marker yt-dlp prints in front of every progress line we ask it for
const PROGRESS_MARKER: &str = "fetchd-progress";
/// Lines of stderr kept for the error message of a failed run
const STDERR_TAIL_LINES: usize = 20;

/// Extractor backed by the yt-dlp command line tool (ffmpeg does the transcode)
#[derive(Debug, Clone)]
pub struct YtDlp {
    pub bin: PathBuf,
    pub cookies_file: Option<PathBuf>,
}

impl YtDlp {
    pub fn new(cfg: &FetchConfig) -> Self {
        Self {
            bin: cfg.ytdlp_bin.clone(),
            cookies_file: cfg.cookies_file.clone(),
        }
    }

    fn probe_args(&self, url: &str) -> Vec<String> {
        let mut args = vec![
            "--dump-single-json".to_string(),
            "--skip-download".to_string(),
            "--no-playlist".to_string(),
            "--no-warnings".to_string(),
        ];
        self.push_cookies(&mut args);
        args.push(url.to_string());
        args
    }

    /// Arguments for the fetch + transcode run
    pub fn download_args(&self, request: &DownloadRequest) -> Vec<String> {
        let template = request
            .output_dir
            .join(format!("{}%(title)s.%(ext)s", request.output_prefix()));

        let mut args = vec![
            "-f".to_string(),
            "bestaudio/best".to_string(),
            "-x".to_string(),
            "--audio-format".to_string(),
            request.format.extension().to_string(),
            "--audio-quality".to_string(),
            format!("{}K", request.quality.as_str()),
            "--no-playlist".to_string(),
            // Output mtime must be the local write time; the sweep ages files by it
            "--no-mtime".to_string(),
            "--newline".to_string(),
            "--progress-template".to_string(),
            format!(
                "download:{} %(progress.status)s %(progress.downloaded_bytes)s %(progress.total_bytes)s %(progress.total_bytes_estimate)s",
                PROGRESS_MARKER
            ),
            "-o".to_string(),
            template.to_string_lossy().into_owned(),
        ];
        self.push_cookies(&mut args);
        args.push(request.url.clone());
        args
    }

    fn push_cookies(&self, args: &mut Vec<String>) {
        if let Some(cookies) = &self.cookies_file {
            args.push("--cookies".to_string());
            args.push(cookies.to_string_lossy().into_owned());
        }
    }
}

/// Parse one line of yt-dlp stdout into a progress event
pub fn parse_progress_line(line: &str) -> Option<ExtractionEvent> {
    let mut parts = line.trim().split_whitespace();
    if parts.next()? != PROGRESS_MARKER {
        return None;
    }
    let status = parts.next()?;
    let downloaded = parse_bytes(parts.next());
    let total = parse_bytes(parts.next());
    let estimate = parse_bytes(parts.next());

    match status {
        "downloading" => Some(ExtractionEvent::Downloading {
            downloaded: downloaded.unwrap_or(0),
            total,
            estimate,
        }),
        "finished" => Some(ExtractionEvent::Finished),
        _ => None,
    }
}

/// yt-dlp prints `NA` for missing fields and floats for estimates
fn parse_bytes(field: Option<&str>) -> Option<u64> {
    let value = field?.parse::<f64>().ok()?;
    if value.is_finite() && value >= 0.0 {
        Some(value as u64)
    } else {
        None
    }
}

#[async_trait]
impl Extractor for YtDlp {
    async fn probe(&self, url: &str) -> Result<ProbeInfo> {
        let args = self.probe_args(url);
        debug!("Executing yt-dlp probe: {} {}", self.bin.display(), args.join(" "));

        let output = Command::new(&self.bin)
            .args(&args)
            .output()
            .await
            .with_context(|| format!(
                "Failed to execute yt-dlp at: {}. Ensure yt-dlp is installed and accessible.",
                self.bin.display()
            ))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!(
                "yt-dlp probe failed (exit code {}): {}",
                output.status.code().unwrap_or(-1),
                stderr.trim()
            ));
        }

        let json_str = String::from_utf8(output.stdout)
            .context("yt-dlp output is not valid UTF-8")?;
        let info: ProbeInfo = serde_json::from_str(&json_str)
            .with_context(|| format!("Failed to parse yt-dlp JSON for: {}", url))?;

        Ok(info)
    }

    async fn download(
        &self,
        request: &DownloadRequest,
        events: mpsc::Sender<ExtractionEvent>,
    ) -> Result<()> {
        let args = self.download_args(request);
        debug!("Job {}: executing {} {}", request.job_id, self.bin.display(), args.join(" "));

        let mut child = Command::new(&self.bin)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!(
                "Failed to spawn yt-dlp at: {}. Ensure yt-dlp is installed and accessible.",
                self.bin.display()
            ))?;

        let stdout = child.stdout.take()
            .ok_or_else(|| anyhow!("Failed to capture yt-dlp stdout"))?;
        let stderr = child.stderr.take()
            .ok_or_else(|| anyhow!("Failed to capture yt-dlp stderr"))?;

        let stderr_handle = tokio::spawn(async move {
            let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            tail.into_iter().collect::<Vec<_>>().join("\n")
        });

        let mut lines = BufReader::new(stdout).lines();
        while let Some(line) = lines.next_line().await.context("Failed to read yt-dlp stdout")? {
            match parse_progress_line(&line) {
                Some(event) => {
                    if events.send(event).await.is_err() {
                        warn!("Job {}: progress receiver dropped", request.job_id);
                    }
                }
                None => debug!("Job {}: yt-dlp: {}", request.job_id, line),
            }
        }

        let status = child.wait().await.context("Failed to wait for yt-dlp process")?;
        let stderr = stderr_handle.await.context("Failed to read yt-dlp stderr")?;

        if !status.success() {
            let last_error = stderr
                .lines()
                .rev()
                .find(|l| l.starts_with("ERROR:"))
                .map(str::to_string);
            let message = last_error.unwrap_or(stderr);
            return Err(anyhow!(
                "yt-dlp exited with code {}: {}",
                status.code().unwrap_or(-1),
                message.trim()
            ));
        }

        Ok(())
    }
}
