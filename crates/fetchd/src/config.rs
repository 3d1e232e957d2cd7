use std::path::{Path, PathBuf};
use std::time::Duration;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Configuration for the audio fetch daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Directory where finished audio files are written
    pub downloads_dir: PathBuf,
    /// Directory where job snapshot JSON files are stored
    pub metadata_dir: PathBuf,
    /// How long a finished file stays available, in seconds
    pub retention_secs: u64,
    /// Maximum number of extraction jobs running at once
    pub max_concurrent_jobs: usize,
    /// Interval in seconds between cleanup sweeps
    pub sweep_interval_secs: u64,
    /// Extra age past retention before the sweep removes a download
    pub download_sweep_buffer_secs: u64,
    /// Extra age past retention before the sweep removes a snapshot
    pub metadata_sweep_buffer_secs: u64,
    /// Path to the yt-dlp binary
    pub ytdlp_bin: PathBuf,
    /// Optional Netscape cookie jar handed to yt-dlp
    pub cookies_file: Option<PathBuf>,
    /// Capacity of the per-job progress event channel
    pub progress_buffer: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl FetchConfig {
    /// Create a default configuration with sensible values
    pub fn default_config() -> Self {
        Self {
            downloads_dir: PathBuf::from("downloads"),
            metadata_dir: PathBuf::from("metadata"),
            retention_secs: 60,
            max_concurrent_jobs: 5,
            sweep_interval_secs: 300,
            download_sweep_buffer_secs: 30,
            metadata_sweep_buffer_secs: 60,
            ytdlp_bin: PathBuf::from("yt-dlp"),
            cookies_file: None,
            progress_buffer: 64,
        }
    }

    /// Load configuration from a file, or return defaults if path is None or file doesn't exist
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default_config();

        if let Some(config_path) = path {
            if config_path.exists() {
                let content = std::fs::read_to_string(config_path)
                    .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

                // TOML by extension, JSON otherwise
                if config_path.extension().and_then(|s| s.to_str()) == Some("toml") {
                    config = toml::from_str(&content)
                        .with_context(|| format!("Failed to parse TOML config: {}", config_path.display()))?;
                } else {
                    config = serde_json::from_str(&content)
                        .with_context(|| format!("Failed to parse JSON config: {}", config_path.display()))?;
                }
            }
        }

        if config.max_concurrent_jobs == 0 {
            anyhow::bail!("max_concurrent_jobs must be at least 1");
        }

        Ok(config)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Age after which the sweep deletes a file from the downloads directory
    pub fn download_max_age(&self) -> Duration {
        Duration::from_secs(self.retention_secs + self.download_sweep_buffer_secs)
    }

    /// Age after which the sweep deletes a snapshot from the metadata directory
    pub fn metadata_max_age(&self) -> Duration {
        Duration::from_secs(self.retention_secs + self.metadata_sweep_buffer_secs)
    }

    /// Create the downloads and metadata directories if missing
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [&self.downloads_dir, &self.metadata_dir] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
        }
        Ok(())
    }
}
