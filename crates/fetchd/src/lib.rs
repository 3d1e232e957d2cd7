pub mod config;
pub mod error;
pub mod job;
pub mod extractor;
pub mod ytdlp;
pub mod metadata;
pub mod registry;
pub mod limiter;
pub mod coordinator;
pub mod expiry;
pub mod service;

#[cfg(test)]
mod fake;

pub use config::FetchConfig;
pub use error::{JobError, JobResult};
pub use job::{AudioFormat, AudioQuality, Job, JobStatus};
pub use extractor::{DownloadRequest, ExtractionEvent, Extractor, ProbeInfo};
pub use ytdlp::YtDlp;
pub use expiry::SweepReport;
pub use service::{Artifact, JobService, SupportedFormats};
