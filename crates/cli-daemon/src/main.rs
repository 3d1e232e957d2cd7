use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fetchd::{AudioFormat, AudioQuality, FetchConfig, Job, JobService, JobStatus, YtDlp};
use log::{debug, error, info, warn, LevelFilter};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

/// Audio extraction daemon backed by yt-dlp
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (JSON or TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Convert one URL and follow it until it finishes
    Submit {
        url: String,
        /// Output format (mp3, m4a, wav)
        #[arg(short, long, default_value_t = AudioFormat::DEFAULT.to_string())]
        format: String,
        /// Bitrate in kbps (128, 192, 320)
        #[arg(short, long, default_value_t = AudioQuality::DEFAULT.to_string())]
        quality: String,
        /// Stay running until the retention window reclaims the file
        #[arg(long)]
        hold: bool,
    },
    /// Print the last known state of a job
    Status { id: String },
    /// Resolve title, duration and uploader without downloading
    Info { url: String },
    /// List supported formats and qualities
    Formats,
    /// Run one cleanup pass over the downloads and metadata directories
    Sweep,
    /// Accept `<url> [format] [quality]` lines on stdin until Ctrl-C
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logger - use RUST_LOG env var or default to info level
    let mut logger = env_logger::Builder::from_default_env();
    logger.format_timestamp_secs();
    if args.verbose {
        logger.filter_level(LevelFilter::Debug);
    }
    logger.init();

    let cfg = FetchConfig::load_config(args.config.as_deref())
        .context("Failed to load configuration")?;
    debug!("Configuration loaded: {:?}", cfg);

    let extractor = Arc::new(YtDlp::new(&cfg));
    let service = JobService::new(cfg, extractor).context("Failed to start job service")?;

    match args.command {
        Command::Submit { url, format, quality, hold } => submit(&service, &url, &format, &quality, hold).await,
        Command::Status { id } => print_json(&service.status(&id)?),
        Command::Info { url } => print_json(&service.probe_info(&url).await?),
        Command::Formats => print_json(&service.supported_formats()),
        Command::Sweep => {
            let report = service.sweep_now();
            info!(
                "🗑️  Sweep removed {} download(s), {} snapshot(s), released {} job(s), {} error(s)",
                report.downloads_removed, report.metadata_removed, report.jobs_released, report.errors
            );
            print_json(&report)
        }
        Command::Serve => serve(&service).await,
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn submit(service: &JobService, url: &str, format: &str, quality: &str, hold: bool) -> Result<()> {
    let id = service.submit(url, format, quality)?;
    let job = follow(service, &id).await?;
    print_json(&job)?;

    if job.status == JobStatus::Failed {
        anyhow::bail!("Job {} failed: {}", id, job.error.unwrap_or_default());
    }

    let artifact = service.fetch_artifact(&id)?;
    info!("✅ {} -> {}", artifact.suggested_filename, artifact.path.display());

    if hold {
        info!("Holding until the file expires ({}s)", service.config().retention_secs);
        while service.status(&id).is_ok() {
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        }
        info!("Job {}: reclaimed", id);
    }
    Ok(())
}

/// Log progress changes until the job is terminal, then return its final state
async fn follow(service: &JobService, id: &str) -> Result<Job> {
    let mut rx = service.subscribe(id)?;
    let mut last = None;
    loop {
        let job = rx.borrow_and_update().clone();
        if last != Some((job.status, job.progress)) {
            info!("Job {}: {} {}%", id, job.status, job.progress);
            last = Some((job.status, job.progress));
        }
        if job.is_terminal() {
            return Ok(job);
        }
        if rx.changed().await.is_err() {
            return service.status(id).map_err(Into::into);
        }
    }
}

async fn serve(service: &JobService) -> Result<()> {
    let sweeper = service.start_sweeper();
    info!("Reading submissions from stdin (Ctrl-C to stop)");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line.context("Failed to read stdin")? {
                    Some(line) => submit_line(service, &line),
                    None => {
                        info!("stdin closed; waiting for Ctrl-C");
                        tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    warn!("Shutting down; unfinished jobs are abandoned");
    sweeper.abort();
    Ok(())
}

fn submit_line(service: &JobService, line: &str) {
    let mut parts = line.split_whitespace();
    let Some(url) = parts.next() else {
        return;
    };
    let format = parts.next().unwrap_or(AudioFormat::DEFAULT.extension());
    let quality = parts.next().unwrap_or(AudioQuality::DEFAULT.as_str());
    match service.submit(url, format, quality) {
        Ok(id) => println!("{}", id),
        Err(e) => error!("❌ Rejected '{}': {}", line.trim(), e),
    }
}
