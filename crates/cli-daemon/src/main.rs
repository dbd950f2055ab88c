//! CLI entry point for hwtranscoder
//!
//! Detects capabilities, inspects presets, builds or runs a single
//! transcode, or serves the job scheduler over HTTP.

use clap::{Args, Parser, Subcommand};
use hwtranscoder::capabilities::Capabilities;
use hwtranscoder::daemon::detect_capabilities;
use hwtranscoder::jobs::{format_file_size, JobStatus};
use hwtranscoder::preset::{self, EncodeOptions, OutputTarget, PresetCollection};
use hwtranscoder::scheduler::{effective_capabilities, JobEvent, PresetRef, SchedulerOptions, SubmitRequest};
use hwtranscoder::store::MemoryJobStore;
use hwtranscoder::{
    build_with_program, AudioCodec, Codec, Config, Daemon, Scale, Scheduler, SharedCapabilities,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// hwtranscoder - hardware-aware ffmpeg transcoding
#[derive(Parser, Debug)]
#[command(name = "hwtranscoder")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log at debug level unless RUST_LOG is set
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Probe the host for hardware encoders and write a capabilities document
    Detect {
        /// Where to write the capabilities JSON
        output: PathBuf,
    },
    /// Validate a preset collection and list its presets
    Presets {
        #[arg(long)]
        file: PathBuf,
    },
    /// Print (or with --run, execute) the ffmpeg command for one file
    Transcode(TranscodeArgs),
    /// Run the job scheduler and HTTP server until interrupted
    Serve {
        /// Path to the configuration file
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,

        /// Skip the ffmpeg/ffprobe startup checks. For testing only.
        #[arg(long, default_value = "false")]
        skip_checks: bool,
    },
}

#[derive(Args, Debug)]
struct TranscodeArgs {
    /// Preset name from --presets-file
    #[arg(long, requires = "presets_file", conflicts_with = "to")]
    preset: Option<String>,

    /// Preset collection document
    #[arg(long)]
    presets_file: Option<PathBuf>,

    /// Target video codec (h264, hevc, vp9, av1)
    #[arg(long)]
    to: Option<Codec>,

    /// 360p, 480p, 720p, 1080p, 2160p or WxH
    #[arg(long)]
    scale: Option<Scale>,

    /// Audio codec (copy, aac, flac, opus, libopus)
    #[arg(long)]
    audio: Option<AudioCodec>,

    #[arg(long, conflicts_with = "bitrate")]
    crf: Option<u8>,

    /// Video bitrate such as 4M or 2500k
    #[arg(long)]
    bitrate: Option<String>,

    #[arg(long)]
    audio_bitrate: Option<String>,

    #[arg(long)]
    flac_compression: Option<u8>,

    /// Never use a hardware encoder
    #[arg(long)]
    force_software: bool,

    /// Do not retry in software after a hardware failure
    #[arg(long)]
    no_fallback: bool,

    /// Capabilities document to use instead of detecting
    #[arg(long)]
    capabilities: Option<PathBuf>,

    /// Execute the command instead of printing it
    #[arg(long)]
    run: bool,

    input: PathBuf,
    output: PathBuf,
}

impl TranscodeArgs {
    fn overrides(&self) -> EncodeOptions {
        EncodeOptions {
            codec: self.to,
            scale: self.scale,
            audio_codec: self.audio,
            audio_bitrate: self.audio_bitrate.clone(),
            flac_compression: self.flac_compression,
            crf: self.crf,
            bitrate: self.bitrate.clone(),
            allow_fallback: self.no_fallback.then_some(false),
            force_software: self.force_software.then_some(true),
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result = match cli.command {
        Command::Detect { output } => run_detect(&output).await,
        Command::Presets { file } => run_presets(&file),
        Command::Transcode(args) => run_transcode(args).await,
        Command::Serve {
            config,
            skip_checks,
        } => run_serve(&config, skip_checks).await,
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "hwtranscoder=debug"
    } else {
        "hwtranscoder=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

type CliResult = Result<ExitCode, Box<dyn std::error::Error>>;

async fn run_detect(output: &Path) -> CliResult {
    let config = Config::from_env();
    let capabilities = detect_capabilities(&config).await;
    capabilities.save(output)?;

    match capabilities.hwaccel {
        Some(method) => {
            println!("Hardware acceleration: {}", method);
            for (codec, encoder) in &capabilities.encoders {
                println!("  {:<5} {}", codec.as_str(), encoder);
            }
        }
        None => println!("No hardware acceleration found; software encoders only"),
    }
    println!("Capabilities written to {}", output.display());
    Ok(ExitCode::SUCCESS)
}

fn run_presets(file: &Path) -> CliResult {
    let collection = PresetCollection::load(file)?;
    if collection.is_empty() {
        println!("No presets in {}", file.display());
        return Ok(ExitCode::SUCCESS);
    }
    for (name, options) in &collection.presets {
        println!("{}: {}", name, serde_json::to_string(options)?);
    }
    Ok(ExitCode::SUCCESS)
}

async fn run_transcode(args: TranscodeArgs) -> CliResult {
    let config = Config::from_env();
    let presets = match &args.presets_file {
        Some(path) => PresetCollection::load(path)?,
        None => PresetCollection::default(),
    };
    let capabilities = match &args.capabilities {
        Some(path) => effective_capabilities(&config, Capabilities::load(path)?),
        None => detect_capabilities(&config).await,
    };
    let overrides = args.overrides();

    if !args.run {
        let spec = preset::resolve(
            args.preset.as_deref(),
            Some(&presets),
            &overrides,
            &args.input,
            OutputTarget::Path(&args.output),
        )?;
        let command = build_with_program(&spec, &capabilities, &config.ffmpeg.ffmpeg_path)?;
        println!("{}", command.display());
        return Ok(ExitCode::SUCCESS);
    }

    let options = SchedulerOptions {
        max_concurrent_jobs: 1,
        ffmpeg_path: config.ffmpeg.ffmpeg_path.clone(),
        ffprobe_path: Some(config.ffmpeg.ffprobe_path.clone()),
        output_dir: config.jobs.output_dir.clone(),
        log_capacity: config.jobs.log_capacity,
        event_capacity: config.jobs.event_capacity,
        kill_grace: Duration::from_secs(config.jobs.kill_grace_secs),
    };
    let scheduler = Scheduler::new(
        options,
        SharedCapabilities::new(capabilities),
        presets,
        Arc::new(MemoryJobStore::new()),
    )?;

    let mut events = scheduler.subscribe();
    let printer = tokio::spawn(async move {
        let mut last_percent = None;
        while let Ok(event) = events.recv().await {
            match event {
                JobEvent::Progress {
                    progress: Some(p), ..
                } => {
                    let percent = (p * 100.0).floor() as u32;
                    if last_percent != Some(percent) {
                        last_percent = Some(percent);
                        eprintln!("progress: {}%", percent);
                    }
                }
                JobEvent::Updated { job } => {
                    if let Some(line) = job.job.logs.back() {
                        info!(status = %job.job.status, "{}", line);
                    }
                }
                _ => {}
            }
        }
    });

    let id = scheduler.submit(SubmitRequest {
        input: args.input.clone(),
        output: Some(args.output.clone()),
        preset: args.preset.clone().map(PresetRef::Named),
        overrides,
    })?;
    let _dispatcher = scheduler.start();

    let finished = tokio::select! {
        view = scheduler.wait_for_terminal(&id) => view?,
        _ = tokio::signal::ctrl_c() => {
            scheduler.cancel(&id)?;
            scheduler.wait_for_terminal(&id).await?
        }
    };
    printer.abort();

    let job = finished.job;
    match job.status {
        JobStatus::Completed => {
            let used = if job.used_hardware == Some(true) {
                "hardware"
            } else {
                "software"
            };
            let size = job
                .output_size
                .map(|bytes| format!(" ({})", format_file_size(bytes)))
                .unwrap_or_default();
            println!(
                "Completed with {} encoding: {}{}",
                used,
                job.output_path
                    .as_deref()
                    .unwrap_or(args.output.as_path())
                    .display(),
                size
            );
            Ok(ExitCode::SUCCESS)
        }
        status => {
            eprintln!(
                "Job {}: {}",
                status,
                job.error_message.as_deref().unwrap_or("no error recorded")
            );
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn run_serve(config_path: &Path, skip_checks: bool) -> CliResult {
    let config = if config_path.exists() {
        Config::load(config_path)?
    } else {
        warn!(path = %config_path.display(), "config file not found, using defaults");
        Config::from_env()
    };

    let daemon = if skip_checks {
        warn!("skipping startup checks (--skip-checks enabled)");
        Daemon::new_without_checks(config).await?
    } else {
        Daemon::with_config(config).await?
    };

    info!(
        max_concurrent_jobs = daemon.concurrency_plan.max_concurrent_jobs,
        total_cores = daemon.concurrency_plan.total_cores,
        bind = %daemon.config.server.bind,
        "daemon ready"
    );
    daemon.run_with_server().await?;
    Ok(ExitCode::SUCCESS)
}
