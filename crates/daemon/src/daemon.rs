//! Daemon startup and main loop
//!
//! Builds the scheduler from configuration and runs it alongside the HTTP
//! server and the system metrics updater until interrupted.

use crate::capabilities::{detect, Capabilities, CapabilitiesError, SharedCapabilities};
use crate::concurrency::{derive_plan, ConcurrencyPlan};
use crate::config::{Config, ConfigError, HardwareMode};
use crate::metrics::{collect_system_metrics, new_shared_system_metrics, SharedSystemMetrics};
use crate::preset::{PresetCollection, PresetError};
use crate::scheduler::{effective_capabilities, Scheduler, SchedulerError, SchedulerOptions};
use crate::server::{run_server, AppState, ServerError};
use crate::startup::{run_startup_checks, StartupError};
use crate::store::{JobStore, JsonDirJobStore, MemoryJobStore, StoreError};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Interval between system metrics refreshes.
const METRICS_INTERVAL: Duration = Duration::from_millis(500);

/// Error type for daemon operations
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    #[error("Capabilities error: {0}")]
    Capabilities(#[from] CapabilitiesError),

    #[error("Preset error: {0}")]
    Presets(#[from] PresetError),

    #[error("Job store error: {0}")]
    Store(#[from] StoreError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("Server error: {0}")]
    Server(#[from] ServerError),
}

/// Daemon state containing all runtime components
pub struct Daemon {
    /// Configuration loaded from file and environment
    pub config: Config,
    /// Derived concurrency plan
    pub concurrency_plan: ConcurrencyPlan,
    pub scheduler: Scheduler,
    /// Host metrics refreshed in the background
    pub system: SharedSystemMetrics,
}

impl Daemon {
    /// Initialize the daemon with configuration from file
    ///
    /// 1. Load config from file and apply environment overrides
    /// 2. Run startup checks (ffmpeg, ffprobe)
    /// 3. Load or detect capabilities, load presets, open the job store
    pub async fn new<P: AsRef<Path>>(config_path: P) -> Result<Self, DaemonError> {
        let config = Config::load(config_path)?;
        Self::with_config(config).await
    }

    /// Initialize the daemon with an existing configuration
    pub async fn with_config(config: Config) -> Result<Self, DaemonError> {
        run_startup_checks(&config)?;
        Self::new_without_checks(config).await
    }

    /// Initialize the daemon without running startup checks
    ///
    /// Useful for testing when ffmpeg and ffprobe are not available.
    pub async fn new_without_checks(config: Config) -> Result<Self, DaemonError> {
        let concurrency_plan = derive_plan(&config);
        let capabilities = load_capabilities(&config).await?;
        let presets = load_presets(&config)?;
        let store = open_store(&config)?;

        info!(
            hwaccel = ?capabilities.hwaccel,
            presets = presets.presets.len(),
            max_concurrent_jobs = concurrency_plan.max_concurrent_jobs,
            "daemon initialized"
        );

        let scheduler = Scheduler::new(
            SchedulerOptions::from_config(&config, &concurrency_plan),
            SharedCapabilities::new(capabilities),
            presets,
            store,
        )?;

        Ok(Self {
            config,
            concurrency_plan,
            scheduler,
            system: new_shared_system_metrics(),
        })
    }

    /// Start the HTTP server as a background task.
    pub fn start_server(&self) -> JoinHandle<()> {
        let state = AppState {
            scheduler: self.scheduler.clone(),
            system: self.system.clone(),
        };
        let bind = self.config.server.bind.clone();
        let scheduler = self.scheduler.clone();
        tokio::spawn(async move {
            let shutdown = async move { scheduler.wait_shutdown().await };
            if let Err(e) = run_server(&bind, state, shutdown).await {
                error!(error = %e, "http server stopped");
            }
        })
    }

    /// Start the metrics update task
    ///
    /// Periodically updates system metrics in the shared state.
    pub fn start_metrics_updater(&self) -> JoinHandle<()> {
        let system = self.system.clone();
        tokio::spawn(async move {
            loop {
                let metrics = tokio::task::spawn_blocking(collect_system_metrics)
                    .await
                    .unwrap_or_default();
                *system.write().await = metrics;
                tokio::time::sleep(METRICS_INTERVAL).await;
            }
        })
    }

    /// Run the daemon with all background tasks until Ctrl-C.
    pub async fn run_with_server(&self) -> Result<(), DaemonError> {
        let _dispatcher = self.scheduler.start();
        let updater = self.start_metrics_updater();
        let server = self.config.server.enabled.then(|| self.start_server());

        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for shutdown signal");
        }
        info!("shutdown requested");

        self.scheduler.shutdown();
        self.scheduler.wait_idle().await;
        updater.abort();
        if let Some(server) = server {
            let _ = server.await;
        }
        Ok(())
    }
}

/// Capabilities from the configured document, or detected on a blocking thread.
pub async fn load_capabilities(config: &Config) -> Result<Capabilities, DaemonError> {
    if let Some(path) = &config.files.capabilities {
        if path.exists() {
            let loaded = Capabilities::load(path)?;
            info!(path = %path.display(), "loaded capabilities");
            return Ok(effective_capabilities(config, loaded));
        }
    }

    let detected = detect_capabilities(config).await;

    if let Some(path) = &config.files.capabilities {
        match detected.save(path) {
            Ok(()) => info!(path = %path.display(), "saved detected capabilities"),
            Err(e) => warn!(path = %path.display(), error = %e, "failed to save capabilities"),
        }
    }
    Ok(detected)
}

/// Probe the host on a blocking thread. Hardware disabled in configuration
/// yields software-only capabilities without running ffmpeg.
pub async fn detect_capabilities(config: &Config) -> Capabilities {
    if config.ffmpeg.hardware == HardwareMode::Disabled {
        return Capabilities::software_only();
    }
    let ffmpeg = config.ffmpeg.ffmpeg_path.clone();
    let device = config.ffmpeg.device.clone();
    tokio::task::spawn_blocking(move || detect(&ffmpeg, &device))
        .await
        .unwrap_or_else(|e| {
            warn!(error = %e, "capability detection panicked, using software only");
            Capabilities::software_only()
        })
}

/// The configured preset collection, or an empty one.
pub fn load_presets(config: &Config) -> Result<PresetCollection, DaemonError> {
    match &config.files.presets {
        Some(path) => Ok(PresetCollection::load(path)?),
        None => Ok(PresetCollection::default()),
    }
}

/// A JSON directory store when `state_dir` is set, otherwise in memory.
pub fn open_store(config: &Config) -> Result<Arc<dyn JobStore>, DaemonError> {
    match &config.jobs.state_dir {
        Some(dir) => Ok(Arc::new(JsonDirJobStore::open(dir)?)),
        None => Ok(Arc::new(MemoryJobStore::new())),
    }
}
