//! Job scheduler: admission, dispatch, supervision and fallback.
//!
//! Submitted jobs wait in a FIFO queue. A single dispatcher task acquires a
//! semaphore permit, pops the oldest pending job and hands it to a worker
//! task that owns the permit until the job reaches a terminal state, so at
//! most `max_concurrent_jobs` jobs are ever `processing`.
//!
//! All job records live behind one mutex that is never held across an
//! `.await`. Every status transition is published as a [`JobEvent::Updated`]
//! carrying the full job projection and written to the [`JobStore`] once the
//! mutex is released.
//!
//! A hardware attempt that exits non-zero is retried once on the software
//! path when the encode spec allows fallback. A cancel request recorded before the
//! worker records its outcome always ends the job as `cancelled`.

use crate::capabilities::{Capabilities, SharedCapabilities};
use crate::config::{Config, HardwareMode};
use crate::concurrency::ConcurrencyPlan;
use crate::encode::command::{build_with_program, EncodeCommand};
use crate::encode::supervisor::{
    OutputStream, ProcessState, ProcessSupervisor, ProgressEvent, SupervisorError, SupervisorOptions,
};
use crate::jobs::{Job, JobStatus};
use crate::metrics::MetricsSnapshot;
use crate::preset::{self, EncodeOptions, EncodeSpec, OutputTarget, PresetCollection, SpecError};
use crate::probe::probe_duration;
use crate::store::{JobStore, StoreError};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, watch, Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Stderr lines quoted in a failed job's error message.
const FAILURE_TAIL_LINES: usize = 10;

/// Error message recorded for jobs found running after a restart.
pub const INTERRUPTED_MESSAGE: &str = "interrupted";

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Spec(#[from] SpecError),

    #[error("job {0} not found")]
    NotFound(String),

    #[error("job {id} is still {status}")]
    NotTerminal { id: String, status: JobStatus },

    #[error("scheduler is shut down")]
    ShutDown,

    #[error("job store error: {0}")]
    Store(#[from] StoreError),
}

/// Runtime settings for the scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// Worker pool size. Values below 1 are treated as 1.
    pub max_concurrent_jobs: usize,
    pub ffmpeg_path: String,
    /// Used to learn source durations up front; banner parsing is the fallback.
    pub ffprobe_path: Option<String>,
    /// Where outputs go when a submission names no output path.
    pub output_dir: PathBuf,
    pub log_capacity: usize,
    pub event_capacity: usize,
    pub kill_grace: Duration,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 1,
            ffmpeg_path: "ffmpeg".to_string(),
            ffprobe_path: None,
            output_dir: PathBuf::from("."),
            log_capacity: 1000,
            event_capacity: 256,
            kill_grace: Duration::from_secs(5),
        }
    }
}

impl SchedulerOptions {
    pub fn from_config(cfg: &Config, plan: &ConcurrencyPlan) -> Self {
        Self {
            max_concurrent_jobs: plan.max_concurrent_jobs as usize,
            ffmpeg_path: cfg.ffmpeg.ffmpeg_path.clone(),
            ffprobe_path: Some(cfg.ffmpeg.ffprobe_path.clone()),
            output_dir: cfg.jobs.output_dir.clone(),
            log_capacity: cfg.jobs.log_capacity,
            event_capacity: cfg.jobs.event_capacity,
            kill_grace: Duration::from_secs(cfg.jobs.kill_grace_secs),
        }
    }
}

/// Whether capabilities from detection may be used, per configuration.
pub fn effective_capabilities(cfg: &Config, detected: Capabilities) -> Capabilities {
    match cfg.ffmpeg.hardware {
        HardwareMode::Auto => detected,
        HardwareMode::Disabled => Capabilities {
            hwaccel: None,
            device: None,
            encoders: Default::default(),
            ..detected
        },
    }
}

/// A preset given by name or inline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PresetRef {
    Named(String),
    Inline(EncodeOptions),
}

/// Everything needed to create a job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub input: PathBuf,
    /// A file path, or an existing directory to place `<stem> (<label>).<ext>` in.
    #[serde(default)]
    pub output: Option<PathBuf>,
    #[serde(default)]
    pub preset: Option<PresetRef>,
    #[serde(default)]
    pub overrides: EncodeOptions,
}

/// A job as seen by callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobView {
    #[serde(flatten)]
    pub job: Job,
    /// 1-based rank among pending jobs.
    pub queue_position: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    /// A job changed status or recorded a new attempt.
    Updated { job: JobView },
    /// One line of encoder output.
    Progress {
        job_id: String,
        line: String,
        progress: Option<f64>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "status", rename_all = "snake_case")]
pub enum CancelOutcome {
    /// The job was pending and is now cancelled.
    Cancelled,
    /// The job is processing; it becomes cancelled once its process stops.
    Requested,
    /// Nothing to cancel.
    AlreadyFinished(JobStatus),
}

struct Entry {
    job: Job,
    cancel_requested: bool,
    cancel_tx: Option<watch::Sender<bool>>,
    /// Bumped for every copy handed to the store.
    revision: u64,
}

impl Entry {
    fn new(job: Job) -> Self {
        Self {
            job,
            cancel_requested: false,
            cancel_tx: None,
            revision: 0,
        }
    }

    fn snapshot(&mut self) -> StoreWrite {
        self.revision += 1;
        StoreWrite {
            revision: self.revision,
            job: self.job.clone(),
        }
    }
}

/// A job record copied under the state lock, written after it is released.
struct StoreWrite {
    revision: u64,
    job: Job,
}

#[derive(Default)]
struct State {
    jobs: HashMap<String, Entry>,
    /// Job ids in creation order.
    order: Vec<String>,
    /// Pending job ids, oldest first.
    queue: VecDeque<String>,
    shutdown: bool,
}

impl State {
    fn queue_position(&self, id: &str) -> Option<usize> {
        self.queue.iter().position(|queued| queued == id).map(|i| i + 1)
    }

    fn view(&self, id: &str) -> Option<JobView> {
        self.jobs.get(id).map(|entry| JobView {
            job: entry.job.clone(),
            queue_position: self.queue_position(id),
        })
    }

    fn running(&self) -> usize {
        self.jobs
            .values()
            .filter(|entry| entry.job.status == JobStatus::Processing)
            .count()
    }
}

enum Outcome {
    Completed(Option<u64>),
    Failed(String),
    Cancelled,
}

enum Next {
    Job(Dispatch),
    Empty,
    ShutDown,
}

struct Dispatch {
    id: String,
    spec: EncodeSpec,
    cancel_rx: watch::Receiver<bool>,
}

struct Inner {
    options: SchedulerOptions,
    capabilities: SharedCapabilities,
    presets: RwLock<Arc<PresetCollection>>,
    store: Arc<dyn JobStore>,
    state: Mutex<State>,
    /// Last revision written per job. Held for the duration of a store write.
    written: Mutex<HashMap<String, u64>>,
    permits: Arc<Semaphore>,
    wake: Notify,
    idle: Notify,
    events: broadcast::Sender<JobEvent>,
    fallback_retries: AtomicU64,
    started: AtomicBool,
}

/// Handle to the scheduler. Cheap to clone.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// Creates the scheduler and recovers stored jobs: pending jobs are
    /// queued again in creation order, jobs left `processing` by a previous
    /// run are failed as interrupted.
    ///
    /// Nothing runs until [`start`](Self::start) is called.
    pub fn new(
        options: SchedulerOptions,
        capabilities: SharedCapabilities,
        presets: PresetCollection,
        store: Arc<dyn JobStore>,
    ) -> Result<Self, SchedulerError> {
        let permits = options.max_concurrent_jobs.max(1);
        let (events, _) = broadcast::channel(options.event_capacity.max(1));

        let mut state = State::default();
        for mut job in store.list()? {
            match job.status {
                JobStatus::Pending => state.queue.push_back(job.id.clone()),
                JobStatus::Processing => {
                    warn!(job_id = %job.id, "job was running at shutdown, marking failed");
                    job.fail(INTERRUPTED_MESSAGE);
                    store.update(&job)?;
                }
                _ => {}
            }
            state.order.push(job.id.clone());
            state.jobs.insert(job.id.clone(), Entry::new(job));
        }
        if !state.queue.is_empty() {
            info!(pending = state.queue.len(), "recovered pending jobs");
        }

        Ok(Self {
            inner: Arc::new(Inner {
                options,
                capabilities,
                presets: RwLock::new(Arc::new(presets)),
                store,
                state: Mutex::new(state),
                written: Mutex::new(HashMap::new()),
                permits: Arc::new(Semaphore::new(permits)),
                wake: Notify::new(),
                idle: Notify::new(),
                events,
                fallback_retries: AtomicU64::new(0),
                started: AtomicBool::new(false),
            }),
        })
    }

    /// Spawns the dispatcher. Calling it again returns `None`.
    pub fn start(&self) -> Option<JoinHandle<()>> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return None;
        }
        info!(
            max_concurrent_jobs = self.inner.options.max_concurrent_jobs.max(1),
            "scheduler started"
        );
        Some(tokio::spawn(dispatch(Arc::clone(&self.inner))))
    }

    /// Resolve, validate and enqueue a job. Validation errors are returned
    /// here and no job is created.
    pub fn submit(&self, request: SubmitRequest) -> Result<String, SchedulerError> {
        let spec = self.resolve(&request)?;
        // Surface builder-level rejections before the job exists.
        build_with_program(&spec, &self.capabilities(), &self.inner.options.ffmpeg_path)?;

        let preset_name = match &request.preset {
            Some(PresetRef::Named(name)) => Some(name.clone()),
            _ => None,
        };
        let job = Job::new(spec, preset_name);
        let id = job.id.clone();

        {
            let mut state = self.inner.lock();
            if state.shutdown {
                return Err(SchedulerError::ShutDown);
            }
            self.inner.store.create(&job)?;
            state.order.push(id.clone());
            state.queue.push_back(id.clone());
            state.jobs.insert(id.clone(), Entry::new(job));
            self.inner.emit_updated(&state, &id);
        }

        info!(job_id = %id, input = %request.input.display(), "job queued");
        self.inner.wake.notify_one();
        Ok(id)
    }

    fn resolve(&self, request: &SubmitRequest) -> Result<EncodeSpec, SpecError> {
        let output_dir = &self.inner.options.output_dir;
        let target = match &request.output {
            Some(path) if path.is_dir() => OutputTarget::Directory(path),
            Some(path) => OutputTarget::Path(path),
            None => OutputTarget::Directory(output_dir),
        };

        match &request.preset {
            Some(PresetRef::Named(name)) => {
                let presets = self.presets();
                preset::resolve(
                    Some(name.as_str()),
                    Some(presets.as_ref()),
                    &request.overrides,
                    &request.input,
                    target,
                )
            }
            Some(PresetRef::Inline(options)) => {
                let merged = request.overrides.merged_over(options);
                preset::resolve_options(None, &merged, &request.input, target)
            }
            None => preset::resolve_options(None, &request.overrides, &request.input, target),
        }
    }

    pub fn status(&self, id: &str) -> Result<JobView, SchedulerError> {
        self.inner
            .lock()
            .view(id)
            .ok_or_else(|| SchedulerError::NotFound(id.to_string()))
    }

    /// All known jobs in creation order.
    pub fn list(&self) -> Vec<JobView> {
        let state = self.inner.lock();
        state.order.iter().filter_map(|id| state.view(id)).collect()
    }

    /// 1-based rank among pending jobs; `None` once the job left the queue.
    pub fn queue_position(&self, id: &str) -> Result<Option<usize>, SchedulerError> {
        let state = self.inner.lock();
        if !state.jobs.contains_key(id) {
            return Err(SchedulerError::NotFound(id.to_string()));
        }
        Ok(state.queue_position(id))
    }

    /// Record cancel intent. Returns without waiting for the process to stop.
    pub fn cancel(&self, id: &str) -> Result<CancelOutcome, SchedulerError> {
        let mut state = self.inner.lock();
        let entry = state
            .jobs
            .get_mut(id)
            .ok_or_else(|| SchedulerError::NotFound(id.to_string()))?;

        let mut write = None;
        let outcome = match entry.job.status {
            JobStatus::Pending => {
                entry.job.cancel();
                write = Some(entry.snapshot());
                state.queue.retain(|queued| queued != id);
                self.inner.emit_updated(&state, id);
                CancelOutcome::Cancelled
            }
            JobStatus::Processing => {
                entry.cancel_requested = true;
                if let Some(tx) = &entry.cancel_tx {
                    let _ = tx.send(true);
                }
                CancelOutcome::Requested
            }
            status => CancelOutcome::AlreadyFinished(status),
        };
        drop(state);
        if let Some(write) = write {
            self.inner.persist(write);
        }

        info!(job_id = %id, ?outcome, "cancel requested");
        if outcome == CancelOutcome::Cancelled {
            self.inner.idle.notify_waiters();
        }
        Ok(outcome)
    }

    /// Forget a finished job, here and in the store.
    pub fn remove(&self, id: &str) -> Result<Job, SchedulerError> {
        let mut state = self.inner.lock();
        let status = state
            .jobs
            .get(id)
            .map(|entry| entry.job.status)
            .ok_or_else(|| SchedulerError::NotFound(id.to_string()))?;
        if !status.is_terminal() {
            return Err(SchedulerError::NotTerminal {
                id: id.to_string(),
                status,
            });
        }
        self.inner.delete(id)?;
        state.order.retain(|known| known != id);
        let entry = state
            .jobs
            .remove(id)
            .ok_or_else(|| SchedulerError::NotFound(id.to_string()))?;
        Ok(entry.job)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.inner.events.subscribe()
    }

    pub fn capabilities(&self) -> Arc<Capabilities> {
        self.inner.capabilities.snapshot()
    }

    /// Swap in new capabilities. Running jobs keep the snapshot they started with.
    pub fn replace_capabilities(&self, capabilities: Capabilities) -> Arc<Capabilities> {
        info!(hwaccel = ?capabilities.hwaccel, "capabilities replaced");
        self.inner.capabilities.replace(capabilities)
    }

    pub fn presets(&self) -> Arc<PresetCollection> {
        Arc::clone(&self.inner.presets.read().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn options(&self) -> &SchedulerOptions {
        &self.inner.options
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        let state = self.inner.lock();
        let mut snapshot = MetricsSnapshot::from_jobs(
            state
                .order
                .iter()
                .filter_map(|id| state.jobs.get(id).map(|entry| (&entry.job, state.queue_position(id)))),
            self.inner.fallback_retries.load(Ordering::Relaxed),
        );
        drop(state);
        snapshot.hwaccel = self.capabilities().hwaccel.map(|h| h.to_string());
        snapshot
    }

    /// Stop admitting work and cancel running jobs. Pending jobs stay pending
    /// in the store and are picked up again on the next start.
    pub fn shutdown(&self) {
        let mut state = self.inner.lock();
        if state.shutdown {
            return;
        }
        state.shutdown = true;
        for entry in state.jobs.values_mut() {
            if entry.job.status == JobStatus::Processing {
                entry.cancel_requested = true;
                if let Some(tx) = &entry.cancel_tx {
                    let _ = tx.send(true);
                }
            }
        }
        drop(state);

        info!("scheduler shutting down");
        self.inner.permits.close();
        self.inner.wake.notify_one();
        self.inner.idle.notify_waiters();
    }

    /// Resolves once no job is processing and nothing more will be dispatched.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let state = self.inner.lock();
                if state.running() == 0 && (state.queue.is_empty() || state.shutdown) {
                    return;
                }
            }
            notified.await;
        }
    }

    /// Resolves once [`shutdown`](Self::shutdown) has been called.
    pub async fn wait_shutdown(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.lock().shutdown {
                return;
            }
            notified.await;
        }
    }

    /// Resolves with the job once it reaches a terminal state.
    pub async fn wait_for_terminal(&self, id: &str) -> Result<JobView, SchedulerError> {
        let mut events = self.subscribe();
        loop {
            let view = self.status(id)?;
            if view.job.is_terminal() {
                return Ok(view);
            }
            loop {
                match events.recv().await {
                    Ok(JobEvent::Updated { job }) if job.job.id == id => break,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => break,
                    Err(broadcast::error::RecvError::Closed) => return Err(SchedulerError::ShutDown),
                }
            }
        }
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Writes happen outside the state lock, so a copy older than the last
    /// one written for the same job is dropped.
    fn persist(&self, write: StoreWrite) {
        let mut written = self.written.lock().unwrap_or_else(|e| e.into_inner());
        let last = written.entry(write.job.id.clone()).or_insert(0);
        if write.revision <= *last {
            return;
        }
        *last = write.revision;
        if let Err(e) = self.store.update(&write.job) {
            warn!(job_id = %write.job.id, error = %e, "failed to persist job");
        }
    }

    /// Deletes the stored record and drops any write still in flight for it.
    fn delete(&self, id: &str) -> Result<(), StoreError> {
        let mut written = self.written.lock().unwrap_or_else(|e| e.into_inner());
        written.insert(id.to_string(), u64::MAX);
        self.store.delete(id).map(|_| ())
    }

    fn emit_updated(&self, state: &State, id: &str) {
        if let Some(job) = state.view(id) {
            // No subscribers is fine.
            let _ = self.events.send(JobEvent::Updated { job });
        }
    }

    /// Pop the oldest pending job and mark it processing.
    fn take_next(&self) -> Next {
        let mut state = self.lock();
        if state.shutdown {
            return Next::ShutDown;
        }
        while let Some(id) = state.queue.pop_front() {
            let Some(entry) = state.jobs.get_mut(&id) else {
                continue;
            };
            if !entry.job.start() {
                continue;
            }
            let (cancel_tx, cancel_rx) = watch::channel(false);
            entry.cancel_tx = Some(cancel_tx);
            entry.cancel_requested = false;
            let spec = entry.job.spec.clone();
            let write = entry.snapshot();
            self.emit_updated(&state, &id);
            drop(state);
            self.persist(write);
            return Next::Job(Dispatch { id, spec, cancel_rx });
        }
        Next::Empty
    }

    async fn run_job(&self, dispatch: Dispatch) {
        let Dispatch {
            id,
            spec,
            mut cancel_rx,
        } = dispatch;
        info!(job_id = %id, input = %spec.input.display(), "job started");

        let duration_hint = match &self.options.ffprobe_path {
            Some(ffprobe) => match probe_duration(ffprobe, &spec.input).await {
                Ok(duration) => duration,
                Err(e) => {
                    debug!(job_id = %id, error = %e, "duration probe failed");
                    None
                }
            },
            None => None,
        };

        if let Some(dir) = spec.output.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            if let Err(e) = tokio::fs::create_dir_all(dir).await {
                let message = format!("failed to create output directory {}: {}", dir.display(), e);
                self.finish(&id, Outcome::Failed(message));
                return;
            }
        }

        let capabilities = self.capabilities.snapshot();
        let mut attempt_spec = spec;
        let mut retried = false;

        let outcome = loop {
            let command = match build_with_program(&attempt_spec, &capabilities, &self.options.ffmpeg_path) {
                Ok(command) => command,
                Err(e) => break Outcome::Failed(format!("failed to build command: {}", e)),
            };
            if !self.begin_attempt(&id, &command) {
                break Outcome::Cancelled;
            }

            let failure = match self.run_attempt(&id, command.argv.clone(), duration_hint, &mut cancel_rx).await {
                Ok((state, _)) if state.success() => {
                    let size = tokio::fs::metadata(&attempt_spec.output).await.ok().map(|m| m.len());
                    break Outcome::Completed(size);
                }
                Ok((ProcessState::Terminated, _)) => break Outcome::Cancelled,
                Ok((state, tail)) => failure_message(state, &tail),
                Err(e) => e.to_string(),
            };

            if self.cancel_requested(&id) {
                break Outcome::Cancelled;
            }

            if command.used_hardware && attempt_spec.allow_fallback && !attempt_spec.force_software && !retried {
                retried = true;
                self.fallback_retries.fetch_add(1, Ordering::Relaxed);
                warn!(job_id = %id, encoder = %command.encoder, reason = %first_line(&failure), "hardware encode failed, retrying in software");
                self.note_fallback(&id, &command.encoder);
                attempt_spec = attempt_spec.forcing_software();
                continue;
            }

            if retried {
                self.log_line(&id, "software fallback failed");
            }
            break Outcome::Failed(failure);
        };

        self.finish(&id, outcome);
    }

    /// Record the command about to run. Returns `false` if the job was
    /// cancelled in the meantime.
    fn begin_attempt(&self, id: &str, command: &EncodeCommand) -> bool {
        let mut state = self.lock();
        let Some(entry) = state.jobs.get_mut(id) else {
            return false;
        };
        if entry.cancel_requested {
            return false;
        }
        entry
            .job
            .record_command(command.argv.clone(), command.used_hardware, self.options.log_capacity);
        let write = entry.snapshot();
        self.emit_updated(&state, id);
        drop(state);
        self.persist(write);
        debug!(job_id = %id, command = %command.display(), "running encoder");
        true
    }

    async fn run_attempt(
        &self,
        id: &str,
        argv: Vec<String>,
        duration_hint: Option<f64>,
        cancel_rx: &mut watch::Receiver<bool>,
    ) -> Result<(ProcessState, Vec<String>), SupervisorError> {
        let mut supervisor = ProcessSupervisor::new(
            argv,
            SupervisorOptions {
                event_capacity: self.options.event_capacity.max(1),
                tail_lines: FAILURE_TAIL_LINES,
                kill_grace: self.options.kill_grace,
                duration_hint,
            },
        );
        let mut stream = supervisor.start()?;
        let supervisor = supervisor;

        let finished = supervisor.wait(None);
        tokio::pin!(finished);
        let mut stream_open = true;
        let mut cancel_seen = false;

        let state = loop {
            tokio::select! {
                result = &mut finished => break result?.unwrap_or(ProcessState::Finished(-1)),
                event = stream.next(), if stream_open => match event {
                    Some(event) => self.record_event(id, event),
                    None => stream_open = false,
                },
                changed = cancel_rx.changed(), if !cancel_seen => {
                    cancel_seen = true;
                    if changed.is_ok() && *cancel_rx.borrow() {
                        debug!(job_id = %id, "terminating encoder");
                        supervisor.terminate();
                    }
                }
            }
        };

        // Readers are drained before the final state is published.
        while let Some(event) = stream.try_next() {
            self.record_event(id, event);
        }

        Ok((state, supervisor.tail()))
    }

    /// Reported progress is the job's, so it stays monotonic across attempts.
    fn record_event(&self, id: &str, event: ProgressEvent) {
        let mut reported = event.progress;
        let mut write = None;
        let mut state = self.lock();
        if let Some(entry) = state.jobs.get_mut(id) {
            if entry.job.status == JobStatus::Processing {
                if event.stream == OutputStream::Stderr {
                    entry.job.push_log(event.line.clone(), self.options.log_capacity);
                }
                if let Some(progress) = event.progress {
                    let before = (entry.job.progress * 100.0).floor();
                    if entry.job.record_progress(progress, event.elapsed, event.duration)
                        && (entry.job.progress * 100.0).floor() > before
                    {
                        write = Some(entry.snapshot());
                    }
                    reported = Some(entry.job.progress);
                }
            }
        }
        drop(state);
        if let Some(write) = write {
            self.persist(write);
        }

        let _ = self.events.send(JobEvent::Progress {
            job_id: id.to_string(),
            line: event.line,
            progress: reported,
        });
    }

    fn cancel_requested(&self, id: &str) -> bool {
        self.lock()
            .jobs
            .get(id)
            .map_or(false, |entry| entry.cancel_requested)
    }

    fn log_line(&self, id: &str, line: &str) {
        let mut state = self.lock();
        if let Some(entry) = state.jobs.get_mut(id) {
            entry.job.push_log(line, self.options.log_capacity);
        }
    }

    fn note_fallback(&self, id: &str, encoder: &str) {
        let mut state = self.lock();
        let Some(entry) = state.jobs.get_mut(id) else {
            return;
        };
        entry.job.fallback_attempted = true;
        entry.job.push_log(
            format!("hardware encoder {} failed, falling back to software", encoder),
            self.options.log_capacity,
        );
        entry.job.touch();
        let write = entry.snapshot();
        self.emit_updated(&state, id);
        drop(state);
        self.persist(write);
    }

    /// Record the terminal state. Cancel intent wins over any other outcome.
    fn finish(&self, id: &str, outcome: Outcome) {
        let mut state = self.lock();
        let Some(entry) = state.jobs.get_mut(id) else {
            return;
        };
        let outcome = if entry.cancel_requested {
            Outcome::Cancelled
        } else {
            outcome
        };
        let changed = match &outcome {
            Outcome::Completed(size) => entry.job.complete(*size),
            Outcome::Failed(message) => entry.job.fail(message),
            Outcome::Cancelled => entry.job.cancel(),
        };
        entry.cancel_tx = None;
        let status = entry.job.status;
        let write = changed.then(|| entry.snapshot());
        if changed {
            self.emit_updated(&state, id);
        }
        drop(state);
        if let Some(write) = write {
            self.persist(write);
        }

        match outcome {
            Outcome::Failed(message) => warn!(job_id = %id, error = %first_line(&message), "job failed"),
            _ => info!(job_id = %id, %status, "job finished"),
        }
    }
}

async fn dispatch(inner: Arc<Inner>) {
    loop {
        let permit = match Arc::clone(&inner.permits).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };

        let next = loop {
            let notified = inner.wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            match inner.take_next() {
                Next::Job(next) => break Some(next),
                Next::ShutDown => break None,
                Next::Empty => notified.await,
            }
        };
        let Some(next) = next else {
            break;
        };

        let worker = Arc::clone(&inner);
        tokio::spawn(async move {
            worker.run_job(next).await;
            drop(permit);
            worker.idle.notify_waiters();
        });
    }
    debug!("dispatcher stopped");
}

fn failure_message(state: ProcessState, tail: &[String]) -> String {
    let mut message = match state.exit_code() {
        Some(code) => format!("ffmpeg exited with code {}", code),
        None => "ffmpeg did not exit cleanly".to_string(),
    };
    let skip = tail.len().saturating_sub(FAILURE_TAIL_LINES);
    for line in &tail[skip..] {
        message.push('\n');
        message.push_str(line);
    }
    message
}

fn first_line(message: &str) -> &str {
    message.lines().next().unwrap_or(message)
}
