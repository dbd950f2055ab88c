//! Process supervisor: runs one encoder process and streams its output.
//!
//! `start` spawns the process, one reader task per output pipe and a
//! supervising task that owns the only `wait` on the child. Output lines are
//! published on a bounded broadcast channel; a slow consumer loses the oldest
//! events instead of stalling the readers. Completion is published on a
//! `watch` channel. A supervisor that is dropped while its process is still
//! running terminates it.

use crate::encode::progress::ProgressTracker;
use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// How long to wait for the readers to drain after the process exits.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("empty command")]
    EmptyCommand,

    #[error("process was already started")]
    AlreadyStarted,

    #[error("process was never started")]
    NotStarted,

    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Lifecycle of the supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    NotStarted,
    Running,
    /// Exited on its own; `-1` when no exit code was available
    Finished(i32),
    /// Stopped by [`ProcessSupervisor::terminate`] or by drop
    Terminated,
}

impl ProcessState {
    pub fn is_final(&self) -> bool {
        matches!(self, ProcessState::Finished(_) | ProcessState::Terminated)
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            ProcessState::Finished(code) => Some(*code),
            _ => None,
        }
    }

    pub fn success(&self) -> bool {
        matches!(self, ProcessState::Finished(0))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// One observed output line and the progress it implied.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    pub stream: OutputStream,
    pub line: String,
    /// `None` when the line carried no parseable progress marker
    pub progress: Option<f64>,
    pub elapsed: Option<f64>,
    pub duration: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// Events buffered before the oldest are dropped
    pub event_capacity: usize,
    /// Stderr lines retained for error reporting
    pub tail_lines: usize,
    /// Delay between SIGTERM and a hard kill
    pub kill_grace: Duration,
    /// Total duration in seconds, when known up front
    pub duration_hint: Option<f64>,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            event_capacity: 256,
            tail_lines: 50,
            kill_grace: Duration::from_secs(5),
            duration_hint: None,
        }
    }
}

/// Finite stream of [`ProgressEvent`]s for one process.
///
/// Ends once both output pipes are closed.
pub struct ProgressStream {
    rx: broadcast::Receiver<ProgressEvent>,
}

impl ProgressStream {
    pub async fn next(&mut self) -> Option<ProgressEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "progress consumer lagged, dropped oldest events");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next already buffered event, without waiting.
    pub fn try_next(&mut self) -> Option<ProgressEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}

/// Supervises a single encoder process.
pub struct ProcessSupervisor {
    argv: Vec<String>,
    options: SupervisorOptions,
    state_tx: Option<watch::Sender<ProcessState>>,
    state_rx: watch::Receiver<ProcessState>,
    terminate_tx: Mutex<Option<oneshot::Sender<()>>>,
    tail: Arc<Mutex<VecDeque<String>>>,
    pid: Option<u32>,
}

impl ProcessSupervisor {
    pub fn new(argv: Vec<String>, options: SupervisorOptions) -> Self {
        let (state_tx, state_rx) = watch::channel(ProcessState::NotStarted);
        Self {
            argv,
            options,
            state_tx: Some(state_tx),
            state_rx,
            terminate_tx: Mutex::new(None),
            tail: Arc::new(Mutex::new(VecDeque::new())),
            pid: None,
        }
    }

    pub fn state(&self) -> ProcessState {
        *self.state_rx.borrow()
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Spawn the process and return its event stream. Returns immediately.
    pub fn start(&mut self) -> Result<ProgressStream, SupervisorError> {
        if self.state_tx.is_none() {
            return Err(SupervisorError::AlreadyStarted);
        }
        let (program, args) = self.argv.split_first().ok_or(SupervisorError::EmptyCommand)?;

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SupervisorError::Spawn {
                program: program.clone(),
                source,
            })?;
        self.pid = child.id();
        debug!(pid = ?self.pid, program = %program, "encoder process started");

        let (events_tx, events_rx) = broadcast::channel(self.options.event_capacity.max(1));
        let tracker = Arc::new(Mutex::new(ProgressTracker::new(self.options.duration_hint)));

        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(read_lines(
                stdout,
                OutputStream::Stdout,
                events_tx.clone(),
                Arc::clone(&tracker),
                None,
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(read_lines(
                stderr,
                OutputStream::Stderr,
                events_tx.clone(),
                Arc::clone(&tracker),
                Some((Arc::clone(&self.tail), self.options.tail_lines)),
            )));
        }
        drop(events_tx);

        let (terminate_tx, terminate_rx) = oneshot::channel();
        *self.terminate_tx.lock().unwrap_or_else(|e| e.into_inner()) = Some(terminate_tx);
        let state_tx = self.state_tx.take().ok_or(SupervisorError::AlreadyStarted)?;
        state_tx.send_replace(ProcessState::Running);
        tokio::spawn(supervise(
            child,
            terminate_rx,
            state_tx,
            readers,
            self.options.kill_grace,
        ));

        Ok(ProgressStream { rx: events_rx })
    }

    /// Wait for the process to exit, up to `timeout` when given.
    ///
    /// Returns `Ok(None)` if the timeout elapsed first.
    pub async fn wait(&self, timeout: Option<Duration>) -> Result<Option<ProcessState>, SupervisorError> {
        if self.state_tx.is_some() {
            return Err(SupervisorError::NotStarted);
        }

        let mut rx = self.state_rx.clone();
        let finished = async move {
            match rx.wait_for(ProcessState::is_final).await {
                Ok(state) => *state,
                // The supervising task is gone without reporting; treat as a failed exit.
                Err(_) => ProcessState::Finished(-1),
            }
        };

        match timeout {
            Some(limit) => Ok(tokio::time::timeout(limit, finished).await.ok()),
            None => Ok(Some(finished.await)),
        }
    }

    /// Ask the process to stop. Returns immediately; observe the outcome with
    /// [`wait`](Self::wait).
    pub fn terminate(&self) {
        let sender = self.terminate_tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(tx) = sender {
            let _ = tx.send(());
        }
    }

    /// Most recent stderr lines, oldest first.
    pub fn tail(&self) -> Vec<String> {
        let tail = self.tail.lock().unwrap_or_else(|e| e.into_inner());
        tail.iter().cloned().collect()
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        if !self.state().is_final() {
            self.terminate();
        }
    }
}

async fn supervise(
    mut child: Child,
    mut terminate_rx: oneshot::Receiver<()>,
    state_tx: watch::Sender<ProcessState>,
    readers: Vec<JoinHandle<()>>,
    kill_grace: Duration,
) {
    let state = tokio::select! {
        status = child.wait() => match status {
            Ok(status) => ProcessState::Finished(status.code().unwrap_or(-1)),
            Err(e) => {
                warn!(error = %e, "failed to wait for encoder process");
                ProcessState::Finished(-1)
            }
        },
        // Fires on an explicit terminate and when the supervisor is dropped.
        _ = &mut terminate_rx => {
            stop_child(&mut child, kill_grace).await;
            ProcessState::Terminated
        }
    };

    let drained = tokio::time::timeout(READER_DRAIN_TIMEOUT, async {
        for reader in readers {
            let _ = reader.await;
        }
    })
    .await;
    if drained.is_err() {
        debug!("output readers still open after exit");
    }

    debug!(?state, "encoder process finished");
    state_tx.send_replace(state);
}

async fn stop_child(child: &mut Child, grace: Duration) {
    send_sigterm(child);
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(_) => {}
        Err(_) => {
            warn!(grace_secs = grace.as_secs(), "encoder ignored SIGTERM, killing");
            if let Err(e) = child.kill().await {
                warn!(error = %e, "failed to kill encoder process");
            }
        }
    }
}

#[cfg(unix)]
fn send_sigterm(child: &mut Child) {
    if let Some(pid) = child.id() {
        // SAFETY: kill(2) with a pid we spawned and have not yet reaped.
        let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        if rc != 0 {
            debug!(pid, "SIGTERM delivery failed");
        }
    }
}

#[cfg(not(unix))]
fn send_sigterm(child: &mut Child) {
    let _ = child.start_kill();
}

async fn read_lines<R: AsyncRead + Unpin>(
    reader: R,
    stream: OutputStream,
    events: broadcast::Sender<ProgressEvent>,
    tracker: Arc<Mutex<ProgressTracker>>,
    tail: Option<(Arc<Mutex<VecDeque<String>>>, usize)>,
) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(error = %e, ?stream, "output reader stopped");
                break;
            }
        }

        let text = String::from_utf8_lossy(&buf);
        // Stats output separates updates with carriage returns.
        for line in text.split(['\r', '\n']).map(str::trim_end).filter(|l| !l.is_empty()) {
            let event = {
                let mut tracker = tracker.lock().unwrap_or_else(|e| e.into_inner());
                let progress = tracker.observe(line);
                ProgressEvent {
                    stream,
                    line: line.to_string(),
                    progress,
                    elapsed: tracker.elapsed(),
                    duration: tracker.duration(),
                }
            };

            if let Some((tail, capacity)) = &tail {
                let mut tail = tail.lock().unwrap_or_else(|e| e.into_inner());
                tail.push_back(event.line.clone());
                while tail.len() > *capacity {
                    tail.pop_front();
                }
            }

            // No receivers is fine: nobody is watching this process.
            let _ = events.send(event);
        }
    }
}
