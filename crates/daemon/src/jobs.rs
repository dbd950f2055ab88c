//! Job records and their state transitions.
//!
//! A job is created `pending` from a resolved [`EncodeSpec`] and only ever
//! moves forward: `pending -> processing -> {completed, failed, cancelled}`
//! or `pending -> cancelled`. Terminal states are final; every transition
//! helper returns `false` and leaves the record untouched when applied to a
//! job that has already finished.

use crate::preset::EncodeSpec;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Prefix of the log line that records an executed argument vector.
pub const COMMAND_LOG_PREFIX: &str = "COMMAND: ";

static LAST_CREATED_MS: AtomicI64 = AtomicI64::new(0);

/// Status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting in the queue for a free worker.
    Pending,
    /// An encoder process is running for this job.
    Processing,
    /// The encode finished and the output file exists.
    Completed,
    /// The encode failed (including after a software retry).
    Failed,
    /// Cancelled before or during processing.
    Cancelled,
}

impl Default for JobStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Processing => write!(f, "processing"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

/// An encoding job with full metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    /// Unique job identifier (UUID).
    pub id: String,
    /// The resolved encode parameters. Never changes after creation.
    pub spec: EncodeSpec,
    /// Preset the encode spec was resolved from, if any.
    #[serde(default)]
    pub preset_name: Option<String>,
    pub status: JobStatus,
    /// Fraction complete in `[0, 1]`. Never decreases.
    pub progress: f64,
    /// Encoder position in seconds.
    #[serde(default)]
    pub current_time: Option<f64>,
    /// Source duration in seconds, once known.
    #[serde(default)]
    pub duration: Option<f64>,
    /// Unix timestamp (milliseconds) when the job was created.
    pub created_at: i64,
    /// Unix timestamp (milliseconds) of the last mutation.
    pub updated_at: i64,
    #[serde(default)]
    pub started_at: Option<i64>,
    #[serde(default)]
    pub completed_at: Option<i64>,
    /// Set only once the job completed.
    #[serde(default)]
    pub output_path: Option<PathBuf>,
    /// Size of the produced file in bytes.
    #[serde(default)]
    pub output_size: Option<u64>,
    /// Set only while the job is failed.
    #[serde(default)]
    pub error_message: Option<String>,
    /// Captured output, oldest first.
    #[serde(default)]
    pub logs: VecDeque<String>,
    /// Argument vector of the most recent attempt.
    #[serde(default)]
    pub command: Vec<String>,
    /// Whether the most recent attempt used a hardware encoder.
    #[serde(default)]
    pub used_hardware: Option<bool>,
    /// Whether the software retry has been spent.
    #[serde(default)]
    pub fallback_attempted: bool,
}

impl Job {
    /// Creates a pending job with a fresh UUID.
    pub fn new(spec: EncodeSpec, preset_name: Option<String>) -> Self {
        let now = next_created_at();
        Job {
            id: Uuid::new_v4().to_string(),
            spec,
            preset_name,
            status: JobStatus::Pending,
            progress: 0.0,
            current_time: None,
            duration: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            output_path: None,
            output_size: None,
            error_message: None,
            logs: VecDeque::new(),
            command: Vec::new(),
            used_hardware: None,
            fallback_attempted: false,
        }
    }

    /// Update the job's updated_at timestamp to now.
    pub fn touch(&mut self) {
        self.updated_at = current_timestamp_ms();
    }

    /// `pending -> processing`.
    pub fn start(&mut self) -> bool {
        if self.status != JobStatus::Pending {
            return false;
        }
        self.status = JobStatus::Processing;
        self.started_at = Some(current_timestamp_ms());
        self.touch();
        true
    }

    /// Raise progress to `progress`; lower values are ignored.
    ///
    /// Returns `true` when the stored value changed.
    pub fn record_progress(&mut self, progress: f64, current_time: Option<f64>, duration: Option<f64>) -> bool {
        if self.status != JobStatus::Processing || !progress.is_finite() {
            return false;
        }
        if let Some(duration) = duration {
            self.duration = Some(duration);
        }
        if let Some(time) = current_time {
            self.current_time = Some(time);
        }
        let clamped = progress.clamp(0.0, 1.0);
        if clamped <= self.progress {
            return false;
        }
        self.progress = clamped;
        self.touch();
        true
    }

    /// Append a log line, dropping the oldest lines beyond `capacity`.
    pub fn push_log(&mut self, line: impl Into<String>, capacity: usize) {
        self.logs.push_back(line.into());
        while self.logs.len() > capacity.max(1) {
            self.logs.pop_front();
        }
    }

    /// Record the argument vector of a new attempt.
    pub fn record_command(&mut self, argv: Vec<String>, used_hardware: bool, log_capacity: usize) {
        self.push_log(format!("{}{}", COMMAND_LOG_PREFIX, argv.join(" ")), log_capacity);
        self.command = argv;
        self.used_hardware = Some(used_hardware);
        self.touch();
    }

    /// `processing -> completed`.
    pub fn complete(&mut self, output_size: Option<u64>) -> bool {
        if self.status != JobStatus::Processing {
            return false;
        }
        self.status = JobStatus::Completed;
        self.progress = 1.0;
        self.output_path = Some(self.spec.output.clone());
        self.output_size = output_size;
        self.error_message = None;
        self.completed_at = Some(current_timestamp_ms());
        self.touch();
        true
    }

    /// `pending | processing -> failed`.
    pub fn fail(&mut self, reason: &str) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.status = JobStatus::Failed;
        self.error_message = Some(reason.to_string());
        self.output_path = None;
        self.completed_at = Some(current_timestamp_ms());
        self.touch();
        true
    }

    /// `pending | processing -> cancelled`.
    pub fn cancel(&mut self) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.status = JobStatus::Cancelled;
        self.output_path = None;
        self.error_message = None;
        self.completed_at = Some(current_timestamp_ms());
        self.touch();
        true
    }

    /// Check if the job is in a terminal state (completed, failed, or cancelled).
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Get current timestamp in milliseconds since Unix epoch.
pub fn current_timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Creation timestamps are strictly increasing within a process, so stores
/// can order jobs by `created_at` alone.
fn next_created_at() -> i64 {
    let now = current_timestamp_ms();
    let mut prev = LAST_CREATED_MS.load(Ordering::Relaxed);
    loop {
        let next = now.max(prev + 1);
        match LAST_CREATED_MS.compare_exchange_weak(prev, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(actual) => prev = actual,
        }
    }
}

/// Human readable byte count (`1.5 GB`, `300 KB`).
pub fn format_file_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", size, UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::{AudioCodec, Codec, Container};
    use crate::preset::Quality;
    use proptest::prelude::*;

    pub(crate) fn make_spec() -> EncodeSpec {
        EncodeSpec {
            input: PathBuf::from("/media/in.mp4"),
            output: PathBuf::from("/media/out.mkv"),
            container: Container::Mkv,
            codec: Codec::Hevc,
            scale: None,
            audio_codec: AudioCodec::Copy,
            audio_bitrate: None,
            flac_compression: None,
            quality: Quality::Crf(24),
            allow_fallback: true,
            force_software: false,
            overwrite: true,
        }
    }

    fn job_status_strategy() -> impl Strategy<Value = JobStatus> {
        prop_oneof![
            Just(JobStatus::Pending),
            Just(JobStatus::Processing),
            Just(JobStatus::Completed),
            Just(JobStatus::Failed),
            Just(JobStatus::Cancelled),
        ]
    }

    #[derive(Debug, Clone)]
    enum Op {
        Start,
        Progress(f64),
        Complete,
        Fail,
        Cancel,
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            Just(Op::Start),
            (0.0f64..1.5).prop_map(Op::Progress),
            Just(Op::Complete),
            Just(Op::Fail),
            Just(Op::Cancel),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_status_serde_roundtrip(status in job_status_strategy()) {
            let json = serde_json::to_string(&status).unwrap();
            prop_assert_eq!(json, format!("\"{}\"", status));
        }

        #[test]
        fn prop_record_invariants_hold(ops in prop::collection::vec(op_strategy(), 0..20)) {
            let mut job = Job::new(make_spec(), None);
            let mut last_progress = 0.0;
            let mut terminal: Option<JobStatus> = None;

            for op in ops {
                match op {
                    Op::Start => { job.start(); }
                    Op::Progress(p) => { job.record_progress(p, None, None); }
                    Op::Complete => { job.complete(Some(1)); }
                    Op::Fail => { job.fail("boom"); }
                    Op::Cancel => { job.cancel(); }
                }

                prop_assert!(job.progress >= last_progress);
                prop_assert!((0.0..=1.0).contains(&job.progress));
                last_progress = job.progress;

                prop_assert_eq!(job.output_path.is_some(), job.status == JobStatus::Completed);
                prop_assert_eq!(job.error_message.is_some(), job.status == JobStatus::Failed);

                if let Some(status) = terminal {
                    prop_assert_eq!(job.status, status);
                } else if job.is_terminal() {
                    terminal = Some(job.status);
                }
            }
        }
    }

    #[test]
    fn test_job_status_display() {
        assert_eq!(JobStatus::Pending.to_string(), "pending");
        assert_eq!(JobStatus::Processing.to_string(), "processing");
        assert_eq!(JobStatus::Completed.to_string(), "completed");
        assert_eq!(JobStatus::Failed.to_string(), "failed");
        assert_eq!(JobStatus::Cancelled.to_string(), "cancelled");
    }

    #[test]
    fn test_job_status_default() {
        assert_eq!(JobStatus::default(), JobStatus::Pending);
    }

    #[test]
    fn test_new_job() {
        let job = Job::new(make_spec(), Some("hevc-720".into()));
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.progress, 0.0);
        assert!(job.output_path.is_none());
        assert!(job.error_message.is_none());
        assert!(Uuid::parse_str(&job.id).is_ok());
        assert_eq!(job.created_at, job.updated_at);
        assert_eq!(job.preset_name.as_deref(), Some("hevc-720"));
    }

    #[test]
    fn test_job_ids_unique() {
        let a = Job::new(make_spec(), None);
        let b = Job::new(make_spec(), None);
        assert_ne!(a.id, b.id);
        assert!(b.created_at > a.created_at);
    }

    #[test]
    fn test_complete_sets_output_path() {
        let mut job = Job::new(make_spec(), None);
        assert!(!job.complete(None), "pending job cannot complete");
        assert!(job.start());
        assert!(job.complete(Some(4096)));
        assert_eq!(job.output_path, Some(PathBuf::from("/media/out.mkv")));
        assert_eq!(job.output_size, Some(4096));
        assert_eq!(job.progress, 1.0);
        assert!(job.completed_at.is_some());
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut job = Job::new(make_spec(), None);
        job.start();
        assert!(job.fail("ffmpeg exited with code 1"));
        assert!(!job.cancel());
        assert!(!job.complete(None));
        assert!(!job.start());
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_message.as_deref(), Some("ffmpeg exited with code 1"));
    }

    #[test]
    fn test_cancel_pending_never_processes() {
        let mut job = Job::new(make_spec(), None);
        assert!(job.cancel());
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.started_at.is_none());
    }

    #[test]
    fn test_progress_is_monotonic() {
        let mut job = Job::new(make_spec(), None);
        assert!(!job.record_progress(0.5, None, None), "not processing yet");
        job.start();
        assert!(job.record_progress(0.5, Some(5.0), Some(10.0)));
        assert!(!job.record_progress(0.2, Some(2.0), None));
        assert_eq!(job.progress, 0.5);
        assert_eq!(job.current_time, Some(2.0));
        assert!(job.record_progress(3.0, None, None));
        assert_eq!(job.progress, 1.0);
    }

    #[test]
    fn test_push_log_caps_lines() {
        let mut job = Job::new(make_spec(), None);
        for i in 0..10 {
            job.push_log(format!("line {}", i), 4);
        }
        assert_eq!(job.logs.len(), 4);
        assert_eq!(job.logs.front().map(String::as_str), Some("line 6"));
        assert_eq!(job.logs.back().map(String::as_str), Some("line 9"));
    }

    #[test]
    fn test_record_command_logs_argv() {
        let mut job = Job::new(make_spec(), None);
        job.record_command(vec!["ffmpeg".into(), "-i".into(), "in.mp4".into()], true, 100);
        job.push_log("error one", 100);
        job.push_log("error two", 100);
        assert_eq!(job.logs[0], "COMMAND: ffmpeg -i in.mp4");
        assert_eq!(job.used_hardware, Some(true));
        assert_eq!(job.logs.back().map(String::as_str), Some("error two"));
    }

    #[test]
    fn test_job_json_roundtrip() {
        let mut job = Job::new(make_spec(), Some("p".into()));
        job.start();
        job.record_progress(0.25, Some(2.5), Some(10.0));
        let json = serde_json::to_string_pretty(&job).unwrap();
        assert!(json.contains("\"status\": \"processing\""));
        let back: Job = serde_json::from_str(&json).unwrap();
        assert_eq!(back, job);
    }

    #[test]
    fn test_format_file_size() {
        assert_eq!(format_file_size(512), "512 B");
        assert_eq!(format_file_size(1536), "1.5 KB");
        assert_eq!(format_file_size(5 * 1024 * 1024 * 1024), "5.0 GB");
    }
}
