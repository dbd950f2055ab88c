//! Metrics for the transcoding daemon
//!
//! Per-job progress, host resource usage and aggregate scheduler counters,
//! serialized as the `/metrics` JSON document.

use crate::jobs::{Job, JobStatus};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Per-job metrics tracking encoding progress
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobMetrics {
    pub id: String,
    pub input_path: String,
    pub status: JobStatus,
    pub progress: f64,
    /// Video encoder of the most recent attempt
    pub encoder: Option<String>,
    pub used_hardware: Option<bool>,
    pub fallback_attempted: bool,
    pub preset: Option<String>,
    pub current_time: Option<f64>,
    pub duration: Option<f64>,
    /// 1-based rank among pending jobs
    pub queue_position: Option<usize>,
}

impl JobMetrics {
    pub fn from_job(job: &Job, queue_position: Option<usize>) -> Self {
        Self {
            id: job.id.clone(),
            input_path: job.spec.input.to_string_lossy().to_string(),
            status: job.status,
            progress: job.progress,
            encoder: video_encoder(&job.command),
            used_hardware: job.used_hardware,
            fallback_attempted: job.fallback_attempted,
            preset: job.preset_name.clone(),
            current_time: job.current_time,
            duration: job.duration,
            queue_position,
        }
    }
}

/// The value following `-c:v` in an argument vector.
fn video_encoder(argv: &[String]) -> Option<String> {
    argv.iter()
        .position(|arg| arg == "-c:v")
        .and_then(|i| argv.get(i + 1))
        .cloned()
}

/// System-level metrics for resource monitoring
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SystemMetrics {
    pub cpu_usage_percent: f32,
    pub mem_usage_percent: f32,
    pub load_avg_1: f32,
    pub load_avg_5: f32,
    pub load_avg_15: f32,
}

/// Complete metrics snapshot including jobs, system, and aggregate stats
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MetricsSnapshot {
    pub timestamp_unix_ms: i64,
    pub jobs: Vec<JobMetrics>,
    pub system: SystemMetrics,
    pub queue_len: usize,
    pub running_jobs: usize,
    pub completed_jobs: u64,
    pub failed_jobs: u64,
    pub cancelled_jobs: u64,
    /// Software retries started after a hardware failure
    pub fallback_retries: u64,
    pub total_bytes_written: u64,
    /// Hardware method of the active capabilities, if any
    pub hwaccel: Option<String>,
}

impl MetricsSnapshot {
    /// Tally jobs (in creation order) into a snapshot.
    pub fn from_jobs<'a, I>(jobs: I, fallback_retries: u64) -> Self
    where
        I: IntoIterator<Item = (&'a Job, Option<usize>)>,
    {
        let mut snapshot = MetricsSnapshot {
            fallback_retries,
            ..Default::default()
        };
        for (job, queue_position) in jobs {
            match job.status {
                JobStatus::Pending => snapshot.queue_len += 1,
                JobStatus::Processing => snapshot.running_jobs += 1,
                JobStatus::Completed => {
                    snapshot.completed_jobs += 1;
                    snapshot.total_bytes_written += job.output_size.unwrap_or(0);
                }
                JobStatus::Failed => snapshot.failed_jobs += 1,
                JobStatus::Cancelled => snapshot.cancelled_jobs += 1,
            }
            snapshot.jobs.push(JobMetrics::from_job(job, queue_position));
        }
        snapshot
    }
}

/// Latest host metrics, refreshed by a background task.
pub type SharedSystemMetrics = Arc<RwLock<SystemMetrics>>;

/// Creates a new SharedSystemMetrics instance with default values
pub fn new_shared_system_metrics() -> SharedSystemMetrics {
    Arc::new(RwLock::new(SystemMetrics::default()))
}

/// Collects current system metrics using sysinfo
pub fn collect_system_metrics() -> SystemMetrics {
    use sysinfo::System;

    let mut sys = System::new();
    sys.refresh_cpu_usage();
    sys.refresh_memory();

    let cpu_usage = sys.global_cpu_usage();
    let total_memory = sys.total_memory();
    let used_memory = sys.used_memory();
    let mem_usage = if total_memory > 0 {
        (used_memory as f64 / total_memory as f64 * 100.0) as f32
    } else {
        0.0
    };

    let load_avg = System::load_average();

    SystemMetrics {
        cpu_usage_percent: cpu_usage,
        mem_usage_percent: mem_usage,
        load_avg_1: load_avg.one as f32,
        load_avg_5: load_avg.five as f32,
        load_avg_15: load_avg.fifteen as f32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::{AudioCodec, Codec, Container};
    use crate::preset::{EncodeSpec, Quality};
    use std::path::PathBuf;

    fn make_job(status: JobStatus) -> Job {
        let spec = EncodeSpec {
            input: PathBuf::from("/media/in.mp4"),
            output: PathBuf::from("/media/out.mkv"),
            container: Container::Mkv,
            codec: Codec::H264,
            scale: None,
            audio_codec: AudioCodec::Copy,
            audio_bitrate: None,
            flac_compression: None,
            quality: Quality::Crf(23),
            allow_fallback: true,
            force_software: false,
            overwrite: true,
        };
        let mut job = Job::new(spec, Some("fast".into()));
        match status {
            JobStatus::Pending => {}
            JobStatus::Processing => {
                job.start();
            }
            JobStatus::Completed => {
                job.start();
                job.complete(Some(1000));
            }
            JobStatus::Failed => {
                job.start();
                job.fail("ffmpeg exited with code 1");
            }
            JobStatus::Cancelled => {
                job.cancel();
            }
        }
        job
    }

    #[test]
    fn test_job_metrics_from_job() {
        let mut job = make_job(JobStatus::Processing);
        job.record_command(
            vec!["ffmpeg".into(), "-i".into(), "in.mp4".into(), "-c:v".into(), "libx264".into()],
            false,
            10,
        );
        job.record_progress(0.4, Some(4.0), Some(10.0));

        let metrics = JobMetrics::from_job(&job, None);
        assert_eq!(metrics.status, JobStatus::Processing);
        assert_eq!(metrics.encoder.as_deref(), Some("libx264"));
        assert_eq!(metrics.used_hardware, Some(false));
        assert_eq!(metrics.preset.as_deref(), Some("fast"));
        assert_eq!(metrics.progress, 0.4);
        assert_eq!(metrics.input_path, "/media/in.mp4");
    }

    #[test]
    fn test_snapshot_counts() {
        let jobs = vec![
            make_job(JobStatus::Pending),
            make_job(JobStatus::Pending),
            make_job(JobStatus::Processing),
            make_job(JobStatus::Completed),
            make_job(JobStatus::Completed),
            make_job(JobStatus::Failed),
            make_job(JobStatus::Cancelled),
        ];
        let snapshot = MetricsSnapshot::from_jobs(
            jobs.iter().enumerate().map(|(i, job)| (job, (i < 2).then_some(i + 1))),
            3,
        );

        assert_eq!(snapshot.queue_len, 2);
        assert_eq!(snapshot.running_jobs, 1);
        assert_eq!(snapshot.completed_jobs, 2);
        assert_eq!(snapshot.failed_jobs, 1);
        assert_eq!(snapshot.cancelled_jobs, 1);
        assert_eq!(snapshot.fallback_retries, 3);
        assert_eq!(snapshot.total_bytes_written, 2000);
        assert_eq!(snapshot.jobs.len(), 7);
        assert_eq!(snapshot.jobs[1].queue_position, Some(2));
    }

    #[test]
    fn test_snapshot_json_field_names() {
        let json = serde_json::to_value(MetricsSnapshot::default()).unwrap();
        for key in ["timestamp_unix_ms", "jobs", "system", "queue_len", "running_jobs", "fallback_retries"] {
            assert!(json.get(key).is_some(), "missing {}", key);
        }
    }

    #[test]
    fn test_collect_system_metrics_in_range() {
        let system = collect_system_metrics();
        assert!((0.0..=100.0).contains(&system.mem_usage_percent));
        assert!(system.load_avg_1 >= 0.0);
    }
}
