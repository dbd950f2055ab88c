//! Progress extraction from encoder output.
//!
//! Understands the stderr banner (`Duration: 00:01:30.00, ...`), the
//! `-progress` key/value report (`out_time=`, `out_time_us=`, `progress=end`)
//! and the classic stats line (`... time=00:00:05.00 bitrate=...`).

/// Parse `HH:MM:SS(.frac)` into seconds. Negative or malformed values yield `None`.
pub fn parse_timestamp(value: &str) -> Option<f64> {
    let mut parts = value.trim().split(':');
    let hours: f64 = parts.next()?.parse().ok()?;
    let minutes: f64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() || hours < 0.0 || minutes < 0.0 || seconds < 0.0 {
        return None;
    }
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

/// Tracks elapsed time against total duration for one process.
///
/// Reported progress is clamped to `[0, 1]` and never decreases.
#[derive(Debug, Clone, Default)]
pub struct ProgressTracker {
    duration: Option<f64>,
    elapsed: Option<f64>,
    progress: Option<f64>,
}

impl ProgressTracker {
    /// `duration_hint` (seconds) takes precedence over the banner duration.
    pub fn new(duration_hint: Option<f64>) -> Self {
        Self {
            duration: duration_hint.filter(|d| *d > 0.0),
            ..Default::default()
        }
    }

    pub fn duration(&self) -> Option<f64> {
        self.duration
    }

    pub fn elapsed(&self) -> Option<f64> {
        self.elapsed
    }

    pub fn progress(&self) -> Option<f64> {
        self.progress
    }

    /// Feed one output line; returns the current progress when the line
    /// carried a progress marker and the duration is known.
    pub fn observe(&mut self, line: &str) -> Option<f64> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        if let Some(rest) = line.strip_prefix("Duration:") {
            if self.duration.is_none() {
                let stamp = rest.split(',').next().unwrap_or("");
                self.duration = parse_timestamp(stamp).filter(|d| *d > 0.0);
            }
            return None;
        }

        if let Some((key, value)) = line.split_once('=') {
            match key {
                "out_time" => return self.advance(parse_timestamp(value)?),
                // out_time_ms is reported in microseconds as well
                "out_time_us" | "out_time_ms" => {
                    let micros: i64 = value.trim().parse().ok()?;
                    if micros < 0 {
                        return None;
                    }
                    return self.advance(micros as f64 / 1_000_000.0);
                }
                "progress" if value.trim() == "end" => {
                    self.progress = Some(1.0);
                    if let Some(duration) = self.duration {
                        self.elapsed = Some(duration);
                    }
                    return self.progress;
                }
                _ => {}
            }
        }

        let time = stats_time(line)?;
        self.advance(parse_timestamp(time)?)
    }

    fn advance(&mut self, elapsed: f64) -> Option<f64> {
        self.elapsed = Some(elapsed);
        let duration = self.duration?;
        let ratio = (elapsed / duration).clamp(0.0, 1.0);
        let progress = self.progress.map_or(ratio, |p| p.max(ratio));
        self.progress = Some(progress);
        Some(progress)
    }
}

/// The value of a standalone `time=` token, skipping keys like `out_time=`.
fn stats_time(line: &str) -> Option<&str> {
    let start = if line.starts_with("time=") {
        0
    } else {
        line.find(" time=")? + 1
    };
    let rest = &line[start + "time=".len()..];
    rest.split_whitespace().next()
}
