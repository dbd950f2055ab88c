//! Source duration lookup via ffprobe.
//!
//! The encoder banner usually carries the duration too, but probing up front
//! lets progress be reported from the first `out_time` line.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;

/// Upper bound on a single ffprobe invocation.
const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Error type for probe operations.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// ffprobe command failed to execute or exited non-zero.
    #[error("ffprobe failed: {0}")]
    FfprobeFailed(String),

    /// Failed to parse ffprobe JSON output.
    #[error("failed to parse ffprobe output: {0}")]
    ParseError(String),

    #[error("ffprobe timed out after {0:?}")]
    Timeout(Duration),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Container-level information reported by ffprobe.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FormatInfo {
    /// Duration in seconds, when the container declares one.
    pub duration_secs: Option<f64>,
    pub size_bytes: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    format: Option<RawFormat>,
}

#[derive(Debug, Deserialize)]
struct RawFormat {
    duration: Option<String>,
    size: Option<String>,
}

/// Runs `ffprobe -v quiet -print_format json -show_format <input>`.
pub async fn probe_format(ffprobe_path: &str, input: &Path) -> Result<FormatInfo, ProbeError> {
    let mut command = Command::new(ffprobe_path);
    command
        .args(["-v", "quiet", "-print_format", "json", "-show_format"])
        .arg(input)
        .kill_on_drop(true);

    let output = tokio::time::timeout(PROBE_TIMEOUT, command.output())
        .await
        .map_err(|_| ProbeError::Timeout(PROBE_TIMEOUT))??;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ProbeError::FfprobeFailed(format!(
            "ffprobe exited with status {}: {}",
            output.status,
            stderr.trim()
        )));
    }

    parse_format_output(&String::from_utf8_lossy(&output.stdout))
}

/// Duration of `input` in seconds, if ffprobe can tell.
pub async fn probe_duration(ffprobe_path: &str, input: &Path) -> Result<Option<f64>, ProbeError> {
    Ok(probe_format(ffprobe_path, input).await?.duration_secs)
}

/// Parses the `format` object of ffprobe JSON output.
pub fn parse_format_output(json_str: &str) -> Result<FormatInfo, ProbeError> {
    let parsed: FfprobeOutput =
        serde_json::from_str(json_str).map_err(|e| ProbeError::ParseError(e.to_string()))?;
    let format = parsed.format.ok_or_else(|| {
        ProbeError::ParseError("Missing format information in ffprobe output".to_string())
    })?;

    Ok(FormatInfo {
        duration_secs: format
            .duration
            .as_deref()
            .and_then(|d| d.trim().parse::<f64>().ok())
            .filter(|d| d.is_finite() && *d > 0.0),
        size_bytes: format.size.as_deref().and_then(|s| s.trim().parse().ok()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_format_output_basic() {
        let json = r#"{
            "format": {
                "filename": "movie.mkv",
                "duration": "7200.5",
                "size": "22548578304"
            }
        }"#;
        let info = parse_format_output(json).expect("Should parse valid JSON");
        assert_eq!(info.duration_secs, Some(7200.5));
        assert_eq!(info.size_bytes, Some(22548578304));
    }

    #[test]
    fn test_parse_format_output_missing_fields() {
        let info = parse_format_output(r#"{"format": {}}"#).unwrap();
        assert_eq!(info, FormatInfo::default());
    }

    #[test]
    fn test_parse_format_output_rejects_non_positive_duration() {
        let info = parse_format_output(r#"{"format": {"duration": "N/A"}}"#).unwrap();
        assert!(info.duration_secs.is_none());
        let info = parse_format_output(r#"{"format": {"duration": "0.000"}}"#).unwrap();
        assert!(info.duration_secs.is_none());
    }

    #[test]
    fn test_parse_format_output_missing_format() {
        let err = parse_format_output(r#"{"streams": []}"#).unwrap_err();
        assert!(matches!(err, ProbeError::ParseError(_)));
    }

    #[test]
    fn test_parse_format_output_invalid_json() {
        assert!(matches!(
            parse_format_output("not json"),
            Err(ProbeError::ParseError(_))
        ));
    }

    #[tokio::test]
    async fn test_probe_missing_binary() {
        let err = probe_duration("/nonexistent/ffprobe", Path::new("in.mp4"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::Io(_)));
    }
}
