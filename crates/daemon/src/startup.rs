//! Preflight checks run before the daemon accepts jobs.
//!
//! Verifies that the configured ffmpeg and ffprobe binaries execute.

use crate::config::Config;
use std::process::Command;
use thiserror::Error;
use tracing::{debug, info};

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("ffmpeg not available: {0}")]
    FfmpegUnavailable(String),

    #[error("ffprobe not available: {0}")]
    FfprobeUnavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Parse FFmpeg version string and extract major version number
///
/// Handles various FFmpeg version formats:
/// - Standard: "ffmpeg version 6.1.1 ..."
/// - N-prefixed: "ffmpeg version n7.0-... ..."
///
/// Git snapshot builds (`N-113000-g...`) carry no release number and yield `None`.
pub fn parse_ffmpeg_version(version_output: &str) -> Option<u32> {
    parse_tool_version(version_output, "ffmpeg version")
}

fn parse_tool_version(version_output: &str, marker: &str) -> Option<u32> {
    let version_line = version_output
        .lines()
        .find(|line| line.to_lowercase().contains(marker))?;

    let lower = version_line.to_lowercase();
    let version_part = lower.split(marker).nth(1)?.split_whitespace().next()?;

    let version_str = version_part.strip_prefix('n').unwrap_or(version_part);
    let major_str = version_str.split(['.', '-']).next()?;
    major_str.parse().ok()
}

/// Runs `<path> -version` and returns its stdout.
fn run_version(path: &str) -> Result<String, String> {
    let output = Command::new(path)
        .arg("-version")
        .output()
        .map_err(|e| format!("failed to run {} -version; is it installed and in PATH? Error: {}", path, e))?;

    if !output.status.success() {
        return Err(format!("{} -version exited with {}", path, output.status));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Check that ffmpeg executes. Returns the major version when it can be parsed.
pub fn check_ffmpeg_available(path: &str) -> Result<Option<u32>, StartupError> {
    let version_output = run_version(path).map_err(StartupError::FfmpegUnavailable)?;
    let major = parse_ffmpeg_version(&version_output);
    match major {
        Some(major) => info!(path, major, "ffmpeg available"),
        None => debug!(path, "ffmpeg available, version not recognized"),
    }
    Ok(major)
}

/// Check that ffprobe executes.
pub fn check_ffprobe_available(path: &str) -> Result<(), StartupError> {
    let version_output = run_version(path).map_err(StartupError::FfprobeUnavailable)?;
    if !version_output.to_lowercase().contains("ffprobe version") {
        return Err(StartupError::FfprobeUnavailable(format!(
            "{} -version did not identify as ffprobe",
            path
        )));
    }
    Ok(())
}

/// Run all startup checks in order
///
/// 1. ffmpeg availability
/// 2. ffprobe availability
pub fn run_startup_checks(cfg: &Config) -> Result<(), StartupError> {
    check_ffmpeg_available(&cfg.ffmpeg.ffmpeg_path)?;
    check_ffprobe_available(&cfg.ffmpeg.ffprobe_path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_version_parsing(major in 1u32..100, minor in 0u32..10, n_prefix in any::<bool>()) {
            let prefix = if n_prefix { "n" } else { "" };
            let output = format!(
                "ffmpeg version {}{}.{}-static Copyright (c) 2000-2024 the FFmpeg developers\nbuilt with gcc 13",
                prefix, major, minor
            );
            prop_assert_eq!(parse_ffmpeg_version(&output), Some(major));
        }
    }

    #[test]
    fn test_parse_ffmpeg_version_variants() {
        assert_eq!(parse_ffmpeg_version("ffmpeg version 6.1.1 Copyright"), Some(6));
        assert_eq!(parse_ffmpeg_version("ffmpeg version n7.0-3-gabc Copyright"), Some(7));
        assert_eq!(parse_ffmpeg_version("ffmpeg version 5.1.4-0+deb12u1 Copyright"), Some(5));
        assert_eq!(parse_ffmpeg_version("ffmpeg version N-113000-g1234 Copyright"), None);
        assert_eq!(parse_ffmpeg_version("nothing to see"), None);
        assert_eq!(parse_ffmpeg_version(""), None);
    }

    #[test]
    fn test_check_ffmpeg_missing_binary() {
        let err = check_ffmpeg_available("/nonexistent/ffmpeg").unwrap_err();
        assert!(matches!(err, StartupError::FfmpegUnavailable(_)));
        assert!(err.to_string().contains("/nonexistent/ffmpeg"));
    }

    #[test]
    fn test_check_ffprobe_missing_binary() {
        let err = check_ffprobe_available("/nonexistent/ffprobe").unwrap_err();
        assert!(matches!(err, StartupError::FfprobeUnavailable(_)));
    }

    #[cfg(unix)]
    #[test]
    fn test_check_ffmpeg_with_script() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("ffmpeg");
        std::fs::write(&path, "#!/bin/sh\necho 'ffmpeg version n6.1 Copyright'\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();

        let major = check_ffmpeg_available(path.to_str().unwrap()).unwrap();
        assert_eq!(major, Some(6));
        // ffmpeg output does not identify as ffprobe
        assert!(check_ffprobe_available(path.to_str().unwrap()).is_err());
    }
}
