//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Whether jobs may use hardware encoders at all
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum HardwareMode {
    /// Use whatever the detected capabilities offer
    #[default]
    Auto,
    /// Force the software path for every job
    #[serde(rename = "none")]
    Disabled,
}

impl FromStr for HardwareMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(HardwareMode::Auto),
            "none" | "off" | "software" => Ok(HardwareMode::Disabled),
            _ => Err(()),
        }
    }
}

/// External tool configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FfmpegConfig {
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,
    #[serde(default = "default_ffprobe_path")]
    pub ffprobe_path: String,
    /// VAAPI render node probed during capability detection
    #[serde(default = "default_device")]
    pub device: String,
    #[serde(default)]
    pub hardware: HardwareMode,
}

fn default_ffmpeg_path() -> String {
    "ffmpeg".to_string()
}

fn default_ffprobe_path() -> String {
    "ffprobe".to_string()
}

fn default_device() -> String {
    "/dev/dri/renderD128".to_string()
}

impl Default for FfmpegConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: default_ffmpeg_path(),
            ffprobe_path: default_ffprobe_path(),
            device: default_device(),
            hardware: HardwareMode::Auto,
        }
    }
}

/// Job scheduling configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobsConfig {
    /// Maximum concurrent jobs (0 = auto-derive)
    #[serde(default)]
    pub max_concurrent_jobs: u32,
    /// Directory transcoded files are written to when no output path is given
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Directory for persisted job records (in-memory when unset)
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
    /// Log lines retained per job
    #[serde(default = "default_log_capacity")]
    pub log_capacity: usize,
    /// Progress events buffered per running process
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// Seconds to wait after SIGTERM before killing the encoder
    #[serde(default = "default_kill_grace_secs")]
    pub kill_grace_secs: u64,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("transcodes")
}

fn default_log_capacity() -> usize {
    1000
}

fn default_event_capacity() -> usize {
    256
}

fn default_kill_grace_secs() -> u64 {
    5
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 0,
            output_dir: default_output_dir(),
            state_dir: None,
            log_capacity: default_log_capacity(),
            event_capacity: default_event_capacity(),
            kill_grace_secs: default_kill_grace_secs(),
        }
    }
}

/// Paths of user-supplied documents
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct FilesConfig {
    /// Capabilities document loaded instead of running detection
    #[serde(default)]
    pub capabilities: Option<PathBuf>,
    /// Preset collection document
    #[serde(default)]
    pub presets: Option<PathBuf>,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    #[serde(default = "default_server_enabled")]
    pub enabled: bool,
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_server_enabled() -> bool {
    true
}

fn default_bind() -> String {
    "127.0.0.1:7878".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: default_server_enabled(),
            bind: default_bind(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub ffmpeg: FfmpegConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
    #[serde(default)]
    pub files: FilesConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Missing sections and fields fall back to their defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// - TRANSCODER_FFMPEG_PATH -> ffmpeg.ffmpeg_path
    /// - TRANSCODER_FFPROBE_PATH -> ffmpeg.ffprobe_path
    /// - TRANSCODER_HARDWARE -> ffmpeg.hardware ("auto" or "none")
    /// - TRANSCODER_MAX_CONCURRENT_JOBS -> jobs.max_concurrent_jobs
    /// - TRANSCODER_OUTPUT_DIR -> jobs.output_dir
    /// - TRANSCODER_STATE_DIR -> jobs.state_dir
    /// - TRANSCODER_BIND -> server.bind
    ///
    /// Values that fail to parse are ignored.
    pub fn apply_env_overrides(&mut self) {
        if let Some(val) = non_empty_var("TRANSCODER_FFMPEG_PATH") {
            self.ffmpeg.ffmpeg_path = val;
        }

        if let Some(val) = non_empty_var("TRANSCODER_FFPROBE_PATH") {
            self.ffmpeg.ffprobe_path = val;
        }

        if let Some(val) = non_empty_var("TRANSCODER_HARDWARE") {
            if let Ok(mode) = val.parse::<HardwareMode>() {
                self.ffmpeg.hardware = mode;
            }
        }

        if let Some(val) = non_empty_var("TRANSCODER_MAX_CONCURRENT_JOBS") {
            if let Ok(jobs) = val.parse::<u32>() {
                self.jobs.max_concurrent_jobs = jobs;
            }
        }

        if let Some(val) = non_empty_var("TRANSCODER_OUTPUT_DIR") {
            self.jobs.output_dir = PathBuf::from(val);
        }

        if let Some(val) = non_empty_var("TRANSCODER_STATE_DIR") {
            self.jobs.state_dir = Some(PathBuf::from(val));
        }

        if let Some(val) = non_empty_var("TRANSCODER_BIND") {
            self.server.bind = val;
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Defaults plus environment overrides, for running without a config file
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Mutex;

    // Mutex to ensure env var tests don't interfere with each other
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const ENV_KEYS: &[&str] = &[
        "TRANSCODER_FFMPEG_PATH",
        "TRANSCODER_FFPROBE_PATH",
        "TRANSCODER_HARDWARE",
        "TRANSCODER_MAX_CONCURRENT_JOBS",
        "TRANSCODER_OUTPUT_DIR",
        "TRANSCODER_STATE_DIR",
        "TRANSCODER_BIND",
    ];

    fn clear_env_vars() {
        for key in ENV_KEYS {
            env::remove_var(key);
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_config_parses_all_sections(
            max_jobs in 0u32..16,
            log_capacity in 1usize..5000,
            grace in 0u64..60,
            disable_hw in proptest::bool::ANY,
            server_enabled in proptest::bool::ANY,
            port in 1024u16..65535,
        ) {
            let toml_str = format!(
                r#"
[ffmpeg]
ffmpeg_path = "/opt/ffmpeg/bin/ffmpeg"
hardware = "{}"

[jobs]
max_concurrent_jobs = {}
log_capacity = {}
kill_grace_secs = {}
state_dir = "/var/lib/hwtranscoder"

[files]
presets = "presets.json"

[server]
enabled = {}
bind = "0.0.0.0:{}"
"#,
                if disable_hw { "none" } else { "auto" },
                max_jobs,
                log_capacity,
                grace,
                server_enabled,
                port,
            );

            let config = Config::parse_toml(&toml_str).expect("Valid TOML should parse");

            prop_assert_eq!(config.ffmpeg.ffmpeg_path.as_str(), "/opt/ffmpeg/bin/ffmpeg");
            prop_assert_eq!(config.ffmpeg.ffprobe_path.as_str(), "ffprobe");
            let expected_mode = if disable_hw { HardwareMode::Disabled } else { HardwareMode::Auto };
            prop_assert_eq!(config.ffmpeg.hardware, expected_mode);
            prop_assert_eq!(config.jobs.max_concurrent_jobs, max_jobs);
            prop_assert_eq!(config.jobs.log_capacity, log_capacity);
            prop_assert_eq!(config.jobs.kill_grace_secs, grace);
            prop_assert_eq!(config.jobs.state_dir, Some(PathBuf::from("/var/lib/hwtranscoder")));
            prop_assert_eq!(config.files.presets, Some(PathBuf::from("presets.json")));
            prop_assert_eq!(config.files.capabilities, None);
            prop_assert_eq!(config.server.enabled, server_enabled);
            prop_assert_eq!(config.server.bind, format!("0.0.0.0:{}", port));
        }

        #[test]
        fn prop_env_overrides_max_concurrent_jobs(
            initial_jobs in 0u32..8,
            override_jobs in 0u32..16,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!("[jobs]\nmax_concurrent_jobs = {}\n", initial_jobs);
            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("TRANSCODER_MAX_CONCURRENT_JOBS", override_jobs.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.jobs.max_concurrent_jobs, override_jobs);
        }

        #[test]
        fn prop_env_overrides_paths(
            ffmpeg in "/[a-z]{1,12}/ffmpeg",
            output_dir in "/[a-z]{1,12}/out",
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let mut config = Config::default();
            env::set_var("TRANSCODER_FFMPEG_PATH", &ffmpeg);
            env::set_var("TRANSCODER_OUTPUT_DIR", &output_dir);
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.ffmpeg.ffmpeg_path, ffmpeg);
            prop_assert_eq!(config.jobs.output_dir, PathBuf::from(output_dir));
        }
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse_toml("").expect("Empty TOML should parse");

        assert_eq!(config.ffmpeg.ffmpeg_path, "ffmpeg");
        assert_eq!(config.ffmpeg.device, "/dev/dri/renderD128");
        assert_eq!(config.ffmpeg.hardware, HardwareMode::Auto);
        assert_eq!(config.jobs.max_concurrent_jobs, 0);
        assert_eq!(config.jobs.log_capacity, 1000);
        assert_eq!(config.jobs.kill_grace_secs, 5);
        assert_eq!(config.jobs.state_dir, None);
        assert!(config.server.enabled);
        assert_eq!(config.server.bind, "127.0.0.1:7878");
    }

    #[test]
    fn test_invalid_env_values_are_ignored() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = Config::parse_toml("[jobs]\nmax_concurrent_jobs = 3\n").unwrap();
        env::set_var("TRANSCODER_MAX_CONCURRENT_JOBS", "many");
        env::set_var("TRANSCODER_HARDWARE", "sometimes");
        config.apply_env_overrides();
        clear_env_vars();

        assert_eq!(config.jobs.max_concurrent_jobs, 3);
        assert_eq!(config.ffmpeg.hardware, HardwareMode::Auto);
    }

    #[test]
    fn test_hardware_env_override_disables() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = Config::default();
        env::set_var("TRANSCODER_HARDWARE", "none");
        config.apply_env_overrides();
        clear_env_vars();

        assert_eq!(config.ffmpeg.hardware, HardwareMode::Disabled);
    }

    #[test]
    fn test_unknown_hardware_mode_is_parse_error() {
        let result = Config::parse_toml("[ffmpeg]\nhardware = \"qsv\"\n");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }
}
