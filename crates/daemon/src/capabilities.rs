//! Hardware capability detection and the capabilities document.
//!
//! Detection probes the host for one hardware acceleration method (VAAPI
//! first, then CUDA) by running short trial encodes. Any probe failure
//! excludes that method; detection itself never fails. Software fallback
//! encoders are always populated.

use crate::formats::Codec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::process::Command;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::{debug, info};

/// Keys a user-supplied capabilities document must contain.
pub const REQUIRED_KEYS: [&str; 4] = ["hwaccel", "device", "encoders", "fallback_encoders"];

/// Device used for CUDA when detection selects it.
pub const DEFAULT_CUDA_DEVICE: &str = "0";

/// Markers that identify hardware encoders and hardware flags.
const HARDWARE_MARKERS: &[&str] = &[
    "nvenc", "qsv", "vaapi", "cuda", "amf", "vce", "videotoolbox", "v4l2m2m",
];

const TRIAL_SOURCE: &str = "testsrc=duration=1:size=1280x720:rate=30";

const VAAPI_CANDIDATES: &[(Codec, &str)] = &[(Codec::H264, "h264_vaapi"), (Codec::Hevc, "hevc_vaapi")];

const CUDA_CANDIDATES: &[(Codec, &str)] = &[
    (Codec::H264, "h264_nvenc"),
    (Codec::Hevc, "hevc_nvenc"),
    (Codec::Av1, "av1_nvenc"),
];

/// Error type for capability documents and host probes
#[derive(Debug, Error)]
pub enum CapabilitiesError {
    #[error("failed to read capabilities file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse capabilities: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("capabilities document must be a JSON object")]
    NotAnObject,

    #[error("capabilities document is missing required key '{0}'")]
    MissingKey(&'static str),

    #[error("fallback_encoders has no entry for {0}")]
    MissingFallback(Codec),

    #[error("hwaccel {0} requires a device")]
    MissingDevice(HwAccel),

    #[error("'{encoder}' is not a valid {role} encoder for {codec}")]
    InvalidEncoder {
        codec: Codec,
        encoder: String,
        role: &'static str,
    },

    #[error("probe failed: {0}")]
    ProbeFailed(String),
}

/// Hardware acceleration methods the command builder knows how to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HwAccel {
    Vaapi,
    Cuda,
}

impl HwAccel {
    pub fn as_str(&self) -> &'static str {
        match self {
            HwAccel::Vaapi => "vaapi",
            HwAccel::Cuda => "cuda",
        }
    }
}

impl fmt::Display for HwAccel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of what the host can encode with.
///
/// Never mutated after creation; re-detection produces a new value that is
/// swapped in through [`SharedCapabilities`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capabilities {
    pub hwaccel: Option<HwAccel>,
    pub device: Option<String>,
    pub encoders: BTreeMap<Codec, String>,
    pub fallback_encoders: BTreeMap<Codec, String>,
}

impl Capabilities {
    /// Capabilities with no hardware path.
    pub fn software_only() -> Self {
        Self {
            hwaccel: None,
            device: None,
            encoders: BTreeMap::new(),
            fallback_encoders: Codec::ALL
                .iter()
                .map(|c| (*c, c.software_encoder().to_string()))
                .collect(),
        }
    }

    /// Parse a user-supplied document. All four keys must be present.
    pub fn from_json(json: &str) -> Result<Self, CapabilitiesError> {
        let value: serde_json::Value = serde_json::from_str(json)?;
        let object = value.as_object().ok_or(CapabilitiesError::NotAnObject)?;
        for key in REQUIRED_KEYS {
            if !object.contains_key(key) {
                return Err(CapabilitiesError::MissingKey(key));
            }
        }

        let capabilities: Capabilities = serde_json::from_value(value)?;
        capabilities.validate()?;
        Ok(capabilities)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, CapabilitiesError> {
        let content = fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn to_json(&self) -> Result<String, CapabilitiesError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), CapabilitiesError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_json()?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), CapabilitiesError> {
        for codec in Codec::ALL {
            let encoder = self
                .fallback_encoders
                .get(&codec)
                .ok_or(CapabilitiesError::MissingFallback(codec))?;
            if is_hardware_encoder(encoder) {
                return Err(CapabilitiesError::InvalidEncoder {
                    codec,
                    encoder: encoder.clone(),
                    role: "software",
                });
            }
        }

        for (codec, encoder) in &self.encoders {
            if !is_hardware_encoder(encoder) {
                return Err(CapabilitiesError::InvalidEncoder {
                    codec: *codec,
                    encoder: encoder.clone(),
                    role: "hardware",
                });
            }
        }

        if let Some(method) = self.hwaccel {
            if self.device.as_deref().map_or(true, str::is_empty) {
                return Err(CapabilitiesError::MissingDevice(method));
            }
        }
        Ok(())
    }

    /// Hardware encoder for `codec`, if a hardware path is usable for it.
    pub fn hardware_encoder(&self, codec: Codec) -> Option<(HwAccel, &str)> {
        let method = self.hwaccel?;
        self.encoders.get(&codec).map(|e| (method, e.as_str()))
    }

    pub fn software_encoder(&self, codec: Codec) -> &str {
        self.fallback_encoders
            .get(&codec)
            .map(String::as_str)
            .unwrap_or_else(|| codec.software_encoder())
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Self::software_only()
    }
}

/// Returns the first hardware marker found in `s`, if any.
pub fn hardware_marker(s: &str) -> Option<&'static str> {
    let lower = s.to_lowercase();
    HARDWARE_MARKERS
        .iter()
        .find(|&&marker| lower.contains(marker))
        .copied()
}

pub fn is_hardware_encoder(name: &str) -> bool {
    hardware_marker(name).is_some()
}

/// Read-only host queries used during detection.
pub trait HostProbe {
    fn device_exists(&self, device: &str) -> bool;

    /// Runs the encoder tool and returns its stdout when it exits successfully.
    fn run(&self, args: &[String]) -> Result<String, CapabilitiesError>;
}

/// [`HostProbe`] backed by the real ffmpeg binary.
#[derive(Debug, Clone)]
pub struct FfmpegProbe {
    ffmpeg_path: String,
}

impl FfmpegProbe {
    pub fn new(ffmpeg_path: impl Into<String>) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
        }
    }
}

impl HostProbe for FfmpegProbe {
    fn device_exists(&self, device: &str) -> bool {
        Path::new(device).exists()
    }

    fn run(&self, args: &[String]) -> Result<String, CapabilitiesError> {
        let output = Command::new(&self.ffmpeg_path)
            .args(args)
            .output()
            .map_err(|e| CapabilitiesError::ProbeFailed(format!("{}: {}", self.ffmpeg_path, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CapabilitiesError::ProbeFailed(format!(
                "exited with {}: {}",
                output.status,
                stderr.lines().last().unwrap_or("").trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Detect capabilities using the real ffmpeg binary.
pub fn detect(ffmpeg_path: &str, vaapi_device: &str) -> Capabilities {
    detect_with(&FfmpegProbe::new(ffmpeg_path), vaapi_device)
}

/// Detect capabilities through `probe`.
pub fn detect_with(probe: &dyn HostProbe, vaapi_device: &str) -> Capabilities {
    let mut capabilities = Capabilities::software_only();

    let vaapi = probe_vaapi(probe, vaapi_device);
    if !vaapi.is_empty() {
        info!(device = vaapi_device, encoders = vaapi.len(), "VAAPI encoding available");
        capabilities.hwaccel = Some(HwAccel::Vaapi);
        capabilities.device = Some(vaapi_device.to_string());
        capabilities.encoders = vaapi;
        return capabilities;
    }

    let cuda = probe_cuda(probe);
    if !cuda.is_empty() {
        info!(encoders = cuda.len(), "CUDA encoding available");
        capabilities.hwaccel = Some(HwAccel::Cuda);
        capabilities.device = Some(DEFAULT_CUDA_DEVICE.to_string());
        capabilities.encoders = cuda;
        return capabilities;
    }

    info!("no hardware encoders found, using software encoding");
    capabilities
}

fn probe_vaapi(probe: &dyn HostProbe, device: &str) -> BTreeMap<Codec, String> {
    let mut found = BTreeMap::new();
    if !probe.device_exists(device) {
        debug!(device, "VAAPI device not present");
        return found;
    }

    for (codec, encoder) in VAAPI_CANDIDATES {
        let args = vaapi_trial_args(device, encoder);
        match probe.run(&args) {
            Ok(_) => {
                found.insert(*codec, encoder.to_string());
            }
            Err(e) => debug!(encoder, error = %e, "VAAPI trial encode failed"),
        }
    }
    found
}

fn probe_cuda(probe: &dyn HostProbe) -> BTreeMap<Codec, String> {
    let mut found = BTreeMap::new();
    let listing = match probe.run(&to_args(&["-hide_banner", "-hwaccels"])) {
        Ok(listing) => listing,
        Err(e) => {
            debug!(error = %e, "could not list hwaccels");
            return found;
        }
    };

    // First line is the "Hardware acceleration methods:" header.
    let has_cuda = listing.lines().skip(1).any(|line| line.trim() == "cuda");
    if !has_cuda {
        debug!("cuda not listed in hwaccels");
        return found;
    }

    for (codec, encoder) in CUDA_CANDIDATES {
        match probe.run(&cuda_trial_args(encoder)) {
            Ok(_) => {
                found.insert(*codec, encoder.to_string());
            }
            Err(e) => debug!(encoder, error = %e, "CUDA trial encode failed"),
        }
    }
    found
}

fn to_args(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

fn vaapi_trial_args(device: &str, encoder: &str) -> Vec<String> {
    let init = format!("vaapi=va:{}", device);
    to_args(&[
        "-hide_banner",
        "-loglevel",
        "error",
        "-init_hw_device",
        &init,
        "-filter_hw_device",
        "va",
        "-f",
        "lavfi",
        "-i",
        TRIAL_SOURCE,
        "-vf",
        "format=nv12,hwupload",
        "-c:v",
        encoder,
        "-t",
        "1",
        "-f",
        "null",
        "-",
    ])
}

fn cuda_trial_args(encoder: &str) -> Vec<String> {
    to_args(&[
        "-hide_banner",
        "-loglevel",
        "error",
        "-f",
        "lavfi",
        "-i",
        TRIAL_SOURCE,
        "-c:v",
        encoder,
        "-t",
        "1",
        "-f",
        "null",
        "-",
    ])
}

/// Holder for the current capabilities snapshot.
///
/// Readers take an `Arc` snapshot and keep using it for the rest of their
/// job; `replace` swaps the whole value at once.
#[derive(Debug, Clone)]
pub struct SharedCapabilities {
    current: Arc<RwLock<Arc<Capabilities>>>,
}

impl SharedCapabilities {
    pub fn new(capabilities: Capabilities) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(capabilities))),
        }
    }

    pub fn snapshot(&self) -> Arc<Capabilities> {
        let guard = self.current.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    /// Swap in new capabilities, returning the previous snapshot.
    pub fn replace(&self, capabilities: Capabilities) -> Arc<Capabilities> {
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *guard, Arc::new(capabilities))
    }
}

impl Default for SharedCapabilities {
    fn default() -> Self {
        Self::new(Capabilities::software_only())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashSet;

    /// Scripted host: the listed encoders succeed, everything else fails.
    struct FakeHost {
        device: bool,
        hwaccels: Option<&'static str>,
        working: HashSet<&'static str>,
        calls: RefCell<Vec<Vec<String>>>,
    }

    impl FakeHost {
        fn new(device: bool, hwaccels: Option<&'static str>, working: &[&'static str]) -> Self {
            Self {
                device,
                hwaccels,
                working: working.iter().copied().collect(),
                calls: RefCell::new(Vec::new()),
            }
        }
    }

    impl HostProbe for FakeHost {
        fn device_exists(&self, _device: &str) -> bool {
            self.device
        }

        fn run(&self, args: &[String]) -> Result<String, CapabilitiesError> {
            self.calls.borrow_mut().push(args.to_vec());
            if args.iter().any(|a| a == "-hwaccels") {
                return self
                    .hwaccels
                    .map(str::to_string)
                    .ok_or_else(|| CapabilitiesError::ProbeFailed("no ffmpeg".into()));
            }
            let encoder = args
                .windows(2)
                .find(|w| w[0] == "-c:v")
                .map(|w| w[1].clone())
                .unwrap_or_default();
            if self.working.contains(encoder.as_str()) {
                Ok(String::new())
            } else {
                Err(CapabilitiesError::ProbeFailed(format!("{} failed", encoder)))
            }
        }
    }

    const CUDA_LISTING: &str = "Hardware acceleration methods:\nvdpau\ncuda\nvaapi\n";

    #[test]
    fn test_detect_without_hardware_is_software_only() {
        let host = FakeHost::new(false, Some("Hardware acceleration methods:\n"), &[]);
        let caps = detect_with(&host, "/dev/dri/renderD128");

        assert_eq!(caps, Capabilities::software_only());
        assert_eq!(caps.fallback_encoders.len(), Codec::ALL.len());
    }

    #[test]
    fn test_detect_survives_missing_ffmpeg() {
        let host = FakeHost::new(true, None, &[]);
        let caps = detect_with(&host, "/dev/dri/renderD128");
        assert_eq!(caps.hwaccel, None);
        assert_eq!(caps.software_encoder(Codec::Hevc), "libx265");
    }

    #[test]
    fn test_detect_vaapi_keeps_only_working_encoders() {
        let host = FakeHost::new(true, Some(CUDA_LISTING), &["hevc_vaapi", "h264_nvenc"]);
        let caps = detect_with(&host, "/dev/dri/renderD129");

        assert_eq!(caps.hwaccel, Some(HwAccel::Vaapi));
        assert_eq!(caps.device.as_deref(), Some("/dev/dri/renderD129"));
        assert_eq!(caps.encoders.len(), 1);
        assert_eq!(caps.encoders.get(&Codec::Hevc).map(String::as_str), Some("hevc_vaapi"));
        // CUDA is never probed once VAAPI works.
        assert!(host.calls.borrow().iter().all(|c| !c.contains(&"-hwaccels".to_string())));
    }

    #[test]
    fn test_detect_falls_through_to_cuda() {
        let host = FakeHost::new(false, Some(CUDA_LISTING), &["h264_nvenc", "av1_nvenc"]);
        let caps = detect_with(&host, "/dev/dri/renderD128");

        assert_eq!(caps.hwaccel, Some(HwAccel::Cuda));
        assert_eq!(caps.device.as_deref(), Some(DEFAULT_CUDA_DEVICE));
        assert_eq!(caps.encoders.get(&Codec::H264).map(String::as_str), Some("h264_nvenc"));
        assert_eq!(caps.encoders.get(&Codec::Av1).map(String::as_str), Some("av1_nvenc"));
        assert!(!caps.encoders.contains_key(&Codec::Hevc));
    }

    #[test]
    fn test_vaapi_trial_uses_device() {
        let args = vaapi_trial_args("/dev/dri/renderD128", "h264_vaapi");
        assert!(args
            .windows(2)
            .any(|w| w[0] == "-init_hw_device" && w[1] == "vaapi=va:/dev/dri/renderD128"));
        assert_eq!(args.last().map(String::as_str), Some("-"));
    }

    #[test]
    fn test_document_requires_all_keys() {
        let json = r#"{"hwaccel": null, "encoders": {}, "fallback_encoders": {}}"#;
        assert!(matches!(
            Capabilities::from_json(json),
            Err(CapabilitiesError::MissingKey("device"))
        ));
    }

    #[test]
    fn test_document_null_hwaccel_loads() {
        let json = r#"{
            "hwaccel": null,
            "device": null,
            "encoders": {},
            "fallback_encoders": {"h264": "libx264", "hevc": "libx265", "vp9": "libvpx-vp9", "av1": "libsvtav1"}
        }"#;
        let caps = Capabilities::from_json(json).unwrap();
        assert_eq!(caps.hwaccel, None);
        assert_eq!(caps.software_encoder(Codec::Av1), "libsvtav1");
    }

    #[test]
    fn test_document_rejects_bad_encoders() {
        let missing_fallback = r#"{"hwaccel": null, "device": null, "encoders": {},
            "fallback_encoders": {"h264": "libx264"}}"#;
        assert!(matches!(
            Capabilities::from_json(missing_fallback),
            Err(CapabilitiesError::MissingFallback(Codec::Hevc))
        ));

        let software_as_hardware = r#"{"hwaccel": "vaapi", "device": "/dev/dri/renderD128",
            "encoders": {"h264": "libx264"},
            "fallback_encoders": {"h264": "libx264", "hevc": "libx265", "vp9": "libvpx-vp9", "av1": "libaom-av1"}}"#;
        assert!(matches!(
            Capabilities::from_json(software_as_hardware),
            Err(CapabilitiesError::InvalidEncoder { role: "hardware", .. })
        ));

        let no_device = r#"{"hwaccel": "cuda", "device": null, "encoders": {"h264": "h264_nvenc"},
            "fallback_encoders": {"h264": "libx264", "hevc": "libx265", "vp9": "libvpx-vp9", "av1": "libaom-av1"}}"#;
        assert!(matches!(
            Capabilities::from_json(no_device),
            Err(CapabilitiesError::MissingDevice(HwAccel::Cuda))
        ));
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested").join("caps.json");
        let mut caps = Capabilities::software_only();
        caps.hwaccel = Some(HwAccel::Vaapi);
        caps.device = Some("/dev/dri/renderD128".to_string());
        caps.encoders.insert(Codec::H264, "h264_vaapi".to_string());

        caps.save(&path).unwrap();
        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"hwaccel\": \"vaapi\""));
        assert_eq!(Capabilities::load(&path).unwrap(), caps);
    }

    #[test]
    fn test_shared_capabilities_swap_keeps_old_snapshot() {
        let shared = SharedCapabilities::default();
        let before = shared.snapshot();

        let mut next = Capabilities::software_only();
        next.hwaccel = Some(HwAccel::Cuda);
        next.device = Some("0".to_string());
        let previous = shared.replace(next.clone());

        assert_eq!(*previous, *before);
        assert_eq!(before.hwaccel, None);
        assert_eq!(*shared.snapshot(), next);
    }

    #[test]
    fn test_hardware_marker() {
        assert_eq!(hardware_marker("hevc_nvenc"), Some("nvenc"));
        assert_eq!(hardware_marker("H264_QSV"), Some("qsv"));
        assert_eq!(hardware_marker("h264_vaapi"), Some("vaapi"));
        assert_eq!(hardware_marker("libx265"), None);
    }
}
