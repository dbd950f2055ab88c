//! Codec, container and scale vocabulary shared by presets, capabilities and
//! the command builder.

use crate::preset::SpecError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Video codecs the transcoder can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    H264,
    Hevc,
    Vp9,
    Av1,
}

impl Codec {
    pub const ALL: [Codec; 4] = [Codec::H264, Codec::Hevc, Codec::Vp9, Codec::Av1];

    pub fn as_str(&self) -> &'static str {
        match self {
            Codec::H264 => "h264",
            Codec::Hevc => "hevc",
            Codec::Vp9 => "vp9",
            Codec::Av1 => "av1",
        }
    }

    /// Software encoder used when no hardware path is available.
    pub fn software_encoder(&self) -> &'static str {
        match self {
            Codec::H264 => "libx264",
            Codec::Hevc => "libx265",
            Codec::Vp9 => "libvpx-vp9",
            Codec::Av1 => "libaom-av1",
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Codec {
    type Err = SpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "h264" | "avc" => Ok(Codec::H264),
            "hevc" | "h265" => Ok(Codec::Hevc),
            "vp9" => Ok(Codec::Vp9),
            "av1" => Ok(Codec::Av1),
            other => Err(SpecError::InvalidValue(format!("unknown video codec '{}'", other))),
        }
    }
}

/// Audio handling for the output stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioCodec {
    Copy,
    Aac,
    Flac,
    Opus,
    Libopus,
}

impl AudioCodec {
    pub fn as_str(&self) -> &'static str {
        match self {
            AudioCodec::Copy => "copy",
            AudioCodec::Aac => "aac",
            AudioCodec::Flac => "flac",
            AudioCodec::Opus => "opus",
            AudioCodec::Libopus => "libopus",
        }
    }

    /// Whether an explicit audio bitrate is meaningful for this codec.
    pub fn accepts_bitrate(&self) -> bool {
        matches!(self, AudioCodec::Aac | AudioCodec::Opus | AudioCodec::Libopus)
    }

    pub fn is_opus(&self) -> bool {
        matches!(self, AudioCodec::Opus | AudioCodec::Libopus)
    }
}

impl fmt::Display for AudioCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AudioCodec {
    type Err = SpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "copy" => Ok(AudioCodec::Copy),
            "aac" => Ok(AudioCodec::Aac),
            "flac" => Ok(AudioCodec::Flac),
            "opus" => Ok(AudioCodec::Opus),
            "libopus" => Ok(AudioCodec::Libopus),
            other => Err(SpecError::InvalidValue(format!("unknown audio codec '{}'", other))),
        }
    }
}

/// Output container, written with a leading dot in documents (`.mkv`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Container {
    Mp4,
    Mkv,
    Webm,
    Mov,
}

impl Container {
    pub fn extension(&self) -> &'static str {
        match self {
            Container::Mp4 => "mp4",
            Container::Mkv => "mkv",
            Container::Webm => "webm",
            Container::Mov => "mov",
        }
    }

    /// Container implied by a path's extension, if it is one we write.
    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|e| e.to_str())
            .and_then(|e| e.parse().ok())
    }

    pub fn video_codecs(&self) -> &'static [Codec] {
        match self {
            Container::Mp4 | Container::Mov => &[Codec::H264, Codec::Hevc],
            Container::Mkv => &[Codec::H264, Codec::Hevc, Codec::Vp9],
            Container::Webm => &[Codec::Vp9, Codec::Av1],
        }
    }

    pub fn audio_codecs(&self) -> &'static [AudioCodec] {
        match self {
            Container::Mp4 | Container::Mov => &[AudioCodec::Aac, AudioCodec::Copy],
            Container::Mkv => &[
                AudioCodec::Aac,
                AudioCodec::Flac,
                AudioCodec::Opus,
                AudioCodec::Libopus,
                AudioCodec::Copy,
            ],
            Container::Webm => &[AudioCodec::Opus, AudioCodec::Libopus],
        }
    }

    pub fn default_codec(&self) -> Codec {
        match self {
            Container::Mp4 | Container::Mov => Codec::H264,
            Container::Mkv => Codec::Hevc,
            Container::Webm => Codec::Vp9,
        }
    }

    pub fn default_audio(&self) -> AudioCodec {
        match self {
            Container::Webm => AudioCodec::Libopus,
            _ => AudioCodec::Aac,
        }
    }

    /// Rejects codec pairs the container cannot carry.
    pub fn check(&self, codec: Codec, audio: AudioCodec) -> Result<(), SpecError> {
        if !self.video_codecs().contains(&codec) {
            return Err(SpecError::IncompatibleContainer {
                container: *self,
                codec: codec.to_string(),
            });
        }
        if !self.audio_codecs().contains(&audio) {
            return Err(SpecError::IncompatibleContainer {
                container: *self,
                codec: audio.to_string(),
            });
        }
        Ok(())
    }
}

impl fmt::Display for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ".{}", self.extension())
    }
}

impl FromStr for Container {
    type Err = SpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_lowercase();
        match lower.trim_start_matches('.') {
            "mp4" => Ok(Container::Mp4),
            "mkv" => Ok(Container::Mkv),
            "webm" => Ok(Container::Webm),
            "mov" => Ok(Container::Mov),
            _ => Err(SpecError::InvalidValue(format!("unsupported container '{}'", s))),
        }
    }
}

impl TryFrom<String> for Container {
    type Error = SpecError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Container> for String {
    fn from(value: Container) -> Self {
        value.to_string()
    }
}

/// Named resolution buckets.
const BUCKETS: &[(&str, u32)] = &[
    ("360p", 360),
    ("480p", 480),
    ("720p", 720),
    ("1080p", 1080),
    ("2160p", 2160),
];

/// Target output size: a named bucket pinning only the height, or explicit
/// dimensions passed through unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Scale {
    Height(u32),
    Exact { width: u32, height: u32 },
}

impl Scale {
    pub fn height(&self) -> u32 {
        match self {
            Scale::Height(h) => *h,
            Scale::Exact { height, .. } => *height,
        }
    }

    /// Width argument for a scale filter; `-2` keeps the source aspect ratio
    /// with an even width.
    pub fn width_arg(&self) -> String {
        match self {
            Scale::Height(_) => "-2".to_string(),
            Scale::Exact { width, .. } => width.to_string(),
        }
    }

    /// Accepted bucket names, smallest first.
    pub fn bucket_names() -> impl Iterator<Item = &'static str> {
        BUCKETS.iter().map(|(name, _)| *name)
    }
}

impl fmt::Display for Scale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scale::Height(h) => match BUCKETS.iter().find(|(_, bh)| bh == h) {
                Some((name, _)) => f.write_str(name),
                None => write!(f, "{}p", h),
            },
            Scale::Exact { width, height } => write!(f, "{}x{}", width, height),
        }
    }
}

impl FromStr for Scale {
    type Err = SpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_lowercase();
        if let Some((_, height)) = BUCKETS.iter().find(|(name, _)| *name == lower) {
            return Ok(Scale::Height(*height));
        }

        let invalid = || {
            SpecError::InvalidValue(format!(
                "invalid scale '{}': expected one of {} or WxH",
                s,
                Scale::bucket_names().collect::<Vec<_>>().join(", ")
            ))
        };

        let (w, h) = lower.split_once('x').ok_or_else(invalid)?;
        let width: u32 = w.trim().parse().map_err(|_| invalid())?;
        let height: u32 = h.trim().parse().map_err(|_| invalid())?;
        if width == 0 || height == 0 {
            return Err(invalid());
        }
        Ok(Scale::Exact { width, height })
    }
}

impl TryFrom<String> for Scale {
    type Error = SpecError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Scale> for String {
    fn from(value: Scale) -> Self {
        value.to_string()
    }
}
