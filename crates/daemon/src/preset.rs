//! Preset collections and resolution of presets plus overrides into an
//! [`EncodeSpec`].
//!
//! Every field is merged with the precedence override > preset > container
//! default. The result is validated once here; the command builder only
//! re-checks container compatibility.

use crate::formats::{AudioCodec, Codec, Container, Scale};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Quality used when neither a CRF nor a bitrate is configured.
pub const DEFAULT_CRF: u8 = 28;

const MAX_CRF: u8 = 51;
const MAX_FLAC_COMPRESSION: u8 = 8;

/// Validation errors raised before a job exists.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SpecError {
    #[error("preset '{0}' not found")]
    InvalidPreset(String),

    #[error("crf ({crf}) and bitrate ({bitrate}) are mutually exclusive")]
    ConflictingQuality { crf: u8, bitrate: String },

    #[error("incomplete encode spec: {0}")]
    IncompleteSpec(String),

    #[error("{codec} is not supported in {container} containers")]
    IncompatibleContainer { container: Container, codec: String },

    #[error("invalid value: {0}")]
    InvalidValue(String),
}

/// Errors loading a preset collection document.
#[derive(Debug, Error)]
pub enum PresetError {
    #[error("failed to read preset file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse preset file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("preset '{name}' is invalid: {source}")]
    Invalid {
        name: String,
        #[source]
        source: SpecError,
    },
}

/// A partially specified set of encode options.
///
/// Used both for the entries of a preset collection and for per-job
/// overrides. Absent fields defer to the next layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EncodeOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<Container>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub codec: Option<Codec>,
    /// Named bucket or `WxH`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<Scale>,
    /// Explicit `WxH`, preferred over `scale` within the same layer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<Scale>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_codec: Option<AudioCodec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_bitrate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flac_compression: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crf: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bitrate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_fallback: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub force_software: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overwrite: Option<bool>,
}

impl EncodeOptions {
    fn layer_scale(&self) -> Option<Scale> {
        self.dimensions.or(self.scale)
    }

    /// Field-wise merge where `self` wins over `base`.
    pub fn merged_over(&self, base: &EncodeOptions) -> EncodeOptions {
        let scale = self.layer_scale().or(base.layer_scale());
        EncodeOptions {
            container: self.container.or(base.container),
            codec: self.codec.or(base.codec),
            scale,
            dimensions: None,
            audio_codec: self.audio_codec.or(base.audio_codec),
            audio_bitrate: self.audio_bitrate.clone().or_else(|| base.audio_bitrate.clone()),
            flac_compression: self.flac_compression.or(base.flac_compression),
            crf: self.crf.or(base.crf),
            bitrate: self.bitrate.clone().or_else(|| base.bitrate.clone()),
            allow_fallback: self.allow_fallback.or(base.allow_fallback),
            force_software: self.force_software.or(base.force_software),
            overwrite: self.overwrite.or(base.overwrite),
        }
    }
}

/// Rate control for the video stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quality {
    Crf(u8),
    Bitrate(String),
}

/// Fully resolved, job-specific encode parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodeSpec {
    pub input: PathBuf,
    pub output: PathBuf,
    pub container: Container,
    pub codec: Codec,
    pub scale: Option<Scale>,
    pub audio_codec: AudioCodec,
    pub audio_bitrate: Option<String>,
    pub flac_compression: Option<u8>,
    pub quality: Quality,
    pub allow_fallback: bool,
    pub force_software: bool,
    pub overwrite: bool,
}

impl EncodeSpec {
    /// Copy of this spec pinned to the software path.
    pub fn forcing_software(&self) -> EncodeSpec {
        EncodeSpec {
            force_software: true,
            ..self.clone()
        }
    }
}

/// Where the output of a job goes.
#[derive(Debug, Clone, Copy)]
pub enum OutputTarget<'a> {
    /// Write exactly here; the extension may imply the container.
    Path(&'a Path),
    /// Write `<stem> (<label>).<ext>` inside this directory.
    Directory(&'a Path),
}

/// Named presets loaded from a `{"presets": {...}}` document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PresetCollection {
    #[serde(default)]
    pub presets: BTreeMap<String, EncodeOptions>,
}

impl PresetCollection {
    /// Parse and validate a preset collection document.
    pub fn from_json(json: &str) -> Result<Self, PresetError> {
        let collection: PresetCollection = serde_json::from_str(json)?;
        collection.validate()?;
        Ok(collection)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, PresetError> {
        let content = fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn get(&self, name: &str) -> Option<&EncodeOptions> {
        self.presets.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.presets.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.presets.is_empty()
    }

    /// Every preset must name a container and resolve on its own.
    pub fn validate(&self) -> Result<(), PresetError> {
        let placeholder = Path::new("input");
        for (name, preset) in &self.presets {
            let invalid = |source| PresetError::Invalid {
                name: name.clone(),
                source,
            };
            if preset.container.is_none() {
                return Err(invalid(SpecError::IncompleteSpec(
                    "missing required 'container' field".to_string(),
                )));
            }
            resolve_options(
                Some((name.as_str(), preset)),
                &EncodeOptions::default(),
                placeholder,
                OutputTarget::Directory(Path::new(".")),
            )
            .map_err(invalid)?;
        }
        Ok(())
    }
}

/// Resolve a named preset from `collection` plus `overrides` into an
/// [`EncodeSpec`].
///
/// Fails with [`SpecError::InvalidPreset`] when `preset_name` is given but
/// not present in `collection` (or no collection is available).
pub fn resolve(
    preset_name: Option<&str>,
    collection: Option<&PresetCollection>,
    overrides: &EncodeOptions,
    input: &Path,
    output: OutputTarget<'_>,
) -> Result<EncodeSpec, SpecError> {
    let preset = match preset_name {
        Some(name) => {
            let preset = collection
                .and_then(|c| c.get(name))
                .ok_or_else(|| SpecError::InvalidPreset(name.to_string()))?;
            Some((name, preset))
        }
        None => None,
    };
    resolve_options(preset, overrides, input, output)
}

/// Resolve an optional `(label, preset)` layer plus `overrides`.
pub fn resolve_options(
    preset: Option<(&str, &EncodeOptions)>,
    overrides: &EncodeOptions,
    input: &Path,
    output: OutputTarget<'_>,
) -> Result<EncodeSpec, SpecError> {
    let empty = EncodeOptions::default();
    let (label, base) = match preset {
        Some((name, options)) => (Some(name), options),
        None => (None, &empty),
    };
    let merged = overrides.merged_over(base);

    let container = match (merged.container, output) {
        (Some(container), _) => container,
        (None, OutputTarget::Path(path)) => Container::from_path(path).ok_or_else(|| {
            SpecError::IncompleteSpec(format!(
                "no container given and none implied by '{}'",
                path.display()
            ))
        })?,
        (None, OutputTarget::Directory(_)) => {
            return Err(SpecError::IncompleteSpec(
                "no container given by preset or overrides".to_string(),
            ))
        }
    };
    let codec = merged.codec.unwrap_or_else(|| container.default_codec());
    let audio_codec = merged.audio_codec.unwrap_or_else(|| container.default_audio());

    let quality = resolve_quality(merged.crf, merged.bitrate)?;
    validate_audio(audio_codec, merged.audio_bitrate.as_deref(), merged.flac_compression)?;
    container.check(codec, audio_codec)?;

    let output = match output {
        OutputTarget::Path(path) => {
            if let Some(implied) = Container::from_path(path) {
                if implied != container {
                    return Err(SpecError::InvalidValue(format!(
                        "output '{}' does not match container {}",
                        path.display(),
                        container
                    )));
                }
            }
            path.to_path_buf()
        }
        OutputTarget::Directory(dir) => {
            dir.join(output_file_name(input, label.unwrap_or(codec.as_str()), container))
        }
    };

    Ok(EncodeSpec {
        input: input.to_path_buf(),
        output,
        container,
        codec,
        scale: merged.scale,
        audio_codec,
        audio_bitrate: merged.audio_bitrate,
        flac_compression: merged.flac_compression,
        quality,
        allow_fallback: merged.allow_fallback.unwrap_or(true),
        force_software: merged.force_software.unwrap_or(false),
        overwrite: merged.overwrite.unwrap_or(true),
    })
}

/// `<stem> (<label>).<ext>`
pub fn output_file_name(input: &Path, label: &str, container: Container) -> String {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    format!("{} ({}).{}", stem, label, container.extension())
}

fn resolve_quality(crf: Option<u8>, bitrate: Option<String>) -> Result<Quality, SpecError> {
    match (crf, bitrate) {
        (Some(crf), Some(bitrate)) => Err(SpecError::ConflictingQuality { crf, bitrate }),
        (Some(crf), None) => {
            if crf > MAX_CRF {
                return Err(SpecError::InvalidValue(format!(
                    "crf must be between 0 and {}, got {}",
                    MAX_CRF, crf
                )));
            }
            Ok(Quality::Crf(crf))
        }
        (None, Some(bitrate)) => {
            validate_bitrate("bitrate", &bitrate)?;
            Ok(Quality::Bitrate(bitrate))
        }
        (None, None) => Ok(Quality::Crf(DEFAULT_CRF)),
    }
}

fn validate_audio(
    audio: AudioCodec,
    bitrate: Option<&str>,
    flac_compression: Option<u8>,
) -> Result<(), SpecError> {
    if let Some(bitrate) = bitrate {
        if audio == AudioCodec::Copy {
            return Err(SpecError::InvalidValue(
                "audio bitrate cannot be used when copying audio".to_string(),
            ));
        }
        if !audio.accepts_bitrate() {
            return Err(SpecError::InvalidValue(format!(
                "audio bitrate is only valid for aac and opus, not {}",
                audio
            )));
        }
        validate_bitrate("audio bitrate", bitrate)?;
    }

    if let Some(level) = flac_compression {
        if audio != AudioCodec::Flac {
            return Err(SpecError::InvalidValue(
                "flac compression is only valid with the flac audio codec".to_string(),
            ));
        }
        if level > MAX_FLAC_COMPRESSION {
            return Err(SpecError::InvalidValue(format!(
                "flac compression must be between 0 and {}, got {}",
                MAX_FLAC_COMPRESSION, level
            )));
        }
    }
    Ok(())
}

/// Bitrates are a positive number followed by `k` or `M` (e.g. `4M`, `192k`).
fn validate_bitrate(field: &str, value: &str) -> Result<(), SpecError> {
    let invalid = || {
        SpecError::InvalidValue(format!(
            "{} must be a number ending in 'k' or 'M', got '{}'",
            field, value
        ))
    };
    let number = value
        .strip_suffix('k')
        .or_else(|| value.strip_suffix('M'))
        .ok_or_else(invalid)?;
    match number.parse::<f64>() {
        Ok(n) if n > 0.0 && n.is_finite() => Ok(()),
        _ => Err(invalid()),
    }
}
