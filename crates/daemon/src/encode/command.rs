//! Command builder: turns an [`EncodeSpec`] plus [`Capabilities`] into the
//! ffmpeg argument vector.
//!
//! Pure and deterministic, so the software retry of a failed hardware attempt
//! can be rebuilt from the same spec.

use crate::capabilities::{Capabilities, HwAccel};
use crate::formats::{AudioCodec, Scale};
use crate::preset::{EncodeSpec, Quality, SpecError};

/// Program placed in `argv[0]` by [`build`].
pub const DEFAULT_PROGRAM: &str = "ffmpeg";

/// A concrete encoder invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodeCommand {
    /// Full argument vector, program first
    pub argv: Vec<String>,
    pub used_hardware: bool,
    /// Video encoder selected (e.g. `hevc_vaapi`, `libx265`)
    pub encoder: String,
}

impl EncodeCommand {
    /// Shell-like rendering for logs.
    pub fn display(&self) -> String {
        self.argv
            .iter()
            .map(|arg| {
                if arg.is_empty() || arg.contains(char::is_whitespace) {
                    format!("'{}'", arg)
                } else {
                    arg.clone()
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Build the invocation using the `ffmpeg` found on `PATH`.
pub fn build(spec: &EncodeSpec, capabilities: &Capabilities) -> Result<EncodeCommand, SpecError> {
    build_with_program(spec, capabilities, DEFAULT_PROGRAM)
}

/// Build the invocation for a specific ffmpeg binary.
pub fn build_with_program(
    spec: &EncodeSpec,
    capabilities: &Capabilities,
    program: &str,
) -> Result<EncodeCommand, SpecError> {
    spec.container.check(spec.codec, spec.audio_codec)?;

    let hardware = if spec.force_software {
        None
    } else {
        capabilities.hardware_encoder(spec.codec)
    };

    let mut args = Args::new(program);
    if spec.overwrite {
        args.push("-y");
    }

    let encoder = match hardware {
        Some((HwAccel::Vaapi, encoder)) => {
            let device = capabilities.device.as_deref().unwrap_or_default();
            args.pair("-hwaccel", "vaapi");
            args.pair("-hwaccel_device", device);
            args.pair("-init_hw_device", &format!("vaapi=va:{}", device));
            args.pair("-filter_hw_device", "va");
            args.input(spec);

            let mut filter = "format=nv12,hwupload".to_string();
            if let Some(scale) = &spec.scale {
                filter.push_str(&format!(
                    ",scale_vaapi=w={}:h={}",
                    scale.width_arg(),
                    scale.height()
                ));
            }
            args.pair("-vf", &filter);
            args.pair("-c:v", encoder);
            match &spec.quality {
                Quality::Crf(value) => args.pair("-qp", &value.to_string()),
                Quality::Bitrate(bitrate) => args.pair("-b:v", bitrate),
            }
            encoder
        }
        Some((HwAccel::Cuda, encoder)) => {
            let device = capabilities.device.as_deref().unwrap_or_default();
            args.pair("-hwaccel", "cuda");
            args.pair("-hwaccel_device", device);
            args.input(spec);

            if let Some(scale) = &spec.scale {
                args.pair("-vf", &scale_filter("scale_cuda", scale));
            }
            args.pair("-c:v", encoder);
            match &spec.quality {
                Quality::Crf(value) => args.pair("-cq", &value.to_string()),
                Quality::Bitrate(bitrate) => args.pair("-b:v", bitrate),
            }
            args.pair("-rc:v", "vbr");
            args.pair("-spatial_aq:v", "1");
            args.pair("-temporal_aq:v", "1");
            args.pair("-gpu", device);
            encoder
        }
        None => {
            let encoder = capabilities.software_encoder(spec.codec);
            args.input(spec);
            if let Some(scale) = &spec.scale {
                args.pair("-vf", &scale_filter("scale", scale));
            }
            args.pair("-c:v", encoder);
            match &spec.quality {
                Quality::Crf(value) => args.pair("-crf", &value.to_string()),
                Quality::Bitrate(bitrate) => args.pair("-b:v", bitrate),
            }
            encoder
        }
    };

    args.pair("-c:a", spec.audio_codec.as_str());
    if spec.audio_codec.is_opus() {
        args.pair("-ac", "2");
    }
    if let Some(bitrate) = spec.audio_bitrate.as_deref() {
        if spec.audio_codec.accepts_bitrate() {
            args.pair("-b:a", bitrate);
        }
    }
    if let (AudioCodec::Flac, Some(level)) = (spec.audio_codec, spec.flac_compression) {
        args.pair("-compression_level", &level.to_string());
    }

    args.pair("-progress", "pipe:1");
    args.push("-nostats");
    args.push(&spec.output.to_string_lossy());

    Ok(EncodeCommand {
        argv: args.0,
        used_hardware: hardware.is_some(),
        encoder: encoder.to_string(),
    })
}

fn scale_filter(name: &str, scale: &Scale) -> String {
    format!("{}={}:{}", name, scale.width_arg(), scale.height())
}

struct Args(Vec<String>);

impl Args {
    fn new(program: &str) -> Self {
        Self(vec![program.to_string()])
    }

    fn push(&mut self, arg: &str) {
        self.0.push(arg.to_string());
    }

    fn pair(&mut self, flag: &str, value: &str) {
        self.push(flag);
        self.push(value);
    }

    fn input(&mut self, spec: &EncodeSpec) {
        self.push("-i");
        self.push(&spec.input.to_string_lossy());
    }
}
