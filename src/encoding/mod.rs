// Lossless video encoding through an external encoder process
//
// This module defines the supported codecs and the settings used to build
// the encoder command line. To add a new codec:
// 1. Add variant to VideoCodec enum
// 2. Add the encoder's codec name in encoder_name()
// 3. Check the built-in argument list in EncoderSettings::arguments()

pub mod encoder;

pub use encoder::{EncoderError, EncoderPipeline, EncoderStats};

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::devices::Resolution;

/// Supported lossless codecs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    /// FFV1 - intra-only lossless, the default for 16-bit depth
    #[default]
    Ffv1,
    /// H.264 at a fixed rate factor
    H264,
}

impl VideoCodec {
    /// Name passed to the encoder's `-vcodec`
    pub fn encoder_name(&self) -> &'static str {
        match self {
            VideoCodec::Ffv1 => "ffv1",
            VideoCodec::H264 => "h264",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            VideoCodec::Ffv1 => "FFV1",
            VideoCodec::H264 => "H.264",
        }
    }
}

/// Raw pixel layouts written to the encoder input
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// 16-bit grayscale, little-endian samples
    #[default]
    Gray16le,
}

impl PixelFormat {
    /// Name passed to the encoder's `-pix_fmt`
    pub fn name(&self) -> &'static str {
        match self {
            PixelFormat::Gray16le => "gray16le",
        }
    }

    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Gray16le => 2,
        }
    }

    /// Size of one frame in bytes
    pub fn frame_bytes(&self, size: Resolution) -> usize {
        size.pixel_count() * self.bytes_per_pixel()
    }
}

/// Encoder process settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncoderSettings {
    /// Encoder executable
    #[serde(default = "default_program")]
    pub program: PathBuf,

    #[serde(default)]
    pub codec: VideoCodec,

    /// Constant rate factor
    #[serde(default = "default_crf")]
    pub crf: u32,

    #[serde(default = "default_preset")]
    pub preset: String,

    #[serde(default = "default_threads")]
    pub threads: u32,

    /// Slices for parallel encoding
    #[serde(default = "default_slices")]
    pub slices: u32,

    /// Protect slices with a CRC
    #[serde(default = "default_slicecrc")]
    pub slicecrc: u32,

    #[serde(default = "default_fps")]
    pub fps: u32,

    /// Replaces the built-in argument list. Placeholders `{output}`,
    /// `{size}`, `{pix_fmt}` and `{fps}` are substituted per stream.
    #[serde(default)]
    pub custom_args: Option<Vec<String>>,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            program: default_program(),
            codec: VideoCodec::default(),
            crf: default_crf(),
            preset: default_preset(),
            threads: default_threads(),
            slices: default_slices(),
            slicecrc: default_slicecrc(),
            fps: default_fps(),
            custom_args: None,
        }
    }
}

impl EncoderSettings {
    /// Arguments for one output stream
    pub fn arguments(&self, output: &Path, pixel_format: PixelFormat, size: Resolution) -> Vec<String> {
        let output = output.to_string_lossy().to_string();

        if let Some(template) = &self.custom_args {
            return template
                .iter()
                .map(|arg| {
                    arg.replace("{output}", &output)
                        .replace("{size}", &size.size_arg())
                        .replace("{pix_fmt}", pixel_format.name())
                        .replace("{fps}", &self.fps.to_string())
                })
                .collect();
        }

        let fps = self.fps.to_string();
        vec![
            "-y".into(),
            "-loglevel".into(),
            "fatal".into(),
            "-framerate".into(),
            fps.clone(),
            "-f".into(),
            "rawvideo".into(),
            "-s".into(),
            size.size_arg(),
            "-pix_fmt".into(),
            pixel_format.name().into(),
            "-i".into(),
            "-".into(),
            "-an".into(),
            "-crf".into(),
            self.crf.to_string(),
            "-vcodec".into(),
            self.codec.encoder_name().into(),
            "-preset".into(),
            self.preset.clone(),
            "-threads".into(),
            self.threads.to_string(),
            "-slices".into(),
            self.slices.to_string(),
            "-slicecrc".into(),
            self.slicecrc.to_string(),
            "-r".into(),
            fps,
            output,
        ]
    }
}

fn default_program() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_crf() -> u32 {
    10
}

fn default_preset() -> String {
    "ultrafast".to_string()
}

fn default_threads() -> u32 {
    6
}

fn default_slices() -> u32 {
    24
}

fn default_slicecrc() -> u32 {
    1
}

fn default_fps() -> u32 {
    30
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_arguments_describe_raw_input() {
        let args = EncoderSettings::default().arguments(
            Path::new("/tmp/depth.avi"),
            PixelFormat::Gray16le,
            Resolution::new(640, 576),
        );
        let joined = args.join(" ");
        assert!(joined.contains("-f rawvideo -s 640x576 -pix_fmt gray16le -i -"));
        assert!(joined.contains("-vcodec ffv1"));
        assert!(joined.contains("-slices 24 -slicecrc 1"));
        assert_eq!(args.last().map(String::as_str), Some("/tmp/depth.avi"));
    }

    #[test]
    fn custom_template_substitutes_placeholders() {
        let settings = EncoderSettings {
            custom_args: Some(vec![
                "--size={size}".into(),
                "--fmt={pix_fmt}".into(),
                "--rate={fps}".into(),
                "{output}".into(),
            ]),
            fps: 15,
            ..Default::default()
        };
        let args = settings.arguments(Path::new("ir.avi"), PixelFormat::Gray16le, Resolution::new(4, 2));
        assert_eq!(args, vec!["--size=4x2", "--fmt=gray16le", "--rate=15", "ir.avi"]);
    }

    #[test]
    fn frame_bytes_counts_two_bytes_per_sample() {
        assert_eq!(
            PixelFormat::Gray16le.frame_bytes(Resolution::new(640, 576)),
            640 * 576 * 2
        );
    }
}
