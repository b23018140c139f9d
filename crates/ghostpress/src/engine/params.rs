//! Translation of user-facing compression settings into engine arguments.
//!
//! The quality formulas are part of the settings contract: a given quality
//! must always map to the same encoder parameter.

use std::path::Path;

use crate::job::{CompressionRequest, CompressionSettings, MediaKind, ORIGINAL_FORMAT};

/// Constant rate factor for video. Quality 100 → 18, quality 0 → 51.
pub fn video_crf(quality: u8) -> u8 {
    let quality = f64::from(quality.min(100));
    (51.0 - (quality / 100.0) * 33.0).round() as u8
}

/// `-q:v` scale for image encoders, where lower means better.
/// Quality 100 → 0, quality 0 → 33.
pub fn image_qscale(quality: u8) -> u8 {
    let quality = f64::from(quality.min(100));
    ((100.0 - quality) / 3.0).round() as u8
}

/// Video encoder selection, taken from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoCodecOptions {
    pub codec: String,
    pub preset: String,
}

impl Default for VideoCodecOptions {
    fn default() -> Self {
        Self {
            codec: "libx264".to_string(),
            preset: "ultrafast".to_string(),
        }
    }
}

/// A fully resolved engine call for one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineInvocation {
    pub input_name: String,
    pub output_name: String,
    pub args: Vec<String>,
}

/// Scratch file name holding the source of a job.
pub fn input_name(request: &CompressionRequest) -> String {
    let extension = request
        .source_extension()
        .unwrap_or_else(|| "bin".to_string());
    format!("input_{}.{}", request.job_id.short(), extension)
}

/// Scratch file name the engine writes the result to.
pub fn output_name(request: &CompressionRequest) -> String {
    format!(
        "output_{}.{}",
        request.job_id.short(),
        output_extension(request)
    )
}

/// Extension of the produced file: the target format, or the source's own
/// extension when the target is `original`.
pub fn output_extension(request: &CompressionRequest) -> String {
    result_extension(&request.file_name, request.media_kind, &request.settings)
}

/// Extension of the compressed file for a source named `file_name`.
pub fn result_extension(file_name: &str, kind: MediaKind, settings: &CompressionSettings) -> String {
    let target = settings.target_format.as_str();
    if !target.is_empty() && target != ORIGINAL_FORMAT {
        return target.to_string();
    }
    Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_else(|| match kind {
            MediaKind::Video => "mp4".to_string(),
            _ => "jpg".to_string(),
        })
}

pub fn build_invocation(request: &CompressionRequest, video: &VideoCodecOptions) -> EngineInvocation {
    let input_name = input_name(request);
    let output_name = output_name(request);
    let settings = &request.settings;

    let mut args = vec!["-i".to_string(), input_name.clone()];

    match request.media_kind {
        MediaKind::Video => {
            args.extend([
                "-c:v".to_string(),
                video.codec.clone(),
                "-preset".to_string(),
                video.preset.clone(),
                "-crf".to_string(),
                video_crf(settings.quality).to_string(),
            ]);
            if let Some(filter) = scale_filter(settings.effective_scale()) {
                args.extend(["-vf".to_string(), filter]);
            }
            if settings.strip_metadata {
                args.extend(["-map_metadata".to_string(), "-1".to_string()]);
            }
        }
        MediaKind::Image | MediaKind::Other => {
            args.extend([
                "-q:v".to_string(),
                image_qscale(settings.quality).to_string(),
            ]);
            if let Some(filter) = scale_filter(settings.effective_scale()) {
                args.extend(["-vf".to_string(), filter]);
            }
        }
    }

    args.push(output_name.clone());

    EngineInvocation {
        input_name,
        output_name,
        args,
    }
}

/// Downscale keeping even dimensions, which chroma-subsampled encoders require.
fn scale_filter(scale: Option<f32>) -> Option<String> {
    scale.map(|s| format!("scale=trunc(iw*{s}/2)*2:-2"))
}
