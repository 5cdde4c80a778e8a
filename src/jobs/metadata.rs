// Metadata job: ffprobe wrapper

use std::path::PathBuf;
use std::process::Command;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SiftError};
use crate::jobs::JobContext;
use crate::tools;

#[derive(Debug, Deserialize)]
struct FFprobeOutput {
    streams: Option<Vec<FFprobeStream>>,
    format: Option<FFprobeFormat>,
}

#[derive(Debug, Deserialize)]
struct FFprobeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<i64>,
    height: Option<i64>,
    r_frame_rate: Option<String>,
    avg_frame_rate: Option<String>,
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FFprobeFormat {
    duration: Option<String>,
    bit_rate: Option<String>,
}

/// Technical metadata of one media file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaProbe {
    pub duration_secs: f64,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub frame_rate: Option<f64>,
    pub bit_rate: Option<i64>,
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
}

impl MediaProbe {
    pub fn has_audio(&self) -> bool {
        self.audio_codec.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct MetadataJob {
    pub item_id: i64,
    pub path: PathBuf,
}

impl MetadataJob {
    pub fn new(item_id: i64, path: PathBuf) -> Self {
        Self { item_id, path }
    }

    pub fn is_cancellable(&self) -> bool {
        true
    }

    pub fn execute(&self, ctx: &JobContext) -> Result<MediaProbe> {
        let mut cmd = Command::new(tools::ffprobe_path());
        cmd.args([
            "-v", "quiet",
            "-print_format", "json",
            "-show_format",
            "-show_streams",
        ])
        .arg(&self.path);

        let output = tools::run_tool(cmd, "ffprobe", ctx)?;
        if !output.status.success() {
            return Err(SiftError::Probe(format!(
                "ffprobe exited with {}: {}",
                output.status,
                output.stderr_tail()
            )));
        }

        parse_probe_output(&output.stdout)
    }
}

/// Turn ffprobe JSON into a MediaProbe.
pub fn parse_probe_output(stdout: &[u8]) -> Result<MediaProbe> {
    let probe_output: FFprobeOutput = serde_json::from_slice(stdout)
        .map_err(|e| SiftError::Probe(format!("Failed to parse ffprobe output: {}", e)))?;

    let mut meta = MediaProbe::default();
    let mut duration: Option<f64> = None;

    if let Some(ref streams) = probe_output.streams {
        for stream in streams {
            match stream.codec_type.as_deref() {
                Some("video") if meta.video_codec.is_none() => {
                    meta.video_codec = stream.codec_name.as_ref().map(|c| c.to_lowercase());
                    meta.width = stream.width;
                    meta.height = stream.height;
                    meta.frame_rate = parse_frame_rate(stream.avg_frame_rate.as_deref())
                        .or_else(|| parse_frame_rate(stream.r_frame_rate.as_deref()));
                    if duration.is_none() {
                        duration = parse_seconds(stream.duration.as_deref());
                    }
                }
                Some("audio") if meta.audio_codec.is_none() => {
                    meta.audio_codec = stream.codec_name.as_ref().map(|c| c.to_lowercase());
                }
                _ => {}
            }
        }
    }

    if let Some(ref format) = probe_output.format {
        // Container duration covers all streams; prefer it
        if let Some(d) = parse_seconds(format.duration.as_deref()) {
            duration = Some(d);
        }
        meta.bit_rate = format.bit_rate.as_ref().and_then(|s| s.parse().ok());
    }

    if meta.video_codec.is_none() && meta.audio_codec.is_none() {
        return Err(SiftError::Probe("no audio or video streams".to_string()));
    }

    meta.duration_secs = duration
        .ok_or_else(|| SiftError::Probe("duration missing from ffprobe output".to_string()))?;
    Ok(meta)
}

/// Parse frame rate string like "30000/1001" to f64
fn parse_frame_rate(rate_str: Option<&str>) -> Option<f64> {
    let rate_str = rate_str?;
    if let Some((num, den)) = rate_str.split_once('/') {
        let num: f64 = num.parse().ok()?;
        let den: f64 = den.parse().ok()?;
        if den > 0.0 && num > 0.0 {
            return Some(num / den);
        }
        return None;
    }
    rate_str.parse().ok()
}

fn parse_seconds(s: Option<&str>) -> Option<f64> {
    let secs: f64 = s?.parse().ok()?;
    if secs.is_finite() && secs >= 0.0 {
        Some(secs)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "streams": [
            {"codec_type": "video", "codec_name": "H264", "width": 1920, "height": 1080,
             "r_frame_rate": "30000/1001", "avg_frame_rate": "30000/1001", "duration": "120.1"},
            {"codec_type": "audio", "codec_name": "aac"}
        ],
        "format": {"duration": "120.500000", "bit_rate": "8000000"}
    }"#;

    #[test]
    fn test_parse_full_probe() {
        let meta = parse_probe_output(SAMPLE.as_bytes()).unwrap();
        assert_eq!(meta.duration_secs, 120.5);
        assert_eq!(meta.width, Some(1920));
        assert_eq!(meta.height, Some(1080));
        assert_eq!(meta.video_codec.as_deref(), Some("h264"));
        assert_eq!(meta.audio_codec.as_deref(), Some("aac"));
        assert_eq!(meta.bit_rate, Some(8_000_000));
        assert!((meta.frame_rate.unwrap() - 29.97).abs() < 0.01);
        assert!(meta.has_audio());
    }

    #[test]
    fn test_silent_video_has_no_audio() {
        let json = r#"{"streams": [{"codec_type": "video", "codec_name": "vp9", "width": 640, "height": 360}],
                       "format": {"duration": "10"}}"#;
        let meta = parse_probe_output(json.as_bytes()).unwrap();
        assert!(!meta.has_audio());
        assert_eq!(meta.duration_secs, 10.0);
    }

    #[test]
    fn test_garbage_is_probe_error() {
        assert!(matches!(parse_probe_output(b"not json"), Err(SiftError::Probe(_))));
        assert!(matches!(parse_probe_output(b"{}"), Err(SiftError::Probe(_))));
    }

    #[test]
    fn test_parse_frame_rate() {
        assert_eq!(parse_frame_rate(Some("25/1")), Some(25.0));
        assert_eq!(parse_frame_rate(Some("0/0")), None);
        assert_eq!(parse_frame_rate(Some("24")), Some(24.0));
        assert_eq!(parse_frame_rate(None), None);
    }
}
