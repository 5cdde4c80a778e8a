// Fingerprint job
//
// Audio: fpcalc raw signed sub-fingerprints over the full length.
// Visual: one ffmpeg decode pass sampling a frame every 2s, scaled to a 9x8
// gray grid and streamed as raw bytes, hashed frame by frame.

use std::path::PathBuf;
use std::process::Command;

use crate::constants::VISUAL_SAMPLE_INTERVAL_SECS;
use crate::error::{Result, SiftError};
use crate::fingerprint::{self, FingerprintMode, FingerprintType, DHASH_FRAME_BYTES};
use crate::jobs::JobContext;
use crate::tools;
use crate::constants::{DHASH_HEIGHT, DHASH_WIDTH};

#[derive(Debug, Clone, PartialEq)]
pub struct FingerprintOutput {
    pub audio: Option<Vec<i32>>,
    pub visual: Option<Vec<u64>>,
    pub fingerprint_type: FingerprintType,
}

#[derive(Debug, Clone)]
pub struct FingerprintJob {
    pub item_id: i64,
    pub path: PathBuf,
    pub has_audio: bool,
    pub mode: FingerprintMode,
}

impl FingerprintJob {
    pub fn is_cancellable(&self) -> bool {
        true
    }

    pub fn execute(&self, ctx: &JobContext) -> Result<FingerprintOutput> {
        let plan = fingerprint::extraction_plan(self.has_audio, self.mode);

        let mut audio = None;
        if plan.audio {
            match self.extract_audio(ctx) {
                Ok(fp) if !fp.is_empty() => audio = Some(fp),
                Ok(_) => log::warn!("Item {}: empty audio fingerprint", self.item_id),
                Err(SiftError::Extraction(msg)) => {
                    log::warn!("Item {}: audio fingerprint failed: {}", self.item_id, msg)
                }
                Err(e) => return Err(e),
            }
        }

        // An audio track that yields nothing still needs some fingerprint
        let mut visual = None;
        if plan.visual || audio.is_none() {
            let fp = self.extract_visual(ctx)?;
            if !fp.is_empty() {
                visual = Some(fp);
            }
        }

        let fingerprint_type = FingerprintType::from_presence(audio.is_some(), visual.is_some())
            .ok_or_else(|| SiftError::Extraction("no fingerprint could be extracted".to_string()))?;

        Ok(FingerprintOutput {
            audio,
            visual,
            fingerprint_type,
        })
    }

    fn extract_audio(&self, ctx: &JobContext) -> Result<Vec<i32>> {
        let mut cmd = Command::new(tools::fpcalc_path());
        cmd.args(["-raw", "-signed", "-length", "0"]).arg(&self.path);

        let output = tools::run_tool(cmd, "fpcalc", ctx)?;
        if !output.status.success() {
            return Err(SiftError::Extraction(format!(
                "fpcalc exited with {}: {}",
                output.status,
                output.stderr_tail()
            )));
        }
        parse_fpcalc_output(&String::from_utf8_lossy(&output.stdout))
    }

    fn extract_visual(&self, ctx: &JobContext) -> Result<Vec<u64>> {
        let filter = format!(
            "fps=1/{},scale={}:{}:flags=area,format=gray",
            VISUAL_SAMPLE_INTERVAL_SECS, DHASH_WIDTH, DHASH_HEIGHT
        );
        let mut cmd = Command::new(tools::ffmpeg_path());
        cmd.args(["-v", "error", "-nostdin", "-i"])
            .arg(&self.path)
            .args(["-an", "-vf", &filter, "-f", "rawvideo", "-pix_fmt", "gray", "-"]);

        let mut hasher = FrameHasher::default();
        let (status, stderr) = tools::run_tool_streaming(cmd, "ffmpeg", ctx, |chunk| hasher.push(chunk))?;

        if !status.success() {
            let tail: Vec<&str> = stderr.lines().rev().take(5).collect();
            return Err(SiftError::Extraction(format!(
                "ffmpeg frame stream exited with {}: {}",
                status,
                tail.into_iter().rev().collect::<Vec<_>>().join(" | ")
            )));
        }
        Ok(hasher.finish())
    }
}

/// Pull the FINGERPRINT= line out of fpcalc output.
pub fn parse_fpcalc_output(stdout: &str) -> Result<Vec<i32>> {
    let line = stdout
        .lines()
        .find_map(|l| l.trim().strip_prefix("FINGERPRINT="))
        .ok_or_else(|| SiftError::Extraction("fpcalc output has no FINGERPRINT line".to_string()))?;

    if line.trim().is_empty() {
        return Ok(Vec::new());
    }
    line.split(',')
        .map(|v| {
            v.trim()
                .parse::<i32>()
                .map_err(|e| SiftError::Extraction(format!("bad sub-fingerprint '{}': {}", v, e)))
        })
        .collect()
}

/// Splits a raw gray byte stream into frames and hashes each one.
#[derive(Debug, Default)]
pub struct FrameHasher {
    pending: Vec<u8>,
    hashes: Vec<u64>,
}

impl FrameHasher {
    pub fn push(&mut self, bytes: &[u8]) -> Result<()> {
        self.pending.extend_from_slice(bytes);
        let whole = self.pending.len() / DHASH_FRAME_BYTES * DHASH_FRAME_BYTES;
        for frame in self.pending[..whole].chunks_exact(DHASH_FRAME_BYTES) {
            self.hashes.push(fingerprint::dhash(frame)?);
        }
        self.pending.drain(..whole);
        Ok(())
    }

    /// Hashes of all complete frames. A trailing partial frame is dropped.
    pub fn finish(self) -> Vec<u64> {
        if !self.pending.is_empty() {
            log::debug!("Dropping {} trailing bytes of a partial frame", self.pending.len());
        }
        self.hashes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_fpcalc() {
        let out = "DURATION=183\nFINGERPRINT=-12,34,2147483647,-2147483648\n";
        assert_eq!(parse_fpcalc_output(out).unwrap(), vec![-12, 34, i32::MAX, i32::MIN]);
    }

    #[test]
    fn test_parse_fpcalc_empty_and_missing() {
        assert!(parse_fpcalc_output("DURATION=1\nFINGERPRINT=\n").unwrap().is_empty());
        assert!(matches!(parse_fpcalc_output("DURATION=1\n"), Err(SiftError::Extraction(_))));
        assert!(parse_fpcalc_output("FINGERPRINT=1,x").is_err());
    }

    #[test]
    fn test_frame_hasher_handles_split_chunks() {
        let mut frame_a = [0u8; DHASH_FRAME_BYTES];
        frame_a[0] = 255;
        let frame_b = [7u8; DHASH_FRAME_BYTES];
        let mut stream = Vec::new();
        stream.extend_from_slice(&frame_a);
        stream.extend_from_slice(&frame_b);
        stream.extend_from_slice(&[1, 2, 3]);

        let mut hasher = FrameHasher::default();
        for piece in stream.chunks(13) {
            hasher.push(piece).unwrap();
        }
        assert_eq!(hasher.finish(), vec![1u64 << 63, 0]);
    }
}
