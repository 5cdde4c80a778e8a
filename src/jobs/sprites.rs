// Sprites job
//
// Samples one frame every `interval_secs`, tiles the frames into paged grid
// sheets and writes a WebVTT cue file mapping time ranges to sheet regions.
// Frame extraction runs with its own bounded parallelism, independent of the
// worker pool that runs the job.

use std::path::{Path, PathBuf};
use std::process::Command;

use rayon::prelude::*;

use crate::config::SpriteOptions;
use crate::error::{Result, SiftError};
use crate::jobs::thumbnail::{format_timestamp, jpeg_qscale};
use crate::jobs::JobContext;
use crate::tools;

#[derive(Debug, Clone, PartialEq)]
pub struct SpriteOutput {
    pub vtt_path: PathBuf,
    pub sheet_paths: Vec<PathBuf>,
    pub frame_count: u32,
}

/// Layout of one sprite sheet
#[derive(Debug, Clone, PartialEq)]
pub struct SpritePage {
    pub page_index: u32,
    pub start_frame: u32,
    pub frames_this_page: u32,
    pub columns: u32,
    pub rows: u32,
}

/// Layout of the whole sprite set
#[derive(Debug, Clone, PartialEq)]
pub struct SpriteLayout {
    pub frame_count: u32,
    pub interval_ms: u64,
    pub tile_width: u32,
    pub tile_height: u32,
    pub pages: Vec<SpritePage>,
}

#[derive(Debug, Clone)]
pub struct SpritesJob {
    pub item_id: i64,
    pub path: PathBuf,
    pub duration_secs: f64,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub output_dir: PathBuf,
    pub options: SpriteOptions,
}

impl SpritesJob {
    pub fn is_cancellable(&self) -> bool {
        true
    }

    pub fn execute(&self, ctx: &JobContext) -> Result<SpriteOutput> {
        let layout = calculate_layout(self.duration_secs, self.width, self.height, &self.options)?;

        let item_dir = self.output_dir.join(self.item_id.to_string());
        let frames_dir = item_dir.join(".frames");
        std::fs::create_dir_all(&frames_dir)?;

        let result = self.render(ctx, &layout, &item_dir, &frames_dir);
        let _ = std::fs::remove_dir_all(&frames_dir);
        result
    }

    fn render(&self, ctx: &JobContext, layout: &SpriteLayout, item_dir: &Path, frames_dir: &Path) -> Result<SpriteOutput> {
        self.extract_frames(ctx, layout, frames_dir)?;

        let mut sheet_paths = Vec::with_capacity(layout.pages.len());
        for page in &layout.pages {
            let sheet = item_dir.join(format!("sprite_p{}.jpg", page.page_index));
            tile_page(ctx, frames_dir, &sheet, page, self.options.quality)?;
            sheet_paths.push(sheet);
        }

        let sheet_names: Vec<String> = sheet_paths
            .iter()
            .map(|p| {
                p.file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| "sprite.jpg".to_string())
            })
            .collect();
        let vtt = generate_vtt(layout, &sheet_names, self.duration_secs);

        let vtt_path = item_dir.join("sprite.vtt");
        let tmp_vtt = vtt_path.with_extension("tmp.vtt");
        std::fs::write(&tmp_vtt, vtt)?;
        std::fs::rename(&tmp_vtt, &vtt_path)?;

        Ok(SpriteOutput {
            vtt_path,
            sheet_paths,
            frame_count: layout.frame_count,
        })
    }

    /// Extract every sample frame, `extract_concurrency` at a time.
    fn extract_frames(&self, ctx: &JobContext, layout: &SpriteLayout, frames_dir: &Path) -> Result<()> {
        let threads = self.options.extract_concurrency.max(1).min(layout.frame_count as usize);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("sprite-extract-{}", i))
            .build()
            .map_err(|e| SiftError::Other(format!("frame extraction pool: {}", e)))?;

        pool.install(|| {
            (0..layout.frame_count).into_par_iter().try_for_each(|i| {
                ctx.check()?;
                let at = (i as u64 * layout.interval_ms) as f64 / 1000.0;
                let out = frames_dir.join(format!("frame_{:05}.jpg", i));
                extract_one(ctx, &self.path, &out, at, layout, self.options.quality)
            })
        })
    }
}

/// Compute the paged sheet layout for an item.
pub fn calculate_layout(
    duration_secs: f64,
    width: Option<i64>,
    height: Option<i64>,
    options: &SpriteOptions,
) -> Result<SpriteLayout> {
    if duration_secs <= 0.0 {
        return Err(SiftError::PrerequisiteNotMet("sprites need a positive duration".to_string()));
    }
    if options.interval_secs <= 0.0 || options.columns == 0 || options.rows_per_sheet == 0 {
        return Err(SiftError::Invalid("sprite interval, columns and rows must be positive".to_string()));
    }

    let natural = (duration_secs / options.interval_secs).ceil() as u32;
    let frame_count = natural.clamp(1, options.max_frames.max(1));

    // Capped sets spread their frames over the whole duration
    let interval_ms = if frame_count < natural {
        ((duration_secs * 1000.0) / frame_count as f64) as u64
    } else {
        (options.interval_secs * 1000.0) as u64
    };

    let tile_height = match (width, height) {
        (Some(w), Some(h)) if w > 0 && h > 0 => {
            let h = (options.tile_width as f64 * h as f64 / w as f64).round() as u32;
            (h + 1) & !1
        }
        _ => (options.tile_width as f64 * 9.0 / 16.0) as u32,
    };

    let per_page = options.columns * options.rows_per_sheet;
    let page_count = (frame_count + per_page - 1) / per_page;
    let mut pages = Vec::with_capacity(page_count as usize);
    for page_index in 0..page_count {
        let start_frame = page_index * per_page;
        let frames_this_page = (frame_count - start_frame).min(per_page);
        let columns = options.columns.min(frames_this_page);
        let rows = (frames_this_page + columns - 1) / columns;
        pages.push(SpritePage {
            page_index,
            start_frame,
            frames_this_page,
            columns,
            rows,
        });
    }

    Ok(SpriteLayout {
        frame_count,
        interval_ms,
        tile_width: options.tile_width,
        tile_height,
        pages,
    })
}

fn extract_one(ctx: &JobContext, source: &Path, out: &Path, at_secs: f64, layout: &SpriteLayout, quality: u32) -> Result<()> {
    let scale = format!("scale={}:{}", layout.tile_width, layout.tile_height);
    let mut cmd = Command::new(tools::ffmpeg_path());
    cmd.args(["-y", "-v", "error", "-ss", &format_timestamp(at_secs), "-i"])
        .arg(source)
        .args(["-frames:v", "1", "-vf", &scale, "-q:v", &jpeg_qscale(quality).to_string()])
        .arg(out);

    let output = tools::run_tool(cmd, "ffmpeg", ctx)?;
    if !output.status.success() {
        return Err(SiftError::Extraction(format!(
            "frame at {:.3}s failed: {}",
            at_secs,
            output.stderr_tail()
        )));
    }
    // Seeks landing past the last decodable frame produce nothing; use a black tile
    if !out.exists() {
        let mut cmd = Command::new(tools::ffmpeg_path());
        cmd.args([
            "-y", "-v", "error",
            "-f", "lavfi",
            "-i", &format!("color=c=black:s={}x{}", layout.tile_width, layout.tile_height),
            "-frames:v", "1",
        ])
        .arg(out);
        let output = tools::run_tool(cmd, "ffmpeg", ctx)?;
        if !output.status.success() {
            return Err(SiftError::Extraction(format!("filler frame failed: {}", output.stderr_tail())));
        }
    }
    Ok(())
}

fn tile_page(ctx: &JobContext, frames_dir: &Path, sheet: &Path, page: &SpritePage, quality: u32) -> Result<()> {
    let tmp = sheet.with_extension("tmp.jpg");
    let pattern = frames_dir.join("frame_%05d.jpg");
    let tile = format!("tile={}x{}", page.columns, page.rows);

    let mut cmd = Command::new(tools::ffmpeg_path());
    cmd.args(["-y", "-v", "error", "-start_number", &page.start_frame.to_string(), "-i"])
        .arg(&pattern)
        .args([
            "-frames:v", "1",
            "-vf", &tile,
            "-q:v", &jpeg_qscale(quality).to_string(),
        ])
        .arg(&tmp);

    let output = tools::run_tool(cmd, "ffmpeg", ctx)?;
    if !output.status.success() || std::fs::metadata(&tmp).map(|m| m.len()).unwrap_or(0) == 0 {
        let _ = std::fs::remove_file(&tmp);
        return Err(SiftError::Extraction(format!(
            "sprite page {} failed: {}",
            page.page_index,
            output.stderr_tail()
        )));
    }

    std::fs::rename(&tmp, sheet)?;
    Ok(())
}

/// WebVTT cues for a paged sprite set.
pub fn generate_vtt(layout: &SpriteLayout, sheet_names: &[String], duration_secs: f64) -> String {
    let duration_ms = (duration_secs * 1000.0) as u64;
    let mut vtt = String::from("WEBVTT\n\n");

    for (page, name) in layout.pages.iter().zip(sheet_names) {
        for i in 0..page.frames_this_page {
            let frame = page.start_frame + i;
            let start_ms = frame as u64 * layout.interval_ms;
            let end_ms = ((frame + 1) as u64 * layout.interval_ms).min(duration_ms);

            let x = (i % page.columns) * layout.tile_width;
            let y = (i / page.columns) * layout.tile_height;

            vtt.push_str(&format!(
                "{} --> {}\n{}#xywh={},{},{},{}\n\n",
                format_vtt_time(start_ms),
                format_vtt_time(end_ms),
                name,
                x, y, layout.tile_width, layout.tile_height
            ));
        }
    }

    vtt
}

/// Format milliseconds as VTT timestamp (HH:MM:SS.mmm).
fn format_vtt_time(ms: u64) -> String {
    let hours = ms / (60 * 60 * 1000);
    let minutes = (ms % (60 * 60 * 1000)) / (60 * 1000);
    let seconds = (ms % (60 * 1000)) / 1000;
    let millis = ms % 1000;
    format!("{:02}:{:02}:{:02}.{:03}", hours, minutes, seconds, millis)
}
