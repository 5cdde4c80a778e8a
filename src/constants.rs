// Vidsift Constants
// Defaults seeded into config tables on first run. Runtime values come from the database.

pub const PIPELINE_VERSION: u32 = 1;

// Paths
pub const APP_QUALIFIER: &str = "org";
pub const APP_ORGANIZATION: &str = "vidsift";
pub const APP_NAME: &str = "vidsift";
pub const DATA_DIR_ENV: &str = "VIDSIFT_DATA_DIR";
pub const CONFIG_FILENAME: &str = "config.json";
pub const DB_FILENAME: &str = "vidsift.db";
pub const INDEX_DB_FILENAME: &str = "index.db";
pub const THUMBS_FOLDER: &str = "thumbs";
pub const SPRITES_FOLDER: &str = "sprites";

// Import: file extensions treated as video
pub const VIDEO_EXTENSIONS: [&str; 16] = [
    "mp4", "mov", "avi", "mkv", "mts", "m2ts", "mpg", "mpeg",
    "wmv", "flv", "webm", "3gp", "m4v", "ts", "vob", "ogv",
];

// Worker pools
pub const DEFAULT_METADATA_WORKERS: usize = 3;
pub const DEFAULT_THUMBNAIL_WORKERS: usize = 2;
pub const DEFAULT_SPRITES_WORKERS: usize = 1;
pub const DEFAULT_FINGERPRINT_WORKERS: usize = 2;
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

// Feeder / scheduler
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 2_000;
pub const DEFAULT_SCHEDULER_TICK_SECS: u64 = 30;
pub const DEFAULT_SCHEDULED_BATCH_SIZE: i64 = 100;
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_CLAIM_LEASE_SECS: i64 = 3_600;
pub const DEFAULT_HISTORY_RETENTION_DAYS: i64 = 30;

// Cancellation / process polling
pub const TOOL_POLL_INTERVAL_MS: u64 = 100;

// Phase timeouts
pub const METADATA_TIMEOUT_SECS: u64 = 60;
pub const THUMBNAIL_TIMEOUT_SECS: u64 = 120;
pub const SPRITES_TIMEOUT_SECS: u64 = 1_800;
pub const FINGERPRINT_TIMEOUT_SECS: u64 = 1_800;

// Phase priorities (higher runs first)
pub const METADATA_PRIORITY: i32 = 10;
pub const THUMBNAIL_PRIORITY: i32 = 8;
pub const FINGERPRINT_PRIORITY: i32 = 5;
pub const SPRITES_PRIORITY: i32 = 3;

// Retry defaults
pub const DEFAULT_MAX_RETRIES: i32 = 3;
pub const DEFAULT_INITIAL_BACKOFF_SECS: i64 = 30;
pub const DEFAULT_MAX_BACKOFF_SECS: i64 = 3_600;
pub const DEFAULT_BACKOFF_FACTOR: f64 = 2.0;

// Thumbnail settings
pub const THUMB_FORMAT: &str = "jpg";
pub const THUMB_QUALITY: u32 = 85;
pub const THUMB_SMALL_WIDTH: u32 = 320;
pub const THUMB_LARGE_WIDTH: u32 = 1280;
pub const THUMB_SEEK_PERCENT: f64 = 20.0;

// Sprite settings
pub const SPRITE_INTERVAL_SECS: f64 = 5.0;
pub const SPRITE_TILE_WIDTH: u32 = 160;
pub const SPRITE_COLUMNS: u32 = 10;
pub const SPRITE_ROWS_PER_SHEET: u32 = 10;
pub const SPRITE_MAX_FRAMES: u32 = 1_000;
pub const SPRITE_EXTRACT_CONCURRENCY: usize = 4;

// Fingerprinting
pub const AUDIO_SUBFINGERPRINTS_PER_SEC: f64 = 8.0;
pub const VISUAL_SAMPLE_INTERVAL_SECS: u32 = 2;
pub const DHASH_WIDTH: usize = 9;
pub const DHASH_HEIGHT: usize = 8;
pub const VISUAL_CHUNK_COUNT: usize = 4;

// Duplication thresholds
pub const FINGERPRINT_MODE_AUDIO_ONLY: &str = "audio_only";
pub const FINGERPRINT_MODE_DUAL: &str = "dual";
pub const AUDIO_MIN_HASHES: i64 = 80;
pub const AUDIO_DENSITY_THRESHOLD: f64 = 0.50;
pub const AUDIO_MIN_SPAN: i64 = 160;
pub const AUDIO_DELTA_TOLERANCE: i64 = 4;
pub const AUDIO_MAX_SCENE_FREQ: i64 = 10;
pub const VISUAL_MIN_FRAMES: i64 = 20;
pub const VISUAL_DENSITY_THRESHOLD: f64 = 0.50;
pub const VISUAL_MIN_SPAN: i64 = 30;
pub const VISUAL_DELTA_TOLERANCE: i64 = 2;
pub const VISUAL_HAMMING_MAX: u32 = 5;

// Quality scoring: bonus per video codec (lowercase ffprobe codec_name)
pub const DEFAULT_CODEC_BONUS: [(&str, i64); 5] = [
    ("av1", 300_000),
    ("hevc", 250_000),
    ("vp9", 200_000),
    ("h264", 100_000),
    ("mpeg4", 50_000),
];

// Index batch size for IN (...) lookups
pub const INDEX_LOOKUP_BATCH: usize = 500;
