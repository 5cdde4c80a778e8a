// Vidsift - media processing pipeline and duplicate detection

pub mod config;
pub mod constants;
pub mod db;
pub mod duplicates;
pub mod error;
pub mod fingerprint;
pub mod index;
pub mod jobs;
pub mod matching;
pub mod pipeline;
pub mod tools;

pub use config::PipelineConfig;
pub use error::{Result, SiftError};
pub use pipeline::Pipeline;
