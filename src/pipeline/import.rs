// Item import: file discovery and registration

use std::path::{Path, PathBuf};

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::constants::VIDEO_EXTENSIONS;
use crate::db::schema::{self, NewItem};
use crate::error::{Result, SiftError};

/// Check if a file looks like a video based on extension
pub fn is_video_file(path: &Path) -> bool {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => VIDEO_EXTENSIONS.contains(&ext.to_lowercase().as_str()),
        None => false,
    }
}

/// All video files under `source` (or `source` itself), sorted by path.
pub fn discover_videos(source: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    if source.is_file() {
        if is_video_file(source) {
            files.push(source.to_path_buf());
        }
    } else if source.is_dir() {
        for entry in WalkDir::new(source).follow_links(true).into_iter().filter_map(|e| e.ok()) {
            let path = entry.path();
            if path.is_file() && is_video_file(path) {
                files.push(path.to_path_buf());
            }
        }
    } else {
        return Err(SiftError::NotFound(source.display().to_string()));
    }
    files.sort();
    Ok(files)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportedItem {
    pub item_id: i64,
    pub path: String,
    /// False when the path was already registered
    pub created: bool,
}

/// Register one file as an item. Paths are stored canonicalized, and an
/// already-known path returns the existing item.
pub fn register_item(conn: &Connection, path: &Path) -> Result<ImportedItem> {
    let canonical = std::fs::canonicalize(path)?;
    let path_str = canonical.to_string_lossy().to_string();

    if let Some(existing) = schema::get_item_by_path(conn, &path_str)? {
        return Ok(ImportedItem { item_id: existing.id, path: path_str, created: false });
    }

    let size_bytes = std::fs::metadata(&canonical)?.len() as i64;
    let title = canonical
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "Untitled".to_string());

    let item_id = schema::insert_item(conn, &NewItem { path: path_str.clone(), title, size_bytes })?;
    log::info!("Imported item {} from {}", item_id, path_str);
    Ok(ImportedItem { item_id, path: path_str, created: true })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_is_video_file() {
        assert!(is_video_file(Path::new("/a/b.MP4")));
        assert!(is_video_file(Path::new("clip.mkv")));
        assert!(!is_video_file(Path::new("notes.txt")));
        assert!(!is_video_file(Path::new("noext")));
    }

    #[test]
    fn test_discover_walks_and_sorts() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("b.mov"), b"x").unwrap();
        fs::write(dir.path().join("sub/a.mp4"), b"x").unwrap();
        fs::write(dir.path().join("readme.md"), b"x").unwrap();

        let found = discover_videos(dir.path()).unwrap();
        assert_eq!(found, vec![dir.path().join("b.mov"), dir.path().join("sub/a.mp4")]);
        assert!(discover_videos(&dir.path().join("missing")).is_err());
    }

    #[test]
    fn test_register_is_idempotent_per_path() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("Holiday Clip.mp4");
        fs::write(&file, vec![0u8; 42]).unwrap();
        let conn = db::open_in_memory().unwrap();

        let first = register_item(&conn, &file).unwrap();
        assert!(first.created);
        let item = schema::get_item(&conn, first.item_id).unwrap().unwrap();
        assert_eq!(item.title, "Holiday Clip");
        assert_eq!(item.size_bytes, 42);

        let second = register_item(&conn, &file).unwrap();
        assert!(!second.created);
        assert_eq!(second.item_id, first.item_id);
    }
}
