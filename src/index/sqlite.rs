// SQLite-backed fingerprint index (index.db)

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, params_from_iter, Connection};

use crate::constants::INDEX_LOOKUP_BATCH;
use crate::error::{Result, SiftError};
use crate::fingerprint;

use super::{AudioHit, FingerprintIndex, VisualHit};

const INDEX_SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS audio_hashes (
        hash INTEGER NOT NULL,
        item_id INTEGER NOT NULL,
        position INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_audio_hashes_hash ON audio_hashes(hash);
    CREATE INDEX IF NOT EXISTS idx_audio_hashes_item ON audio_hashes(item_id);

    CREATE TABLE IF NOT EXISTS visual_chunks (
        chunk_value INTEGER NOT NULL,
        chunk_index INTEGER NOT NULL,
        item_id INTEGER NOT NULL,
        frame_offset INTEGER NOT NULL,
        full_hash INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_visual_chunks_lookup ON visual_chunks(chunk_index, chunk_value);
    CREATE INDEX IF NOT EXISTS idx_visual_chunks_item ON visual_chunks(item_id);
"#;

pub struct SqliteFingerprintIndex {
    conn: Mutex<Connection>,
}

impl SqliteFingerprintIndex {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(INDEX_SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| SiftError::Other("fingerprint index lock poisoned".to_string()))
    }
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

impl FingerprintIndex for SqliteFingerprintIndex {
    fn insert_audio_fingerprints(&self, item_id: i64, sub_hashes: &[i32]) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM audio_hashes WHERE item_id = ?1", params![item_id])?;
        {
            let mut stmt = tx.prepare("INSERT INTO audio_hashes (hash, item_id, position) VALUES (?1, ?2, ?3)")?;
            for (position, hash) in sub_hashes.iter().enumerate() {
                stmt.execute(params![hash, item_id, position as i64])?;
            }
        }
        tx.commit()?;
        log::debug!("Indexed {} audio sub-hashes for item {}", sub_hashes.len(), item_id);
        Ok(())
    }

    fn insert_visual_fingerprints(&self, item_id: i64, hashes: &[u64]) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM visual_chunks WHERE item_id = ?1", params![item_id])?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO visual_chunks (chunk_value, chunk_index, item_id, frame_offset, full_hash)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for (frame, hash) in hashes.iter().enumerate() {
                for (chunk_index, chunk_value) in fingerprint::chunks(*hash).iter().enumerate() {
                    // Stored bit-for-bit; SQLite integers are signed
                    stmt.execute(params![
                        *chunk_value as i64,
                        chunk_index as i64,
                        item_id,
                        frame as i64,
                        *hash as i64
                    ])?;
                }
            }
        }
        tx.commit()?;
        log::debug!("Indexed {} visual hashes for item {}", hashes.len(), item_id);
        Ok(())
    }

    fn lookup_audio_hashes(&self, hashes: &[i32]) -> Result<HashMap<i32, Vec<AudioHit>>> {
        let conn = self.lock()?;
        let mut out: HashMap<i32, Vec<AudioHit>> = HashMap::new();
        for batch in hashes.chunks(INDEX_LOOKUP_BATCH) {
            let sql = format!(
                "SELECT hash, item_id, position FROM audio_hashes WHERE hash IN ({})",
                placeholders(batch.len())
            );
            let mut stmt = conn.prepare_cached(&sql)?;
            let rows = stmt.query_map(params_from_iter(batch.iter()), |row| {
                Ok((row.get::<_, i32>(0)?, row.get::<_, i64>(1)?, row.get::<_, i64>(2)?))
            })?;
            for row in rows {
                let (hash, item_id, offset) = row?;
                out.entry(hash).or_default().push(AudioHit { item_id, offset });
            }
        }
        Ok(out)
    }

    fn lookup_visual_chunks(&self, chunk_values: &[u16], chunk_index: usize) -> Result<Vec<VisualHit>> {
        let conn = self.lock()?;
        let mut out = Vec::new();
        for batch in chunk_values.chunks(INDEX_LOOKUP_BATCH) {
            let sql = format!(
                "SELECT item_id, frame_offset, full_hash FROM visual_chunks
                 WHERE chunk_index = ? AND chunk_value IN ({})",
                placeholders(batch.len())
            );
            let mut args: Vec<i64> = Vec::with_capacity(batch.len() + 1);
            args.push(chunk_index as i64);
            args.extend(batch.iter().map(|v| *v as i64));

            let mut stmt = conn.prepare_cached(&sql)?;
            let rows = stmt.query_map(params_from_iter(args.iter()), |row| {
                Ok(VisualHit {
                    item_id: row.get(0)?,
                    frame_offset: row.get(1)?,
                    full_hash: row.get::<_, i64>(2)? as u64,
                })
            })?;
            for hit in rows {
                out.push(hit?);
            }
        }
        Ok(out)
    }

    fn delete_item_fingerprints(&self, item_id: i64) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM audio_hashes WHERE item_id = ?1", params![item_id])?;
        tx.execute("DELETE FROM visual_chunks WHERE item_id = ?1", params![item_id])?;
        tx.commit()?;
        Ok(())
    }

    fn health(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_insert_and_lookup() {
        let index = SqliteFingerprintIndex::open_in_memory().unwrap();
        index.insert_audio_fingerprints(1, &[10, 20, 10]).unwrap();
        index.insert_audio_fingerprints(2, &[20]).unwrap();

        let hits = index.lookup_audio_hashes(&[10, 20, 30]).unwrap();
        let mut tens = hits[&10].clone();
        tens.sort_by_key(|h| h.offset);
        assert_eq!(tens, vec![AudioHit { item_id: 1, offset: 0 }, AudioHit { item_id: 1, offset: 2 }]);
        assert_eq!(hits[&20].len(), 2);
        assert!(!hits.contains_key(&30));
    }

    #[test]
    fn test_reinsert_replaces_rows() {
        let index = SqliteFingerprintIndex::open_in_memory().unwrap();
        index.insert_audio_fingerprints(1, &[10, 11]).unwrap();
        index.insert_audio_fingerprints(1, &[12]).unwrap();
        let hits = index.lookup_audio_hashes(&[10, 11, 12]).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[&12], vec![AudioHit { item_id: 1, offset: 0 }]);
    }

    #[test]
    fn test_visual_chunks_keep_full_hash() {
        let index = SqliteFingerprintIndex::open_in_memory().unwrap();
        let hash = 0xFFFF_0000_1234_8001u64;
        index.insert_visual_fingerprints(5, &[0, hash]).unwrap();

        let hits = index.lookup_visual_chunks(&[0x8001], 0).unwrap();
        assert_eq!(hits, vec![VisualHit { item_id: 5, frame_offset: 1, full_hash: hash }]);

        // Chunk value only matches at its own index
        assert!(index.lookup_visual_chunks(&[0x8001], 1).unwrap().is_empty());
        assert_eq!(index.lookup_visual_chunks(&[0xFFFF], 3).unwrap().len(), 1);
    }

    #[test]
    fn test_delete_item() {
        let index = SqliteFingerprintIndex::open_in_memory().unwrap();
        index.insert_audio_fingerprints(1, &[10]).unwrap();
        index.insert_visual_fingerprints(1, &[42]).unwrap();
        index.delete_item_fingerprints(1).unwrap();
        assert!(index.lookup_audio_hashes(&[10]).unwrap().is_empty());
        assert!(index.lookup_visual_chunks(&[42], 0).unwrap().is_empty());
        index.health().unwrap();
    }

    #[test]
    fn test_lookup_spans_batches() {
        let index = SqliteFingerprintIndex::open_in_memory().unwrap();
        let fp: Vec<i32> = (0..(INDEX_LOOKUP_BATCH as i32 * 2 + 7)).collect();
        index.insert_audio_fingerprints(3, &fp).unwrap();
        assert_eq!(index.lookup_audio_hashes(&fp).unwrap().len(), fp.len());
    }
}
