use std::path::{Path, PathBuf};

use chrono::Utc;
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use rusqlite::{params, Connection};
use thiserror::Error;

/// Errors emitted by the embedding cache.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Store database error.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// Filesystem I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// A stored row that cannot be decoded.
    #[error("cache store {path}: invalid entry {key}: {message}")]
    InvalidEntry {
        /// Store file.
        path: PathBuf,
        /// Cache key of the row.
        key: String,
        /// What was wrong with it.
        message: String,
    },
}

/// Key to embedding map, optionally backed by a SQLite store.
///
/// Each key has exactly one row in the store; writing a key again replaces
/// its vector.
#[derive(Debug, Default)]
pub struct EmbeddingCache {
    path: Option<PathBuf>,
    entries: RwLock<IndexMap<String, Vec<f32>>>,
    conn: Option<Mutex<Connection>>,
}

impl EmbeddingCache {
    /// Cache that never touches disk.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Opens (or creates) a persistent store and loads its entries.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(&path)?;
        conn.execute_batch(SCHEMA_SQL)?;

        let mut entries = IndexMap::new();
        {
            let mut stmt = conn.prepare("SELECT key, vector FROM embeddings ORDER BY rowid")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
            })?;
            for row in rows {
                let (key, blob) = row?;
                let vector = decode_vector(&blob).map_err(|message| CacheError::InvalidEntry {
                    path: path.clone(),
                    key: key.clone(),
                    message,
                })?;
                entries.insert(key, vector);
            }
        }
        tracing::debug!("opened embedding cache {} ({} entries)", path.display(), entries.len());
        Ok(Self {
            path: Some(path),
            entries: RwLock::new(entries),
            conn: Some(Mutex::new(conn)),
        })
    }

    /// Store file, if persistent.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Cached vector for `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Vec<f32>> {
        self.entries.read().get(key).cloned()
    }

    /// Number of cached keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Caches a vector; with `persist` it is also upserted into the store.
    ///
    /// Persisting on an in-memory cache only updates memory.
    pub fn insert(&self, key: &str, vector: Vec<f32>, persist: bool) -> Result<(), CacheError> {
        if persist {
            if let Some(conn) = &self.conn {
                conn.lock().execute(
                    "INSERT OR REPLACE INTO embeddings (key, dimension, vector, created_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![
                        key,
                        i64::try_from(vector.len()).unwrap_or(i64::MAX),
                        encode_vector(&vector),
                        Utc::now().to_rfc3339()
                    ],
                )?;
            }
        }
        self.entries.write().insert(key.to_string(), vector);
        Ok(())
    }
}

const SCHEMA_SQL: &str = r"
CREATE TABLE IF NOT EXISTS embeddings (
    key TEXT PRIMARY KEY NOT NULL,
    dimension INTEGER NOT NULL,
    vector BLOB NOT NULL,
    created_at TEXT NOT NULL
);
";

fn encode_vector(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(std::mem::size_of_val(vector));
    for &value in vector {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

fn decode_vector(blob: &[u8]) -> Result<Vec<f32>, String> {
    if blob.len() % 4 != 0 {
        return Err(format!("vector blob of {} bytes", blob.len()));
    }
    Ok(blob
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn stored_rows(path: &Path) -> i64 {
        Connection::open(path)
            .unwrap()
            .query_row("SELECT COUNT(*) FROM embeddings", [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn persisted_entries_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache/sentenceCache.sqlite");
        {
            let cache = EmbeddingCache::open(&path).unwrap();
            cache.insert("B1_A1_1", vec![0.5, 1.5], true).unwrap();
            cache.insert("B2_A2_2", vec![2.0, 3.0], false).unwrap();
            assert_eq!(cache.len(), 2);
        }
        let reopened = EmbeddingCache::open(&path).unwrap();
        assert_eq!(reopened.len(), 1);
        assert_eq!(reopened.get("B1_A1_1"), Some(vec![0.5, 1.5]));
        assert!(reopened.get("B2_A2_2").is_none());
    }

    #[test]
    fn rewriting_a_key_keeps_one_row() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sentenceCache.sqlite");
        let cache = EmbeddingCache::open(&path).unwrap();
        for value in [1.0, 2.0, 3.0, 4.0, 5.0] {
            cache.insert("k", vec![value], true).unwrap();
        }
        drop(cache);
        assert_eq!(stored_rows(&path), 1);
        assert_eq!(EmbeddingCache::open(&path).unwrap().get("k"), Some(vec![5.0]));
    }

    #[test]
    fn interrupted_write_leaves_store_readable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sentenceCache.sqlite");
        {
            let cache = EmbeddingCache::open(&path).unwrap();
            cache.insert("a", vec![1.0, 2.0], true).unwrap();
        }
        {
            let mut conn = Connection::open(&path).unwrap();
            let tx = conn.transaction().unwrap();
            tx.execute(
                "INSERT OR REPLACE INTO embeddings (key, dimension, vector, created_at)
                 VALUES ('b', 2, x'0000', 'now')",
                [],
            )
            .unwrap();
            drop(tx);
        }
        let reopened = EmbeddingCache::open(&path).unwrap();
        assert_eq!(reopened.len(), 1);
        assert_eq!(reopened.get("a"), Some(vec![1.0, 2.0]));
        reopened.insert("b", vec![3.0, 4.0], true).unwrap();
        drop(reopened);
        assert_eq!(stored_rows(&path), 2);
    }

    #[test]
    fn malformed_vector_blob_is_reported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sentenceCache.sqlite");
        drop(EmbeddingCache::open(&path).unwrap());
        Connection::open(&path)
            .unwrap()
            .execute(
                "INSERT INTO embeddings (key, dimension, vector, created_at)
                 VALUES ('bad', 1, x'000000', 'now')",
                [],
            )
            .unwrap();
        let err = EmbeddingCache::open(&path).unwrap_err();
        assert!(matches!(err, CacheError::InvalidEntry { ref key, .. } if key == "bad"));
    }

    #[test]
    fn in_memory_cache_ignores_persist_flag() {
        let cache = EmbeddingCache::in_memory();
        cache.insert("k", vec![1.0], true).unwrap();
        assert!(cache.path().is_none());
        assert_eq!(cache.get("k"), Some(vec![1.0]));
    }
}
