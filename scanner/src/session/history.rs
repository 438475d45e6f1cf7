use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Durable, ordered list of accepted codes.
///
/// One SQLite file with a single `scanned_codes` table. Codes are unique and
/// come back in the order they were first accepted (insertion id order).
pub struct HistoryDb {
    conn: Connection,
    path: Option<PathBuf>,
}

/// One persisted code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub code: String,
    pub scanned_at_ms: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("history database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("failed to prepare history path {0}: {1}")]
    Io(String, std::io::Error),
}

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS scanned_codes (
        id            INTEGER PRIMARY KEY AUTOINCREMENT,
        code          TEXT    NOT NULL UNIQUE,
        scanned_at_ms INTEGER NOT NULL
    );";

impl HistoryDb {
    /// Open (or create) the history database at `path`.
    /// Creates the parent directory if it does not exist.
    pub fn open(path: &Path) -> Result<Self, HistoryError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| HistoryError::Io(parent.display().to_string(), e))?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        conn.execute_batch(SCHEMA)?;
        // Fails here, not on first write, if the file is not a usable database.
        conn.query_row("SELECT COUNT(*) FROM scanned_codes", [], |row| row.get::<_, i64>(0))?;

        info!(path = path.display().to_string(), "history database opened");
        Ok(Self {
            conn,
            path: Some(path.to_path_buf()),
        })
    }

    /// Open `path`, moving an unreadable file aside and starting fresh.
    ///
    /// Returns `None` only if a fresh database cannot be created either.
    pub fn open_or_recover(path: &Path) -> Option<Self> {
        match Self::open(path) {
            Ok(db) => return Some(db),
            Err(e) if path.exists() => {
                let aside = corrupt_path(path);
                warn!(
                    error = %e,
                    path = path.display().to_string(),
                    moved_to = aside.display().to_string(),
                    "history unreadable, starting with an empty history"
                );
                if let Err(e) = std::fs::rename(path, &aside) {
                    warn!(error = %e, "failed to move unreadable history aside");
                    return None;
                }
                for suffix in ["-wal", "-shm"] {
                    let _ = std::fs::remove_file(sidecar(path, suffix));
                }
            }
            Err(e) => {
                warn!(error = %e, path = path.display().to_string(), "failed to create history");
                return None;
            }
        }

        match Self::open(path) {
            Ok(db) => Some(db),
            Err(e) => {
                warn!(error = %e, "failed to create fresh history; persistence disabled");
                None
            }
        }
    }

    /// In-memory database, lost on drop.
    pub fn open_in_memory() -> Result<Self, HistoryError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn, path: None })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// All persisted codes in first-accepted order.
    pub fn load(&self) -> Result<Vec<HistoryEntry>, HistoryError> {
        let mut stmt = self
            .conn
            .prepare("SELECT code, scanned_at_ms FROM scanned_codes ORDER BY id ASC")?;
        let rows = stmt.query_map([], |row| {
            Ok(HistoryEntry {
                code: row.get(0)?,
                scanned_at_ms: row.get(1)?,
            })
        })?;
        let entries = rows.collect::<Result<Vec<_>, _>>()?;
        debug!(count = entries.len(), "history loaded");
        Ok(entries)
    }

    /// Append a code. Returns `false` if it was already present.
    pub fn append(&self, code: &str, scanned_at_ms: i64) -> Result<bool, HistoryError> {
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO scanned_codes (code, scanned_at_ms) VALUES (?1, ?2)",
            params![code, scanned_at_ms],
        )?;
        debug!(code, inserted = inserted > 0, "history append");
        Ok(inserted > 0)
    }

    /// When `code` was first accepted, if ever.
    pub fn scanned_at(&self, code: &str) -> Result<Option<i64>, HistoryError> {
        Ok(self
            .conn
            .query_row(
                "SELECT scanned_at_ms FROM scanned_codes WHERE code = ?1",
                params![code],
                |row| row.get(0),
            )
            .optional()?)
    }
}

fn sidecar(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

fn corrupt_path(path: &Path) -> PathBuf {
    let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%3fZ");
    sidecar(path, &format!(".corrupt-{stamp}"))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Unique scratch path for a history file.
    pub(crate) fn scratch_db(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "qrscan-history-{name}-{}-{}",
            std::process::id(),
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        dir.join("scanned.db")
    }

    #[test]
    fn append_and_reload_keeps_order() {
        let path = scratch_db("order");
        {
            let db = HistoryDb::open(&path).unwrap();
            assert!(db.append("B2", 2).unwrap());
            assert!(db.append("A1", 1).unwrap());
            assert!(!db.append("B2", 3).unwrap());
        }
        let db = HistoryDb::open(&path).unwrap();
        let codes: Vec<_> = db.load().unwrap().into_iter().map(|e| e.code).collect();
        assert_eq!(codes, vec!["B2", "A1"]);
        assert_eq!(db.scanned_at("B2").unwrap(), Some(2));
        assert_eq!(db.scanned_at("Z9").unwrap(), None);
    }

    #[test]
    fn garbage_file_fails_to_open() {
        let path = scratch_db("garbage");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"this is definitely not sqlite, just some bytes on disk").unwrap();
        assert!(HistoryDb::open(&path).is_err());
    }

    #[test]
    fn recover_moves_garbage_aside() {
        let path = scratch_db("recover");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"this is definitely not sqlite, just some bytes on disk").unwrap();

        let db = HistoryDb::open_or_recover(&path).unwrap();
        assert!(db.load().unwrap().is_empty());
        assert!(db.append("A1", 1).unwrap());

        let moved = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .any(|e| e.file_name().to_string_lossy().contains(".corrupt-"));
        assert!(moved, "unreadable history should be kept aside");
    }

    #[test]
    fn in_memory_database_works() {
        let db = HistoryDb::open_in_memory().unwrap();
        db.append("X", 5).unwrap();
        assert_eq!(db.load().unwrap().len(), 1);
        assert!(db.path().is_none());
    }
}
