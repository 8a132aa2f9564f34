//! Persistence for long-term memory notes and the conversation log index.
//!
//! [`NoteStore`] and [`TermIndex`] are the seams the scheduler and the
//! log-search tool depend on. [`MemoryDatabase`] implements both on SQLite
//! via `rusqlite`, with WAL enabled so readers do not block the writer.

use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};

use super::errors::MaintenanceError;
use super::queue::{mutex_lock, WorkKey};

// ─── Traits ──────────────────────────────────────────────────────────────────

/// One compacted memory note per `(identity, persona)`.
pub trait NoteStore: Send + Sync {
    fn get(&self, key: &WorkKey) -> Result<Option<String>, MaintenanceError>;
    fn put(&self, key: &WorkKey, text: &str) -> Result<(), MaintenanceError>;
}

/// Term → excerpt-line index over past conversations, scoped per
/// `(identity, persona)`.
pub trait TermIndex: Send + Sync {
    fn append(&self, key: &WorkKey, term: &str, line: &str) -> Result<(), MaintenanceError>;
    fn search(&self, key: &WorkKey, term: &str) -> Result<Vec<String>, MaintenanceError>;
    /// Most frequently indexed terms, most frequent first.
    fn top_terms(&self, key: &WorkKey, limit: usize) -> Result<Vec<String>, MaintenanceError>;
}

/// Normalized form under which terms are stored and searched.
pub fn normalize_term(term: &str) -> String {
    term.trim().to_lowercase()
}

// ─── MemoryDatabase ──────────────────────────────────────────────────────────

/// SQLite-backed notes and term index.
pub struct MemoryDatabase {
    conn: Mutex<Connection>,
}

impl MemoryDatabase {
    /// Open (or create) the database at the given path.
    ///
    /// Pass `":memory:"` for an in-memory database (tests).
    pub fn open(path: &str) -> Result<Self, MaintenanceError> {
        let conn = Connection::open(path)?;

        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.create_tables()?;
        Ok(db)
    }

    fn create_tables(&self) -> Result<(), MaintenanceError> {
        mutex_lock(&self.conn).execute_batch(
            "
            CREATE TABLE IF NOT EXISTS memory_notes (
                identity TEXT NOT NULL,
                persona TEXT NOT NULL,
                body TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                PRIMARY KEY (identity, persona)
            );

            CREATE TABLE IF NOT EXISTS log_index (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                identity TEXT NOT NULL,
                persona TEXT NOT NULL,
                term TEXT NOT NULL,
                line TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE INDEX IF NOT EXISTS idx_log_index_term
                ON log_index(identity, persona, term, id);
            ",
        )?;
        Ok(())
    }
}

impl NoteStore for MemoryDatabase {
    fn get(&self, key: &WorkKey) -> Result<Option<String>, MaintenanceError> {
        let body = mutex_lock(&self.conn)
            .query_row(
                "SELECT body FROM memory_notes WHERE identity = ?1 AND persona = ?2",
                params![key.identity, key.persona],
                |row| row.get(0),
            )
            .optional()?;
        Ok(body)
    }

    fn put(&self, key: &WorkKey, text: &str) -> Result<(), MaintenanceError> {
        mutex_lock(&self.conn).execute(
            "INSERT INTO memory_notes (identity, persona, body) VALUES (?1, ?2, ?3)
             ON CONFLICT(identity, persona)
             DO UPDATE SET body = excluded.body, updated_at = datetime('now')",
            params![key.identity, key.persona, text],
        )?;
        Ok(())
    }
}

impl TermIndex for MemoryDatabase {
    fn append(&self, key: &WorkKey, term: &str, line: &str) -> Result<(), MaintenanceError> {
        let term = normalize_term(term);
        if term.is_empty() {
            return Ok(());
        }
        mutex_lock(&self.conn).execute(
            "INSERT INTO log_index (identity, persona, term, line) VALUES (?1, ?2, ?3, ?4)",
            params![key.identity, key.persona, term, line],
        )?;
        Ok(())
    }

    fn search(&self, key: &WorkKey, term: &str) -> Result<Vec<String>, MaintenanceError> {
        let conn = mutex_lock(&self.conn);
        let mut stmt = conn.prepare(
            "SELECT line FROM log_index
             WHERE identity = ?1 AND persona = ?2 AND term = ?3 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(
            params![key.identity, key.persona, normalize_term(term)],
            |row| row.get(0),
        )?;
        let lines = rows.collect::<Result<Vec<String>, _>>()?;
        Ok(lines)
    }

    fn top_terms(&self, key: &WorkKey, limit: usize) -> Result<Vec<String>, MaintenanceError> {
        let conn = mutex_lock(&self.conn);
        let mut stmt = conn.prepare(
            "SELECT term FROM log_index WHERE identity = ?1 AND persona = ?2
             GROUP BY term ORDER BY COUNT(*) DESC, MAX(id) DESC LIMIT ?3",
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map(params![key.identity, key.persona, limit], |row| row.get(0))?;
        let terms = rows.collect::<Result<Vec<String>, _>>()?;
        Ok(terms)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> MemoryDatabase {
        MemoryDatabase::open(":memory:").unwrap()
    }

    fn key(identity: &str, persona: &str) -> WorkKey {
        WorkKey::new(identity, persona)
    }

    #[test]
    fn test_note_put_overwrites() {
        let db = test_db();
        let key = WorkKey::new("alice", "default");
        assert!(db.get(&key).unwrap().is_none());

        db.put(&key, "likes tea").unwrap();
        db.put(&key, "likes coffee").unwrap();
        assert_eq!(db.get(&key).unwrap().as_deref(), Some("likes coffee"));
        assert!(db.get(&WorkKey::new("alice", "pirate")).unwrap().is_none());
    }

    #[test]
    fn test_index_search_is_case_insensitive_and_ordered() {
        let db = test_db();
        let alice = key("alice", "default");
        db.append(&alice, "Weather", "[USER] is it raining?").unwrap();
        db.append(&alice, "weather ", "[ASSISTANT] no").unwrap();
        db.append(&key("alice", "pirate"), "weather", "[USER] arr").unwrap();

        let lines = db.search(&alice, "WEATHER").unwrap();
        assert_eq!(lines, ["[USER] is it raining?", "[ASSISTANT] no"]);
        assert_eq!(db.search(&key("alice", "pirate"), "weather").unwrap().len(), 1);
        assert!(db.search(&alice, "unknown").unwrap().is_empty());
    }

    #[test]
    fn test_empty_term_ignored() {
        let db = test_db();
        let alice = key("alice", "default");
        db.append(&alice, "  ", "line").unwrap();
        assert!(db.top_terms(&alice, 10).unwrap().is_empty());
    }

    #[test]
    fn test_top_terms_by_frequency() {
        let db = test_db();
        let alice = key("alice", "default");
        for _ in 0..3 {
            db.append(&alice, "rust", "x").unwrap();
        }
        db.append(&alice, "tea", "x").unwrap();
        db.append(&alice, "music", "x").unwrap();
        db.append(&alice, "music", "x").unwrap();

        assert_eq!(db.top_terms(&alice, 2).unwrap(), ["rust", "music"]);
    }

    #[test]
    fn test_index_isolated_between_identities() {
        let db = test_db();
        let bob = key("bob", "default");
        db.append(&bob, "medical", "[USER] bob secret diagnosis").unwrap();
        db.append(&bob, "medical", "[ASSISTANT] ok").unwrap();

        let alice = key("alice", "default");
        assert!(db.search(&alice, "medical").unwrap().is_empty());
        assert!(db.top_terms(&alice, 5).unwrap().is_empty());
        assert_eq!(db.search(&bob, "medical").unwrap().len(), 2);
        assert_eq!(db.top_terms(&bob, 5).unwrap(), ["medical"]);
    }

    #[test]
    fn test_on_disk_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.db");
        let path = path.to_str().unwrap();
        let key = WorkKey::new("alice", "default");
        {
            let db = MemoryDatabase::open(path).unwrap();
            db.put(&key, "note").unwrap();
        }
        let db = MemoryDatabase::open(path).unwrap();
        assert_eq!(db.get(&key).unwrap().as_deref(), Some("note"));
    }
}
