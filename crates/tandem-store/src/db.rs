// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! SQLite connection management, schema, and transactions with
//! deferred post-commit effects.
//!
//! An effect is a closure registered inside a transaction and executed
//! iff the transaction commits. Every event publication in the store
//! crosses this barrier, so subscribers never observe uncommitted
//! state; on rollback the effect queue is discarded along with the
//! writes.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::Connection;
use tracing::info;

use crate::StoreError;

type Effect = Box<dyn FnOnce() + Send>;

pub struct Database {
    conn: Mutex<Connection>,
}

/// Handle passed to transaction closures: raw SQL access plus the
/// effect queue.
pub struct TxScope<'a> {
    tx: &'a rusqlite::Transaction<'a>,
    effects: Vec<Effect>,
}

impl<'a> TxScope<'a> {
    /// The underlying transaction. Reads through this see the
    /// transaction's own writes.
    pub fn tx(&self) -> &rusqlite::Transaction<'a> {
        self.tx
    }

    /// Register a closure to run after (and only after) commit.
    pub fn effect(&mut self, f: impl FnOnce() + Send + 'static) {
        self.effects.push(Box::new(f));
    }
}

impl Database {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)
                    .map_err(|e| StoreError::Io(format!("creating {}: {e}", dir.display())))?;
            }
        }
        info!(path = %path.display(), "opening database");
        let conn = Connection::open(path)?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("db lock poisoned");
        // journal_mode returns a row, so it cannot go through execute_batch.
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(std::time::Duration::from_millis(5000))?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS project (
                id TEXT PRIMARY KEY,
                data TEXT,
                time_created INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS session (
                id TEXT PRIMARY KEY,
                project_id TEXT NOT NULL REFERENCES project(id) ON DELETE CASCADE,
                parent_id TEXT,
                directory TEXT NOT NULL,
                title TEXT NOT NULL,
                version TEXT NOT NULL,
                share_url TEXT,
                summary TEXT,
                revert TEXT,
                permission TEXT,
                time_created INTEGER NOT NULL,
                time_updated INTEGER NOT NULL,
                time_compacting INTEGER,
                time_archived INTEGER
            );

            CREATE TABLE IF NOT EXISTS message (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL REFERENCES session(id) ON DELETE CASCADE,
                time_created INTEGER NOT NULL,
                data TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS part (
                id TEXT PRIMARY KEY,
                message_id TEXT NOT NULL REFERENCES message(id) ON DELETE CASCADE,
                session_id TEXT NOT NULL REFERENCES session(id) ON DELETE CASCADE,
                time_created INTEGER NOT NULL,
                data TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS todo (
                session_id TEXT PRIMARY KEY REFERENCES session(id) ON DELETE CASCADE,
                data TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS permission (
                project_id TEXT PRIMARY KEY REFERENCES project(id) ON DELETE CASCADE,
                data TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS session_share (
                session_id TEXT PRIMARY KEY REFERENCES session(id) ON DELETE CASCADE,
                url TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_session_project ON session(project_id);
            CREATE INDEX IF NOT EXISTS idx_session_parent ON session(parent_id);
            CREATE INDEX IF NOT EXISTS idx_message_session ON message(session_id);
            CREATE INDEX IF NOT EXISTS idx_part_message ON part(message_id);
            CREATE INDEX IF NOT EXISTS idx_part_session ON part(session_id);
            "#,
        )?;
        Ok(())
    }

    /// Run `f` inside a transaction. Effects registered on the scope run
    /// after commit, in registration order; on error the transaction
    /// rolls back and the effects are dropped.
    ///
    /// The connection lock is released before effects run, so an effect
    /// (e.g. an event subscriber) may read the store without deadlocking.
    pub fn transaction<T>(
        &self,
        f: impl FnOnce(&mut TxScope<'_>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let (value, effects) = {
            let mut conn = self.conn.lock().expect("db lock poisoned");
            let tx = conn.transaction()?;
            let mut scope = TxScope {
                tx: &tx,
                effects: Vec::new(),
            };
            match f(&mut scope) {
                Ok(value) => {
                    let effects = std::mem::take(&mut scope.effects);
                    drop(scope);
                    tx.commit()?;
                    (value, effects)
                }
                // Dropping the transaction rolls it back.
                Err(e) => return Err(e),
            }
        };
        for effect in effects {
            effect();
        }
        Ok(value)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
