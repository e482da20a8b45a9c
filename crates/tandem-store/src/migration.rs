// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! One-shot migration of the legacy per-file JSON storage layout into
//! the relational store.
//!
//! Legacy layout, rooted at the old storage directory:
//!
//! ```text
//! project/<id>.json
//! session/<project_id>/<session_id>.json
//! message/<session_id>/<message_id>.json
//! part/<message_id>/<part_id>.json
//! todo/<session_id>.json
//! permission/<project_id>.json
//! session_share/<session_id>.json
//! ```
//!
//! Inserts use `INSERT OR IGNORE` so the migration is idempotent; the
//! whole run happens in one transaction. Per-file failures (unreadable
//! JSON, orphaned rows rejected by foreign keys) are recorded in the
//! report and do not abort the run.

use std::path::{Path, PathBuf};

use rusqlite::params;
use serde_json::Value;
use tracing::info;

use crate::db::{Database, TxScope};
use crate::types::{MessageInfo, Part, SessionInfo};
use crate::StoreError;

#[derive(Debug, Default)]
pub struct MigrationReport {
    pub projects: usize,
    pub sessions: usize,
    pub messages: usize,
    pub parts: usize,
    pub todos: usize,
    pub permissions: usize,
    pub shares: usize,
    pub errors: Vec<String>,
}

impl MigrationReport {
    pub fn total(&self) -> usize {
        self.projects
            + self.sessions
            + self.messages
            + self.parts
            + self.todos
            + self.permissions
            + self.shares
    }
}

/// Migrate `storage_dir` into `db`. Safe to run on every startup; rows
/// that already exist are left alone.
pub fn migrate_legacy_json(
    db: &Database,
    storage_dir: &Path,
) -> Result<MigrationReport, StoreError> {
    if !storage_dir.is_dir() {
        return Ok(MigrationReport::default());
    }
    let report = db.transaction(|scope| {
        let mut report = MigrationReport::default();
        migrate_projects(scope, storage_dir, &mut report);
        migrate_sessions(scope, storage_dir, &mut report);
        migrate_messages(scope, storage_dir, &mut report);
        migrate_parts(scope, storage_dir, &mut report);
        migrate_keyed_json(
            scope,
            &storage_dir.join("todo"),
            "INSERT OR IGNORE INTO todo (session_id, data) VALUES (?1, ?2)",
            &mut report.todos,
            &mut report.errors,
        );
        migrate_keyed_json(
            scope,
            &storage_dir.join("permission"),
            "INSERT OR IGNORE INTO permission (project_id, data) VALUES (?1, ?2)",
            &mut report.permissions,
            &mut report.errors,
        );
        migrate_shares(scope, storage_dir, &mut report);
        Ok(report)
    })?;
    info!(
        migrated = report.total(),
        errors = report.errors.len(),
        "legacy JSON migration finished"
    );
    Ok(report)
}

fn json_files(dir: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let Ok(entries) = std::fs::read_dir(dir) else {
        return out;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().is_some_and(|e| e == "json") {
            out.push(path);
        }
    }
    out.sort();
    out
}

fn subdirs(dir: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let Ok(entries) = std::fs::read_dir(dir) else {
        return out;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            out.push(path);
        }
    }
    out.sort();
    out
}

fn read_json(path: &Path, errors: &mut Vec<String>) -> Option<Value> {
    let text = match std::fs::read_to_string(path) {
        Ok(t) => t,
        Err(e) => {
            errors.push(format!("{}: {e}", path.display()));
            return None;
        }
    };
    match serde_json::from_str(&text) {
        Ok(v) => Some(v),
        Err(e) => {
            errors.push(format!("{}: {e}", path.display()));
            None
        }
    }
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn migrate_projects(scope: &TxScope<'_>, root: &Path, report: &mut MigrationReport) {
    for path in json_files(&root.join("project")) {
        let Some(value) = read_json(&path, &mut report.errors) else {
            continue;
        };
        let id = value["id"]
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| file_stem(&path));
        let result = scope.tx().execute(
            "INSERT OR IGNORE INTO project (id, data, time_created) VALUES (?1, ?2, ?3)",
            params![id, value.to_string(), 0i64],
        );
        match result {
            Ok(n) => report.projects += n,
            Err(e) => report.errors.push(format!("{}: {e}", path.display())),
        }
    }
}

fn migrate_sessions(scope: &TxScope<'_>, root: &Path, report: &mut MigrationReport) {
    for project_dir in subdirs(&root.join("session")) {
        let project_id = file_stem(&project_dir);
        // The project row may predate the project/ directory layout.
        let _ = scope.tx().execute(
            "INSERT OR IGNORE INTO project (id, data, time_created) VALUES (?1, NULL, 0)",
            params![project_id],
        );
        for path in json_files(&project_dir) {
            let Some(value) = read_json(&path, &mut report.errors) else {
                continue;
            };
            let info: SessionInfo = match serde_json::from_value(value) {
                Ok(i) => i,
                Err(e) => {
                    report.errors.push(format!("{}: {e}", path.display()));
                    continue;
                }
            };
            let result = scope.tx().execute(
                "INSERT OR IGNORE INTO session \
                 (id, project_id, parent_id, directory, title, version, share_url, \
                  summary, revert, permission, time_created, time_updated, \
                  time_compacting, time_archived) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                params![
                    info.id,
                    info.project_id,
                    info.parent_id,
                    info.directory,
                    info.title,
                    info.version,
                    info.share.as_ref().map(|s| s.url.clone()),
                    opt_json(&info.summary),
                    opt_json(&info.revert),
                    opt_json(&info.permission),
                    info.time.created,
                    info.time.updated,
                    info.time.compacting,
                    info.time.archived,
                ],
            );
            match result {
                Ok(n) => report.sessions += n,
                Err(e) => report.errors.push(format!("{}: {e}", path.display())),
            }
        }
    }
}

fn migrate_messages(scope: &TxScope<'_>, root: &Path, report: &mut MigrationReport) {
    for session_dir in subdirs(&root.join("message")) {
        for path in json_files(&session_dir) {
            let Some(value) = read_json(&path, &mut report.errors) else {
                continue;
            };
            let info: MessageInfo = match serde_json::from_value(value.clone()) {
                Ok(i) => i,
                Err(e) => {
                    report.errors.push(format!("{}: {e}", path.display()));
                    continue;
                }
            };
            let result = scope.tx().execute(
                "INSERT OR IGNORE INTO message (id, session_id, time_created, data) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    info.id(),
                    info.session_id(),
                    info.created_at(),
                    value.to_string()
                ],
            );
            match result {
                Ok(n) => report.messages += n,
                Err(e) => report.errors.push(format!("{}: {e}", path.display())),
            }
        }
    }
}

fn migrate_parts(scope: &TxScope<'_>, root: &Path, report: &mut MigrationReport) {
    for message_dir in subdirs(&root.join("part")) {
        for path in json_files(&message_dir) {
            let Some(value) = read_json(&path, &mut report.errors) else {
                continue;
            };
            let part: Part = match serde_json::from_value(value.clone()) {
                Ok(p) => p,
                Err(e) => {
                    report.errors.push(format!("{}: {e}", path.display()));
                    continue;
                }
            };
            let result = scope.tx().execute(
                "INSERT OR IGNORE INTO part (id, message_id, session_id, time_created, data) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    part.id,
                    part.message_id,
                    part.session_id,
                    0i64,
                    value.to_string()
                ],
            );
            match result {
                Ok(n) => report.parts += n,
                Err(e) => report.errors.push(format!("{}: {e}", path.display())),
            }
        }
    }
}

fn migrate_keyed_json(
    scope: &TxScope<'_>,
    dir: &Path,
    sql: &str,
    count: &mut usize,
    errors: &mut Vec<String>,
) {
    for path in json_files(dir) {
        let Some(value) = read_json(&path, errors) else {
            continue;
        };
        let key = file_stem(&path);
        match scope.tx().execute(sql, params![key, value.to_string()]) {
            Ok(n) => *count += n,
            Err(e) => errors.push(format!("{}: {e}", path.display())),
        }
    }
}

fn migrate_shares(scope: &TxScope<'_>, root: &Path, report: &mut MigrationReport) {
    for path in json_files(&root.join("session_share")) {
        let Some(value) = read_json(&path, &mut report.errors) else {
            continue;
        };
        let session_id = file_stem(&path);
        let Some(url) = value["url"].as_str() else {
            report
                .errors
                .push(format!("{}: missing url", path.display()));
            continue;
        };
        let result = scope.tx().execute(
            "INSERT OR IGNORE INTO session_share (session_id, url) VALUES (?1, ?2)",
            params![session_id, url],
        );
        match result {
            Ok(n) => report.shares += n,
            Err(e) => report.errors.push(format!("{}: {e}", path.display())),
        }
    }
}

fn opt_json<T: serde::Serialize>(value: &Option<T>) -> Option<String> {
    value.as_ref().and_then(|v| serde_json::to_string(v).ok())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn write(path: &Path, value: &Value) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, serde_json::to_string_pretty(value).unwrap()).unwrap();
    }

    fn legacy_tree(root: &Path) {
        write(&root.join("project/proj1.json"), &json!({"id": "proj1"}));
        write(
            &root.join("session/proj1/session_1_aa.json"),
            &json!({
                "id": "session_1_aa",
                "projectID": "proj1",
                "directory": "/work",
                "title": "Old session",
                "version": "0.1.0",
                "time": {"created": 100, "updated": 200},
            }),
        );
        write(
            &root.join("message/session_1_aa/message_1_aa.json"),
            &json!({
                "id": "message_1_aa",
                "sessionID": "session_1_aa",
                "role": "user",
                "time": {"created": 150},
                "agent": "build",
                "model": {"providerID": "anthropic", "modelID": "m"},
            }),
        );
        write(
            &root.join("part/message_1_aa/part_1_aa.json"),
            &json!({
                "id": "part_1_aa",
                "sessionID": "session_1_aa",
                "messageID": "message_1_aa",
                "type": "text",
                "text": "hello",
            }),
        );
        write(&root.join("todo/session_1_aa.json"), &json!([]));
        write(
            &root.join("session_share/session_1_aa.json"),
            &json!({"url": "https://example.com/s/session_1_aa"}),
        );
    }

    #[test]
    fn migrates_full_tree() {
        let dir = tempfile::tempdir().unwrap();
        legacy_tree(dir.path());
        let db = Database::open_in_memory().unwrap();
        let report = migrate_legacy_json(&db, dir.path()).unwrap();
        assert_eq!(report.projects, 1);
        assert_eq!(report.sessions, 1);
        assert_eq!(report.messages, 1);
        assert_eq!(report.parts, 1);
        assert_eq!(report.todos, 1);
        assert_eq!(report.shares, 1);
        assert!(report.errors.is_empty(), "{:?}", report.errors);
    }

    #[test]
    fn migration_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        legacy_tree(dir.path());
        let db = Database::open_in_memory().unwrap();
        let first = migrate_legacy_json(&db, dir.path()).unwrap();
        assert!(first.total() > 0);
        let second = migrate_legacy_json(&db, dir.path()).unwrap();
        assert_eq!(second.total(), 0, "second run must insert nothing");
    }

    #[test]
    fn missing_storage_dir_is_a_noop() {
        let db = Database::open_in_memory().unwrap();
        let report = migrate_legacy_json(&db, Path::new("/nonexistent/xyz")).unwrap();
        assert_eq!(report.total(), 0);
        assert!(report.errors.is_empty());
    }

    #[test]
    fn malformed_json_is_reported_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        legacy_tree(dir.path());
        std::fs::create_dir_all(dir.path().join("project")).unwrap();
        std::fs::write(dir.path().join("project/broken.json"), "{not json").unwrap();
        let db = Database::open_in_memory().unwrap();
        let report = migrate_legacy_json(&db, dir.path()).unwrap();
        assert_eq!(report.sessions, 1);
        assert_eq!(report.errors.len(), 1);
    }

    #[test]
    fn orphaned_part_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        write(
            &dir.path().join("part/message_missing/part_1_zz.json"),
            &json!({
                "id": "part_1_zz",
                "sessionID": "session_missing",
                "messageID": "message_missing",
                "type": "text",
                "text": "orphan",
            }),
        );
        let db = Database::open_in_memory().unwrap();
        let report = migrate_legacy_json(&db, dir.path()).unwrap();
        assert_eq!(report.parts, 0);
        assert_eq!(report.errors.len(), 1);
    }
}
