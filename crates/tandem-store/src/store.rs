// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Session/message/part operations.
//!
//! Every operation runs inside a transaction; every event it produces
//! is registered as a post-commit effect, so subscribers only ever see
//! committed rows. The store is the sole writer of these tables.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use regex::Regex;
use rusqlite::{params, OptionalExtension};
use serde_json::Value;
use tracing::debug;

use tandem_bus::Bus;
use tandem_id::IdService;
use tandem_permission::PermissionRule;

use crate::db::{Database, TxScope};
use crate::events;
use crate::types::{
    MessageInfo, MessageWithParts, Part, SessionInfo, SessionRevert, SessionShare, SessionSummary,
    SessionTime,
};
use crate::StoreError;

/// Inputs for [`Store::create_session`].
#[derive(Debug, Default)]
pub struct CreateSession {
    pub parent_id: Option<String>,
    pub title: Option<String>,
    pub permission: Option<Vec<PermissionRule>>,
}

/// Conjunctive filters for [`Store::list`].
#[derive(Debug, Default)]
pub struct SessionFilter {
    pub directory: Option<String>,
    /// Only sessions without a parent.
    pub roots: bool,
    /// Only sessions updated at or after this timestamp (ms).
    pub since: Option<i64>,
    /// Substring match on the title.
    pub search: Option<String>,
    pub limit: Option<usize>,
}

pub struct Store {
    db: Database,
    bus: Bus,
    ids: Arc<IdService>,
    project_id: String,
    directory: String,
    version: String,
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// `"My title (fork #2)"` → `"My title (fork #3)"`; otherwise appends
/// `" (fork #1)"`.
pub fn forked_title(title: &str) -> String {
    let re = Regex::new(r"^(.+) \(fork #(\d+)\)$").expect("static regex");
    if let Some(caps) = re.captures(title) {
        if let Ok(n) = caps[2].parse::<u64>() {
            return format!("{} (fork #{})", &caps[1], n + 1);
        }
    }
    format!("{title} (fork #1)")
}

fn default_title(is_child: bool) -> String {
    let prefix = if is_child {
        "Child session - "
    } else {
        "New session - "
    };
    format!(
        "{prefix}{}",
        Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
    )
}

/// Whether a title was generated by [`default_title`] (and so may be
/// replaced by an auto-generated one without losing user intent).
pub fn is_default_title(title: &str) -> bool {
    let re = Regex::new(r"^(New session - |Child session - )\d{4}-\d{2}-\d{2}T").expect("static");
    re.is_match(title)
}

impl Store {
    /// Open the store for one project. The project row is created on
    /// first use.
    pub fn new(
        db: Database,
        bus: Bus,
        ids: Arc<IdService>,
        project_id: impl Into<String>,
        directory: impl Into<String>,
    ) -> Result<Self, StoreError> {
        let store = Self {
            db,
            bus,
            ids,
            project_id: project_id.into(),
            directory: directory.into(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        };
        store.db.transaction(|scope| {
            scope.tx().execute(
                "INSERT OR IGNORE INTO project (id, data, time_created) VALUES (?1, NULL, ?2)",
                params![store.project_id, now_ms()],
            )?;
            Ok(())
        })?;
        Ok(store)
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn ids(&self) -> &Arc<IdService> {
        &self.ids
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    // ── Sessions ─────────────────────────────────────────────────────────────

    pub fn create_session(&self, input: CreateSession) -> Result<SessionInfo, StoreError> {
        let now = now_ms();
        let info = SessionInfo {
            id: self.ids.session_id(),
            project_id: self.project_id.clone(),
            parent_id: input.parent_id.clone(),
            directory: self.directory.clone(),
            title: input
                .title
                .unwrap_or_else(|| default_title(input.parent_id.is_some())),
            version: self.version.clone(),
            share: None,
            summary: None,
            revert: None,
            permission: input.permission,
            time: SessionTime {
                created: now,
                updated: now,
                compacting: None,
                archived: None,
            },
        };
        self.db.transaction(|scope| {
            scope.tx().execute(
                "INSERT INTO session \
                 (id, project_id, parent_id, directory, title, version, permission, \
                  time_created, time_updated) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    info.id,
                    info.project_id,
                    info.parent_id,
                    info.directory,
                    info.title,
                    info.version,
                    to_json_opt(&info.permission)?,
                    info.time.created,
                    info.time.updated,
                ],
            )?;
            self.publish(scope, events::TOPIC_SESSION_CREATED, events::session_payload(&info));
            self.publish(scope, events::TOPIC_SESSION_UPDATED, events::session_payload(&info));
            Ok(())
        })?;
        debug!(session = %info.id, "session created");
        Ok(info)
    }

    pub fn get(&self, session_id: &str) -> Result<SessionInfo, StoreError> {
        self.db
            .transaction(|scope| read_session(scope, session_id))
    }

    pub fn touch(&self, session_id: &str) -> Result<SessionInfo, StoreError> {
        self.update_session(session_id, "time_updated = ?2", vec![now_ms().into()])
    }

    pub fn set_title(&self, session_id: &str, title: &str) -> Result<SessionInfo, StoreError> {
        self.update_session(session_id, "title = ?2", vec![title.to_string().into()])
    }

    pub fn set_archived(
        &self,
        session_id: &str,
        archived: Option<i64>,
    ) -> Result<SessionInfo, StoreError> {
        self.update_session(session_id, "time_archived = ?2", vec![archived.into()])
    }

    pub fn set_compacting(
        &self,
        session_id: &str,
        compacting: Option<i64>,
    ) -> Result<SessionInfo, StoreError> {
        self.update_session(session_id, "time_compacting = ?2", vec![compacting.into()])
    }

    pub fn set_permission(
        &self,
        session_id: &str,
        permission: Vec<PermissionRule>,
    ) -> Result<SessionInfo, StoreError> {
        let json = serde_json::to_string(&permission)?;
        self.update_session(
            session_id,
            "permission = ?2, time_updated = ?3",
            vec![json.into(), now_ms().into()],
        )
    }

    pub fn set_revert(
        &self,
        session_id: &str,
        revert: SessionRevert,
        summary: Option<SessionSummary>,
    ) -> Result<SessionInfo, StoreError> {
        let revert_json = serde_json::to_string(&revert)?;
        match summary {
            Some(summary) => {
                let summary_json = serde_json::to_string(&summary)?;
                self.update_session(
                    session_id,
                    "revert = ?2, summary = ?3, time_updated = ?4",
                    vec![revert_json.into(), summary_json.into(), now_ms().into()],
                )
            }
            None => self.update_session(
                session_id,
                "revert = ?2, time_updated = ?3",
                vec![revert_json.into(), now_ms().into()],
            ),
        }
    }

    pub fn clear_revert(&self, session_id: &str) -> Result<SessionInfo, StoreError> {
        self.update_session(
            session_id,
            "revert = NULL, time_updated = ?2",
            vec![now_ms().into()],
        )
    }

    pub fn share(&self, session_id: &str) -> Result<SessionShare, StoreError> {
        let url = format!("https://tandem.example.com/s/{session_id}");
        self.db.transaction(|scope| {
            let changed = scope.tx().execute(
                "UPDATE session SET share_url = ?2 WHERE id = ?1",
                params![session_id, url],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("session {session_id}")));
            }
            scope.tx().execute(
                "INSERT OR REPLACE INTO session_share (session_id, url) VALUES (?1, ?2)",
                params![session_id, url],
            )?;
            let info = read_session(scope, session_id)?;
            self.publish(scope, events::TOPIC_SESSION_UPDATED, events::session_payload(&info));
            Ok(())
        })?;
        Ok(SessionShare { url })
    }

    pub fn unshare(&self, session_id: &str) -> Result<(), StoreError> {
        self.db.transaction(|scope| {
            let changed = scope.tx().execute(
                "UPDATE session SET share_url = NULL WHERE id = ?1",
                params![session_id],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("session {session_id}")));
            }
            scope.tx().execute(
                "DELETE FROM session_share WHERE session_id = ?1",
                params![session_id],
            )?;
            let info = read_session(scope, session_id)?;
            self.publish(scope, events::TOPIC_SESSION_UPDATED, events::session_payload(&info));
            Ok(())
        })
    }

    pub fn list(&self, filter: &SessionFilter) -> Result<Vec<SessionInfo>, StoreError> {
        let mut sql = String::from(
            "SELECT id FROM session WHERE project_id = ?1",
        );
        let mut params_vec: Vec<rusqlite::types::Value> =
            vec![self.project_id.clone().into()];
        if let Some(dir) = &filter.directory {
            params_vec.push(dir.clone().into());
            sql.push_str(&format!(" AND directory = ?{}", params_vec.len()));
        }
        if filter.roots {
            sql.push_str(" AND parent_id IS NULL");
        }
        if let Some(since) = filter.since {
            params_vec.push(since.into());
            sql.push_str(&format!(" AND time_updated >= ?{}", params_vec.len()));
        }
        if let Some(search) = &filter.search {
            params_vec.push(format!("%{search}%").into());
            sql.push_str(&format!(" AND title LIKE ?{}", params_vec.len()));
        }
        sql.push_str(" ORDER BY time_updated DESC");
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        self.db.transaction(|scope| {
            let mut stmt = scope.tx().prepare(&sql)?;
            let ids: Vec<String> = stmt
                .query_map(rusqlite::params_from_iter(params_vec.iter()), |row| {
                    row.get(0)
                })?
                .collect::<Result<_, _>>()?;
            ids.iter().map(|id| read_session(scope, id)).collect()
        })
    }

    pub fn children(&self, parent_id: &str) -> Result<Vec<SessionInfo>, StoreError> {
        self.db.transaction(|scope| {
            let mut stmt = scope.tx().prepare(
                "SELECT id FROM session WHERE project_id = ?1 AND parent_id = ?2 \
                 ORDER BY time_updated DESC",
            )?;
            let ids: Vec<String> = stmt
                .query_map(params![self.project_id, parent_id], |row| row.get(0))?
                .collect::<Result<_, _>>()?;
            ids.iter().map(|id| read_session(scope, id)).collect()
        })
    }

    /// Delete a session, its children (recursively) and, via cascading
    /// foreign keys, all of its messages and parts. Unknown ids are a
    /// no-op.
    pub fn delete(&self, session_id: &str) -> Result<(), StoreError> {
        let Ok(info) = self.get(session_id) else {
            return Ok(());
        };
        for child in self.children(session_id)? {
            self.delete(&child.id)?;
        }
        self.db.transaction(|scope| {
            scope
                .tx()
                .execute("DELETE FROM session WHERE id = ?1", params![session_id])?;
            self.publish(scope, events::TOPIC_SESSION_DELETED, events::session_payload(&info));
            Ok(())
        })
    }

    /// Fork `parent_session`: a new root session holding clones (fresh
    /// ids) of every message before `cutoff`, with assistant parent
    /// pointers remapped into the clone. Token totals ride along
    /// unchanged.
    pub fn fork_session(
        &self,
        parent_session: &str,
        cutoff: Option<&str>,
    ) -> Result<SessionInfo, StoreError> {
        let original = self.get(parent_session)?;
        let forked = self.create_session(CreateSession {
            parent_id: None,
            title: Some(forked_title(&original.title)),
            permission: original.permission.clone(),
        })?;

        let messages = self.list_messages(parent_session, None)?;
        let mut id_map: HashMap<String, String> = HashMap::new();
        for msg in messages {
            if cutoff == Some(msg.info.id()) {
                break;
            }
            let new_id = self.ids.message_id();
            id_map.insert(msg.info.id().to_string(), new_id.clone());

            let mut info = msg.info.clone();
            match &mut info {
                MessageInfo::User(m) => {
                    m.id = new_id.clone();
                    m.session_id = forked.id.clone();
                }
                MessageInfo::Assistant(m) => {
                    m.id = new_id.clone();
                    m.session_id = forked.id.clone();
                    if let Some(mapped) = id_map.get(&m.parent_id) {
                        m.parent_id = mapped.clone();
                    }
                }
            }
            self.upsert_message(&info)?;

            for part in &msg.parts {
                let mut part = part.clone();
                part.id = self.ids.part_id();
                part.message_id = new_id.clone();
                part.session_id = forked.id.clone();
                self.upsert_part(&part)?;
            }
        }
        Ok(forked)
    }

    // ── Messages ─────────────────────────────────────────────────────────────

    pub fn upsert_message(&self, info: &MessageInfo) -> Result<(), StoreError> {
        let data = serde_json::to_string(info)?;
        self.db.transaction(|scope| {
            ensure_session(scope, info.session_id())?;
            if let MessageInfo::Assistant(m) = info {
                ensure_parent_user(scope, &m.session_id, &m.parent_id)?;
            }
            scope.tx().execute(
                "INSERT INTO message (id, session_id, time_created, data) \
                 VALUES (?1, ?2, ?3, ?4) \
                 ON CONFLICT(id) DO UPDATE SET data = excluded.data",
                params![info.id(), info.session_id(), info.created_at(), data],
            )?;
            self.publish(scope, events::TOPIC_MESSAGE_UPDATED, events::message_payload(info));
            Ok(())
        })
    }

    pub fn remove_message(&self, session_id: &str, message_id: &str) -> Result<(), StoreError> {
        self.db.transaction(|scope| {
            let changed = scope.tx().execute(
                "DELETE FROM message WHERE id = ?1 AND session_id = ?2",
                params![message_id, session_id],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("message {message_id}")));
            }
            self.publish(
                scope,
                events::TOPIC_MESSAGE_REMOVED,
                events::message_removed_payload(session_id, message_id),
            );
            Ok(())
        })
    }

    /// Messages in chronological order, each with its parts. With a
    /// limit, the newest `limit` messages are returned (still oldest
    /// first).
    pub fn list_messages(
        &self,
        session_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<MessageWithParts>, StoreError> {
        self.db.transaction(|scope| {
            ensure_session(scope, session_id)?;
            let sql = match limit {
                Some(n) => format!(
                    "SELECT data FROM message WHERE session_id = ?1 \
                     ORDER BY time_created DESC, rowid DESC LIMIT {n}"
                ),
                None => "SELECT data FROM message WHERE session_id = ?1 \
                         ORDER BY time_created ASC, rowid ASC"
                    .to_string(),
            };
            let mut stmt = scope.tx().prepare(&sql)?;
            let mut infos: Vec<MessageInfo> = stmt
                .query_map(params![session_id], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?
                .into_iter()
                .map(|data| serde_json::from_str(&data))
                .collect::<Result<_, _>>()?;
            if limit.is_some() {
                infos.reverse();
            }
            infos
                .into_iter()
                .map(|info| {
                    let parts = read_parts(scope, info.id())?;
                    Ok(MessageWithParts { info, parts })
                })
                .collect()
        })
    }

    pub fn get_message_with_parts(
        &self,
        session_id: &str,
        message_id: &str,
    ) -> Result<MessageWithParts, StoreError> {
        self.db.transaction(|scope| {
            let data: Option<String> = scope
                .tx()
                .query_row(
                    "SELECT data FROM message WHERE id = ?1 AND session_id = ?2",
                    params![message_id, session_id],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(data) = data else {
                return Err(StoreError::NotFound(format!("message {message_id}")));
            };
            let info: MessageInfo = serde_json::from_str(&data)?;
            let parts = read_parts(scope, message_id)?;
            Ok(MessageWithParts { info, parts })
        })
    }

    // ── Parts ────────────────────────────────────────────────────────────────

    pub fn upsert_part(&self, part: &Part) -> Result<(), StoreError> {
        let data = serde_json::to_string(part)?;
        self.db.transaction(|scope| {
            let existing: Option<String> = scope
                .tx()
                .query_row(
                    "SELECT data FROM part WHERE id = ?1",
                    params![part.id],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(existing) = existing {
                let old: Part = serde_json::from_str(&existing)?;
                check_tool_transition(&old, part)?;
            } else {
                // Only check the parent on insert; updates imply it exists.
                let message_exists: Option<i64> = scope
                    .tx()
                    .query_row(
                        "SELECT 1 FROM message WHERE id = ?1 AND session_id = ?2",
                        params![part.message_id, part.session_id],
                        |row| row.get(0),
                    )
                    .optional()?;
                if message_exists.is_none() {
                    return Err(StoreError::NotFound(format!("message {}", part.message_id)));
                }
            }
            scope.tx().execute(
                "INSERT INTO part (id, message_id, session_id, time_created, data) \
                 VALUES (?1, ?2, ?3, ?4, ?5) \
                 ON CONFLICT(id) DO UPDATE SET data = excluded.data",
                params![part.id, part.message_id, part.session_id, now_ms(), data],
            )?;
            self.publish(scope, events::TOPIC_PART_UPDATED, events::part_payload(part));
            Ok(())
        })
    }

    pub fn remove_part(
        &self,
        session_id: &str,
        message_id: &str,
        part_id: &str,
    ) -> Result<(), StoreError> {
        self.db.transaction(|scope| {
            let changed = scope.tx().execute(
                "DELETE FROM part WHERE id = ?1 AND message_id = ?2 AND session_id = ?3",
                params![part_id, message_id, session_id],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("part {part_id}")));
            }
            self.publish(
                scope,
                events::TOPIC_PART_REMOVED,
                events::part_removed_payload(session_id, message_id, part_id),
            );
            Ok(())
        })
    }

    // ── Project permissions ──────────────────────────────────────────────────

    /// Persist the project's permission ruleset. The engine is seeded
    /// from this at process start; session-scoped rules never land here.
    pub fn set_project_permissions(&self, rules: &[PermissionRule]) -> Result<(), StoreError> {
        let data = serde_json::to_string(rules)?;
        self.db.transaction(|scope| {
            scope.tx().execute(
                "INSERT OR REPLACE INTO permission (project_id, data) VALUES (?1, ?2)",
                params![self.project_id, data],
            )?;
            Ok(())
        })
    }

    pub fn get_project_permissions(&self) -> Result<Option<Vec<PermissionRule>>, StoreError> {
        self.db.transaction(|scope| {
            let data: Option<String> = scope
                .tx()
                .query_row(
                    "SELECT data FROM permission WHERE project_id = ?1",
                    params![self.project_id],
                    |row| row.get(0),
                )
                .optional()?;
            from_json_opt(data)
        })
    }

    // ── Todos ────────────────────────────────────────────────────────────────

    pub fn set_todos(&self, session_id: &str, todos: &Value) -> Result<(), StoreError> {
        let data = serde_json::to_string(todos)?;
        self.db.transaction(|scope| {
            ensure_session(scope, session_id)?;
            scope.tx().execute(
                "INSERT OR REPLACE INTO todo (session_id, data) VALUES (?1, ?2)",
                params![session_id, data],
            )?;
            Ok(())
        })
    }

    pub fn get_todos(&self, session_id: &str) -> Result<Option<Value>, StoreError> {
        self.db.transaction(|scope| {
            let data: Option<String> = scope
                .tx()
                .query_row(
                    "SELECT data FROM todo WHERE session_id = ?1",
                    params![session_id],
                    |row| row.get(0),
                )
                .optional()?;
            data.map(|d| serde_json::from_str(&d).map_err(StoreError::from))
                .transpose()
        })
    }

    // ── Internals ────────────────────────────────────────────────────────────

    fn publish(&self, scope: &mut TxScope<'_>, topic: &'static str, payload: Value) {
        let bus = self.bus.clone();
        scope.effect(move || bus.emit(topic, payload));
    }

    fn update_session(
        &self,
        session_id: &str,
        set_clause: &str,
        values: Vec<rusqlite::types::Value>,
    ) -> Result<SessionInfo, StoreError> {
        let sql = format!("UPDATE session SET {set_clause} WHERE id = ?1");
        self.db.transaction(|scope| {
            let mut params_vec: Vec<rusqlite::types::Value> =
                vec![session_id.to_string().into()];
            params_vec.extend(values.iter().cloned());
            let changed = scope
                .tx()
                .execute(&sql, rusqlite::params_from_iter(params_vec.iter()))?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("session {session_id}")));
            }
            let info = read_session(scope, session_id)?;
            self.publish(scope, events::TOPIC_SESSION_UPDATED, events::session_payload(&info));
            Ok(info)
        })
    }
}

fn to_json_opt<T: serde::Serialize>(value: &Option<T>) -> Result<Option<String>, StoreError> {
    value
        .as_ref()
        .map(|v| serde_json::to_string(v).map_err(StoreError::from))
        .transpose()
}

fn ensure_session(scope: &TxScope<'_>, session_id: &str) -> Result<(), StoreError> {
    let exists: Option<i64> = scope
        .tx()
        .query_row(
            "SELECT 1 FROM session WHERE id = ?1",
            params![session_id],
            |row| row.get(0),
        )
        .optional()?;
    if exists.is_none() {
        return Err(StoreError::NotFound(format!("session {session_id}")));
    }
    Ok(())
}

/// Invariant: an assistant's `parentID` must name a user message in the
/// same session.
fn ensure_parent_user(
    scope: &TxScope<'_>,
    session_id: &str,
    parent_id: &str,
) -> Result<(), StoreError> {
    let data: Option<String> = scope
        .tx()
        .query_row(
            "SELECT data FROM message WHERE id = ?1 AND session_id = ?2",
            params![parent_id, session_id],
            |row| row.get(0),
        )
        .optional()?;
    let Some(data) = data else {
        return Err(StoreError::NotFound(format!("parent message {parent_id}")));
    };
    let parent: MessageInfo = serde_json::from_str(&data)?;
    if parent.as_user().is_none() {
        return Err(StoreError::NotFound(format!(
            "parent message {parent_id} is not a user message"
        )));
    }
    Ok(())
}

fn read_parts(scope: &TxScope<'_>, message_id: &str) -> Result<Vec<Part>, StoreError> {
    let mut stmt = scope.tx().prepare(
        "SELECT data FROM part WHERE message_id = ?1 ORDER BY time_created ASC, rowid ASC",
    )?;
    let rows: Vec<String> = stmt
        .query_map(params![message_id], |row| row.get(0))?
        .collect::<Result<_, _>>()?;
    rows.into_iter()
        .map(|data| serde_json::from_str(&data).map_err(StoreError::from))
        .collect()
}

fn read_session(scope: &TxScope<'_>, session_id: &str) -> Result<SessionInfo, StoreError> {
    let info = scope
        .tx()
        .query_row(
            "SELECT id, project_id, parent_id, directory, title, version, share_url, \
                    summary, revert, permission, \
                    time_created, time_updated, time_compacting, time_archived \
             FROM session WHERE id = ?1",
            params![session_id],
            |row| {
                Ok(RawSession {
                    id: row.get(0)?,
                    project_id: row.get(1)?,
                    parent_id: row.get(2)?,
                    directory: row.get(3)?,
                    title: row.get(4)?,
                    version: row.get(5)?,
                    share_url: row.get(6)?,
                    summary: row.get(7)?,
                    revert: row.get(8)?,
                    permission: row.get(9)?,
                    time_created: row.get(10)?,
                    time_updated: row.get(11)?,
                    time_compacting: row.get(12)?,
                    time_archived: row.get(13)?,
                })
            },
        )
        .optional()?;
    let Some(raw) = info else {
        return Err(StoreError::NotFound(format!("session {session_id}")));
    };
    raw.into_info()
}

struct RawSession {
    id: String,
    project_id: String,
    parent_id: Option<String>,
    directory: String,
    title: String,
    version: String,
    share_url: Option<String>,
    summary: Option<String>,
    revert: Option<String>,
    permission: Option<String>,
    time_created: i64,
    time_updated: i64,
    time_compacting: Option<i64>,
    time_archived: Option<i64>,
}

impl RawSession {
    fn into_info(self) -> Result<SessionInfo, StoreError> {
        Ok(SessionInfo {
            id: self.id,
            project_id: self.project_id,
            parent_id: self.parent_id,
            directory: self.directory,
            title: self.title,
            version: self.version,
            share: self.share_url.map(|url| SessionShare { url }),
            summary: from_json_opt(self.summary)?,
            revert: from_json_opt(self.revert)?,
            permission: from_json_opt(self.permission)?,
            time: SessionTime {
                created: self.time_created,
                updated: self.time_updated,
                compacting: self.time_compacting,
                archived: self.time_archived,
            },
        })
    }
}

fn from_json_opt<T: serde::de::DeserializeOwned>(
    value: Option<String>,
) -> Result<Option<T>, StoreError> {
    value
        .map(|v| serde_json::from_str(&v).map_err(StoreError::from))
        .transpose()
}

fn check_tool_transition(old: &Part, new: &Part) -> Result<(), StoreError> {
    let (Some(old_state), Some(new_state)) = (old.tool_state(), new.tool_state()) else {
        return Ok(());
    };
    let backwards = new_state.rank() < old_state.rank();
    let terminal_flip = old_state.rank() == 2
        && new_state.rank() == 2
        && old_state.status() != new_state.status();
    if backwards || terminal_flip {
        return Err(StoreError::InvalidTransition {
            from: old_state.status(),
            to: new_state.status(),
        });
    }
    Ok(())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use serde_json::json;
    use tandem_bus::HandlerFlow;
    use tandem_config::ModelRef;

    use crate::types::{
        AssistantMessage, MessageTime, PartBody, TimeRange, TokenUsage, ToolState, UserMessage,
    };

    use super::*;

    fn store() -> (Store, Bus) {
        let bus = Bus::new();
        let db = Database::open_in_memory().unwrap();
        let ids = Arc::new(IdService::new());
        let store = Store::new(db, bus.clone(), ids, "proj1", "/work").unwrap();
        (store, bus)
    }

    fn user_message(store: &Store, session_id: &str) -> UserMessage {
        UserMessage {
            id: store.ids().message_id(),
            session_id: session_id.to_string(),
            time: MessageTime {
                created: now_ms(),
                completed: None,
            },
            agent: "build".into(),
            model: ModelRef::default(),
            system: None,
            format: None,
            tools: None,
        }
    }

    fn assistant_message(store: &Store, session_id: &str, parent_id: &str) -> AssistantMessage {
        AssistantMessage {
            id: store.ids().message_id(),
            session_id: session_id.to_string(),
            parent_id: parent_id.to_string(),
            provider_id: "anthropic".into(),
            model_id: "m".into(),
            agent: "build".into(),
            time: MessageTime {
                created: now_ms(),
                completed: None,
            },
            cost: 0.0,
            tokens: TokenUsage::default(),
            error: None,
            summary: None,
            structured: None,
            finish: None,
        }
    }

    fn text_part(store: &Store, session_id: &str, message_id: &str, text: &str) -> Part {
        Part {
            id: store.ids().part_id(),
            session_id: session_id.to_string(),
            message_id: message_id.to_string(),
            body: PartBody::Text {
                text: text.to_string(),
                synthetic: None,
                ignored: None,
            },
        }
    }

    // ── Sessions ─────────────────────────────────────────────────────────────

    #[test]
    fn create_session_assigns_prefixed_id() {
        let (store, _) = store();
        let info = store.create_session(CreateSession::default()).unwrap();
        assert!(info.id.starts_with("session_"));
        assert_eq!(info.project_id, "proj1");
        assert!(is_default_title(&info.title));
    }

    #[test]
    fn get_unknown_session_is_not_found() {
        let (store, _) = store();
        assert!(matches!(
            store.get("session_bogus"),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn create_publishes_created_then_updated_after_commit() {
        let (store, bus) = store();
        let topics = Arc::new(StdMutex::new(Vec::new()));
        let t = topics.clone();
        let _sub = bus.subscribe_all(move |ev| {
            t.lock().unwrap().push(ev.topic.clone());
            HandlerFlow::Continue
        });
        store.create_session(CreateSession::default()).unwrap();
        assert_eq!(
            *topics.lock().unwrap(),
            vec!["session.created", "session.updated"]
        );
    }

    #[test]
    fn set_title_and_touch_roundtrip() {
        let (store, _) = store();
        let info = store.create_session(CreateSession::default()).unwrap();
        let updated = store.set_title(&info.id, "My task").unwrap();
        assert_eq!(updated.title, "My task");
        let touched = store.touch(&info.id).unwrap();
        assert!(touched.time.updated >= info.time.updated);
    }

    #[test]
    fn list_orders_by_updated_desc() {
        let (store, _) = store();
        let a = store.create_session(CreateSession::default()).unwrap();
        let b = store.create_session(CreateSession::default()).unwrap();
        store.touch(&a.id).unwrap();
        let listed = store.list(&SessionFilter::default()).unwrap();
        assert_eq!(listed[0].id, a.id);
        assert!(listed.iter().any(|s| s.id == b.id));
    }

    #[test]
    fn list_search_filters_by_title() {
        let (store, _) = store();
        let a = store.create_session(CreateSession::default()).unwrap();
        store.set_title(&a.id, "fix the parser").unwrap();
        let b = store.create_session(CreateSession::default()).unwrap();
        store.set_title(&b.id, "write docs").unwrap();
        let hits = store
            .list(&SessionFilter {
                search: Some("parser".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, a.id);
    }

    #[test]
    fn revert_roundtrip_and_clear() {
        let (store, _) = store();
        let info = store.create_session(CreateSession::default()).unwrap();
        let revert = SessionRevert {
            message_id: "message_1_aa".into(),
            part_id: None,
            snapshot: Some("snap".into()),
            diff: None,
        };
        let summary = SessionSummary {
            additions: 3,
            deletions: 1,
            files: 2,
            diffs: None,
        };
        let updated = store
            .set_revert(&info.id, revert.clone(), Some(summary))
            .unwrap();
        assert_eq!(updated.revert.as_ref().unwrap().message_id, "message_1_aa");
        assert_eq!(updated.summary.as_ref().unwrap().additions, 3);
        let cleared = store.clear_revert(&info.id).unwrap();
        assert!(cleared.revert.is_none());
        // Clearing the revert leaves the summary in place.
        assert!(cleared.summary.is_some());
    }

    #[test]
    fn archive_sets_and_clears_timestamp() {
        let (store, _) = store();
        let info = store.create_session(CreateSession::default()).unwrap();
        let archived = store.set_archived(&info.id, Some(12345)).unwrap();
        assert_eq!(archived.time.archived, Some(12345));
        let unarchived = store.set_archived(&info.id, None).unwrap();
        assert!(unarchived.time.archived.is_none());
    }

    #[test]
    fn share_sets_url_and_unshare_clears_it() {
        let (store, _) = store();
        let info = store.create_session(CreateSession::default()).unwrap();
        let share = store.share(&info.id).unwrap();
        assert!(share.url.contains(&info.id));
        assert!(store.get(&info.id).unwrap().share.is_some());
        store.unshare(&info.id).unwrap();
        assert!(store.get(&info.id).unwrap().share.is_none());
    }

    #[test]
    fn delete_cascades_to_children_and_rows() {
        let (store, bus) = store();
        let parent = store.create_session(CreateSession::default()).unwrap();
        let child = store
            .create_session(CreateSession {
                parent_id: Some(parent.id.clone()),
                ..Default::default()
            })
            .unwrap();
        let deleted = Arc::new(StdMutex::new(Vec::new()));
        let d = deleted.clone();
        let _sub = bus.subscribe(events::TOPIC_SESSION_DELETED, move |ev| {
            d.lock()
                .unwrap()
                .push(ev.payload["info"]["id"].as_str().unwrap().to_string());
            HandlerFlow::Continue
        });
        store.delete(&parent.id).unwrap();
        assert!(store.get(&parent.id).is_err());
        assert!(store.get(&child.id).is_err());
        assert_eq!(deleted.lock().unwrap().len(), 2);
    }

    // ── Messages & parts ─────────────────────────────────────────────────────

    #[test]
    fn assistant_requires_user_parent_in_same_session() {
        let (store, _) = store();
        let s = store.create_session(CreateSession::default()).unwrap();
        let orphan = assistant_message(&store, &s.id, "message_bogus");
        assert!(store
            .upsert_message(&MessageInfo::Assistant(orphan))
            .is_err());
    }

    #[test]
    fn messages_list_in_chronological_order_with_parts() {
        let (store, _) = store();
        let s = store.create_session(CreateSession::default()).unwrap();
        let user = user_message(&store, &s.id);
        store.upsert_message(&MessageInfo::User(user.clone())).unwrap();
        let assistant = assistant_message(&store, &s.id, &user.id);
        store
            .upsert_message(&MessageInfo::Assistant(assistant.clone()))
            .unwrap();
        store
            .upsert_part(&text_part(&store, &s.id, &user.id, "hi"))
            .unwrap();
        let listed = store.list_messages(&s.id, None).unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].info.id(), user.id);
        assert_eq!(listed[0].parts.len(), 1);
        assert_eq!(listed[1].info.id(), assistant.id);
    }

    #[test]
    fn part_update_event_refers_to_readable_part() {
        let (store, bus) = store();
        let s = store.create_session(CreateSession::default()).unwrap();
        let user = user_message(&store, &s.id);
        store.upsert_message(&MessageInfo::User(user.clone())).unwrap();

        // P1: whatever the subscriber hears must already be readable.
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let seen2 = seen.clone();
        let _sub = bus.subscribe(events::TOPIC_PART_UPDATED, move |ev| {
            let part = &ev.payload["part"];
            seen2.lock().unwrap().push((
                part["messageID"].as_str().unwrap().to_string(),
                part["id"].as_str().unwrap().to_string(),
            ));
            HandlerFlow::Continue
        });
        store
            .upsert_part(&text_part(&store, &s.id, &user.id, "hello"))
            .unwrap();

        for (message_id, part_id) in seen.lock().unwrap().iter() {
            let loaded = store.get_message_with_parts(&s.id, message_id).unwrap();
            assert!(loaded.parts.iter().any(|p| &p.id == part_id));
        }
    }

    #[test]
    fn subscriber_may_read_store_during_event() {
        let bus = Bus::new();
        let db = Database::open_in_memory().unwrap();
        let ids = Arc::new(IdService::new());
        let store = Arc::new(Store::new(db, bus.clone(), ids, "proj1", "/work").unwrap());

        let reader = Arc::clone(&store);
        let observed = Arc::new(StdMutex::new(Vec::new()));
        let o = observed.clone();
        let _sub = bus.subscribe(events::TOPIC_PART_UPDATED, move |ev| {
            let part = &ev.payload["part"];
            let session_id = part["sessionID"].as_str().unwrap();
            let message_id = part["messageID"].as_str().unwrap();
            // Effects run outside the connection lock, so reading back
            // from inside a handler must neither deadlock nor miss the
            // committed row.
            let loaded = reader.get_message_with_parts(session_id, message_id).unwrap();
            o.lock().unwrap().push(loaded.parts.len());
            HandlerFlow::Continue
        });

        let s = store.create_session(CreateSession::default()).unwrap();
        let user = user_message(&store, &s.id);
        store.upsert_message(&MessageInfo::User(user.clone())).unwrap();
        store
            .upsert_part(&text_part(&store, &s.id, &user.id, "hello"))
            .unwrap();
        assert_eq!(*observed.lock().unwrap(), vec![1]);
    }

    #[test]
    fn tool_state_cannot_go_backwards() {
        let (store, _) = store();
        let s = store.create_session(CreateSession::default()).unwrap();
        let user = user_message(&store, &s.id);
        store.upsert_message(&MessageInfo::User(user.clone())).unwrap();
        let assistant = assistant_message(&store, &s.id, &user.id);
        store
            .upsert_message(&MessageInfo::Assistant(assistant.clone()))
            .unwrap();

        let mut part = Part {
            id: store.ids().part_id(),
            session_id: s.id.clone(),
            message_id: assistant.id.clone(),
            body: PartBody::Tool {
                call_id: "tc_1".into(),
                tool: "read".into(),
                state: ToolState::Running {
                    input: json!({}),
                    title: None,
                    metadata: None,
                    time: TimeRange {
                        start: 0,
                        end: None,
                    },
                },
            },
        };
        store.upsert_part(&part).unwrap();

        part.body = PartBody::Tool {
            call_id: "tc_1".into(),
            tool: "read".into(),
            state: ToolState::Pending { input: json!({}) },
        };
        assert!(matches!(
            store.upsert_part(&part),
            Err(StoreError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn terminal_tool_state_cannot_flip() {
        let (store, _) = store();
        let s = store.create_session(CreateSession::default()).unwrap();
        let user = user_message(&store, &s.id);
        store.upsert_message(&MessageInfo::User(user.clone())).unwrap();

        let completed = ToolState::Completed {
            input: json!({}),
            output: "ok".into(),
            title: "read".into(),
            metadata: json!({}),
            time: TimeRange {
                start: 0,
                end: Some(1),
            },
            attachments: None,
        };
        let mut part = Part {
            id: store.ids().part_id(),
            session_id: s.id.clone(),
            message_id: user.id.clone(),
            body: PartBody::Tool {
                call_id: "tc_1".into(),
                tool: "read".into(),
                state: completed,
            },
        };
        store.upsert_part(&part).unwrap();
        part.body = PartBody::Tool {
            call_id: "tc_1".into(),
            tool: "read".into(),
            state: ToolState::Error {
                input: json!({}),
                error: "late".into(),
                time: TimeRange {
                    start: 0,
                    end: Some(2),
                },
            },
        };
        assert!(store.upsert_part(&part).is_err());
    }

    // ── Forking ──────────────────────────────────────────────────────────────

    #[test]
    fn forked_title_sequence() {
        assert_eq!(forked_title("Task"), "Task (fork #1)");
        assert_eq!(forked_title("Task (fork #1)"), "Task (fork #2)");
        assert_eq!(forked_title("Task (fork #12)"), "Task (fork #13)");
    }

    #[test]
    fn fork_clones_messages_before_cutoff_with_fresh_ids() {
        let (store, _) = store();
        let s = store.create_session(CreateSession::default()).unwrap();
        store.set_title(&s.id, "Original").unwrap();

        let u1 = user_message(&store, &s.id);
        store.upsert_message(&MessageInfo::User(u1.clone())).unwrap();
        store
            .upsert_part(&text_part(&store, &s.id, &u1.id, "first"))
            .unwrap();
        let mut a1 = assistant_message(&store, &s.id, &u1.id);
        a1.tokens = TokenUsage {
            input: 10,
            output: 1,
            reasoning: 0,
            cache: Default::default(),
            total: 11,
        };
        store
            .upsert_message(&MessageInfo::Assistant(a1.clone()))
            .unwrap();
        let u2 = user_message(&store, &s.id);
        store.upsert_message(&MessageInfo::User(u2.clone())).unwrap();
        let a2 = assistant_message(&store, &s.id, &u2.id);
        store
            .upsert_message(&MessageInfo::Assistant(a2.clone()))
            .unwrap();

        let child = store.fork_session(&s.id, Some(&u2.id)).unwrap();
        assert!(child.title.ends_with(" (fork #1)"));
        assert!(child.parent_id.is_none(), "forks are roots");

        let cloned = store.list_messages(&child.id, None).unwrap();
        assert_eq!(cloned.len(), 2);

        let parent_ids: Vec<String> = store
            .list_messages(&s.id, None)
            .unwrap()
            .iter()
            .map(|m| m.info.id().to_string())
            .collect();
        for msg in &cloned {
            assert!(
                !parent_ids.iter().any(|id| id == msg.info.id()),
                "ids must be fresh"
            );
        }

        // Remapped parent pointer and preserved token totals.
        let cloned_u1 = cloned[0].info.as_user().expect("first clone is user");
        let cloned_a1 = cloned[1].info.as_assistant().expect("second is assistant");
        assert_eq!(cloned_a1.parent_id, cloned_u1.id);
        assert_eq!(cloned_a1.tokens.total, 11);
        assert_eq!(cloned[0].parts.len(), 1);
    }

    #[test]
    fn fork_is_not_listed_as_child() {
        let (store, _) = store();
        let s = store.create_session(CreateSession::default()).unwrap();
        let _fork = store.fork_session(&s.id, None).unwrap();
        assert!(store.children(&s.id).unwrap().is_empty());
    }

    // ── Project permissions & todos ──────────────────────────────────────────

    #[test]
    fn project_permissions_roundtrip() {
        let (store, _) = store();
        assert!(store.get_project_permissions().unwrap().is_none());
        let rules = vec![
            PermissionRule::new("read", tandem_permission::PermissionLevel::Allow),
            PermissionRule::new("shell", tandem_permission::PermissionLevel::Deny),
        ];
        store.set_project_permissions(&rules).unwrap();
        let loaded = store.get_project_permissions().unwrap().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[1].tool, "shell");
    }

    #[test]
    fn todos_roundtrip() {
        let (store, _) = store();
        let s = store.create_session(CreateSession::default()).unwrap();
        assert!(store.get_todos(&s.id).unwrap().is_none());
        store
            .set_todos(&s.id, &json!([{"content": "x", "status": "pending"}]))
            .unwrap();
        let todos = store.get_todos(&s.id).unwrap().unwrap();
        assert_eq!(todos[0]["content"], "x");
    }
}
