use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use helm_core::ids::{MessageId, SessionId};
use helm_core::tool_params::Todo;

use crate::database::Database;
use crate::error::StoreError;
use crate::events::StoreEvent;
use crate::row_helpers;

const TABLE: &str = "sessions";
const COLUMNS: &str = "id, parent_session_id, title, working_directory, cost, message_count,
                       summary_message_id, todos, created_at, updated_at";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    /// Set only for task sessions created by sub-agent delegation.
    pub parent_session_id: Option<SessionId>,
    pub title: String,
    pub working_directory: String,
    /// Accumulated spend in USD. Never decreases.
    pub cost: f64,
    pub message_count: u32,
    /// The summary message that replaced earlier history, if any.
    pub summary_message_id: Option<MessageId>,
    pub todos: Vec<Todo>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn is_task_session(&self) -> bool {
        self.parent_session_id.is_some()
    }
}

pub struct SessionRepo {
    db: Database,
}

impl SessionRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create a top-level session.
    #[instrument(skip(self))]
    pub fn create(&self, title: &str, working_directory: &str) -> Result<Session, StoreError> {
        let session = Session {
            id: SessionId::new(),
            parent_session_id: None,
            title: title.to_string(),
            working_directory: working_directory.to_string(),
            cost: 0.0,
            message_count: 0,
            summary_message_id: None,
            todos: Vec::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        self.insert(&session)?;
        self.db.publish(StoreEvent::SessionCreated(session.id.clone()));
        Ok(session)
    }

    /// Create (or return the existing) task session with a caller-chosen id.
    /// The parent must exist; the child inherits its working directory.
    #[instrument(skip(self), fields(session_id = %id, parent_id = %parent_id))]
    pub fn create_task_session(
        &self,
        id: &SessionId,
        parent_id: &SessionId,
        title: &str,
    ) -> Result<Session, StoreError> {
        if id == parent_id {
            return Err(StoreError::Conflict(format!(
                "session {id} cannot parent itself"
            )));
        }
        match self.get(id) {
            Ok(existing) => {
                if existing.parent_session_id.as_ref() != Some(parent_id) {
                    return Err(StoreError::Conflict(format!(
                        "session {id} exists with a different parent"
                    )));
                }
                return Ok(existing);
            }
            Err(StoreError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        let parent = self.get(parent_id)?;
        let now = Utc::now();
        let session = Session {
            id: id.clone(),
            parent_session_id: Some(parent.id),
            title: title.to_string(),
            working_directory: parent.working_directory,
            cost: 0.0,
            message_count: 0,
            summary_message_id: None,
            todos: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        self.insert(&session)?;
        self.db.publish(StoreEvent::SessionCreated(session.id.clone()));
        Ok(session)
    }

    fn insert(&self, session: &Session) -> Result<(), StoreError> {
        let todos = serde_json::to_string(&session.todos)?;
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sessions (id, parent_session_id, title, working_directory, cost,
                                       message_count, summary_message_id, todos, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                rusqlite::params![
                    session.id.as_str(),
                    session.parent_session_id.as_ref().map(|p| p.as_str()),
                    session.title,
                    session.working_directory,
                    session.cost,
                    session.message_count,
                    session.summary_message_id.as_ref().map(|m| m.as_str()),
                    todos,
                    session.created_at.to_rfc3339(),
                    session.updated_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    /// Get a session by ID.
    #[instrument(skip(self), fields(session_id = %id))]
    pub fn get(&self, id: &SessionId) -> Result<Session, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("SELECT {COLUMNS} FROM sessions WHERE id = ?1"))?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_session(row),
                None => Err(StoreError::NotFound(format!("session {id}"))),
            }
        })
    }

    /// Persist mutable fields. `cost` only ever moves up and `message_count`
    /// is owned by the message repo, so neither can be rolled back here.
    #[instrument(skip(self, session), fields(session_id = %session.id))]
    pub fn save(&self, session: &Session) -> Result<Session, StoreError> {
        let todos = serde_json::to_string(&session.todos)?;
        let changed = self.db.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE sessions
                 SET title = ?1, working_directory = ?2, cost = MAX(cost, ?3),
                     summary_message_id = ?4, todos = ?5, updated_at = ?6
                 WHERE id = ?7",
                rusqlite::params![
                    session.title,
                    session.working_directory,
                    session.cost,
                    session.summary_message_id.as_ref().map(|m| m.as_str()),
                    todos,
                    Utc::now().to_rfc3339(),
                    session.id.as_str(),
                ],
            )?)
        })?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("session {}", session.id)));
        }
        self.db.publish(StoreEvent::SessionUpdated(session.id.clone()));
        self.get(&session.id)
    }

    /// Atomically add `delta` (clamped at zero) to the session's cost.
    #[instrument(skip(self), fields(session_id = %id))]
    pub fn add_cost(&self, id: &SessionId, delta: f64) -> Result<Session, StoreError> {
        let delta = if delta.is_finite() { delta.max(0.0) } else { 0.0 };
        let changed = self.db.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE sessions SET cost = cost + ?1, updated_at = ?2 WHERE id = ?3",
                rusqlite::params![delta, Utc::now().to_rfc3339(), id.as_str()],
            )?)
        })?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("session {id}")));
        }
        self.db.publish(StoreEvent::SessionUpdated(id.clone()));
        self.get(id)
    }

    /// Top-level sessions, most recently updated first.
    #[instrument(skip(self))]
    pub fn list(&self, limit: u32) -> Result<Vec<Session>, StoreError> {
        self.query_many(
            &format!(
                "SELECT {COLUMNS} FROM sessions WHERE parent_session_id IS NULL
                 ORDER BY updated_at DESC, id DESC LIMIT ?1"
            ),
            rusqlite::params![limit],
        )
    }

    /// Task sessions spawned from `parent_id`, oldest first.
    #[instrument(skip(self), fields(parent_id = %parent_id))]
    pub fn list_children(&self, parent_id: &SessionId) -> Result<Vec<Session>, StoreError> {
        self.query_many(
            &format!(
                "SELECT {COLUMNS} FROM sessions WHERE parent_session_id = ?1
                 ORDER BY created_at ASC, id ASC"
            ),
            rusqlite::params![parent_id.as_str()],
        )
    }

    /// Delete a session with its messages and task sessions.
    #[instrument(skip(self), fields(session_id = %id))]
    pub fn delete(&self, id: &SessionId) -> Result<(), StoreError> {
        let changed = self.db.with_conn(|conn| {
            Ok(conn.execute("DELETE FROM sessions WHERE id = ?1", [id.as_str()])?)
        })?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("session {id}")));
        }
        self.db.publish(StoreEvent::SessionDeleted(id.clone()));
        Ok(())
    }

    fn query_many(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<Session>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let mut rows = stmt.query(params)?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_session(row)?);
            }
            Ok(results)
        })
    }
}

fn row_to_session(row: &rusqlite::Row<'_>) -> Result<Session, StoreError> {
    let id: String = row_helpers::get(row, 0, TABLE, "id")?;
    let parent: Option<String> = row_helpers::get_opt(row, 1, TABLE, "parent_session_id")?;
    let summary: Option<String> = row_helpers::get_opt(row, 6, TABLE, "summary_message_id")?;
    let todos: String = row_helpers::get(row, 7, TABLE, "todos")?;
    let created_at: String = row_helpers::get(row, 8, TABLE, "created_at")?;
    let updated_at: String = row_helpers::get(row, 9, TABLE, "updated_at")?;

    Ok(Session {
        id: SessionId::from_raw(id),
        parent_session_id: parent.map(SessionId::from_raw),
        title: row_helpers::get(row, 2, TABLE, "title")?,
        working_directory: row_helpers::get(row, 3, TABLE, "working_directory")?,
        cost: row_helpers::get(row, 4, TABLE, "cost")?,
        message_count: row_helpers::get(row, 5, TABLE, "message_count")?,
        summary_message_id: summary.map(MessageId::from_raw),
        todos: row_helpers::parse_json(&todos, TABLE, "todos")?,
        created_at: row_helpers::parse_timestamp(&created_at, TABLE, "created_at")?,
        updated_at: row_helpers::parse_timestamp(&updated_at, TABLE, "updated_at")?,
    })
}
