use chrono::Utc;
use tracing::instrument;

use helm_core::ids::{MessageId, SessionId};
use helm_core::messages::{ContentPart, FinishReason, Message, Role};

use crate::database::Database;
use crate::error::StoreError;
use crate::events::StoreEvent;
use crate::row_helpers;

const TABLE: &str = "messages";
const COLUMNS: &str =
    "id, session_id, role, parts, model, provider, is_summary_message, finish_reason, created_at";

pub struct MessageRepo {
    db: Database,
}

impl MessageRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert a message and bump the owning session's message count.
    #[instrument(skip(self, message), fields(session_id = %message.session_id, message_id = %message.id))]
    pub fn create(&self, message: &Message) -> Result<Message, StoreError> {
        let parts = serde_json::to_string(&message.parts)?;
        self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let touched = tx.execute(
                "UPDATE sessions SET message_count = message_count + 1, updated_at = ?1 WHERE id = ?2",
                rusqlite::params![Utc::now().to_rfc3339(), message.session_id.as_str()],
            )?;
            if touched == 0 {
                return Err(StoreError::NotFound(format!(
                    "session {}",
                    message.session_id
                )));
            }
            tx.execute(
                "INSERT INTO messages (id, session_id, role, parts, model, provider,
                                       is_summary_message, finish_reason, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                rusqlite::params![
                    message.id.as_str(),
                    message.session_id.as_str(),
                    message.role.as_str(),
                    parts,
                    message.model,
                    message.provider,
                    message.is_summary_message,
                    message.finish_reason.map(|f| f.as_str()),
                    message.created_at.to_rfc3339(),
                ],
            )?;
            tx.commit()?;
            Ok(())
        })?;
        self.db.publish(StoreEvent::MessageCreated {
            session_id: message.session_id.clone(),
            message_id: message.id.clone(),
        });
        Ok(message.clone())
    }

    #[instrument(skip(self), fields(message_id = %id))]
    pub fn get(&self, id: &MessageId) -> Result<Message, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("SELECT {COLUMNS} FROM messages WHERE id = ?1"))?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_message(row),
                None => Err(StoreError::NotFound(format!("message {id}"))),
            }
        })
    }

    /// Overwrite the content of an existing message. Used while streaming to
    /// flush accumulated deltas.
    #[instrument(skip(self, message), fields(session_id = %message.session_id, message_id = %message.id))]
    pub fn save(&self, message: &Message) -> Result<(), StoreError> {
        let parts = serde_json::to_string(&message.parts)?;
        let changed = self.db.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE messages
                 SET parts = ?1, model = ?2, provider = ?3, is_summary_message = ?4, finish_reason = ?5
                 WHERE id = ?6 AND session_id = ?7",
                rusqlite::params![
                    parts,
                    message.model,
                    message.provider,
                    message.is_summary_message,
                    message.finish_reason.map(|f| f.as_str()),
                    message.id.as_str(),
                    message.session_id.as_str(),
                ],
            )?)
        })?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("message {}", message.id)));
        }
        self.db.publish(StoreEvent::MessageUpdated {
            session_id: message.session_id.clone(),
            message_id: message.id.clone(),
        });
        Ok(())
    }

    /// All messages of a session in insertion order.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn list(&self, session_id: &SessionId) -> Result<Vec<Message>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM messages WHERE session_id = ?1 ORDER BY rowid ASC"
            ))?;
            let mut rows = stmt.query([session_id.as_str()])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_message(row)?);
            }
            Ok(results)
        })
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> Result<Message, StoreError> {
    let id: String = row_helpers::get(row, 0, TABLE, "id")?;
    let session_id: String = row_helpers::get(row, 1, TABLE, "session_id")?;
    let role: String = row_helpers::get(row, 2, TABLE, "role")?;
    let parts: String = row_helpers::get(row, 3, TABLE, "parts")?;
    let finish_reason: Option<String> = row_helpers::get_opt(row, 7, TABLE, "finish_reason")?;
    let created_at: String = row_helpers::get(row, 8, TABLE, "created_at")?;

    Ok(Message {
        id: MessageId::from_raw(id),
        session_id: SessionId::from_raw(session_id),
        role: row_helpers::parse_enum(&role, Role::parse, TABLE, "role")?,
        parts: row_helpers::parse_json::<Vec<ContentPart>>(&parts, TABLE, "parts")?,
        model: row_helpers::get_opt(row, 4, TABLE, "model")?,
        provider: row_helpers::get_opt(row, 5, TABLE, "provider")?,
        is_summary_message: row_helpers::get(row, 6, TABLE, "is_summary_message")?,
        finish_reason: finish_reason
            .map(|f| row_helpers::parse_enum(&f, FinishReason::parse, TABLE, "finish_reason"))
            .transpose()?,
        created_at: row_helpers::parse_timestamp(&created_at, TABLE, "created_at")?,
    })
}
