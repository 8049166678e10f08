use anyhow::Result;
use rusqlite::{params, Row};
use serde::{Deserialize, Serialize};
use spark_observability::now_ms;

use crate::Store;

pub const DEFAULT_CONVERSATION_LIMIT: i64 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationRole {
    User,
    Assistant,
}

impl ConversationRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    fn from_db(s: &str) -> Self {
        if s == "assistant" {
            Self::Assistant
        } else {
            Self::User
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub id: i64,
    pub device_id: String,
    pub role: ConversationRole,
    pub content: String,
    pub timestamp: i64,
}

impl ConversationMessage {
    fn from_row(r: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: r.get(0)?,
            device_id: r.get::<_, Option<String>>(1)?.unwrap_or_default(),
            role: ConversationRole::from_db(&r.get::<_, String>(2)?),
            content: r.get(3)?,
            timestamp: r.get(4)?,
        })
    }
}

impl Store {
    pub fn save_conversation(
        &self,
        device_id: &str,
        role: ConversationRole,
        content: &str,
    ) -> Result<i64> {
        let now = now_ms();
        self.write(
            "STORE.save_conversation",
            "E_CONVERSATION_SAVE",
            Some(serde_json::json!({
                "device_id": device_id,
                "role": role.as_str(),
                "content_chars": content.len(),
            })),
            |c| {
                c.execute(
                    "INSERT INTO conversations (device_id, role, content, timestamp) VALUES (?1, ?2, ?3, ?4)",
                    params![device_id, role.as_str(), content, now],
                )?;
                Ok(c.last_insert_rowid())
            },
        )
    }

    /// Newest first; `limit` defaults to [`DEFAULT_CONVERSATION_LIMIT`].
    pub fn get_conversations(
        &self,
        device_id: &str,
        limit: Option<i64>,
    ) -> Result<Vec<ConversationMessage>> {
        let limit = limit.unwrap_or(DEFAULT_CONVERSATION_LIMIT);
        self.read("list conversations", |c| {
            let mut stmt = c.prepare(
                r#"
                SELECT id, device_id, role, content, timestamp
                FROM conversations
                WHERE device_id = ?1
                ORDER BY timestamp DESC, id DESC
                LIMIT ?2
                "#,
            )?;
            let rows = stmt.query_map(params![device_id, limit], ConversationMessage::from_row)?;
            rows.collect()
        })
    }

    /// Returns the number of deleted messages.
    pub fn clear_conversations(&self, device_id: &str) -> Result<usize> {
        self.write(
            "STORE.clear_conversations",
            "E_CONVERSATION_CLEAR",
            Some(serde_json::json!({"device_id": device_id})),
            |c| c.execute("DELETE FROM conversations WHERE device_id = ?1", params![device_id]),
        )
    }
}
