//! SQLite-backed local inbox
//!
//! Stands in for a chat service on the bench: messages are injected into the
//! `inbox` table and read back by rowid, sends land in `outbox`.

use super::{Batch, ChatId, ChatKind, ClaimTransport, InboundMessage, MessageCursor};
use crate::error::Result;
use chrono::Utc;
use rusqlite::{params, Connection};
use std::path::Path;
use std::time::Duration;
use tracing::warn;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS inbox (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    chat_id INTEGER NOT NULL,
    chat_kind TEXT NOT NULL,
    chat_title TEXT,
    sender TEXT NOT NULL,
    text TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS outbox (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    chat_id INTEGER NOT NULL,
    text TEXT NOT NULL,
    sent_at TEXT NOT NULL
);
"#;

/// Message to append to the inbox
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub chat_id: ChatId,
    pub chat_kind: ChatKind,
    pub chat_title: Option<String>,
    pub sender: String,
    pub text: String,
}

/// A message the device sent
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxEntry {
    pub id: i64,
    pub chat_id: ChatId,
    pub text: String,
    pub sent_at: String,
}

/// Local inbox transport
pub struct LocalInbox {
    conn: Connection,
}

impl LocalInbox {
    /// Open (or create) the inbox database
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_millis(500))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    /// Append a message, returning its position in the stream
    pub fn inject(&self, message: &NewMessage) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO inbox (chat_id, chat_kind, chat_title, sender, text, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                message.chat_id.0,
                message.chat_kind.as_str(),
                message.chat_title,
                message.sender,
                message.text,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Messages strictly after `cursor`, oldest first
    pub fn read_since(&self, cursor: MessageCursor, limit: usize) -> Result<Batch> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, chat_id, chat_kind, chat_title, sender, text
            FROM inbox
            WHERE id > ?1
            ORDER BY id ASC
            LIMIT ?2
            "#,
        )?;

        let rows = stmt.query_map(params![cursor.position(), limit as i64], |row| {
            let id: i64 = row.get(0)?;
            let chat_id: i64 = row.get(1)?;
            let chat_kind: String = row.get(2)?;
            let chat_title: Option<String> = row.get(3)?;
            let sender: String = row.get(4)?;
            let text: String = row.get(5)?;
            Ok((id, chat_id, chat_kind, chat_title, sender, text))
        })?;

        let mut batch = Batch::default();
        for row in rows {
            let (id, chat_id, chat_kind, chat_title, sender, text) = row?;
            batch.high_water = Some(batch.high_water.map_or(id, |hw| hw.max(id)));

            // Unknown kinds are consumed but never classified
            let chat_kind = match chat_kind.parse::<ChatKind>() {
                Ok(kind) => kind,
                Err(e) => {
                    warn!(id = id, error = %e, "Skipping inbox row");
                    continue;
                }
            };

            batch.messages.push(InboundMessage {
                seq: id,
                chat_id: ChatId(chat_id),
                chat_kind,
                chat_title,
                sender,
                text,
            });
        }

        Ok(batch)
    }

    /// Record an outbound message
    pub fn record_send(&self, chat_id: ChatId, text: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO outbox (chat_id, text, sent_at) VALUES (?1, ?2, ?3)",
            params![chat_id.0, text, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Most recent outbound messages, oldest first
    pub fn outbox(&self, limit: usize) -> Result<Vec<OutboxEntry>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, chat_id, text, sent_at FROM (
                SELECT id, chat_id, text, sent_at FROM outbox ORDER BY id DESC LIMIT ?1
            ) ORDER BY id ASC
            "#,
        )?;

        let entries = stmt
            .query_map([limit as i64], |row| {
                Ok(OutboxEntry {
                    id: row.get(0)?,
                    chat_id: ChatId(row.get(1)?),
                    text: row.get(2)?,
                    sent_at: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(entries)
    }
}

impl ClaimTransport for LocalInbox {
    async fn fetch(&mut self, cursor: MessageCursor, limit: usize) -> Result<Batch> {
        self.read_since(cursor, limit)
    }

    async fn send(&mut self, chat_id: ChatId, text: &str) -> Result<()> {
        self.record_send(chat_id, text)
    }
}
