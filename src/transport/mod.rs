//! Claim transport - pull-based message stream plus outbound sends
//!
//! Implementations: [`telegram::TelegramTransport`] for the Bot API and
//! [`inbox::LocalInbox`] for a SQLite-backed bench setup.

pub mod inbox;
pub mod telegram;

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Chat identifier as handed out by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChatId(pub i64);

impl std::fmt::Display for ChatId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Conversation kind reported by the transport itself
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatKind {
    Private,
    Group,
    Channel,
}

impl ChatKind {
    pub fn is_group(self) -> bool {
        matches!(self, ChatKind::Group)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ChatKind::Private => "private",
            ChatKind::Group => "group",
            ChatKind::Channel => "channel",
        }
    }
}

impl std::str::FromStr for ChatKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "private" => Ok(ChatKind::Private),
            "group" | "supergroup" => Ok(ChatKind::Group),
            "channel" => Ok(ChatKind::Channel),
            other => Err(Error::Transport(format!("unknown chat kind: {}", other))),
        }
    }
}

impl std::fmt::Display for ChatKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Position in the remote stream already consumed.
///
/// Only moves forward; see [`MessageCursor::advance`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct MessageCursor(i64);

impl MessageCursor {
    pub fn new(position: i64) -> Self {
        Self(position)
    }

    pub fn position(self) -> i64 {
        self.0
    }

    pub fn advance(&mut self, seen: i64) {
        self.0 = self.0.max(seen);
    }
}

/// A message pulled from the transport
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub seq: i64,
    pub chat_id: ChatId,
    pub chat_kind: ChatKind,
    pub chat_title: Option<String>,
    pub sender: String,
    pub text: String,
}

/// One fetch result.
///
/// `high_water` covers entries the transport skipped (service updates with
/// nothing to classify) so the cursor still moves past them.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    pub high_water: Option<i64>,
    pub messages: Vec<InboundMessage>,
}

impl Batch {
    pub fn from_messages(messages: Vec<InboundMessage>) -> Self {
        let high_water = messages.iter().map(|m| m.seq).max();
        Self {
            high_water,
            messages,
        }
    }
}

/// Pull-based chat transport
#[allow(async_fn_in_trait)]
pub trait ClaimTransport {
    /// Fetch at most `limit` messages strictly newer than `cursor`
    async fn fetch(&mut self, cursor: MessageCursor, limit: usize) -> Result<Batch>;

    /// Send a text message to a chat
    async fn send(&mut self, chat_id: ChatId, text: &str) -> Result<()>;
}
