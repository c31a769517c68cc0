//! Telegram Bot API transport
//!
//! Polls `getUpdates` with an explicit offset (no webhook, the device is not
//! reachable from outside) and sends through `sendMessage`.

use super::{Batch, ChatId, ChatKind, ClaimTransport, InboundMessage, MessageCursor};
use crate::error::{Error, Result};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// Membership statuses that mean "the bot is now in this chat"
const JOINED_STATUSES: &[&str] = &["member", "administrator"];

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Update {
    update_id: i64,
    #[serde(default)]
    message: Option<TgMessage>,
    #[serde(default)]
    my_chat_member: Option<ChatMemberUpdated>,
}

#[derive(Debug, Deserialize)]
struct TgMessage {
    chat: TgChat,
    #[serde(default)]
    from: Option<TgUser>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    new_chat_members: Vec<TgUser>,
}

#[derive(Debug, Deserialize)]
struct TgChat {
    id: i64,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    title: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TgUser {
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    first_name: String,
}

impl TgUser {
    /// Sender identity for claim matching; only the username is unique
    fn handle(&self) -> String {
        self.username.clone().unwrap_or_default()
    }

    /// Human-readable name, for rendered membership text
    fn display_name(&self) -> String {
        self.username
            .clone()
            .unwrap_or_else(|| self.first_name.clone())
    }
}

#[derive(Debug, Deserialize)]
struct ChatMemberUpdated {
    chat: TgChat,
    from: TgUser,
    new_chat_member: ChatMember,
}

#[derive(Debug, Deserialize)]
struct ChatMember {
    status: String,
    user: TgUser,
}

/// Bot API client
pub struct TelegramTransport {
    client: Client,
    base_url: String,
}

impl TelegramTransport {
    pub fn new(api_base: &str, bot_token: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Http(e.without_url()))?;

        Ok(Self {
            client,
            base_url: format!("{}/bot{}", api_base.trim_end_matches('/'), bot_token),
        })
    }

    async fn call<T: DeserializeOwned>(&self, request: reqwest::RequestBuilder) -> Result<T> {
        // Errors carry the URL, which embeds the bot token
        let response = request.send().await.map_err(|e| Error::Http(e.without_url()))?;
        let body: ApiResponse<T> = response
            .json()
            .await
            .map_err(|e| Error::Http(e.without_url()))?;

        if !body.ok {
            return Err(Error::Telegram(
                body.description.unwrap_or_else(|| "request rejected".to_string()),
            ));
        }

        body.result
            .ok_or_else(|| Error::Telegram("response without result".to_string()))
    }
}

impl ClaimTransport for TelegramTransport {
    async fn fetch(&mut self, cursor: MessageCursor, limit: usize) -> Result<Batch> {
        let offset = cursor.position() + 1;
        let request = self
            .client
            .get(format!("{}/getUpdates", self.base_url))
            .query(&[
                ("offset", offset.to_string()),
                ("limit", limit.to_string()),
                ("timeout", "0".to_string()),
                (
                    "allowed_updates",
                    r#"["message","my_chat_member"]"#.to_string(),
                ),
            ]);

        let updates: Vec<Update> = self.call(request).await?;
        debug!(offset = offset, count = updates.len(), "Fetched updates");
        Ok(batch_from_updates(updates))
    }

    async fn send(&mut self, chat_id: ChatId, text: &str) -> Result<()> {
        let request = self
            .client
            .post(format!("{}/sendMessage", self.base_url))
            .json(&serde_json::json!({ "chat_id": chat_id.0, "text": text }));

        let _: serde_json::Value = self.call(request).await?;
        Ok(())
    }
}

fn batch_from_updates(updates: Vec<Update>) -> Batch {
    let high_water = updates.iter().map(|u| u.update_id).max();
    let messages = updates.into_iter().filter_map(update_to_message).collect();
    Batch {
        high_water,
        messages,
    }
}

/// Flatten an update into a classifiable message.
///
/// Membership changes carry no text, so they are rendered as an "added"
/// line for the classifier to pick up.
fn update_to_message(update: Update) -> Option<InboundMessage> {
    if let Some(message) = update.message {
        let chat_kind = message.chat.kind.parse::<ChatKind>().ok()?;
        let sender = message.from.as_ref().map(TgUser::handle).unwrap_or_default();

        let text = if !message.new_chat_members.is_empty() {
            let adder = message.from.as_ref().map(TgUser::display_name).unwrap_or_default();
            let names: Vec<String> = message
                .new_chat_members
                .iter()
                .map(TgUser::display_name)
                .collect();
            format!("{} added {}", adder, names.join(", "))
        } else {
            message.text?
        };

        return Some(InboundMessage {
            seq: update.update_id,
            chat_id: ChatId(message.chat.id),
            chat_kind,
            chat_title: message.chat.title,
            sender,
            text,
        });
    }

    if let Some(member) = update.my_chat_member {
        if !JOINED_STATUSES.contains(&member.new_chat_member.status.as_str()) {
            return None;
        }
        let chat_kind = member.chat.kind.parse::<ChatKind>().ok()?;
        return Some(InboundMessage {
            seq: update.update_id,
            chat_id: ChatId(member.chat.id),
            chat_kind,
            chat_title: member.chat.title,
            text: format!(
                "{} added {}",
                member.from.display_name(),
                member.new_chat_member.user.display_name()
            ),
            sender: member.from.handle(),
        });
    }

    None
}
