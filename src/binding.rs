//! Chat binding - which conversations the device reports to

use crate::transport::ChatId;
use serde::{Deserialize, Serialize};

/// Personal chat plus optional group chat.
///
/// The personal chat is set once and never changes; the group chat can only
/// be set after it, and also only once.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatBinding {
    personal_chat_id: Option<ChatId>,
    group_chat_id: Option<ChatId>,
}

impl ChatBinding {
    pub fn personal_chat_id(&self) -> Option<ChatId> {
        self.personal_chat_id
    }

    pub fn group_chat_id(&self) -> Option<ChatId> {
        self.group_chat_id
    }

    /// Returns false if a personal chat is already bound
    pub fn bind_personal(&mut self, chat_id: ChatId) -> bool {
        if self.personal_chat_id.is_some() {
            return false;
        }
        self.personal_chat_id = Some(chat_id);
        true
    }

    /// Returns false without a personal chat, or if a group is already bound
    pub fn bind_group(&mut self, chat_id: ChatId) -> bool {
        if self.personal_chat_id.is_none() || self.group_chat_id.is_some() {
            return false;
        }
        self.group_chat_id = Some(chat_id);
        true
    }

    /// Every bound chat, personal first
    pub fn chats(&self) -> Vec<ChatId> {
        self.personal_chat_id
            .into_iter()
            .chain(self.group_chat_id)
            .collect()
    }
}
