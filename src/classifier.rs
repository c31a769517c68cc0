//! Chat classification - decide what an inbound message means for pairing
//!
//! Pure functions only. The poller owns cursor handling, the state machine
//! owns what happens after a match.

use crate::config::{BARE_START_COMMAND, CLAIM_COMMAND_PREFIX};
use crate::owner::same_identity;
use crate::token::ClaimToken;
use crate::transport::{ChatId, InboundMessage};
use once_cell::sync::Lazy;
use regex::Regex;

/// Text that indicates the device was just added to a conversation
static MEMBER_ADDED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(added|joined|new_chat_members?)\b").expect("Invalid member-added regex")
});

/// `/start` addressed to a specific bot, as group clients send it
static ADDRESSED_START: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^/start@[A-Za-z0-9_]+$").expect("Invalid start regex"));

/// Which matching mode applies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimPhase {
    Personal,
    Group,
}

/// A phase-defining message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimEvent {
    PersonalClaim {
        chat_id: ChatId,
        sender: String,
    },
    GroupEvidence {
        chat_id: ChatId,
        title: Option<String>,
    },
}

/// The slice of session state classification needs
#[derive(Debug, Clone, Copy)]
pub struct ClassifyContext<'a> {
    pub phase: ClaimPhase,
    pub token: Option<&'a ClaimToken>,
    pub owner: &'a str,
    pub personal_chat: Option<ChatId>,
}

/// Classify one message for the given phase
pub fn classify(ctx: &ClassifyContext<'_>, msg: &InboundMessage) -> Option<ClaimEvent> {
    match ctx.phase {
        ClaimPhase::Personal => {
            let token = ctx.token?;
            is_personal_claim(&msg.text, &msg.sender, token, ctx.owner).then(|| {
                ClaimEvent::PersonalClaim {
                    chat_id: msg.chat_id,
                    sender: msg.sender.clone(),
                }
            })
        }
        ClaimPhase::Group => is_group_evidence(msg, ctx.personal_chat).then(|| {
            ClaimEvent::GroupEvidence {
                chat_id: msg.chat_id,
                title: msg.chat_title.clone(),
            }
        }),
    }
}

/// Exact `/start <token>` from the expected owner.
///
/// Trailing text, extra whitespace or a different case all fail: other
/// commands share the `/start` prefix.
pub fn is_personal_claim(text: &str, sender: &str, token: &ClaimToken, owner: &str) -> bool {
    text.strip_prefix(CLAIM_COMMAND_PREFIX) == Some(token.as_str()) && same_identity(sender, owner)
}

/// Best-effort signal that the device now sits in a group conversation
pub fn is_group_evidence(msg: &InboundMessage, personal_chat: Option<ChatId>) -> bool {
    if !msg.chat_kind.is_group() {
        return false;
    }

    has_member_added_indicator(&msg.text)
        || is_bare_start(&msg.text)
        || personal_chat.map_or(true, |personal| personal != msg.chat_id)
}

pub fn has_member_added_indicator(text: &str) -> bool {
    MEMBER_ADDED.is_match(text)
}

pub fn is_bare_start(text: &str) -> bool {
    text == BARE_START_COMMAND || ADDRESSED_START.is_match(text)
}
