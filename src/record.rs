use crate::client::RawMessage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One line of `messages.jsonl`.
///
/// Optional fields serialize as `null` so every line carries the same keys.
/// `media_file` and `media_error` are the exception: they only appear when
/// an attachment was saved or failed to save.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: i64,
    pub date: Option<DateTime<Utc>>,
    pub message: Option<String>,
    pub sender_id: Option<i64>,
    pub chat_id: Option<i64>,
    pub reply_to_msg_id: Option<i64>,
    pub via_bot_id: Option<i64>,
    pub views: Option<i64>,
    pub forwards: Option<i64>,
    pub reactions: Option<Vec<serde_json::Value>>,
    pub fwd_from: Option<serde_json::Value>,
    pub action: Option<serde_json::Value>,
    pub media_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_error: Option<String>,
}

impl MessageRecord {
    fn bare(id: i64, chat_id: i64) -> Self {
        Self {
            id,
            date: None,
            message: None,
            sender_id: None,
            chat_id: Some(chat_id),
            reply_to_msg_id: None,
            via_bot_id: None,
            views: None,
            forwards: None,
            reactions: None,
            fwd_from: None,
            action: None,
            media_type: None,
            media_file: None,
            media_error: None,
        }
    }

    /// Neither text nor a saved attachment. Viewers may hide these; the
    /// exporter never does.
    pub fn is_empty(&self) -> bool {
        self.message.as_deref().is_none_or(|m| m.trim().is_empty()) && self.media_file.is_none()
    }
}

/// Select and stabilize the archived fields of `msg`.
///
/// Nested structures (reactions, forward header, service action) are kept
/// as the backend produced them.
pub fn normalize(msg: &RawMessage, chat_id: i64) -> MessageRecord {
    match msg {
        RawMessage::Regular(m) => MessageRecord {
            date: m.date,
            message: m.text.clone(),
            sender_id: m.sender_id,
            reply_to_msg_id: m.reply_to_msg_id,
            via_bot_id: m.via_bot_id,
            views: m.views,
            forwards: m.forwards,
            reactions: m.reactions.clone().filter(|r| !r.is_empty()),
            fwd_from: m.fwd_from.clone(),
            media_type: m.media.as_ref().map(|media| media.kind.clone()),
            ..MessageRecord::bare(m.id, chat_id)
        },
        RawMessage::Service(m) => MessageRecord {
            date: m.date,
            sender_id: m.sender_id,
            reply_to_msg_id: m.reply_to_msg_id,
            action: Some(m.action.clone()),
            ..MessageRecord::bare(m.id, chat_id)
        },
        RawMessage::Empty { id } => MessageRecord::bare(*id, chat_id),
    }
}
