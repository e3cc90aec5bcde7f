//! Offline backend over a Telegram Desktop export.
//!
//! Telegram Desktop can export an account (Settings → Advanced → Export
//! Telegram data, format "Machine-readable JSON") into a folder holding
//! `result.json` plus `photos/`, `files/`, `video_files/` and friends. This
//! module serves that folder through [`Session`] so it can be re-archived
//! with the same pipeline as a live account.
//!
//! Layout of `result.json` (only the parts read here):
//! ```json
//! {
//!   "personal_information": { "user_id": 1, "phone_number": "+34 ..." },
//!   "chats": { "list": [ {
//!     "name": "Team", "type": "private_supergroup", "id": 123,
//!     "messages": [
//!       { "id": 5, "type": "message", "date": "2024-03-01T10:00:00",
//!         "date_unixtime": "1709287200", "from_id": "user42",
//!         "text": "hi", "reply_to_message_id": 4, "photo": "photos/p.jpg" },
//!       { "id": 6, "type": "service", "actor_id": "user42",
//!         "action": "topic_created", "title": "News" }
//!     ] } ] },
//!   "left_chats": { "list": [] }
//! }
//! ```
//! A single-chat export has the chat object at the top level instead.
//!
//! Ids are bare in the export. They are turned into signed peer ids the way
//! the live API reports them: users as is, basic groups negated, channels
//! and supergroups with the `-100` prefix.

use crate::client::{
    ClientError, ClientResult, Connector, Conversation, Credentials, EntityKind, LoginToken,
    MediaInfo, MessageIter, MessageQuery, RawMessage, RegularMessage, ServiceMessage, Session,
    Target, Topic,
};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const RESULT_FILE: &str = "result.json";

/// Id of the implicit "General" topic of every forum.
const GENERAL_TOPIC_ID: i64 = 1;

/// Reply chains longer than this are not followed when locating a topic.
const MAX_REPLY_DEPTH: usize = 256;

// ---------------------------------------------------------------------------
// Export schema
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(untagged)]
enum ExportFile {
    Account(AccountExport),
    Single(DesktopChat),
}

#[derive(Deserialize)]
struct AccountExport {
    #[serde(default)]
    personal_information: Option<PersonalInformation>,
    chats: ChatList,
    #[serde(default)]
    left_chats: Option<ChatList>,
}

#[derive(Deserialize)]
struct PersonalInformation {
    user_id: i64,
}

#[derive(Deserialize)]
struct ChatList {
    #[serde(default)]
    list: Vec<DesktopChat>,
}

#[derive(Deserialize)]
struct DesktopChat {
    #[serde(default)]
    name: Option<String>,
    #[serde(rename = "type")]
    kind: String,
    id: i64,
    /// Kept raw so one odd message cannot fail the whole file.
    #[serde(default)]
    messages: Vec<Value>,
}

/// One entry of a chat's `messages` array.
#[derive(Deserialize)]
struct DesktopMessage {
    id: i64,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    date: Option<String>,
    #[serde(default)]
    date_unixtime: Option<String>,
    #[serde(default)]
    from_id: Option<String>,
    #[serde(default)]
    actor_id: Option<String>,
    #[serde(default)]
    text: Value,
    #[serde(default)]
    reply_to_message_id: Option<i64>,
    #[serde(default)]
    forwarded_from: Option<String>,
    #[serde(default)]
    photo: Option<String>,
    #[serde(default)]
    file: Option<String>,
    #[serde(default)]
    media_type: Option<String>,
    #[serde(default)]
    reactions: Option<Vec<Value>>,
    #[serde(default)]
    action: Option<String>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

/// Keys of a service entry that are not part of its action payload.
const SERVICE_ENVELOPE: &[&str] = &[
    "text_entities",
    "actor",
    "from",
    "edited",
    "edited_unixtime",
];

fn peer_id(kind: &str, bare: i64) -> (EntityKind, i64) {
    match kind {
        "personal_chat" | "saved_messages" => (EntityKind::User, bare),
        "bot_chat" => (EntityKind::Bot, bare),
        "private_group" => (EntityKind::Group, -bare),
        "private_supergroup" | "public_supergroup" => (EntityKind::Group, channel_peer(bare)),
        "private_channel" | "public_channel" => (EntityKind::Channel, channel_peer(bare)),
        other => {
            tracing::debug!(kind = other, "Unknown chat type, treating as user");
            (EntityKind::User, bare)
        }
    }
}

fn channel_peer(bare: i64) -> i64 {
    -(1_000_000_000_000 + bare)
}

/// `"user42"` → 42, `"channel7"` → -1000000000007, `"chat9"` → -9.
fn sender_peer(from_id: &str) -> Option<i64> {
    let split = from_id.find(|c: char| c.is_ascii_digit())?;
    let (prefix, digits) = from_id.split_at(split);
    let bare: i64 = digits.parse().ok()?;
    match prefix {
        "user" => Some(bare),
        "channel" => Some(channel_peer(bare)),
        "chat" => Some(-bare),
        _ => None,
    }
}

fn parse_date(unixtime: Option<&str>, date: Option<&str>) -> Option<DateTime<Utc>> {
    if let Some(ts) = unixtime.and_then(|s| s.parse::<i64>().ok()) {
        return Utc.timestamp_opt(ts, 0).single();
    }
    let date = date?;
    DateTime::parse_from_rfc3339(date)
        .map(|d| d.with_timezone(&Utc))
        .or_else(|_| NaiveDateTime::parse_from_str(date, "%Y-%m-%dT%H:%M:%S").map(|n| n.and_utc()))
        .ok()
}

/// `text` is either a plain string or a list of plain strings and entity
/// objects carrying a `text` field.
fn flatten_text(text: &Value) -> Option<String> {
    let flat = match text {
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|p| match p {
                Value::String(s) => Some(s.as_str()),
                Value::Object(o) => o.get("text").and_then(Value::as_str),
                _ => None,
            })
            .collect(),
        _ => String::new(),
    };
    (!flat.is_empty()).then_some(flat)
}

fn media_of(m: &DesktopMessage) -> Option<MediaInfo> {
    if let Some(photo) = &m.photo {
        return Some(MediaInfo {
            kind: "photo".to_string(),
            source: Some(photo.clone()),
        });
    }
    if let Some(file) = &m.file {
        return Some(MediaInfo {
            kind: m.media_type.clone().unwrap_or_else(|| "document".to_string()),
            source: Some(file.clone()),
        });
    }
    let kind = if m.extra.contains_key("location_information") {
        "geo"
    } else if m.extra.contains_key("contact_information") {
        "contact"
    } else if m.extra.contains_key("poll") {
        "poll"
    } else {
        return m.media_type.as_ref().map(|kind| MediaInfo {
            kind: kind.clone(),
            source: None,
        });
    };
    Some(MediaInfo {
        kind: kind.to_string(),
        source: None,
    })
}

fn convert(value: &Value) -> ClientResult<RawMessage> {
    let id_hint = value.get("id").and_then(Value::as_i64);
    let m: DesktopMessage =
        serde_json::from_value(value.clone()).map_err(|e| ClientError::Malformed {
            id: id_hint,
            reason: e.to_string(),
        })?;
    let date = parse_date(m.date_unixtime.as_deref(), m.date.as_deref());

    match m.kind.as_str() {
        "message" => Ok(RawMessage::Regular(RegularMessage {
            id: m.id,
            date,
            text: flatten_text(&m.text),
            sender_id: m.from_id.as_deref().and_then(sender_peer),
            reply_to_msg_id: m.reply_to_message_id,
            // The export names the bot but does not carry its id.
            via_bot_id: None,
            views: None,
            forwards: None,
            reactions: m.reactions.clone(),
            fwd_from: m
                .forwarded_from
                .as_ref()
                .map(|name| serde_json::json!({ "from_name": name })),
            media: media_of(&m),
        })),
        "service" => {
            let mut action: Map<String, Value> = m
                .extra
                .iter()
                .filter(|(k, _)| !SERVICE_ENVELOPE.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            action.insert(
                "action".to_string(),
                m.action.clone().map(Value::String).unwrap_or(Value::Null),
            );
            if let Some(text) = flatten_text(&m.text) {
                action.insert("text".to_string(), Value::String(text));
            }
            Ok(RawMessage::Service(ServiceMessage {
                id: m.id,
                date,
                sender_id: m.actor_id.as_deref().and_then(sender_peer),
                reply_to_msg_id: m.reply_to_message_id,
                action: Value::Object(action),
            }))
        }
        other => Err(ClientError::Malformed {
            id: Some(m.id),
            reason: format!("unknown message type {:?}", other),
        }),
    }
}

// ---------------------------------------------------------------------------
// Loaded export
// ---------------------------------------------------------------------------

struct LoadedChat {
    conversation: Conversation,
    /// Sorted by id, oldest first.
    messages: Vec<(i64, Value)>,
    /// Newest first, as the live service lists them.
    topics: Vec<Topic>,
    /// Topic of each message in a forum. Empty for non-forum chats.
    topic_of: HashMap<i64, i64>,
}

impl LoadedChat {
    fn new(chat: DesktopChat) -> Self {
        let (kind, id) = peer_id(&chat.kind, chat.id);
        let mut messages: Vec<(i64, Value)> = chat
            .messages
            .into_iter()
            .map(|v| (v.get("id").and_then(Value::as_i64).unwrap_or(i64::MIN), v))
            .collect();
        messages.sort_by_key(|(id, _)| *id);

        let roots: HashMap<i64, String> = messages
            .iter()
            .filter(|(_, v)| v.get("action").and_then(Value::as_str) == Some("topic_created"))
            .map(|(id, v)| {
                let title = v.get("title").and_then(Value::as_str).unwrap_or_default();
                (*id, title.to_string())
            })
            .collect();

        let mut topic_of = HashMap::new();
        let mut topics = Vec::new();
        if !roots.is_empty() {
            let parent: HashMap<i64, i64> = messages
                .iter()
                .filter_map(|(id, v)| {
                    v.get("reply_to_message_id")
                        .and_then(Value::as_i64)
                        .map(|p| (*id, p))
                })
                .collect();

            let mut counts: HashMap<i64, u64> = HashMap::new();
            for (msg_id, _) in &messages {
                if roots.contains_key(msg_id) {
                    continue;
                }
                let topic = resolve_topic(*msg_id, &parent, &roots).unwrap_or(GENERAL_TOPIC_ID);
                topic_of.insert(*msg_id, topic);
                *counts.entry(topic).or_default() += 1;
            }

            topics = roots
                .iter()
                .map(|(id, title)| Topic {
                    id: *id,
                    title: title.clone(),
                    total_messages: Some(counts.get(id).copied().unwrap_or(0)),
                })
                .collect();
            if !roots.contains_key(&GENERAL_TOPIC_ID) {
                topics.push(Topic {
                    id: GENERAL_TOPIC_ID,
                    title: "General".to_string(),
                    total_messages: Some(counts.get(&GENERAL_TOPIC_ID).copied().unwrap_or(0)),
                });
            }
            topics.sort_by(|a, b| b.id.cmp(&a.id));
        }

        Self {
            conversation: Conversation {
                id,
                name: chat.name.unwrap_or_default(),
                kind,
            },
            messages,
            topics,
            topic_of,
        }
    }
}

fn resolve_topic(
    id: i64,
    parent: &HashMap<i64, i64>,
    roots: &HashMap<i64, String>,
) -> Option<i64> {
    let mut current = id;
    for _ in 0..MAX_REPLY_DEPTH {
        let up = *parent.get(&current)?;
        if roots.contains_key(&up) {
            return Some(up);
        }
        current = up;
    }
    None
}

/// A Telegram Desktop export opened as a session.
pub struct DesktopExport {
    root: PathBuf,
    account_id: Option<i64>,
    chats: Vec<LoadedChat>,
}

impl DesktopExport {
    /// `path` is the export folder or its `result.json`.
    pub fn open(path: &Path) -> ClientResult<Self> {
        let (root, file) = if path.is_dir() {
            (path.to_path_buf(), path.join(RESULT_FILE))
        } else {
            let root = path.parent().map(Path::to_path_buf).unwrap_or_default();
            (root, path.to_path_buf())
        };
        let raw = fs::read(&file).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                ClientError::NotFound(format!("export file {}", file.display()))
            }
            _ => ClientError::Io(e),
        })?;

        let (account_id, chats) = match serde_json::from_slice::<ExportFile>(&raw)? {
            ExportFile::Account(export) => {
                let mut chats = export.chats.list;
                if let Some(left) = export.left_chats {
                    chats.extend(left.list);
                }
                (export.personal_information.map(|p| p.user_id), chats)
            }
            ExportFile::Single(chat) => (None, vec![chat]),
        };

        let chats: Vec<LoadedChat> = chats.into_iter().map(LoadedChat::new).collect();
        tracing::info!(root = %root.display(), chats = chats.len(), "Opened Telegram Desktop export");
        Ok(Self {
            root,
            account_id,
            chats,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn chat(&self, id: i64) -> ClientResult<&LoadedChat> {
        self.chats
            .iter()
            .find(|c| c.conversation.id == id)
            .ok_or_else(|| ClientError::NotFound(format!("conversation {}", id)))
    }
}

impl Session for DesktopExport {
    fn is_authorized(&self) -> ClientResult<bool> {
        // The export is already the user's own data.
        Ok(true)
    }

    fn request_login_code(&self, _phone: &str) -> ClientResult<LoginToken> {
        Err(ClientError::Unavailable("an offline export needs no login".into()))
    }

    fn sign_in(&self, _token: &LoginToken, _code: &str) -> ClientResult<()> {
        Err(ClientError::Unavailable("an offline export needs no login".into()))
    }

    fn check_password(&self, _password: &str) -> ClientResult<()> {
        Err(ClientError::Unavailable("an offline export needs no login".into()))
    }

    fn list_conversations(&self) -> ClientResult<Vec<Conversation>> {
        Ok(self.chats.iter().map(|c| c.conversation.clone()).collect())
    }

    fn iter_messages<'a>(&'a self, query: &MessageQuery) -> ClientResult<MessageIter<'a>> {
        let chat = self.chat(query.target.conversation_id())?;
        let topic = match query.target {
            Target::Conversation(_) => None,
            Target::Topic { topic, .. } => {
                if !chat.topics.iter().any(|t| t.id == topic) {
                    return Err(ClientError::NotFound(format!("topic {}", topic)));
                }
                Some(topic)
            }
        };
        let min_id = query.min_id;

        let iter = chat
            .messages
            .iter()
            .filter(move |(id, _)| min_id.is_none_or(|min| *id > min))
            .filter(move |(id, _)| topic.is_none_or(|t| chat.topic_of.get(id) == Some(&t)))
            .map(|(_, v)| convert(v));

        Ok(match query.limit {
            Some(n) => Box::new(iter.take(n)),
            None => Box::new(iter),
        })
    }

    fn list_topics_page(
        &self,
        conversation: i64,
        offset_topic_id: i64,
        page_size: usize,
    ) -> ClientResult<Vec<Topic>> {
        let chat = self.chat(conversation)?;
        Ok(chat
            .topics
            .iter()
            .filter(|t| offset_topic_id == 0 || t.id < offset_topic_id)
            .take(page_size)
            .cloned()
            .collect())
    }

    fn download_attachment(
        &self,
        message: &RawMessage,
        dest_dir: &Path,
    ) -> ClientResult<Option<PathBuf>> {
        let Some(source) = message.media().and_then(|m| m.source.as_deref()) else {
            return Ok(None);
        };
        // Files skipped at export time are replaced by a note in parentheses.
        if source.starts_with('(') {
            return Err(ClientError::Unavailable(source.to_string()));
        }

        let src = self.root.join(source);
        let Some(name) = src.file_name() else {
            return Err(ClientError::NotFound(source.to_string()));
        };
        if !src.is_file() {
            return Err(ClientError::NotFound(src.display().to_string()));
        }
        let dest = dest_dir.join(format!("{}_{}", message.id(), name.to_string_lossy()));
        fs::copy(&src, &dest)?;
        Ok(Some(dest))
    }

    fn disconnect(&self) {
        tracing::debug!(root = %self.root.display(), account = ?self.account_id, "Closing export");
    }
}

// ---------------------------------------------------------------------------
// Session file
// ---------------------------------------------------------------------------

/// What a session file remembers about an offline export.
#[derive(Serialize, Deserialize)]
struct SessionFile {
    source: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    api_id: Option<i32>,
    #[serde(default)]
    account_id: Option<i64>,
    bound_at: DateTime<Utc>,
}

/// Opens a [`DesktopExport`]. The export folder is remembered in the session
/// file, so later runs with the same session name can omit it. No API
/// credentials are needed; an API id, when given, is recorded alongside.
pub struct DesktopExportConnector {
    pub source: Option<PathBuf>,
}

impl Connector for DesktopExportConnector {
    type Session = DesktopExport;

    fn requires_credentials(&self) -> bool {
        false
    }

    fn connect(&self, credentials: &Credentials, session_path: &Path) -> ClientResult<DesktopExport> {
        let stored: Option<SessionFile> = match fs::read(session_path) {
            Ok(raw) => Some(serde_json::from_slice(&raw)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        let source = match (&self.source, &stored) {
            (Some(s), _) => s.clone(),
            (None, Some(stored)) => stored.source.clone(),
            (None, None) => {
                return Err(ClientError::NotFound(
                    "no export source; pass --source or set TG_SOURCE".into(),
                ));
            }
        };

        let export = DesktopExport::open(&source)?;
        let record = SessionFile {
            source,
            api_id: (credentials.api_id != 0).then_some(credentials.api_id),
            account_id: export.account_id,
            bound_at: Utc::now(),
        };
        crate::utils::write_json_atomic(session_path, &record)
            .map_err(|e| ClientError::Unavailable(format!("cannot save session: {:#}", e)))?;
        Ok(export)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn peer_ids_follow_api_conventions() {
        assert_eq!(peer_id("personal_chat", 42), (EntityKind::User, 42));
        assert_eq!(peer_id("bot_chat", 7), (EntityKind::Bot, 7));
        assert_eq!(peer_id("private_group", 9), (EntityKind::Group, -9));
        assert_eq!(peer_id("public_channel", 123), (EntityKind::Channel, -1000000000123));
        assert_eq!(sender_peer("user42"), Some(42));
        assert_eq!(sender_peer("channel123"), Some(-1000000000123));
        assert_eq!(sender_peer("chat9"), Some(-9));
        assert_eq!(sender_peer("nobody"), None);
    }

    #[test]
    fn rich_text_is_flattened() {
        let text = json!(["see ", {"type": "link", "text": "https://x.y"}, "!"]);
        assert_eq!(flatten_text(&text).as_deref(), Some("see https://x.y!"));
        assert_eq!(flatten_text(&json!("")), None);
    }

    #[test]
    fn dates_prefer_unixtime() {
        let d = parse_date(Some("1709287200"), Some("garbage")).unwrap();
        assert_eq!(d.to_rfc3339(), "2024-03-01T10:00:00+00:00");
        let d = parse_date(None, Some("2024-03-01T10:00:00")).unwrap();
        assert_eq!(d.to_rfc3339(), "2024-03-01T10:00:00+00:00");
        assert_eq!(parse_date(None, None), None);
    }

    #[test]
    fn service_entries_keep_their_payload() {
        let raw = convert(&json!({
            "id": 3, "type": "service", "date_unixtime": "1709287200",
            "actor": "Ann", "actor_id": "user1", "action": "invite_members",
            "members": ["Bob"], "text": ""
        }))
        .unwrap();
        let RawMessage::Service(s) = raw else {
            panic!("expected a service message");
        };
        assert_eq!(s.sender_id, Some(1));
        assert_eq!(s.action["action"], "invite_members");
        assert_eq!(s.action["members"][0], "Bob");
        assert!(s.action.get("actor").is_none());
    }

    #[test]
    fn unknown_entries_are_malformed() {
        let err = convert(&json!({"id": 8, "type": "hologram"})).unwrap_err();
        assert!(matches!(err, ClientError::Malformed { id: Some(8), .. }));
        let err = convert(&json!({"type": "message"})).unwrap_err();
        assert!(matches!(err, ClientError::Malformed { id: None, .. }));
    }

    #[test]
    fn forum_messages_are_assigned_to_topics() {
        let chat = LoadedChat::new(DesktopChat {
            name: Some("Forum".into()),
            kind: "private_supergroup".into(),
            id: 5,
            messages: vec![
                json!({"id": 2, "type": "service", "action": "topic_created", "title": "News"}),
                json!({"id": 3, "type": "message", "text": "in news", "reply_to_message_id": 2}),
                json!({"id": 4, "type": "message", "text": "reply", "reply_to_message_id": 3}),
                json!({"id": 5, "type": "message", "text": "general"}),
            ],
        });
        assert_eq!(chat.topic_of.get(&3), Some(&2));
        assert_eq!(chat.topic_of.get(&4), Some(&2));
        assert_eq!(chat.topic_of.get(&5), Some(&GENERAL_TOPIC_ID));
        let ids: Vec<i64> = chat.topics.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![2, GENERAL_TOPIC_ID]);
        assert_eq!(chat.topics[0].total_messages, Some(2));
    }
}
