//! In-memory stand-in for the remote service, shared by the integration tests.

#![allow(dead_code)]

use chrono::{TimeZone, Utc};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use telegram_backup::client::{
    ClientError, ClientResult, Connector, Conversation, Credentials, EntityKind, LoginToken,
    MediaInfo, MessageIter, MessageQuery, RawMessage, RegularMessage, Session, Target, Topic,
};

pub const VALID_CODE: &str = "12345";

pub fn credentials(phone: Option<&str>) -> Credentials {
    Credentials {
        api_id: 611335,
        api_hash: "d524b414d21f4d37f08684c1df41ac9c".to_string(),
        phone: phone.map(str::to_string),
    }
}

pub fn conversation(id: i64, name: &str) -> Conversation {
    Conversation {
        id,
        name: name.to_string(),
        kind: EntityKind::Group,
    }
}

pub fn text(id: i64, body: &str) -> RawMessage {
    RawMessage::Regular(RegularMessage {
        id,
        date: Utc.timestamp_opt(1_709_287_200 + id * 60, 0).single(),
        text: Some(body.to_string()),
        sender_id: Some(42),
        ..Default::default()
    })
}

/// A message carrying a downloadable attachment named `file`.
pub fn with_media(id: i64, file: &str) -> RawMessage {
    RawMessage::Regular(RegularMessage {
        id,
        date: Utc.timestamp_opt(1_709_287_200 + id * 60, 0).single(),
        sender_id: Some(42),
        media: Some(MediaInfo {
            kind: "photo".to_string(),
            source: Some(file.to_string()),
        }),
        ..Default::default()
    })
}

pub fn numbered(count: i64) -> Vec<RawMessage> {
    (1..=count).map(|id| text(id, &format!("message {}", id))).collect()
}

#[derive(Default)]
struct Auth {
    authorized: bool,
    /// Sign-in demands a password after the code.
    password: Option<String>,
    code_requested: bool,
}

/// Fake [`Session`] with scripted conversations, topics and failures.
#[derive(Default)]
pub struct FakeSession {
    pub conversations: Vec<Conversation>,
    pub messages: HashMap<i64, Vec<RawMessage>>,
    pub topic_messages: HashMap<(i64, i64), Vec<RawMessage>>,
    /// Listing order, newest first.
    pub topics: Vec<Topic>,
    /// Keep answering with the first page regardless of the cursor.
    pub repeat_topic_page: bool,
    /// Message ids whose download errors out.
    pub failing_media: HashSet<i64>,
    /// Message ids the backend cannot decode.
    pub malformed: HashSet<i64>,
    /// Conversations (or topic anchors) whose iteration fails to start.
    pub broken: HashSet<i64>,
    auth: Mutex<Auth>,
    pub disconnected: Arc<AtomicBool>,
    pub topic_pages_served: AtomicUsize,
}

impl FakeSession {
    pub fn authorized() -> Self {
        let session = Self::default();
        session.auth_state().authorized = true;
        session
    }

    pub fn logged_out(password: Option<&str>) -> Self {
        let session = Self::default();
        session.auth_state().password = password.map(str::to_string);
        session
    }

    pub fn with_conversation(mut self, conv: Conversation, messages: Vec<RawMessage>) -> Self {
        self.messages.insert(conv.id, messages);
        self.conversations.push(conv);
        self
    }

    fn auth_state(&self) -> std::sync::MutexGuard<'_, Auth> {
        self.auth.lock().unwrap()
    }
}

impl Session for FakeSession {
    fn is_authorized(&self) -> ClientResult<bool> {
        Ok(self.auth_state().authorized)
    }

    fn request_login_code(&self, phone: &str) -> ClientResult<LoginToken> {
        self.auth_state().code_requested = true;
        Ok(LoginToken {
            phone: phone.to_string(),
            handle: "hash".to_string(),
        })
    }

    fn sign_in(&self, _token: &LoginToken, code: &str) -> ClientResult<()> {
        let mut auth = self.auth_state();
        if !auth.code_requested {
            return Err(ClientError::NotAuthorized);
        }
        if code != VALID_CODE {
            return Err(ClientError::InvalidCode);
        }
        if auth.password.is_some() {
            return Err(ClientError::PasswordRequired);
        }
        auth.authorized = true;
        Ok(())
    }

    fn check_password(&self, password: &str) -> ClientResult<()> {
        let mut auth = self.auth_state();
        if auth.password.as_deref() == Some(password) {
            auth.authorized = true;
            Ok(())
        } else {
            Err(ClientError::NotAuthorized)
        }
    }

    fn list_conversations(&self) -> ClientResult<Vec<Conversation>> {
        if !self.auth_state().authorized {
            return Err(ClientError::NotAuthorized);
        }
        Ok(self.conversations.clone())
    }

    fn iter_messages<'a>(&'a self, query: &MessageQuery) -> ClientResult<MessageIter<'a>> {
        let (key, source) = match query.target {
            Target::Conversation(id) => (id, self.messages.get(&id)),
            Target::Topic {
                conversation,
                topic,
            } => (topic, self.topic_messages.get(&(conversation, topic))),
        };
        if self.broken.contains(&key) {
            return Err(ClientError::Unavailable(format!("{} is broken", key)));
        }
        let source = source.ok_or_else(|| ClientError::NotFound(key.to_string()))?;

        let min_id = query.min_id;
        let items: Vec<ClientResult<RawMessage>> = source
            .iter()
            .filter(|m| min_id.is_none_or(|min| m.id() > min))
            .take(query.limit.unwrap_or(usize::MAX))
            .map(|m| {
                if self.malformed.contains(&m.id()) {
                    Err(ClientError::Malformed {
                        id: Some(m.id()),
                        reason: "unreadable".to_string(),
                    })
                } else {
                    Ok(m.clone())
                }
            })
            .collect();
        Ok(Box::new(items.into_iter()))
    }

    fn list_topics_page(
        &self,
        _conversation: i64,
        offset_topic_id: i64,
        page_size: usize,
    ) -> ClientResult<Vec<Topic>> {
        self.topic_pages_served.fetch_add(1, Ordering::SeqCst);
        let start = if self.repeat_topic_page || offset_topic_id == 0 {
            0
        } else {
            match self.topics.iter().position(|t| t.id == offset_topic_id) {
                Some(i) => i + 1,
                None => self.topics.len(),
            }
        };
        Ok(self
            .topics
            .iter()
            .skip(start)
            .take(page_size)
            .cloned()
            .collect())
    }

    fn download_attachment(
        &self,
        message: &RawMessage,
        dest_dir: &Path,
    ) -> ClientResult<Option<PathBuf>> {
        if self.failing_media.contains(&message.id()) {
            return Err(ClientError::Unavailable("FILE_REFERENCE_EXPIRED".to_string()));
        }
        let Some(name) = message.media().and_then(|m| m.source.as_deref()) else {
            return Ok(None);
        };
        let dest = dest_dir.join(format!("{}_{}", message.id(), name));
        fs::write(&dest, format!("bytes of {}", message.id()))?;
        Ok(Some(dest))
    }

    fn disconnect(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
    }
}

/// Hands out one prepared [`FakeSession`].
pub struct FakeConnector {
    session: Mutex<Option<FakeSession>>,
    pub disconnected: Arc<AtomicBool>,
}

impl FakeConnector {
    pub fn new(session: FakeSession) -> Self {
        let disconnected = session.disconnected.clone();
        Self {
            session: Mutex::new(Some(session)),
            disconnected,
        }
    }

    pub fn was_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }
}

impl Connector for FakeConnector {
    type Session = FakeSession;

    fn connect(&self, _credentials: &Credentials, session_path: &Path) -> ClientResult<FakeSession> {
        fs::write(session_path, b"fake")?;
        self.session
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| ClientError::Unavailable("already connected".to_string()))
    }
}

pub fn read_lines(path: &Path) -> Vec<String> {
    fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(str::to_string)
        .collect()
}

pub fn line_ids(path: &Path) -> Vec<i64> {
    read_lines(path)
        .iter()
        .map(|l| serde_json::from_str::<serde_json::Value>(l).unwrap()["id"].as_i64().unwrap())
        .collect()
}
