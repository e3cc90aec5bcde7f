//! The remote chat service as seen by the exporter.
//!
//! Nothing in here talks to the network. A backend implements [`Connector`]
//! and [`Session`]; the rest of the crate only ever borrows the session the
//! orchestrator opened.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub type ClientResult<T> = std::result::Result<T, ClientError>;

/// Errors raised at the capability boundary.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("a phone number is required to log in (use --phone or TG_PHONE)")]
    PhoneRequired,

    #[error("two-step verification password required")]
    PasswordRequired,

    #[error("the login code was rejected")]
    InvalidCode,

    #[error("session is not authorized")]
    NotAuthorized,

    #[error("not found: {0}")]
    NotFound(String),

    /// A single message could not be decoded. Iteration may continue past it.
    #[error("malformed message {id:?}: {reason}")]
    Malformed { id: Option<i64>, reason: String },

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// API credentials plus the optional phone used for first login.
///
/// Backends that never talk to the service accept the default (empty) value.
#[derive(Clone, Debug, Default)]
pub struct Credentials {
    pub api_id: i32,
    pub api_hash: String,
    pub phone: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    User,
    Bot,
    Group,
    Channel,
}

/// A chat, group, channel or bot thread visible to the account.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Conversation {
    /// Signed peer id (`-100…` for channels and supergroups).
    pub id: i64,
    pub name: String,
    pub kind: EntityKind,
}

/// A forum topic inside a conversation. `id` is also the reply anchor of the
/// topic's messages.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Topic {
    pub id: i64,
    pub title: String,
    /// As reported by the service. Advisory only.
    pub total_messages: Option<u64>,
}

/// What to page through.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Target {
    Conversation(i64),
    Topic { conversation: i64, topic: i64 },
}

impl Target {
    pub fn conversation_id(&self) -> i64 {
        match *self {
            Target::Conversation(id) => id,
            Target::Topic { conversation, .. } => conversation,
        }
    }
}

#[derive(Clone, Debug)]
pub struct MessageQuery {
    pub target: Target,
    /// `None` means no cap.
    pub limit: Option<usize>,
    /// Only messages with an id strictly greater than this are returned.
    pub min_id: Option<i64>,
}

/// Attachment descriptor. `kind` is the type tag written to the archive,
/// `source` is a backend-specific handle used to fetch the bytes, absent for
/// attachments with nothing to download (locations, contacts, polls).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MediaInfo {
    pub kind: String,
    pub source: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RegularMessage {
    pub id: i64,
    pub date: Option<DateTime<Utc>>,
    pub text: Option<String>,
    pub sender_id: Option<i64>,
    pub reply_to_msg_id: Option<i64>,
    pub via_bot_id: Option<i64>,
    pub views: Option<i64>,
    pub forwards: Option<i64>,
    pub reactions: Option<Vec<serde_json::Value>>,
    pub fwd_from: Option<serde_json::Value>,
    pub media: Option<MediaInfo>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ServiceMessage {
    pub id: i64,
    pub date: Option<DateTime<Utc>>,
    pub sender_id: Option<i64>,
    pub reply_to_msg_id: Option<i64>,
    pub action: serde_json::Value,
}

/// One message as handed over by a backend.
#[derive(Clone, Debug, PartialEq)]
pub enum RawMessage {
    Regular(RegularMessage),
    Service(ServiceMessage),
    /// A deleted or otherwise hollow slot that still occupies an id.
    Empty { id: i64 },
}

impl RawMessage {
    pub fn id(&self) -> i64 {
        match self {
            RawMessage::Regular(m) => m.id,
            RawMessage::Service(m) => m.id,
            RawMessage::Empty { id } => *id,
        }
    }

    pub fn media(&self) -> Option<&MediaInfo> {
        match self {
            RawMessage::Regular(m) => m.media.as_ref(),
            _ => None,
        }
    }
}

/// Opaque token returned by [`Session::request_login_code`].
#[derive(Clone, Debug)]
pub struct LoginToken {
    pub phone: String,
    pub handle: String,
}

pub type MessageIter<'a> = Box<dyn Iterator<Item = ClientResult<RawMessage>> + 'a>;

/// An authenticated (or authenticatable) connection to the service.
///
/// All methods take `&self`; backends that need to serialize calls over one
/// connection do so internally, which is what lets several export workers
/// share a single session by reference.
pub trait Session: Sync {
    fn is_authorized(&self) -> ClientResult<bool>;

    fn request_login_code(&self, phone: &str) -> ClientResult<LoginToken>;

    /// Fails with [`ClientError::PasswordRequired`] when the account has a
    /// second factor, or [`ClientError::InvalidCode`] on a wrong code.
    fn sign_in(&self, token: &LoginToken, code: &str) -> ClientResult<()>;

    fn check_password(&self, password: &str) -> ClientResult<()>;

    fn list_conversations(&self) -> ClientResult<Vec<Conversation>>;

    fn conversation(&self, id: i64) -> ClientResult<Conversation> {
        self.list_conversations()?
            .into_iter()
            .find(|c| c.id == id)
            .ok_or_else(|| ClientError::NotFound(format!("conversation {}", id)))
    }

    /// Oldest to newest. The iterator is finite and cannot be restarted.
    fn iter_messages<'a>(&'a self, query: &MessageQuery) -> ClientResult<MessageIter<'a>>;

    /// Topics after `offset_topic_id` in the service's listing order
    /// (0 starts from the beginning). An empty page means the end.
    fn list_topics_page(
        &self,
        conversation: i64,
        offset_topic_id: i64,
        page_size: usize,
    ) -> ClientResult<Vec<Topic>>;

    /// Writes the attachment of `message` somewhere inside `dest_dir` and
    /// returns the file's path. `Ok(None)` if nothing was written.
    fn download_attachment(
        &self,
        message: &RawMessage,
        dest_dir: &Path,
    ) -> ClientResult<Option<PathBuf>>;

    fn disconnect(&self);
}

pub trait Connector {
    type Session: Session;

    /// Whether [`Connector::connect`] needs a real API id and hash. Checked
    /// before connecting so a missing key fails the run up front.
    fn requires_credentials(&self) -> bool {
        true
    }

    fn connect(&self, credentials: &Credentials, session_path: &Path)
    -> ClientResult<Self::Session>;
}
