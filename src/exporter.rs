use crate::archive::{self, CHAT_META_FILE, MESSAGES_FILE, TOPIC_META_FILE, UnitKind};
use crate::client::{ClientError, Conversation, EntityKind, MessageQuery, Session, Target, Topic};
use crate::media::{self, Materialized};
use crate::paths;
use crate::record::{self, MessageRecord};
use crate::utils::{ensure_dir, write_json_atomic};
use eyre::{Context, Result};
use serde::ser::{SerializeStruct, Serializer};
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Contents of `chat.json` / `topic.json`.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum UnitMeta {
    Chat {
        id: i64,
        title: String,
        entity_type: EntityKind,
    },
    Topic {
        topic_id: i64,
        title: String,
        messages_count: Option<u64>,
    },
}

/// One export directory: a conversation or a forum topic.
#[derive(Debug, Clone)]
pub struct ArchiveUnit {
    pub dir: PathBuf,
    pub target: Target,
    pub meta: UnitMeta,
}

impl ArchiveUnit {
    pub fn for_conversation(base: &Path, conv: &Conversation) -> Self {
        Self {
            dir: base.join(paths::conversation_dir_name(conv.id, &conv.name)),
            target: Target::Conversation(conv.id),
            meta: UnitMeta::Chat {
                id: conv.id,
                title: conv.name.clone(),
                entity_type: conv.kind,
            },
        }
    }

    /// `container` is the forum's own directory, see [`paths::container_dir_name`].
    pub fn for_topic(container: &Path, conversation_id: i64, topic: &Topic) -> Self {
        Self {
            dir: container.join(paths::topic_dir_name(topic.id, &topic.title)),
            target: Target::Topic {
                conversation: conversation_id,
                topic: topic.id,
            },
            meta: UnitMeta::Topic {
                topic_id: topic.id,
                title: topic.title.clone(),
                messages_count: topic.total_messages,
            },
        }
    }

    pub fn id(&self) -> i64 {
        match &self.meta {
            UnitMeta::Chat { id, .. } => *id,
            UnitMeta::Topic { topic_id, .. } => *topic_id,
        }
    }

    pub fn kind(&self) -> UnitKind {
        match self.meta {
            UnitMeta::Chat { .. } => UnitKind::Chat,
            UnitMeta::Topic { .. } => UnitKind::Topic,
        }
    }

    pub fn title(&self) -> &str {
        match &self.meta {
            UnitMeta::Chat { title, .. } | UnitMeta::Topic { title, .. } => title,
        }
    }

    fn meta_file(&self) -> PathBuf {
        match self.meta {
            UnitMeta::Chat { .. } => self.dir.join(CHAT_META_FILE),
            UnitMeta::Topic { .. } => self.dir.join(TOPIC_META_FILE),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ExportOptions {
    pub limit: Option<usize>,
    pub skip_media: bool,
    pub resume: bool,
}

/// Outcome of one archive unit, as listed in the run summary.
///
/// Serialized with the id under `chat_id` or `topic_id`, matching the key
/// used by the unit's own metadata file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitSummary {
    pub kind: UnitKind,
    pub id: i64,
    pub title: String,
    /// Lines appended during this run.
    pub messages: usize,
    pub media: usize,
    pub media_failed: usize,
    /// Messages the backend could not decode.
    pub skipped: usize,
    pub path: PathBuf,
}

impl Serialize for UnitSummary {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let id_key = match self.kind {
            UnitKind::Chat => "chat_id",
            UnitKind::Topic => "topic_id",
        };
        let mut state = serializer.serialize_struct("UnitSummary", 7)?;
        state.serialize_field(id_key, &self.id)?;
        state.serialize_field("title", &self.title)?;
        state.serialize_field("messages", &self.messages)?;
        state.serialize_field("media", &self.media)?;
        state.serialize_field("media_failed", &self.media_failed)?;
        state.serialize_field("skipped", &self.skipped)?;
        state.serialize_field("path", &self.path)?;
        state.end()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Initializing,
    Paginating,
    Writing,
    Draining,
    Done,
}

/// Drives one archive unit from metadata to the last appended line.
pub struct MessageExporter<'a, S: Session> {
    session: &'a S,
    unit: &'a ArchiveUnit,
    options: ExportOptions,
    phase: Phase,
    log: Option<File>,
    /// The existing log ends in a partial line that must be terminated first.
    torn_tail: bool,
    last_id: Option<i64>,
    summary: UnitSummary,
}

impl<'a, S: Session> MessageExporter<'a, S> {
    pub fn new(session: &'a S, unit: &'a ArchiveUnit, options: ExportOptions) -> Self {
        Self {
            session,
            unit,
            options,
            phase: Phase::Initializing,
            log: None,
            torn_tail: false,
            last_id: None,
            summary: UnitSummary {
                kind: unit.kind(),
                id: unit.id(),
                title: unit.title().to_string(),
                messages: 0,
                media: 0,
                media_failed: 0,
                skipped: 0,
                path: unit.dir.clone(),
            },
        }
    }

    fn enter(&mut self, phase: Phase) {
        tracing::trace!(unit = self.summary.id, from = ?self.phase, to = ?phase, "Export phase");
        self.phase = phase;
    }

    pub fn run(mut self) -> Result<UnitSummary> {
        self.initialize()?;

        let query = MessageQuery {
            target: self.unit.target,
            limit: self.options.limit,
            min_id: self.last_id,
        };
        self.enter(Phase::Paginating);
        let session = self.session;
        let messages = session
            .iter_messages(&query)
            .wrap_err_with(|| format!("Failed to start reading {:?}", self.unit.target))?;

        for item in messages {
            let msg = match item {
                Ok(m) => m,
                Err(ClientError::Malformed { id, reason }) => {
                    self.summary.skipped += 1;
                    tracing::warn!(unit = self.summary.id, message_id = ?id, %reason, "Skipping malformed message");
                    continue;
                }
                Err(e) => {
                    // Everything appended so far is already on disk.
                    return Err(e).wrap_err_with(|| {
                        format!(
                            "Reading {:?} failed after {} messages",
                            self.unit.target, self.summary.messages
                        )
                    });
                }
            };

            if self.last_id.is_some_and(|last| msg.id() <= last) {
                tracing::debug!(unit = self.summary.id, message_id = msg.id(), "Out-of-order or repeated message ignored");
                continue;
            }

            self.enter(Phase::Writing);
            let mut rec = record::normalize(&msg, self.unit.target.conversation_id());
            if !self.options.skip_media {
                match media::materialize(session, &msg, &self.unit.dir)? {
                    Materialized::Skipped => {}
                    Materialized::Saved(rel) => {
                        rec.media_file = Some(rel);
                        self.summary.media += 1;
                    }
                    Materialized::Failed(reason) => {
                        rec.media_error = Some(reason);
                        self.summary.media_failed += 1;
                    }
                }
            }
            self.append(&rec)?;
            self.enter(Phase::Paginating);
        }

        self.enter(Phase::Draining);
        if let Some(log) = self.log.take() {
            log.sync_all()
                .wrap_err_with(|| format!("Failed to sync {}", self.unit.dir.display()))?;
        }
        self.enter(Phase::Done);
        Ok(self.summary)
    }

    fn initialize(&mut self) -> Result<()> {
        ensure_dir(&self.unit.dir)?;
        write_json_atomic(&self.unit.meta_file(), &self.unit.meta)?;
        self.torn_tail = archive::has_torn_tail(&self.unit.dir)?;
        if self.torn_tail {
            tracing::warn!(unit = self.summary.id, "Log ends in a partial line, starting a new one");
        }
        if self.options.resume {
            self.last_id = archive::last_recorded_id(&self.unit.dir)?;
            if let Some(id) = self.last_id {
                tracing::debug!(unit = self.summary.id, after = id, "Resuming after last recorded message");
            }
        }
        Ok(())
    }

    fn append(&mut self, rec: &MessageRecord) -> Result<()> {
        let log_path = self.unit.dir.join(MESSAGES_FILE);
        let mut log = match self.log.take() {
            Some(f) => f,
            None => OpenOptions::new()
                .create(true)
                .append(true)
                .open(&log_path)
                .wrap_err_with(|| format!("Failed to open {}", log_path.display()))?,
        };

        let mut line = Vec::new();
        if std::mem::take(&mut self.torn_tail) {
            line.push(b'\n');
        }
        serde_json::to_writer(&mut line, rec).wrap_err("Failed to encode message record")?;
        line.push(b'\n');
        // One write per record keeps the log prefix-consistent on a crash.
        log.write_all(&line)
            .wrap_err_with(|| format!("Failed to append to {}", log_path.display()))?;

        self.log = Some(log);
        self.last_id = Some(rec.id);
        self.summary.messages += 1;
        Ok(())
    }
}

/// Export one archive unit. Convenience over [`MessageExporter`].
pub fn export_unit<S: Session>(
    session: &S,
    unit: &ArchiveUnit,
    options: ExportOptions,
) -> Result<UnitSummary> {
    let summary = MessageExporter::new(session, unit, options).run()?;
    tracing::info!(
        id = summary.id,
        messages = summary.messages,
        media = summary.media,
        media_failed = summary.media_failed,
        path = %summary.path.display(),
        "Archive unit exported"
    );
    Ok(summary)
}
