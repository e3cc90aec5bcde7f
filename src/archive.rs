//! Read-only access to an archive produced by the exporter.

use crate::record::MessageRecord;
use eyre::{Context, Result};
use serde::Deserialize;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

pub const MESSAGES_FILE: &str = "messages.jsonl";
pub const CHAT_META_FILE: &str = "chat.json";
pub const TOPIC_META_FILE: &str = "topic.json";

/// Bytes read from the end of a log when looking for its last record.
const TAIL_WINDOW: u64 = 64 * 1024;

#[derive(Deserialize)]
struct IdOnly {
    id: i64,
}

/// Id of the last well-formed record in `<unit_dir>/messages.jsonl`.
///
/// Reads backwards from the end in growing windows, so a long log costs one
/// small read while a record larger than the window is still found. A torn
/// final line (crash mid-write) is skipped in favour of the line before it.
pub fn last_recorded_id(unit_dir: &Path) -> Result<Option<i64>> {
    let path = unit_dir.join(MESSAGES_FILE);
    let mut file = match File::open(&path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).wrap_err_with(|| format!("Failed to open {}", path.display())),
    };

    let len = file.metadata()?.len();
    let mut window = TAIL_WINDOW;
    loop {
        let start = len.saturating_sub(window);
        file.seek(SeekFrom::Start(start))?;
        let mut tail = Vec::with_capacity((len - start) as usize);
        file.read_to_end(&mut tail)
            .wrap_err_with(|| format!("Failed to read {}", path.display()))?;

        let text = String::from_utf8_lossy(&tail);
        let mut lines = text.lines();
        if start > 0 {
            // First line of the window is probably cut.
            lines.next();
        }
        if let Some(id) = lines
            .rev()
            .find_map(|line| serde_json::from_str::<IdOnly>(line).ok())
            .map(|r| r.id)
        {
            return Ok(Some(id));
        }
        if start == 0 {
            return Ok(None);
        }
        window = window.saturating_mul(2);
    }
}

/// Whether the log ends mid-line, i.e. the last write was cut short.
pub fn has_torn_tail(unit_dir: &Path) -> Result<bool> {
    let path = unit_dir.join(MESSAGES_FILE);
    let mut file = match File::open(&path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e).wrap_err_with(|| format!("Failed to open {}", path.display())),
    };
    if file.metadata()?.len() == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}

/// Every decodable record of a unit, in file order. Lines that fail to parse
/// are counted in the second return value and otherwise ignored.
pub fn load_messages(unit_dir: &Path) -> Result<(Vec<MessageRecord>, usize)> {
    let path = unit_dir.join(MESSAGES_FILE);
    let file = File::open(&path).wrap_err_with(|| format!("No message log at {}", path.display()))?;
    let mut records = Vec::new();
    let mut bad = 0usize;
    for line in BufReader::new(file).lines() {
        let line = line.wrap_err_with(|| format!("Failed to read {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<MessageRecord>(&line) {
            Ok(r) => records.push(r),
            Err(_) => bad += 1,
        }
    }
    Ok((records, bad))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MediaFilter {
    #[default]
    Any,
    WithMedia,
    WithoutMedia,
}

/// Filters applied when browsing. Records with neither text nor a saved
/// file are always dropped here; the exporter keeps them.
#[derive(Debug, Clone, Default)]
pub struct MessageFilter {
    /// Case-insensitive substring of the message text.
    pub text: Option<String>,
    /// Substring of the sender id.
    pub sender: Option<String>,
    /// Prefix of the ISO date, e.g. `2024-03-01`.
    pub date: Option<String>,
    pub media: MediaFilter,
}

impl MessageFilter {
    pub fn matches(&self, rec: &MessageRecord) -> bool {
        if rec.is_empty() {
            return false;
        }
        if let Some(text) = self.text.as_deref().map(str::to_lowercase).filter(|t| !t.is_empty())
            && !rec
                .message
                .as_deref()
                .is_some_and(|m| m.to_lowercase().contains(&text))
        {
            return false;
        }
        if let Some(sender) = self.sender.as_deref().filter(|s| !s.is_empty())
            && !rec
                .sender_id
                .is_some_and(|id| id.to_string().contains(sender))
        {
            return false;
        }
        if let Some(date) = self.date.as_deref().filter(|d| !d.is_empty())
            && !rec.date.is_some_and(|d| d.to_rfc3339().starts_with(date))
        {
            return false;
        }
        match self.media {
            MediaFilter::Any => true,
            MediaFilter::WithMedia => rec.media_file.is_some(),
            MediaFilter::WithoutMedia => rec.media_file.is_none(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitKind {
    Chat,
    Topic,
}

#[derive(Debug, Clone)]
pub struct UnitInfo {
    pub path: PathBuf,
    pub kind: UnitKind,
    pub id: i64,
    pub title: String,
    pub lines: usize,
}

#[derive(Deserialize)]
struct ChatMeta {
    id: i64,
    title: Option<String>,
}

#[derive(Deserialize)]
struct TopicMeta {
    topic_id: i64,
    title: Option<String>,
}

/// Archive units directly under `base`, plus topic units one level below
/// (forum containers). Sorted by path.
pub fn list_units(base: &Path) -> Result<Vec<UnitInfo>> {
    let mut units = Vec::new();
    let entries =
        fs::read_dir(base).wrap_err_with(|| format!("Failed to read {}", base.display()))?;
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        if let Some(unit) = read_unit(&path) {
            units.push(unit);
            continue;
        }
        if let Ok(children) = fs::read_dir(&path) {
            units.extend(
                children
                    .flatten()
                    .map(|e| e.path())
                    .filter(|p| p.is_dir())
                    .filter_map(|p| read_unit(&p)),
            );
        }
    }
    units.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(units)
}

fn read_unit(dir: &Path) -> Option<UnitInfo> {
    let (kind, id, title) = if let Ok(raw) = fs::read_to_string(dir.join(CHAT_META_FILE)) {
        let meta: ChatMeta = serde_json::from_str(&raw).ok()?;
        (UnitKind::Chat, meta.id, meta.title)
    } else if let Ok(raw) = fs::read_to_string(dir.join(TOPIC_META_FILE)) {
        let meta: TopicMeta = serde_json::from_str(&raw).ok()?;
        (UnitKind::Topic, meta.topic_id, meta.title)
    } else {
        return None;
    };
    Some(UnitInfo {
        path: dir.to_path_buf(),
        kind,
        id,
        title: title.unwrap_or_default(),
        lines: count_lines(&dir.join(MESSAGES_FILE)),
    })
}

fn count_lines(path: &Path) -> usize {
    File::open(path)
        .map(|f| BufReader::new(f).lines().map_while(|l| l.ok()).count())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_log(dir: &Path, lines: &[&str]) {
        let mut f = File::create(dir.join(MESSAGES_FILE)).unwrap();
        for l in lines {
            writeln!(f, "{}", l).unwrap();
        }
    }

    fn record(id: i64, text: Option<&str>, media: Option<&str>) -> MessageRecord {
        let mut value = serde_json::json!({
            "id": id, "date": "2024-03-01T10:00:00Z", "message": text, "sender_id": 555,
            "chat_id": 1, "reply_to_msg_id": null, "via_bot_id": null, "views": null,
            "forwards": null, "reactions": null, "fwd_from": null, "action": null,
            "media_type": null
        });
        if let Some(m) = media {
            value["media_file"] = m.into();
        }
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn last_id_skips_torn_tail() {
        let dir = tempfile::tempdir().unwrap();
        write_log(dir.path(), &[r#"{"id":1}"#, r#"{"id":2}"#, r#"{"id":3,"mess"#]);
        assert_eq!(last_recorded_id(dir.path()).unwrap(), Some(2));
    }

    #[test]
    fn last_id_survives_a_record_larger_than_the_window() {
        let dir = tempfile::tempdir().unwrap();
        let big = serde_json::json!({"id": 4, "message": "x".repeat(70 * 1024)}).to_string();
        write_log(dir.path(), &[r#"{"id":1}"#, r#"{"id":3}"#, big.as_str()]);
        assert_eq!(last_recorded_id(dir.path()).unwrap(), Some(4));

        let torn = &big[..big.len() / 2];
        write_log(dir.path(), &[r#"{"id":1}"#, r#"{"id":3}"#, big.as_str(), torn]);
        assert_eq!(last_recorded_id(dir.path()).unwrap(), Some(4));

        write_log(dir.path(), &[torn]);
        assert_eq!(last_recorded_id(dir.path()).unwrap(), None);
    }

    #[test]
    fn last_id_of_missing_log_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(last_recorded_id(dir.path()).unwrap(), None);
    }

    #[test]
    fn load_counts_bad_lines() {
        let dir = tempfile::tempdir().unwrap();
        let good = serde_json::to_string(&record(1, Some("hi"), None)).unwrap();
        write_log(dir.path(), &[&good, "garbage", ""]);
        let (records, bad) = load_messages(dir.path()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(bad, 1);
    }

    #[test]
    fn filter_drops_empty_and_applies_criteria() {
        let text = record(1, Some("Hello World"), None);
        let photo = record(2, None, Some("media/2_a.jpg"));
        let empty = record(3, None, None);

        let all = MessageFilter::default();
        assert!(all.matches(&text));
        assert!(all.matches(&photo));
        assert!(!all.matches(&empty));

        let by_text = MessageFilter {
            text: Some("world".into()),
            ..Default::default()
        };
        assert!(by_text.matches(&text));
        assert!(!by_text.matches(&photo));

        let by_date = MessageFilter {
            date: Some("2024-03-01".into()),
            sender: Some("55".into()),
            ..Default::default()
        };
        assert!(by_date.matches(&text));

        let no_media = MessageFilter {
            media: MediaFilter::WithoutMedia,
            ..Default::default()
        };
        assert!(no_media.matches(&text));
        assert!(!no_media.matches(&photo));
    }

    #[test]
    fn units_are_found_at_both_levels() {
        let base = tempfile::tempdir().unwrap();
        let chat = base.path().join("1_Alice");
        fs::create_dir_all(&chat).unwrap();
        fs::write(chat.join(CHAT_META_FILE), r#"{"id":1,"title":"Alice","entity_type":"user"}"#)
            .unwrap();
        write_log(&chat, &[r#"{"id":1}"#, r#"{"id":2}"#]);

        let topic = base.path().join("-100777").join("topic_4_News");
        fs::create_dir_all(&topic).unwrap();
        fs::write(
            topic.join(TOPIC_META_FILE),
            r#"{"topic_id":4,"title":"News","messages_count":null}"#,
        )
        .unwrap();

        let units = list_units(base.path()).unwrap();
        assert_eq!(units.len(), 2);
        let alice = units.iter().find(|u| u.kind == UnitKind::Chat).unwrap();
        assert_eq!((alice.id, alice.lines), (1, 2));
        let news = units.iter().find(|u| u.kind == UnitKind::Topic).unwrap();
        assert_eq!((news.id, news.title.as_str(), news.lines), (4, "News", 0));
    }
}
