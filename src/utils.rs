use crate::client::Credentials;
use crate::exporter::ExportOptions;
use eyre::{Context, Result, eyre};
use indicatif::MultiProgress;
use serde::Serialize;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use url::Url;

/// Settings for one run, after CLI, environment and config file have been
/// merged. This decouples the pipeline from how the arguments were parsed.
#[derive(Clone, Debug)]
pub struct ExportConfig {
    pub output_dir: PathBuf,
    pub session_name: String,
    /// Per archive unit. `None` exports everything.
    pub limit: Option<usize>,
    pub skip_media: bool,
    /// Filter tokens for the whole-account backup. Empty means all chats.
    pub chats: Vec<String>,
    /// Read the last recorded id of an existing log and continue after it.
    pub resume: bool,
    pub jobs: usize,
    pub quiet: bool,
    /// Progress bars are drawn through this so log lines can clear them
    /// first, see [`LogWriter`].
    pub progress: MultiProgress,
}

impl ExportConfig {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            session_name: "tg_backup".to_string(),
            limit: None,
            skip_media: false,
            chats: Vec::new(),
            resume: true,
            jobs: 1,
            quiet: true,
            progress: MultiProgress::new(),
        }
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.output_dir.join("sessions")
    }

    pub fn session_path(&self) -> PathBuf {
        self.sessions_dir().join(&self.session_name)
    }

    pub fn export_options(&self) -> ExportOptions {
        ExportOptions {
            limit: self.limit,
            skip_media: self.skip_media,
            resume: self.resume,
        }
    }
}

/// Build [`Credentials`] for a backend that talks to the service. An id of
/// `0` or a blank hash counts as missing.
pub fn require_credentials(
    api_id: Option<i32>,
    api_hash: Option<String>,
    phone: Option<String>,
) -> Result<Credentials> {
    let api_id = api_id.filter(|id| *id != 0).ok_or_else(|| {
        eyre!("Missing API id.\nPass --api-id, set TG_API_ID, or add api_id to config.toml.")
    })?;
    let api_hash = api_hash.filter(|h| !h.trim().is_empty()).ok_or_else(|| {
        eyre!("Missing API hash.\nPass --api-hash, set TG_API_HASH, or add api_hash to config.toml.")
    })?;
    Ok(Credentials {
        api_id,
        api_hash,
        phone,
    })
}

/// Log sink for `tracing-subscriber`: writes each formatted event to stderr
/// with the progress bars cleared, then redraws them.
#[derive(Clone)]
pub struct LogWriter {
    progress: MultiProgress,
}

impl LogWriter {
    pub fn new(progress: MultiProgress) -> Self {
        Self { progress }
    }
}

impl Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.progress
            .suspend(|| io::stderr().lock().write_all(buf))
            .map(|()| buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()
    }
}

/// `0` on the command line means "no cap".
pub fn limit_from_count(count: usize) -> Option<usize> {
    (count > 0).then_some(count)
}

/// `~/Desktop/<folder>` when a desktop directory exists, else `./<folder>`.
pub fn default_output_dir(folder: &str) -> PathBuf {
    match dirs::desktop_dir().filter(|d| d.is_dir()) {
        Some(desktop) => desktop.join(folder),
        None => PathBuf::from(folder),
    }
}

/// Serialize `value` as pretty JSON and replace `path` atomically, so a
/// crash never leaves a half-written metadata or summary file behind.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| eyre!("No parent directory for {}", path.display()))?;
    let mut tmp = NamedTempFile::new_in(dir)
        .wrap_err_with(|| format!("Failed to create temporary file in {}", dir.display()))?;
    serde_json::to_writer_pretty(&mut tmp, value)
        .wrap_err_with(|| format!("Failed to serialize {}", path.display()))?;
    tmp.write_all(b"\n")?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .map_err(|e| e.error)
        .wrap_err_with(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .wrap_err_with(|| format!("Failed to create directory: {}", path.display()))
}

/// Extract a chat id from a Telegram link or a bare number.
///
/// Understands web client fragments (`https://web.telegram.org/k/#-3146600095`),
/// `?...=<id>` query parameters and private `t.me/c/<id>/<msg>` links. Ids
/// without the channel marker are normalized to `-100<id>`.
pub fn parse_chat_link(link: &str) -> Option<i64> {
    let raw = match Url::parse(link.trim()) {
        Ok(url) => id_from_url(&url)?,
        Err(_) => parse_signed_digits(link.trim().trim_start_matches('#'))?,
    };
    Some(to_channel_peer(raw))
}

fn id_from_url(url: &Url) -> Option<i64> {
    if let Some(fragment) = url.fragment()
        && let Some(id) = parse_signed_digits(fragment)
    {
        return Some(id);
    }
    if let Some(id) = url
        .query_pairs()
        .find_map(|(_, v)| parse_signed_digits(&v))
    {
        return Some(id);
    }
    let mut segments = url.path_segments()?;
    while let Some(seg) = segments.next() {
        if seg == "c" {
            return segments.next().and_then(parse_signed_digits);
        }
    }
    None
}

fn parse_signed_digits(s: &str) -> Option<i64> {
    let s = s.trim();
    let (neg, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let value: i64 = digits.parse().ok()?;
    Some(if neg { -value } else { value })
}

fn to_channel_peer(raw: i64) -> i64 {
    if raw.to_string().starts_with("-100") {
        raw
    } else {
        let digits = raw.unsigned_abs().to_string();
        format!("-100{}", digits).parse().unwrap_or(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn web_fragment_links_are_normalized() {
        assert_eq!(
            parse_chat_link("https://web.telegram.org/k/#-3146600095"),
            Some(-1003146600095)
        );
        assert_eq!(
            parse_chat_link("https://web.telegram.org/a/#-1003146600095"),
            Some(-1003146600095)
        );
    }

    #[test]
    fn query_and_tme_links() {
        assert_eq!(
            parse_chat_link("https://web.telegram.org/z/?peer=-42"),
            Some(-10042)
        );
        assert_eq!(parse_chat_link("https://t.me/c/3146600095/17"), Some(-1003146600095));
    }

    #[test]
    fn bare_ids_and_garbage() {
        assert_eq!(parse_chat_link("-1003146600095"), Some(-1003146600095));
        assert_eq!(parse_chat_link("3146600095"), Some(-1003146600095));
        assert_eq!(parse_chat_link("https://t.me/somebody"), None);
        assert_eq!(parse_chat_link("not a link"), None);
    }

    #[test]
    fn zero_or_blank_credentials_are_missing() {
        let hash = || Some("d524b414d21f4d37".to_string());
        let err = require_credentials(Some(0), hash(), None).unwrap_err();
        assert!(err.to_string().contains("Missing API id"));
        assert!(require_credentials(None, hash(), None).is_err());

        let err = require_credentials(Some(611335), Some("  ".to_string()), None).unwrap_err();
        assert!(err.to_string().contains("Missing API hash"));

        let creds = require_credentials(Some(611335), hash(), Some("+34600000000".into())).unwrap();
        assert_eq!(creds.api_id, 611335);
        assert_eq!(creds.phone.as_deref(), Some("+34600000000"));
    }

    #[test]
    fn log_writes_pass_through_an_active_bar() {
        let progress = MultiProgress::with_draw_target(indicatif::ProgressDrawTarget::hidden());
        let bar = progress.add(indicatif::ProgressBar::new(3));
        bar.inc(1);

        let mut writer = LogWriter::new(progress.clone());
        let line = b"WARN Attachment not saved\n";
        assert_eq!(writer.write(line).unwrap(), line.len());
        writer.flush().unwrap();
        assert_eq!(bar.position(), 1);
    }

    #[test]
    fn zero_limit_means_unbounded() {
        assert_eq!(limit_from_count(0), None);
        assert_eq!(limit_from_count(5), Some(5));
    }

    #[test]
    fn atomic_json_write_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chat.json");
        write_json_atomic(&path, &serde_json::json!({"id": 1})).unwrap();
        write_json_atomic(&path, &serde_json::json!({"id": 2})).unwrap();
        let v: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(v["id"], 2);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}
