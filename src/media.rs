use crate::client::{RawMessage, Session};
use eyre::{Context, Result};
use std::fs;
use std::path::{Component, Path, PathBuf};

pub const MEDIA_DIR: &str = "media";

/// What happened to a message's attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Materialized {
    /// No attachment, or nothing downloadable attached.
    Skipped,
    /// Saved; path is relative to the archive unit root, `/`-separated.
    Saved(String),
    /// The record is written without a file. The reason goes into the record.
    Failed(String),
}

/// Download the attachment of `msg` into `<unit_dir>/media`.
///
/// Only a failure to create the media directory is an error. Download
/// failures are logged and reported as [`Materialized::Failed`] so the
/// export can carry on.
pub fn materialize<S: Session>(session: &S, msg: &RawMessage, unit_dir: &Path) -> Result<Materialized> {
    if msg.media().is_none_or(|m| m.source.is_none()) {
        return Ok(Materialized::Skipped);
    }

    let media_dir = unit_dir.join(MEDIA_DIR);
    fs::create_dir_all(&media_dir)
        .wrap_err_with(|| format!("Failed to create media dir: {}", media_dir.display()))?;

    let outcome = match session.download_attachment(msg, &media_dir) {
        Ok(Some(path)) => {
            let path = with_sniffed_extension(path);
            match relative_to(&path, unit_dir) {
                Some(rel) => Materialized::Saved(rel),
                None => Materialized::Failed(format!(
                    "downloaded outside the archive unit: {}",
                    path.display()
                )),
            }
        }
        Ok(None) => Materialized::Failed("attachment not available".to_string()),
        Err(e) => Materialized::Failed(e.to_string()),
    };

    if let Materialized::Failed(reason) = &outcome {
        tracing::warn!(message_id = msg.id(), reason = %reason, "Attachment not saved");
    }
    Ok(outcome)
}

/// Give extension-less downloads one based on their magic bytes. Leaves the
/// file alone if the type is unknown or the rename fails.
fn with_sniffed_extension(path: PathBuf) -> PathBuf {
    if path.extension().is_some() {
        return path;
    }
    let Ok(Some(kind)) = infer::get_from_path(&path) else {
        return path;
    };
    let renamed = path.with_extension(kind.extension());
    match fs::rename(&path, &renamed) {
        Ok(()) => renamed,
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "Could not add extension");
            path
        }
    }
}

fn relative_to(path: &Path, root: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Option<_>>()?;
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}
