use crate::client::{Session, Topic};
use crate::exporter::{self, ArchiveUnit, ExportOptions, UnitSummary};
use crate::paths;
use crate::utils::{ensure_dir, write_json_atomic};
use eyre::{Context, Result};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

pub const TOPICS_SUMMARY_FILE: &str = "resumen_topics.json";

/// Topics requested per listing call.
pub const TOPICS_PAGE_SIZE: usize = 100;

/// Export every topic of the forum conversation `conversation_id` into
/// `<base>/<conversation_id>/topic_<id>_<title>/`.
///
/// Topics are listed page by page with an offset-topic cursor. A topic whose
/// export fails is logged and left out of the summary; the rest continue.
pub fn export_topics<S: Session>(
    session: &S,
    conversation_id: i64,
    base: &Path,
    options: ExportOptions,
) -> Result<(PathBuf, Vec<UnitSummary>)> {
    let container = base.join(paths::container_dir_name(conversation_id));
    ensure_dir(&container)?;

    let mut summaries = Vec::new();
    for_each_topic(session, conversation_id, TOPICS_PAGE_SIZE, |topic| {
        let unit = ArchiveUnit::for_topic(&container, conversation_id, topic);
        match exporter::export_unit(session, &unit, options) {
            Ok(summary) => summaries.push(summary),
            Err(e) => {
                tracing::error!(chat_id = conversation_id, topic_id = topic.id, error = ?e, "Topic export failed");
            }
        }
    })?;

    write_json_atomic(&container.join(TOPICS_SUMMARY_FILE), &summaries)
        .wrap_err("Failed to write topics summary")?;
    Ok((container, summaries))
}

/// Walk the forum-topic listing of `conversation_id`, calling `visit` once
/// per distinct topic. Returns the number of topics visited.
///
/// Stops on an empty page. Also stops if the cursor would not move, so a
/// backend that keeps returning the same page cannot loop forever.
pub fn for_each_topic<S, F>(
    session: &S,
    conversation_id: i64,
    page_size: usize,
    mut visit: F,
) -> Result<usize>
where
    S: Session,
    F: FnMut(&Topic),
{
    let mut offset_topic = 0i64;
    let mut seen = HashSet::new();

    loop {
        let page = session
            .list_topics_page(conversation_id, offset_topic, page_size)
            .wrap_err_with(|| {
                format!("Failed to list topics of {} after {}", conversation_id, offset_topic)
            })?;
        let Some(last) = page.last() else {
            break;
        };
        let next_offset = last.id;

        for topic in &page {
            if seen.insert(topic.id) {
                visit(topic);
            } else {
                tracing::debug!(topic_id = topic.id, "Topic listed twice, skipping");
            }
        }

        if next_offset == offset_topic {
            tracing::warn!(chat_id = conversation_id, offset_topic, "Topic cursor did not advance, stopping");
            break;
        }
        offset_topic = next_offset;
    }

    Ok(seen.len())
}
