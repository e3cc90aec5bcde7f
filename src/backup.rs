use crate::client::{Connector, Conversation, Credentials, Session};
use crate::exporter::UnitSummary;
use crate::session::{self, LoginPrompt};
use crate::topics;
use crate::utils::{ExportConfig, ensure_dir, write_json_atomic};
use crate::{parallel, sequential};
use eyre::{Context, Result};
use std::path::PathBuf;

pub const SUMMARY_FILE: &str = "resumen.json";

/// A conversation is selected when any token equals its id or occurs,
/// case-insensitively, in its title. No tokens selects everything.
pub fn matches_filter(conv: &Conversation, tokens: &[String]) -> bool {
    if tokens.is_empty() {
        return true;
    }
    let id = conv.id.to_string();
    let title = conv.name.to_lowercase();
    tokens.iter().any(|t| {
        let t = t.trim();
        !t.is_empty() && (t == id || title.contains(&t.to_lowercase()))
    })
}

pub fn select_conversations(all: Vec<Conversation>, tokens: &[String]) -> Vec<Conversation> {
    all.into_iter().filter(|c| matches_filter(c, tokens)).collect()
}

/// Whole-account backup: connect, log in, export every selected conversation
/// and write `resumen.json`. The session is disconnected on return, error or
/// not.
pub fn run_backup<C: Connector>(
    connector: &C,
    credentials: &Credentials,
    config: &ExportConfig,
    prompt: &mut dyn LoginPrompt,
) -> Result<Vec<UnitSummary>> {
    ensure_dir(&config.output_dir)?;
    let session = session::open(connector, credentials, &config.session_path(), prompt)?;
    backup_with_session(&*session, config)
}

/// The part of [`run_backup`] that runs on an already authenticated session.
pub fn backup_with_session<S: Session>(session: &S, config: &ExportConfig) -> Result<Vec<UnitSummary>> {
    ensure_dir(&config.output_dir)?;
    let all = session
        .list_conversations()
        .wrap_err("Failed to list conversations")?;
    let total = all.len();
    let selected = select_conversations(all, &config.chats);
    tracing::info!(selected = selected.len(), total, "Conversations to export");

    let summaries = if config.jobs > 1 {
        parallel::export_all(session, &selected, config)
    } else {
        sequential::export_all(session, &selected, config)
    };

    let summary_path = config.output_dir.join(SUMMARY_FILE);
    write_json_atomic(&summary_path, &summaries).wrap_err("Failed to write run summary")?;
    tracing::info!(
        exported = summaries.len(),
        failed = selected.len() - summaries.len(),
        summary = %summary_path.display(),
        "Backup finished"
    );
    Ok(summaries)
}

/// Forum export: every topic of one conversation, each into its own unit.
pub fn run_topics<C: Connector>(
    connector: &C,
    credentials: &Credentials,
    config: &ExportConfig,
    conversation_id: i64,
    prompt: &mut dyn LoginPrompt,
) -> Result<(PathBuf, Vec<UnitSummary>)> {
    ensure_dir(&config.output_dir)?;
    let session = session::open(connector, credentials, &config.session_path(), prompt)?;
    let conversation = session
        .conversation(conversation_id)
        .wrap_err_with(|| format!("Cannot open conversation {}", conversation_id))?;
    tracing::info!(chat_id = conversation.id, title = %conversation.name, "Exporting forum topics");
    topics::export_topics(&*session, conversation.id, &config.output_dir, config.export_options())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::EntityKind;

    fn conv(id: i64, name: &str) -> Conversation {
        Conversation {
            id,
            name: name.to_string(),
            kind: EntityKind::Group,
        }
    }

    #[test]
    fn filter_matches_id_or_title() {
        let tokens = vec!["alice".to_string(), "555".to_string()];
        assert!(matches_filter(&conv(1, "Alice Group"), &tokens));
        assert!(matches_filter(&conv(555, "Bob"), &tokens));
        assert!(!matches_filter(&conv(777, "Carol"), &tokens));
    }

    #[test]
    fn empty_filter_selects_all() {
        assert!(matches_filter(&conv(1, "x"), &[]));
    }

    #[test]
    fn id_match_is_exact() {
        assert!(!matches_filter(&conv(555, "Bob"), &["55".to_string()]));
        assert!(matches_filter(&conv(-100555, "Bob"), &["-100555".to_string()]));
    }

    #[test]
    fn blank_tokens_are_ignored() {
        let tokens = vec!["  ".to_string()];
        assert!(!matches_filter(&conv(1, "Alice"), &tokens));
    }
}
