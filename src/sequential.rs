use crate::client::{Conversation, Session};
use crate::exporter::{self, ArchiveUnit, UnitSummary};
use crate::utils::ExportConfig;
use indicatif::{ProgressBar, ProgressStyle};

/// Export conversations one after another on the shared session. A failed
/// conversation is logged and left out of the returned list.
pub fn export_all<S: Session>(
    session: &S,
    conversations: &[Conversation],
    config: &ExportConfig,
) -> Vec<UnitSummary> {
    let pb = progress_bar(conversations.len() as u64, config);
    let options = config.export_options();
    let mut summaries = Vec::with_capacity(conversations.len());

    for conv in conversations {
        pb.set_message(conv.name.clone());
        let unit = ArchiveUnit::for_conversation(&config.output_dir, conv);
        match exporter::export_unit(session, &unit, options) {
            Ok(summary) => summaries.push(summary),
            Err(e) => {
                tracing::error!(chat_id = conv.id, title = %conv.name, error = ?e, "Conversation export failed");
            }
        }
        pb.inc(1);
    }

    pb.finish_and_clear();
    summaries
}

/// Registered with `config.progress`, so log lines printed through
/// [`LogWriter`](crate::utils::LogWriter) do not tear through the bar.
fn progress_bar(total: u64, config: &ExportConfig) -> ProgressBar {
    if config.quiet {
        return ProgressBar::hidden();
    }
    let bar = config.progress.add(ProgressBar::new(total));
    if let Ok(style) =
        ProgressStyle::with_template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {wide_msg}")
    {
        bar.set_style(style.progress_chars("=>-"));
    }
    bar
}
