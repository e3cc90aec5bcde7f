use crate::client::{Conversation, Session};
use crate::exporter::{self, ArchiveUnit, UnitSummary};
use crate::utils::ExportConfig;
use crossbeam_channel::{bounded, unbounded};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Export conversations with `config.jobs` worker threads sharing one
/// session. Each worker owns whole archive units, so no two threads ever
/// write the same file. The result keeps the input order.
pub fn export_all<S: Session>(
    session: &S,
    conversations: &[Conversation],
    config: &ExportConfig,
) -> Vec<UnitSummary> {
    let n_workers = config.jobs.clamp(1, conversations.len().max(1));
    let options = config.export_options();
    let (tx, rx) = bounded::<(usize, &Conversation)>(n_workers * 2);
    let (done_tx, done_rx) = unbounded::<(usize, UnitSummary)>();
    let count_errors = AtomicUsize::new(0);

    std::thread::scope(|s| {
        for _ in 0..n_workers {
            let rx = rx.clone();
            let done_tx = done_tx.clone();
            let count_errors = &count_errors;

            s.spawn(move || {
                while let Ok((index, conv)) = rx.recv() {
                    let unit = ArchiveUnit::for_conversation(&config.output_dir, conv);
                    match exporter::export_unit(session, &unit, options) {
                        Ok(summary) => {
                            // The receiver outlives the scope.
                            let _ = done_tx.send((index, summary));
                        }
                        Err(e) => {
                            count_errors.fetch_add(1, Ordering::Relaxed);
                            tracing::error!(chat_id = conv.id, title = %conv.name, error = ?e, "Conversation export failed");
                        }
                    }
                }
            });
        }

        drop(rx);
        drop(done_tx);

        for item in conversations.iter().enumerate() {
            if tx.send(item).is_err() {
                break;
            }
        }
        drop(tx);
    });

    let mut results: Vec<(usize, UnitSummary)> = done_rx.try_iter().collect();
    results.sort_by_key(|(index, _)| *index);

    tracing::debug!(
        workers = n_workers,
        exported = results.len(),
        errors = count_errors.load(Ordering::Relaxed),
        "Parallel export finished"
    );
    results.into_iter().map(|(_, summary)| summary).collect()
}
