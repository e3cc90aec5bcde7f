//! # telegram-backup
//!
//! Back up Telegram chats, groups, channels, bots and forum topics into a
//! plain-file archive that stays readable without this tool.
//!
//! ## Archive layout
//!
//! ```text
//! <base>/
//!   resumen.json                      run summary, rewritten every run
//!   sessions/<name>                   session file, reused across runs
//!   <id>_<title>/
//!     chat.json                       id, title, entity type
//!     messages.jsonl                  one record per line, oldest first
//!     media/<message-id>_<file>       attachments
//!   <forum-id>/
//!     resumen_topics.json
//!     topic_<id>_<title>/
//!       topic.json
//!       messages.jsonl
//!       media/
//! ```
//!
//! `messages.jsonl` is only ever appended to. Each record is written with a
//! single `write` as soon as it is ready, so an interrupted run leaves a
//! valid prefix behind. A rerun reads the id of the last record and
//! continues after it.
//!
//! ## Backends
//!
//! The pipeline talks to the service through [`client::Session`]. The crate
//! ships [`importer::DesktopExport`], which serves a Telegram Desktop JSON
//! export, so existing exports can be folded into the same archive format.
//!
//! ## Usage
//!
//! ```sh
//! # Whole account
//! telegram-backup backup --source ~/Downloads/Telegram\ Desktop/DataExport_2024-03-01
//!
//! # Only chats whose title contains "family", plus chat 555, text only
//! telegram-backup backup --chats family 555 --skip-media
//!
//! # Every topic of a forum group
//! telegram-backup topics --link 'https://web.telegram.org/k/#-3146600095'
//!
//! # Read an archive back
//! telegram-backup browse ~/Desktop/TelegramBackups/-100123_Team --text release
//! ```

pub mod archive;
pub mod backup;
pub mod client;
pub mod exporter;
pub mod importer;
pub mod media;
pub mod parallel;
pub mod paths;
pub mod record;
pub mod sequential;
pub mod session;
pub mod topics;
pub mod utils;
