use clap::{Args, Parser, Subcommand};
use eyre::{Context, Result, eyre};
use indicatif::MultiProgress;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use telegram_backup::archive::{self, MediaFilter, MessageFilter, UnitKind};
use telegram_backup::backup;
use telegram_backup::client::{Connector, Credentials};
use telegram_backup::importer::DesktopExportConnector;
use telegram_backup::record::MessageRecord;
use telegram_backup::session::ConsolePrompt;
use telegram_backup::utils::{self, ExportConfig, LogWriter};
use tracing_subscriber::EnvFilter;

/// Back up Telegram chats and forum topics into an append-only archive.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Debug-level logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Only warnings and errors, no progress bar.
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Export every conversation of the account (or those matching --chats).
    Backup {
        #[command(flatten)]
        common: CommonArgs,

        /// Chat ids or title fragments to include. Omit for all chats.
        #[arg(long, value_name = "TOKEN", num_args = 1..)]
        chats: Vec<String>,

        /// Number of conversations exported concurrently.
        #[arg(long, value_name = "N")]
        jobs: Option<usize>,
    },
    /// Export every topic of one forum group.
    Topics {
        #[command(flatten)]
        common: CommonArgs,

        /// Forum chat id, e.g. -1003146600095.
        #[arg(long, allow_hyphen_values = true, conflicts_with = "link")]
        chat_id: Option<i64>,

        /// Web or t.me link to the forum.
        #[arg(long)]
        link: Option<String>,
    },
    /// Read an existing archive back.
    Browse {
        /// An archive unit (prints messages) or a base folder (lists units).
        #[arg(value_name = "PATH")]
        path: PathBuf,

        /// Case-insensitive text fragment.
        #[arg(long)]
        text: Option<String>,

        /// Fragment of the sender id.
        #[arg(long)]
        sender: Option<String>,

        /// Date prefix, YYYY-MM-DD.
        #[arg(long)]
        date: Option<String>,

        /// Only messages with a saved attachment.
        #[arg(long, conflicts_with = "no_media")]
        media: bool,

        /// Only messages without a saved attachment.
        #[arg(long)]
        no_media: bool,
    },
}

#[derive(Args)]
struct CommonArgs {
    /// API id from my.telegram.org. Not needed when reading a Desktop export.
    #[arg(long, env = "TG_API_ID")]
    api_id: Option<i32>,

    #[arg(long, env = "TG_API_HASH", hide_env_values = true)]
    api_hash: Option<String>,

    /// Phone number in international format, used on first login.
    #[arg(long, env = "TG_PHONE")]
    phone: Option<String>,

    /// Session name under <output>/sessions.
    #[arg(long)]
    session: Option<String>,

    /// Base folder of the archive.
    #[arg(short, long, value_name = "DIR")]
    output: Option<PathBuf>,

    /// Messages per conversation or topic. 0 exports everything.
    #[arg(long)]
    limit: Option<usize>,

    /// Do not download attachments.
    #[arg(long)]
    skip_media: bool,

    /// Telegram Desktop export folder (or its result.json).
    #[arg(long, env = "TG_SOURCE", value_name = "PATH")]
    source: Option<PathBuf>,

    /// Re-export from the start instead of continuing after the last saved message.
    #[arg(long)]
    no_resume: bool,

    /// Configuration file.
    /// Defaults to $XDG_CONFIG_HOME/telegram-backup/config.toml
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
}

#[derive(Deserialize, Default)]
struct FileConfig {
    api_id: Option<i32>,
    api_hash: Option<String>,
    phone: Option<String>,
    output_dir: Option<PathBuf>,
    session: Option<String>,
    source: Option<PathBuf>,
    limit: Option<usize>,
    skip_media: Option<bool>,
    jobs: Option<usize>,
}

fn load_file_config(explicit_path: Option<&Path>) -> Result<FileConfig> {
    let path = if let Some(p) = explicit_path {
        if !p.exists() {
            return Err(eyre!("Config file not found: {}", p.display()));
        }
        Some(p.to_path_buf())
    } else {
        dirs::config_dir()
            .map(|d| d.join("telegram-backup/config.toml"))
            .filter(|p| p.exists())
    };

    match path {
        None => Ok(FileConfig::default()),
        Some(p) => {
            let content = fs::read_to_string(&p)
                .wrap_err_with(|| format!("Failed to read config: {}", p.display()))?;
            toml::from_str(&content)
                .wrap_err_with(|| format!("Failed to parse config: {}", p.display()))
        }
    }
}

fn init_logging(verbose: bool, quiet: bool, progress: &MultiProgress) {
    let default = if verbose {
        "debug"
    } else if quiet {
        "warn"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let progress = progress.clone();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(move || LogWriter::new(progress.clone()))
        .with_target(false)
        .init();
}

/// Everything needed to connect and export, after merging CLI, environment
/// and config file.
struct Resolved {
    credentials: Credentials,
    connector: DesktopExportConnector,
    config: ExportConfig,
}

fn resolve(
    common: CommonArgs,
    folder: &str,
    session_default: &str,
    quiet: bool,
    progress: &MultiProgress,
) -> Result<(Resolved, FileConfig)> {
    let mut file_cfg = load_file_config(common.config.as_deref())?;

    let connector = DesktopExportConnector {
        source: common.source.or(file_cfg.source.take()),
    };
    let api_id = common.api_id.or(file_cfg.api_id);
    let api_hash = common.api_hash.or(file_cfg.api_hash.take());
    let phone = common.phone.or(file_cfg.phone.take());
    let credentials = if connector.requires_credentials() {
        utils::require_credentials(api_id, api_hash, phone)?
    } else {
        Credentials {
            api_id: api_id.unwrap_or_default(),
            api_hash: api_hash.unwrap_or_default(),
            phone,
        }
    };

    let output_dir = common
        .output
        .or(file_cfg.output_dir.take())
        .unwrap_or_else(|| utils::default_output_dir(folder));

    let mut config = ExportConfig::new(output_dir);
    config.session_name = common
        .session
        .or(file_cfg.session.take())
        .unwrap_or_else(|| session_default.to_string());
    config.limit = utils::limit_from_count(common.limit.or(file_cfg.limit).unwrap_or(0));
    config.skip_media = common.skip_media || file_cfg.skip_media.unwrap_or(false);
    config.resume = !common.no_resume;
    config.quiet = quiet;
    config.progress = progress.clone();

    let resolved = Resolved {
        credentials,
        connector,
        config,
    };
    Ok((resolved, file_cfg))
}

fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    let progress = MultiProgress::new();
    init_logging(cli.verbose, cli.quiet, &progress);

    match cli.command {
        Command::Backup { common, chats, jobs } => {
            let (mut run, file_cfg) = resolve(common, "TelegramBackups", "tg_backup", cli.quiet, &progress)?;
            run.config.chats = chats;
            run.config.jobs = jobs.or(file_cfg.jobs).unwrap_or(1).max(1);

            let summaries =
                backup::run_backup(&run.connector, &run.credentials, &run.config, &mut ConsolePrompt)?;
            let media: usize = summaries.iter().map(|s| s.media).sum();
            let messages: usize = summaries.iter().map(|s| s.messages).sum();
            println!(
                "Exported {} conversations ({} messages, {} media files) to {}",
                summaries.len(),
                messages,
                media,
                run.config.output_dir.display()
            );
            Ok(())
        }
        Command::Topics {
            common,
            chat_id,
            link,
        } => {
            let conversation_id = match (chat_id, link) {
                (Some(id), _) => id,
                (None, Some(link)) => utils::parse_chat_link(&link)
                    .ok_or_else(|| eyre!("Could not find a chat id in link: {}", link))?,
                (None, None) => return Err(eyre!("Pass --chat-id or --link")),
            };
            let (run, _) = resolve(
                common,
                "TelegramBackupsTopics",
                "topics_session",
                cli.quiet,
                &progress,
            )?;

            let (summary_path, summaries) = backup::run_topics(
                &run.connector,
                &run.credentials,
                &run.config,
                conversation_id,
                &mut ConsolePrompt,
            )?;
            for s in &summaries {
                println!("{:>8}  {:>6} msgs  {:>4} media  {}", s.id, s.messages, s.media, s.title);
            }
            println!("Summary written to {}", summary_path.display());
            Ok(())
        }
        Command::Browse {
            path,
            text,
            sender,
            date,
            media,
            no_media,
        } => {
            let filter = MessageFilter {
                text,
                sender,
                date,
                media: match (media, no_media) {
                    (true, _) => MediaFilter::WithMedia,
                    (_, true) => MediaFilter::WithoutMedia,
                    _ => MediaFilter::Any,
                },
            };
            browse(&path, &filter)
        }
    }
}

fn browse(path: &Path, filter: &MessageFilter) -> Result<()> {
    if path.join(archive::MESSAGES_FILE).exists() {
        let (records, bad) = archive::load_messages(path)?;
        let shown = records.iter().filter(|r| filter.matches(r)).map(print_record).count();
        println!("-- {} of {} messages shown", shown, records.len());
        if bad > 0 {
            tracing::warn!(lines = bad, "Skipped undecodable lines");
        }
        return Ok(());
    }

    let units = archive::list_units(path)?;
    if units.is_empty() {
        return Err(eyre!("No archive units under {}", path.display()));
    }
    for unit in units {
        let kind = match unit.kind {
            UnitKind::Chat => "chat",
            UnitKind::Topic => "topic",
        };
        println!(
            "{:<5} {:>16} {:>7} msgs  {}  ({})",
            kind,
            unit.id,
            unit.lines,
            unit.title,
            unit.path.display()
        );
    }
    Ok(())
}

fn print_record(rec: &MessageRecord) {
    let date = rec
        .date
        .map(|d| d.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".to_string());
    let sender = rec.sender_id.map(|s| s.to_string()).unwrap_or_default();
    let text = rec.message.as_deref().unwrap_or("");
    match rec.media_file.as_deref() {
        Some(file) => println!("[{}] #{} {}: {} <{}>", date, rec.id, sender, text, file),
        None => println!("[{}] #{} {}: {}", date, rec.id, sender, text),
    }
}
