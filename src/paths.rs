//! Directory names for archive units.
//!
//! Titles are user-supplied and mutable; the numeric id in front of every
//! directory name is what keeps two chats called "Family" apart.

/// Longest cleaned title, in characters.
pub const MAX_NAME_CHARS: usize = 80;

/// Longest cleaned title, in UTF-8 bytes. Leaves room for the
/// `topic_<id>_` prefix under the 255-byte component limit of common
/// filesystems.
pub const MAX_NAME_BYTES: usize = 200;

const FORBIDDEN: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

fn is_forbidden(c: char) -> bool {
    FORBIDDEN.contains(&c) || c.is_control()
}

/// Make `name` usable as a single path component on Windows, macOS and Linux.
///
/// Runs of forbidden characters collapse into one `_`, leading/trailing
/// underscores, dots and whitespace are stripped, and the result is cut to
/// [`MAX_NAME_CHARS`] characters or [`MAX_NAME_BYTES`] bytes, whichever comes
/// first, on a character boundary. Never returns an empty string: `fallback` is used when
/// nothing survives.
pub fn sanitize_name(name: &str, fallback: &str) -> String {
    let mut cleaned = String::with_capacity(name.len());
    let mut in_run = false;
    for c in name.trim().chars() {
        if is_forbidden(c) {
            if !in_run {
                cleaned.push('_');
            }
            in_run = true;
        } else {
            cleaned.push(c);
            in_run = false;
        }
    }

    let trimmed = trim_edges(&cleaned);
    let mut bytes = 0;
    let truncated: String = trimmed
        .chars()
        .take(MAX_NAME_CHARS)
        .take_while(|c| {
            bytes += c.len_utf8();
            bytes <= MAX_NAME_BYTES
        })
        .collect();
    // Truncation can expose a trailing dot or space again.
    let result = trim_edges(&truncated);

    if result.is_empty() {
        fallback.chars().take(MAX_NAME_CHARS).collect()
    } else {
        result.to_string()
    }
}

fn trim_edges(s: &str) -> &str {
    s.trim_matches(|c: char| c == '_' || c == '.' || c.is_whitespace())
}

/// `<id>_<title>` for a top-level conversation.
pub fn conversation_dir_name(id: i64, title: &str) -> String {
    let fallback = format!("chat_{}", id);
    format!("{}_{}", id, sanitize_name(title, &fallback))
}

/// `topic_<id>_<title>` for a forum topic. Spaces become underscores so topic
/// folders stay shell-friendly inside their container.
pub fn topic_dir_name(id: i64, title: &str) -> String {
    let spaced = title.trim().replace(' ', "_");
    format!("topic_{}_{}", id, sanitize_name(&spaced, "topic"))
}

/// Directory holding every topic of one forum conversation.
pub fn container_dir_name(conversation_id: i64) -> String {
    sanitize_name(&conversation_id.to_string(), "chat")
}
