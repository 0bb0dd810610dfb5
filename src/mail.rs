//! Streaming decoder for the mail archive (per-folder `.mbox` containers
//! holding `.emlx` message files).
//!
//! Folder selection is substring-based and case-insensitive: a folder is
//! read only if its name contains an allow-list term and no block-list
//! term; the block list wins. Each message file carries a byte count on
//! its first line, then exactly that many bytes of RFC-822 content, then
//! trailer data that is never parsed.
//!
//! Body extraction prefers `text/plain` parts; HTML-only messages are
//! stripped to text. Messages with no usable text, and files that fail to
//! parse, are logged and skipped — they never abort the stream.

use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use mailparse::{MailHeaderMap, ParsedMail};
use tokio::sync::mpsc;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::config::Config;
use crate::models::RawMail;

/// Folder names to include (case-insensitive substring match).
const ALLOWED_FOLDERS: &[&str] = &["inbox", "sent", "archive", "all mail"];
/// Folder names to always exclude. Takes precedence over the allow list.
const BLOCKED_FOLDERS: &[&str] = &["spam", "junk", "trash", "drafts", "deleted"];

const CHANNEL_CAPACITY: usize = 64;

/// Apply the allow/block folder filter to an `.mbox` directory name.
pub fn allowed_folder(name: &str) -> bool {
    let name_lower = name.to_lowercase();
    if BLOCKED_FOLDERS.iter().any(|b| name_lower.contains(b)) {
        return false;
    }
    ALLOWED_FOLDERS.iter().any(|a| name_lower.contains(a))
}

fn find_allowed_mboxes(mail_dir: &Path) -> Vec<PathBuf> {
    WalkDir::new(mail_dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.file_type().is_dir()
                && e.file_name()
                    .to_str()
                    .map(|n| n.ends_with(".mbox") && allowed_folder(n))
                    .unwrap_or(false)
        })
        .map(|e| e.into_path())
        .collect()
}

/// Parse a single `.emlx` file: a byte-count line, a newline, that many
/// bytes of message content, then an ignored trailer.
pub fn parse_emlx(path: &Path) -> Option<RawMail> {
    let raw = match std::fs::read(path) {
        Ok(raw) => raw,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot read message file");
            return None;
        }
    };

    let newline_idx = match raw.iter().position(|&b| b == b'\n') {
        Some(idx) => idx,
        None => {
            warn!(path = %path.display(), "no byte-count line, not a valid message file");
            return None;
        }
    };

    let byte_count: usize = match std::str::from_utf8(&raw[..newline_idx])
        .ok()
        .and_then(|s| s.trim().parse().ok())
    {
        Some(n) => n,
        None => {
            warn!(path = %path.display(), "invalid byte count");
            return None;
        }
    };

    let start = newline_idx + 1;
    let end = (start + byte_count).min(raw.len());
    let message = &raw[start..end];

    let parsed = match mailparse::parse_mail(message) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to parse message");
            return None;
        }
    };

    let body = extract_body(&parsed)?;
    let body = body.trim();
    if body.is_empty() {
        return None;
    }

    let timestamp = parsed
        .headers
        .get_first_value("Date")
        .and_then(|d| mailparse::dateparse(&d).ok())
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
        .unwrap_or_else(Utc::now);

    Some(RawMail {
        path: path.display().to_string(),
        subject: parsed.headers.get_first_value("Subject").unwrap_or_default(),
        sender: parsed.headers.get_first_value("From").unwrap_or_default(),
        recipients: parsed.headers.get_first_value("To").unwrap_or_default(),
        timestamp,
        body: body.to_string(),
        message_id: parsed
            .headers
            .get_first_value("Message-ID")
            .unwrap_or_default(),
    })
}

/// Extract text from a parsed message, preferring `text/plain` parts and
/// falling back to stripped `text/html`. Returns `None` when neither
/// exists.
fn extract_body(mail: &ParsedMail<'_>) -> Option<String> {
    let mut plain_parts = Vec::new();
    let mut html_parts = Vec::new();
    collect_text_parts(mail, &mut plain_parts, &mut html_parts);

    if !plain_parts.is_empty() {
        return Some(plain_parts.join("\n"));
    }
    if !html_parts.is_empty() {
        let stripped: Vec<String> = html_parts.iter().map(|h| strip_html(h)).collect();
        return Some(stripped.join("\n"));
    }
    None
}

fn collect_text_parts(mail: &ParsedMail<'_>, plain: &mut Vec<String>, html: &mut Vec<String>) {
    if mail.subparts.is_empty() {
        match mail.ctype.mimetype.as_str() {
            "text/plain" => {
                if let Ok(body) = mail.get_body() {
                    plain.push(body);
                }
            }
            "text/html" => {
                if let Ok(body) = mail.get_body() {
                    html.push(body);
                }
            }
            _ => {}
        }
        return;
    }
    for part in &mail.subparts {
        collect_text_parts(part, plain, html);
    }
}

/// Strip markup from an HTML fragment, keeping text content with newline
/// separators. Script and style bodies are dropped. Real-world mail HTML
/// is rarely well-formed, so end-tag mismatches are tolerated and a parse
/// error simply ends the scan with whatever was collected.
pub fn strip_html(html: &str) -> String {
    use quick_xml::events::Event;

    let mut reader = quick_xml::Reader::from_str(html);
    reader.config_mut().check_end_names = false;

    let mut out = String::new();
    loop {
        match reader.read_event() {
            Ok(Event::Start(e))
                if matches!(e.local_name().as_ref(), b"script" | b"style") =>
            {
                let _ = reader.read_to_end(e.name());
            }
            Ok(Event::Text(t)) => {
                let piece = t
                    .unescape()
                    .map(|c| c.into_owned())
                    .unwrap_or_else(|_| String::from_utf8_lossy(t.as_ref()).into_owned());
                let piece = piece.trim();
                if !piece.is_empty() {
                    if !out.is_empty() {
                        out.push('\n');
                    }
                    out.push_str(piece);
                }
            }
            Ok(Event::Eof) | Err(_) => break,
            _ => {}
        }
    }
    out
}

/// Stream parsed messages from the mail archive, optionally bounded by an
/// inclusive `since` cutoff.
///
/// A file-mtime check runs before the expensive parse when `since` is
/// set. A message file's mtime is never earlier than the Date header it
/// was written with, so the prefilter can only let extra files through —
/// the parsed-date filter afterwards is authoritative.
pub fn stream_mails(
    config: &Config,
    since: Option<DateTime<Utc>>,
) -> mpsc::Receiver<Result<RawMail>> {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    let mail_dir = config.archives.mail_dir.clone();

    tokio::task::spawn_blocking(move || {
        if !mail_dir.exists() {
            warn!(dir = %mail_dir.display(), "mail directory does not exist");
            return;
        }

        let mboxes = find_allowed_mboxes(&mail_dir);
        info!(count = mboxes.len(), "found allowed mailboxes");

        for mbox in mboxes {
            for entry in WalkDir::new(&mbox)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| {
                    e.file_type().is_file()
                        && e.path().extension().and_then(|x| x.to_str()) == Some("emlx")
                })
            {
                if let Some(cutoff) = since {
                    let modified = entry
                        .metadata()
                        .ok()
                        .and_then(|m| m.modified().ok())
                        .map(DateTime::<Utc>::from);
                    match modified {
                        Some(mtime) if mtime < cutoff => continue,
                        None => continue,
                        _ => {}
                    }
                }

                let Some(mail) = parse_emlx(entry.path()) else {
                    continue;
                };

                if let Some(cutoff) = since {
                    if mail.timestamp < cutoff {
                        continue;
                    }
                }

                if tx.blocking_send(Ok(mail)).is_err() {
                    // Receiver gone — consumer stopped early.
                    return;
                }
            }
        }
    });

    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn folder_filter_block_wins() {
        assert!(allowed_folder("INBOX.mbox"));
        assert!(allowed_folder("Sent Messages.mbox"));
        assert!(allowed_folder("All Mail.mbox"));
        assert!(!allowed_folder("Junk.mbox"));
        assert!(!allowed_folder("Deleted Messages.mbox"));
        // Contains both "inbox" and "spam": block list takes precedence.
        assert!(!allowed_folder("inbox-spam.mbox"));
        // Neither list matches.
        assert!(!allowed_folder("Newsletters.mbox"));
    }

    fn write_emlx(dir: &TempDir, name: &str, rfc822: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut raw = format!("{}\n", rfc822.len()).into_bytes();
        raw.extend_from_slice(rfc822.as_bytes());
        // Trailer the parser must never touch.
        raw.extend_from_slice(b"<?xml version=\"1.0\"?><plist>ignored</plist>");
        std::fs::write(&path, raw).unwrap();
        path
    }

    #[test]
    fn parses_plain_message_and_ignores_trailer() {
        let dir = TempDir::new().unwrap();
        let rfc822 = "From: alice@example.com\r\n\
             To: bob@example.com\r\n\
             Subject: lunch\r\n\
             Date: Thu, 15 Jun 2023 12:00:00 +0000\r\n\
             Message-ID: <abc@example.com>\r\n\
             Content-Type: text/plain\r\n\
             \r\n\
             Want to grab lunch tomorrow?";
        let path = write_emlx(&dir, "1.emlx", rfc822);

        let mail = parse_emlx(&path).unwrap();
        assert_eq!(mail.sender, "alice@example.com");
        assert_eq!(mail.subject, "lunch");
        assert_eq!(mail.body, "Want to grab lunch tomorrow?");
        assert!(!mail.body.contains("plist"));
        assert_eq!(mail.timestamp.to_rfc3339(), "2023-06-15T12:00:00+00:00");
    }

    #[test]
    fn prefers_plain_over_html() {
        let dir = TempDir::new().unwrap();
        let rfc822 = "From: a@b.c\r\n\
             Subject: multi\r\n\
             Date: Thu, 15 Jun 2023 12:00:00 +0000\r\n\
             Content-Type: multipart/alternative; boundary=\"XX\"\r\n\
             \r\n\
             --XX\r\n\
             Content-Type: text/plain\r\n\
             \r\n\
             plain version\r\n\
             --XX\r\n\
             Content-Type: text/html\r\n\
             \r\n\
             <p>html version</p>\r\n\
             --XX--\r\n";
        let path = write_emlx(&dir, "2.emlx", rfc822);

        let mail = parse_emlx(&path).unwrap();
        assert_eq!(mail.body, "plain version");
    }

    #[test]
    fn html_only_is_stripped() {
        let dir = TempDir::new().unwrap();
        let rfc822 = "From: a@b.c\r\n\
             Subject: html\r\n\
             Date: Thu, 15 Jun 2023 12:00:00 +0000\r\n\
             Content-Type: text/html\r\n\
             \r\n\
             <html><body><p>Hello</p><p>World</p></body></html>";
        let path = write_emlx(&dir, "3.emlx", rfc822);

        let mail = parse_emlx(&path).unwrap();
        assert_eq!(mail.body, "Hello\nWorld");
    }

    #[test]
    fn no_usable_text_is_skipped() {
        let dir = TempDir::new().unwrap();
        let rfc822 = "From: a@b.c\r\n\
             Subject: attachment only\r\n\
             Content-Type: application/octet-stream\r\n\
             \r\n\
             binarybytes";
        let path = write_emlx(&dir, "4.emlx", rfc822);
        assert!(parse_emlx(&path).is_none());
    }

    #[test]
    fn garbage_file_is_skipped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.emlx");
        std::fs::write(&path, b"not a byte count").unwrap();
        assert!(parse_emlx(&path).is_none());
    }

    #[test]
    fn strip_html_drops_script() {
        let html = "<div>keep</div><script>var x = 1;</script><p>this</p>";
        assert_eq!(strip_html(html), "keep\nthis");
    }
}
