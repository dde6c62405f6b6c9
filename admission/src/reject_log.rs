//! Fire-and-forget log of rejected requests.
//!
//! Rejections are formatted into single lines and handed to a background
//! writer over an unbounded channel. The writer appends to the log file
//! when 100 lines are pending or one second after the first unflushed
//! line, whichever comes first. Logging must never fail the request:
//! write errors go to stderr and are swallowed.

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use tokio::sync::{broadcast, mpsc};
use tracing::info;

/// Flush when this many lines are buffered.
const FLUSH_THRESHOLD: usize = 100;
/// Flush this long after the first unflushed line.
const FLUSH_INTERVAL: Duration = Duration::from_secs(1);
/// Longest request body fragment kept in a log line.
const MAX_BODY_CHARS: usize = 1_000;

/// Handle for logging rejected requests. Cheap to clone.
#[derive(Clone)]
pub struct RejectLog {
    tx: Option<mpsc::UnboundedSender<String>>,
}

impl RejectLog {
    /// Spawn the background writer appending to `path` and return the
    /// logging handle. The writer drains and flushes on shutdown.
    pub fn spawn(path: PathBuf, shutdown: broadcast::Receiver<()>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(writer_loop(path, rx, shutdown));
        Self { tx: Some(tx) }
    }

    /// A handle that drops every line; used when no log path is
    /// configured and in tests.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Record one rejection. Never fails; a closed writer just drops the
    /// line.
    pub fn log(&self, client_ip: &str, origin: &str, reason: &str, body: &str) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(format_line(client_ip, origin, reason, body));
        }
    }
}

/// `<ISO-timestamp> | <ip> | <origin> | <reason> | <body>` with the body
/// clipped to [`MAX_BODY_CHARS`] characters.
fn format_line(client_ip: &str, origin: &str, reason: &str, body: &str) -> String {
    let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
    let body = sanitize_body(body);
    format!("{timestamp} | {client_ip} | {origin} | {reason} | {body}")
}

fn sanitize_body(body: &str) -> String {
    let flat = body.replace(['\n', '\r'], " ");
    if flat.chars().count() <= MAX_BODY_CHARS {
        flat
    } else {
        let clipped: String = flat.chars().take(MAX_BODY_CHARS).collect();
        format!("{clipped} [truncated]")
    }
}

async fn writer_loop(
    path: PathBuf,
    mut rx: mpsc::UnboundedReceiver<String>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut buffer: Vec<String> = Vec::new();
    let mut flush_at: Option<tokio::time::Instant> = None;

    loop {
        let deadline = flush_at.unwrap_or_else(|| {
            // No pending lines: park far in the future.
            tokio::time::Instant::now() + Duration::from_secs(3_600)
        });
        tokio::select! {
            line = rx.recv() => match line {
                Some(line) => {
                    if buffer.is_empty() {
                        flush_at = Some(tokio::time::Instant::now() + FLUSH_INTERVAL);
                    }
                    buffer.push(line);
                    if buffer.len() >= FLUSH_THRESHOLD {
                        flush(&path, &mut buffer);
                        flush_at = None;
                    }
                }
                None => {
                    flush(&path, &mut buffer);
                    return;
                }
            },
            _ = tokio::time::sleep_until(deadline), if flush_at.is_some() => {
                flush(&path, &mut buffer);
                flush_at = None;
            }
            _ = shutdown.recv() => {
                // Drain whatever is already queued, then stop.
                while let Ok(line) = rx.try_recv() {
                    buffer.push(line);
                }
                flush(&path, &mut buffer);
                info!("reject log writer stopping");
                return;
            }
        }
    }
}

/// Append and clear the buffer. Errors are printed to stderr and
/// swallowed; the buffer is dropped either way so a dead disk cannot
/// grow memory without bound.
fn flush(path: &PathBuf, buffer: &mut Vec<String>) {
    if buffer.is_empty() {
        return;
    }
    let result = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut file| {
            for line in buffer.iter() {
                writeln!(file, "{line}")?;
            }
            file.flush()
        });
    if let Err(err) = result {
        eprintln!("reject log write failed ({}): {err}", path.display());
    }
    buffer.clear();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_format_has_all_fields() {
        let line = format_line("1.2.3.4", "example.com", "missing id", "{\"x\":1}");
        let parts: Vec<&str> = line.split(" | ").collect();
        assert_eq!(parts.len(), 5);
        assert_eq!(parts[1], "1.2.3.4");
        assert_eq!(parts[2], "example.com");
        assert_eq!(parts[3], "missing id");
        assert_eq!(parts[4], "{\"x\":1}");
        assert!(parts[0].ends_with('Z'));
    }

    #[test]
    fn long_bodies_are_clipped() {
        let body = "x".repeat(MAX_BODY_CHARS + 50);
        let out = sanitize_body(&body);
        assert!(out.ends_with(" [truncated]"));
        assert_eq!(out.chars().count(), MAX_BODY_CHARS + " [truncated]".len());
    }

    #[test]
    fn newlines_are_flattened() {
        assert_eq!(sanitize_body("a\nb\rc"), "a b c");
    }

    #[tokio::test]
    async fn writer_appends_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rejects.log");
        let controller = palisade_utils::ShutdownController::new();
        let log = RejectLog::spawn(path.clone(), controller.subscribe());

        log.log("1.2.3.4", "example.com", "empty batch", "[]");
        log.log("1.2.3.4", "example.com", "missing id", "{}");
        // Give the writer a beat to pick the lines up, then stop it.
        tokio::time::sleep(Duration::from_millis(50)).await;
        controller.shutdown();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("empty batch"));
        assert!(lines[1].contains("missing id"));
    }

    #[tokio::test]
    async fn flushes_after_interval_without_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rejects.log");
        let controller = palisade_utils::ShutdownController::new();
        let log = RejectLog::spawn(path.clone(), controller.subscribe());

        log.log("1.2.3.4", "unknown", "parse error", "not json");
        tokio::time::sleep(FLUSH_INTERVAL + Duration::from_millis(200)).await;

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("parse error"));
        controller.shutdown();
    }

    #[test]
    fn disabled_log_never_panics() {
        let log = RejectLog::disabled();
        log.log("1.2.3.4", "unknown", "reason", "body");
    }
}
