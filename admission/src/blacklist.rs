//! File-backed IP deny list with hot reload.
//!
//! The file is newline-delimited: blank lines and `#`-prefixed lines are
//! comments, inline `# …` tails are stripped, entries are normalized like
//! any other client address. The set is polled for modification-time
//! changes and atomically replaced on reload. A broken or missing
//! blacklist must never block users: every failure path degrades to an
//! empty set or a `false` answer.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{info, warn};

use palisade_types::ip;

/// How often the file is checked for changes.
pub const POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Default)]
struct State {
    entries: HashSet<String>,
    mtime: Option<SystemTime>,
    loaded_at: u64,
}

/// Admin view of the blacklist.
#[derive(Clone, Debug, Serialize)]
pub struct BlacklistSnapshot {
    pub enabled: bool,
    pub path: Option<String>,
    pub entry_count: usize,
    pub entries: Vec<String>,
    pub loaded_at: u64,
}

/// Hot-reloaded IP deny list checked at admission.
pub struct IpBlacklist {
    path: Option<PathBuf>,
    state: RwLock<State>,
}

impl IpBlacklist {
    /// Create a blacklist over `path`, loading it immediately when it
    /// exists. A missing file at startup is not an error.
    pub fn new(path: Option<PathBuf>) -> Self {
        let blacklist = Self {
            path,
            state: RwLock::new(State::default()),
        };
        blacklist.reload();
        blacklist
    }

    /// Disabled blacklist (no file configured).
    pub fn disabled() -> Self {
        Self::new(None)
    }

    /// O(1) membership test. Never fails: any internal error answers
    /// `false` so a broken blacklist cannot block traffic.
    pub fn is_blacklisted(&self, client_ip: &str) -> bool {
        match self.state.read() {
            Ok(state) => state.entries.contains(client_ip),
            Err(_) => false,
        }
    }

    pub fn snapshot(&self) -> BlacklistSnapshot {
        let (entry_count, entries, loaded_at) = match self.state.read() {
            Ok(state) => {
                let mut entries: Vec<String> = state.entries.iter().cloned().collect();
                entries.sort();
                (state.entries.len(), entries, state.loaded_at)
            }
            Err(_) => (0, Vec::new(), 0),
        };
        BlacklistSnapshot {
            enabled: self.path.is_some(),
            path: self
                .path
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
            entry_count,
            entries,
            loaded_at,
        }
    }

    /// Poll the file every [`POLL_INTERVAL`] until shutdown, reloading on
    /// modification-time changes.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        if self.path.is_none() {
            return;
        }
        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.reload(),
                _ = shutdown.recv() => {
                    info!("blacklist watcher stopping");
                    return;
                }
            }
        }
    }

    /// Reload the set if the file changed (or vanished) since last load.
    /// All I/O errors degrade to an empty set.
    fn reload(&self) {
        let path = match &self.path {
            Some(path) => path,
            None => return,
        };

        let mtime = std::fs::metadata(path).and_then(|m| m.modified()).ok();
        {
            let state = match self.state.read() {
                Ok(state) => state,
                Err(_) => return,
            };
            if state.mtime == mtime {
                return;
            }
        }

        let entries = match mtime {
            Some(_) => match std::fs::read_to_string(path) {
                Ok(content) => parse_blacklist(&content),
                Err(err) => {
                    warn!(path = %path.display(), %err, "failed to read blacklist, keeping empty set");
                    HashSet::new()
                }
            },
            None => {
                // File removed (or unreadable): blacklist nobody.
                HashSet::new()
            }
        };

        if let Ok(mut state) = self.state.write() {
            let added: Vec<&String> = entries.difference(&state.entries).collect();
            let removed: Vec<&String> = state.entries.difference(&entries).collect();
            if !added.is_empty() || !removed.is_empty() || state.loaded_at == 0 {
                info!(
                    path = %path.display(),
                    total = entries.len(),
                    added = added.len(),
                    removed = removed.len(),
                    "blacklist reloaded"
                );
                for entry in &added {
                    info!(ip = %entry, "blacklist entry added");
                }
                for entry in &removed {
                    info!(ip = %entry, "blacklist entry removed");
                }
            }
            state.entries = entries;
            state.mtime = mtime;
            state.loaded_at = palisade_utils::time::unix_now();
        }
    }
}

/// Parse the newline-delimited blacklist format.
fn parse_blacklist(content: &str) -> HashSet<String> {
    content
        .lines()
        .map(|line| {
            let line = match line.find('#') {
                Some(pos) => &line[..pos],
                None => line,
            };
            line.trim()
        })
        .filter(|line| !line.is_empty())
        .map(ip::normalize)
        .filter(|entry| entry != ip::UNKNOWN)
        .collect()
}
