use std::collections::HashSet;
use std::path::Path;
use std::sync::mpsc;
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

use super::history::HistoryDb;

/// Classification of an accepted detection against the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    New,
    Duplicate,
}

enum HistoryCommand {
    Append { code: String, scanned_at_ms: i64 },
    Flush(mpsc::Sender<()>),
}

/// Background writer that owns the history database.
///
/// Appends are applied in the order they were sent. Nothing on the
/// classification path waits for them.
struct HistoryWriter {
    commands: mpsc::Sender<HistoryCommand>,
    thread: JoinHandle<()>,
}

impl HistoryWriter {
    fn spawn(db: HistoryDb) -> Option<Self> {
        let (tx, rx) = mpsc::channel();
        let spawned = std::thread::Builder::new()
            .name("qr-history".into())
            .spawn(move || run_history_writer(db, rx));
        match spawned {
            Ok(thread) => Some(Self {
                commands: tx,
                thread,
            }),
            Err(e) => {
                error!(error = %e, "failed to spawn history writer; persistence disabled");
                None
            }
        }
    }
}

fn run_history_writer(db: HistoryDb, commands: mpsc::Receiver<HistoryCommand>) {
    let mut written: u64 = 0;
    let mut failed: u64 = 0;
    while let Ok(command) = commands.recv() {
        match command {
            HistoryCommand::Append {
                code,
                scanned_at_ms,
            } => match db.append(&code, scanned_at_ms) {
                Ok(_) => written += 1,
                Err(e) => {
                    failed += 1;
                    error!(error = %e, code, "failed to persist code");
                }
            },
            HistoryCommand::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!(written, failed, "history writer stopped");
}

/// Codes accepted so far, optionally backed by durable history.
///
/// The in-memory set is authoritative for the whole process lifetime:
/// persistence failures are logged and never change a classification.
pub struct SessionStore {
    seen: HashSet<String>,
    /// Distinct codes in first-seen order, history first.
    order: Vec<String>,
    /// How many of `order` came from persisted history.
    loaded: usize,
    writer: Option<HistoryWriter>,
}

impl SessionStore {
    /// Store without persistence.
    pub fn in_memory() -> Self {
        Self {
            seen: HashSet::new(),
            order: Vec::new(),
            loaded: 0,
            writer: None,
        }
    }

    /// Pre-populate from `db` and persist new codes to it.
    ///
    /// An unreadable history is treated as empty.
    pub fn with_history(db: HistoryDb) -> Self {
        let mut store = Self::in_memory();
        match db.load() {
            Ok(entries) => {
                for entry in entries {
                    store.insert(entry.code);
                }
            }
            Err(e) => warn!(error = %e, "failed to load history, starting empty"),
        }
        store.loaded = store.order.len();
        store.writer = HistoryWriter::spawn(db);
        info!(
            loaded = store.loaded,
            persistent = store.writer.is_some(),
            "session store ready"
        );
        store
    }

    /// Open the history file at `path`. A missing file starts an empty
    /// history and a corrupt one is replaced; neither is fatal.
    pub fn open(path: &Path) -> Self {
        match HistoryDb::open_or_recover(path) {
            Some(db) => Self::with_history(db),
            None => {
                warn!(path = path.display().to_string(), "running without persisted history");
                Self::in_memory()
            }
        }
    }

    fn insert(&mut self, code: String) -> bool {
        if self.seen.contains(&code) {
            return false;
        }
        self.seen.insert(code.clone());
        self.order.push(code);
        true
    }

    /// Classify `code`, inserting it if new.
    ///
    /// New codes are queued for persistence; the result does not depend on
    /// whether that write succeeds.
    pub fn classify(&mut self, code: &str) -> Classification {
        if self.seen.contains(code) {
            return Classification::Duplicate;
        }
        self.insert(code.to_owned());

        if let Some(writer) = &self.writer {
            let command = HistoryCommand::Append {
                code: code.to_owned(),
                scanned_at_ms: chrono::Utc::now().timestamp_millis(),
            };
            if writer.commands.send(command).is_err() {
                error!(code, "history writer gone; code kept in memory only");
            }
        }
        Classification::New
    }

    pub fn contains(&self, code: &str) -> bool {
        self.seen.contains(code)
    }

    /// Number of distinct codes, including persisted history.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Codes accepted during this process, excluding loaded history.
    pub fn session_codes(&self) -> &[String] {
        &self.order[self.loaded..]
    }

    /// All distinct codes in first-seen order.
    pub fn codes(&self) -> &[String] {
        &self.order
    }

    pub fn is_persistent(&self) -> bool {
        self.writer.is_some()
    }

    /// Block until every queued history write has been applied.
    pub fn flush(&self) {
        let Some(writer) = &self.writer else {
            return;
        };
        let (done_tx, done_rx) = mpsc::channel();
        if writer.commands.send(HistoryCommand::Flush(done_tx)).is_ok() {
            let _ = done_rx.recv();
        }
    }

    /// Flush pending writes and stop the history writer.
    pub fn close(&mut self) {
        if let Some(writer) = self.writer.take() {
            drop(writer.commands);
            if writer.thread.join().is_err() {
                error!("history writer panicked");
            }
            info!(codes = self.order.len(), "session store closed");
        }
    }
}

impl Drop for SessionStore {
    fn drop(&mut self) {
        self.close();
    }
}
