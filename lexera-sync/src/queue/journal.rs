//! Durable backing for the offline mutation queue.
//!
//! The whole queue is written as one JSON document carrying a format version
//! and a SHA-256 checksum of the entry list. File writes are atomic
//! (write .tmp, fsync, rename, fsync directory), so a crash leaves either the
//! previous or the next queue on disk, never a torn one.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::{QueueEntry, QueueError, QueueSnapshot};

const JOURNAL_VERSION: u32 = 1;

/// Persistence for queue snapshots.
pub trait QueueJournal: Send + Sync {
    /// Load the last stored snapshot. `Ok(None)` means nothing was ever stored.
    fn load(&self) -> Result<Option<QueueSnapshot>, QueueError>;

    /// Store a snapshot. Must be durable when this returns.
    fn store(&self, snapshot: &QueueSnapshot) -> Result<(), QueueError>;

    /// Move unreadable state aside so an empty queue can start over it.
    fn quarantine(&self) -> Result<(), QueueError>;
}

#[derive(Serialize)]
struct JournalOut<'a> {
    version: u32,
    next_seq: u64,
    checksum: String,
    entries: &'a [QueueEntry],
}

#[derive(Deserialize)]
struct JournalIn {
    version: u32,
    next_seq: u64,
    checksum: String,
    entries: Vec<QueueEntry>,
}

fn checksum(entries: &[QueueEntry]) -> Result<String, QueueError> {
    let json = serde_json::to_string(entries)?;
    let mut hasher = Sha256::new();
    hasher.update(json.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

pub fn encode(snapshot: &QueueSnapshot) -> Result<String, QueueError> {
    let out = JournalOut {
        version: JOURNAL_VERSION,
        next_seq: snapshot.next_seq,
        checksum: checksum(&snapshot.entries)?,
        entries: &snapshot.entries,
    };
    Ok(serde_json::to_string_pretty(&out)?)
}

pub fn decode(content: &str) -> Result<QueueSnapshot, QueueError> {
    let parsed: JournalIn =
        serde_json::from_str(content).map_err(|e| QueueError::Corrupt(e.to_string()))?;

    if parsed.version != JOURNAL_VERSION {
        return Err(QueueError::Corrupt(format!(
            "unsupported journal version {}",
            parsed.version
        )));
    }

    let expected = checksum(&parsed.entries)?;
    if expected != parsed.checksum {
        return Err(QueueError::Corrupt("checksum mismatch".to_string()));
    }

    Ok(QueueSnapshot {
        next_seq: parsed.next_seq,
        entries: parsed.entries,
    })
}

/// Queue journal in a single JSON file.
pub struct FileJournal {
    path: PathBuf,
}

impl FileJournal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn atomic_write(path: &Path, content: &str) -> Result<(), std::io::Error> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }

        let tmp_path = path.with_extension("json.tmp");
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(content.as_bytes())?;
        file.sync_all()?;
        fs::rename(&tmp_path, path)?;

        // fsync directory for rename durability
        if let Some(dir) = path.parent() {
            if let Ok(d) = fs::File::open(dir) {
                let _ = d.sync_all();
            }
        }
        Ok(())
    }
}

impl QueueJournal for FileJournal {
    fn load(&self) -> Result<Option<QueueSnapshot>, QueueError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&self.path)?;
        decode(&content).map(Some)
    }

    fn store(&self, snapshot: &QueueSnapshot) -> Result<(), QueueError> {
        let content = encode(snapshot)?;
        Self::atomic_write(&self.path, &content)?;
        Ok(())
    }

    fn quarantine(&self) -> Result<(), QueueError> {
        if !self.path.exists() {
            return Ok(());
        }
        let timestamp = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let backup_path = self
            .path
            .with_extension(format!("corrupt-{}.json", timestamp));
        fs::rename(&self.path, &backup_path)?;
        log::warn!(
            "[lexera.sync.queue] Unreadable queue moved to {:?}",
            backup_path
        );
        Ok(())
    }
}

/// Journal kept in memory with the same encoding as [`FileJournal`].
/// Clones share storage, which lets a test reopen "the same" queue.
#[derive(Clone, Default)]
pub struct MemoryJournal {
    content: Arc<Mutex<Option<String>>>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raw(&self) -> Option<String> {
        self.content.lock().unwrap().clone()
    }

    pub fn set_raw(&self, content: impl Into<String>) {
        *self.content.lock().unwrap() = Some(content.into());
    }
}

impl QueueJournal for MemoryJournal {
    fn load(&self) -> Result<Option<QueueSnapshot>, QueueError> {
        match self.content.lock().unwrap().as_deref() {
            Some(content) => decode(content).map(Some),
            None => Ok(None),
        }
    }

    fn store(&self, snapshot: &QueueSnapshot) -> Result<(), QueueError> {
        let content = encode(snapshot)?;
        *self.content.lock().unwrap() = Some(content);
        Ok(())
    }

    fn quarantine(&self) -> Result<(), QueueError> {
        self.content.lock().unwrap().take();
        Ok(())
    }
}
