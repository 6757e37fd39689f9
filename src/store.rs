//! Durable storage for audit entries.
//!
//! The chain decides *what* is written; a store only persists entries in
//! order and reads them back. Implement [`AuditStore`] to put the chain on
//! a database, object store, or anything else that can append durably.

use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};

use crate::audit::AuditEntry;
use crate::error::TrustError;

/// Persistence backend for an audit chain.
///
/// A store is positional: the entry at position `i` is whatever the `i`-th
/// successful `append` wrote, and reads address positions, not the
/// `sequence` field stored inside an entry. Verification relies on this to
/// notice deleted or reordered entries.
///
/// Implementations must be safe to read from while an append is in flight.
/// The chain serialises appends, so a store never sees two concurrent
/// `append` calls.
pub trait AuditStore: Send + Sync {
    /// Durably persist `entry` at the next position. On error nothing may
    /// have been committed.
    fn append(&self, entry: &AuditEntry) -> Result<(), TrustError>;

    /// Entries at positions `start <= i < end`, oldest first. Positions past
    /// the end of the store are simply absent from the result.
    fn read_range(&self, start: u64, end: u64) -> Result<Vec<AuditEntry>, TrustError>;

    /// The most recently committed entry, if any.
    fn tail(&self) -> Result<Option<AuditEntry>, TrustError>;
}

impl<S: AuditStore + ?Sized> AuditStore for Box<S> {
    fn append(&self, entry: &AuditEntry) -> Result<(), TrustError> {
        (**self).append(entry)
    }

    fn read_range(&self, start: u64, end: u64) -> Result<Vec<AuditEntry>, TrustError> {
        (**self).read_range(start, end)
    }

    fn tail(&self) -> Result<Option<AuditEntry>, TrustError> {
        (**self).tail()
    }
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// Keeps entries in a `Vec`. Suitable for tests and short-lived processes.
#[derive(Debug, Default)]
pub struct MemoryAuditStore {
    entries: RwLock<Vec<AuditEntry>>,
}

impl MemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AuditStore for MemoryAuditStore {
    fn append(&self, entry: &AuditEntry) -> Result<(), TrustError> {
        self.entries.write().push(entry.clone());
        Ok(())
    }

    fn read_range(&self, start: u64, end: u64) -> Result<Vec<AuditEntry>, TrustError> {
        let entries = self.entries.read();
        let len = entries.len() as u64;
        let end = end.min(len);
        if start >= end {
            return Ok(Vec::new());
        }
        Ok(entries[start as usize..end as usize].to_vec())
    }

    fn tail(&self) -> Result<Option<AuditEntry>, TrustError> {
        Ok(self.entries.read().last().cloned())
    }
}

// ---------------------------------------------------------------------------
// File store
// ---------------------------------------------------------------------------

/// Writes audit entries as JSON lines (one per entry) to a file.
///
/// Creates the file if it doesn't exist; appends if it does. Every append is
/// flushed and synced before it is acknowledged, and a failed append is
/// truncated away so a retry cannot leave a duplicate line. Reads go back to
/// the file, so edits made on disk are what verification sees.
///
/// A final line without its newline was never acknowledged; `open` cuts it
/// off with a warning.
pub struct FileAuditStore {
    path: PathBuf,
    file: Mutex<File>,
    /// Set when a failed append could not be rolled back. The file may then
    /// hold an entry the chain does not know about, so further appends are
    /// refused until the store is reopened.
    poisoned: AtomicBool,
}

impl std::fmt::Debug for FileAuditStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileAuditStore")
            .field("path", &self.path)
            .field("poisoned", &self.poisoned.load(Ordering::Relaxed))
            .finish()
    }
}

impl FileAuditStore {
    /// Open or create a file for append-only audit logging.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, TrustError> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;
        if let Some(dropped) = cut_torn_tail(&mut file)? {
            tracing::warn!(
                path = %path.display(),
                dropped_bytes = dropped,
                "discarded unacknowledged partial audit line"
            );
        }
        Ok(Self {
            path,
            file: Mutex::new(file),
            poisoned: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Walk the file line by line, stopping once `f` returns `false`.
    fn scan<F>(&self, mut f: F) -> Result<(), TrustError>
    where
        F: FnMut(AuditEntry) -> bool,
    {
        let reader = BufReader::new(File::open(&self.path)?);
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: AuditEntry = serde_json::from_str(&line)?;
            if !f(entry) {
                break;
            }
        }
        Ok(())
    }
}

/// Truncate everything after the last newline. Returns the number of bytes
/// removed, if any.
fn cut_torn_tail(file: &mut File) -> Result<Option<u64>, TrustError> {
    const CHUNK: u64 = 4096;

    let len = file.metadata()?.len();
    let mut end = len;
    let mut buf = [0u8; CHUNK as usize];
    while end > 0 {
        let start = end.saturating_sub(CHUNK);
        let chunk = &mut buf[..(end - start) as usize];
        file.seek(SeekFrom::Start(start))?;
        file.read_exact(chunk)?;
        if let Some(pos) = chunk.iter().rposition(|b| *b == b'\n') {
            end = start + pos as u64 + 1;
            break;
        }
        end = start;
    }

    if end == len {
        return Ok(None);
    }
    file.set_len(end)?;
    file.sync_data()?;
    Ok(Some(len - end))
}

/// The file operations an append needs, so the rollback path can be
/// exercised without a failing disk.
trait LogFile: Write {
    fn end(&self) -> io::Result<u64>;
    fn sync(&mut self) -> io::Result<()>;
    fn truncate(&mut self, len: u64) -> io::Result<()>;
}

impl LogFile for File {
    fn end(&self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn sync(&mut self) -> io::Result<()> {
        self.sync_data()
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)?;
        self.sync_data()
    }
}

enum AppendFailure {
    /// The file is back to its length before the append.
    RolledBack(io::Error),
    /// The rollback failed too; the file may hold a partial or whole line.
    Dirty { write: io::Error, rollback: io::Error },
}

fn write_durably<F: LogFile>(file: &mut F, line: &[u8]) -> io::Result<()> {
    file.write_all(line)?;
    file.flush()?;
    file.sync()
}

fn append_line<F: LogFile>(file: &mut F, line: &[u8]) -> Result<(), AppendFailure> {
    let before = file.end().map_err(AppendFailure::RolledBack)?;
    match write_durably(file, line) {
        Ok(()) => Ok(()),
        Err(write) => match file.truncate(before) {
            Ok(()) => Err(AppendFailure::RolledBack(write)),
            Err(rollback) => Err(AppendFailure::Dirty { write, rollback }),
        },
    }
}

impl AuditStore for FileAuditStore {
    fn append(&self, entry: &AuditEntry) -> Result<(), TrustError> {
        if self.poisoned.load(Ordering::Acquire) {
            return Err(TrustError::Storage(format!(
                "{} needs to be reopened after a failed rollback",
                self.path.display()
            )));
        }

        let mut line = serde_json::to_string(entry)?;
        line.push('\n');

        let mut file = self.file.lock();
        match append_line(&mut *file, line.as_bytes()) {
            Ok(()) => Ok(()),
            Err(AppendFailure::RolledBack(err)) => Err(err.into()),
            Err(AppendFailure::Dirty { write, rollback }) => {
                self.poisoned.store(true, Ordering::Release);
                tracing::error!(
                    path = %self.path.display(),
                    sequence = entry.sequence,
                    error = %write,
                    rollback_error = %rollback,
                    "audit append failed and could not be rolled back"
                );
                Err(write.into())
            }
        }
    }

    fn read_range(&self, start: u64, end: u64) -> Result<Vec<AuditEntry>, TrustError> {
        let mut out = Vec::new();
        let mut index = 0u64;
        // Lines past `end` may still be mid-write; they are never parsed.
        if start >= end {
            return Ok(out);
        }
        self.scan(|entry| {
            if index >= start {
                out.push(entry);
            }
            index += 1;
            index < end
        })?;
        Ok(out)
    }

    fn tail(&self) -> Result<Option<AuditEntry>, TrustError> {
        let mut last = None;
        self.scan(|entry| {
            last = Some(entry);
            true
        })?;
        Ok(last)
    }
}
