//! Byte stores the queue journal is written to.
//!
//! Backends are opaque: they append and return bytes and know nothing about
//! journal framing. The queue owns all interpretation.

use crate::error::{QueueError, QueueResult};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// An append-only byte store holding the queue journal.
///
/// # Invariants
///
/// - `append` either writes all bytes or returns an error
/// - `sync` makes every appended byte survive process termination
/// - `replace` swaps the whole content atomically: after a crash the store
///   holds either the old or the new bytes, never a mix
pub trait JournalBackend: Send {
    /// Reads the full content.
    fn read_all(&mut self) -> QueueResult<Vec<u8>>;

    /// Appends bytes at the end.
    fn append(&mut self, bytes: &[u8]) -> QueueResult<()>;

    /// Flushes appended bytes to durable storage.
    fn sync(&mut self) -> QueueResult<()>;

    /// Returns the current length in bytes.
    fn len(&self) -> QueueResult<u64>;

    /// Returns true if nothing has been written.
    fn is_empty(&self) -> QueueResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Drops everything after `len` bytes.
    fn truncate(&mut self, len: u64) -> QueueResult<()>;

    /// Atomically replaces the full content.
    fn replace(&mut self, bytes: &[u8]) -> QueueResult<()>;
}

/// A journal stored in a single file.
///
/// Compaction writes a sibling `*.tmp` file, syncs it and renames it over
/// the journal.
#[derive(Debug)]
pub struct FileJournal {
    path: PathBuf,
    file: File,
    len: u64,
}

impl FileJournal {
    /// Opens or creates the journal file, creating parent directories.
    pub fn open(path: impl AsRef<Path>) -> QueueResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = Self::open_file(path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            path: path.to_path_buf(),
            file,
            len,
        })
    }

    /// Returns the journal path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open_file(path: &Path) -> QueueResult<File> {
        Ok(OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?)
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl JournalBackend for FileJournal {
    fn read_all(&mut self) -> QueueResult<Vec<u8>> {
        let mut buf = Vec::with_capacity(usize::try_from(self.len).unwrap_or(0));
        self.file.seek(SeekFrom::Start(0))?;
        self.file.read_to_end(&mut buf)?;
        Ok(buf)
    }

    fn append(&mut self, bytes: &[u8]) -> QueueResult<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(bytes)?;
        self.len += bytes.len() as u64;
        Ok(())
    }

    fn sync(&mut self) -> QueueResult<()> {
        self.file.flush()?;
        self.file.sync_data()?;
        Ok(())
    }

    fn len(&self) -> QueueResult<u64> {
        Ok(self.len)
    }

    fn truncate(&mut self, len: u64) -> QueueResult<()> {
        if len > self.len {
            return Err(QueueError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("cannot truncate to {} bytes, journal has {}", len, self.len),
            )));
        }
        self.file.set_len(len)?;
        self.file.sync_all()?;
        self.len = len;
        Ok(())
    }

    fn replace(&mut self, bytes: &[u8]) -> QueueResult<()> {
        let temp = self.temp_path();
        {
            let mut out = File::create(&temp)?;
            out.write_all(bytes)?;
            out.sync_all()?;
        }
        std::fs::rename(&temp, &self.path)?;
        self.file = Self::open_file(&self.path)?;
        self.len = bytes.len() as u64;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    data: Vec<u8>,
    fail_writes: bool,
}

/// An in-memory journal.
///
/// Clones share the same bytes, so a test can drop a store and reopen it
/// from a clone to simulate a restart. Writes can be made to fail to
/// exercise storage-failure paths.
#[derive(Debug, Clone, Default)]
pub struct MemoryJournal {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryJournal {
    /// Creates an empty journal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a journal holding existing bytes.
    #[must_use]
    pub fn with_data(data: Vec<u8>) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState {
                data,
                fail_writes: false,
            })),
        }
    }

    /// Returns a copy of the stored bytes.
    #[must_use]
    pub fn data(&self) -> Vec<u8> {
        self.state.lock().data.clone()
    }

    /// Makes every subsequent write fail until reset.
    pub fn set_fail_writes(&self, fail: bool) {
        self.state.lock().fail_writes = fail;
    }

    fn check_writable(state: &MemoryState) -> QueueResult<()> {
        if state.fail_writes {
            Err(QueueError::Unavailable("memory journal is read-only".into()))
        } else {
            Ok(())
        }
    }
}

impl JournalBackend for MemoryJournal {
    fn read_all(&mut self) -> QueueResult<Vec<u8>> {
        Ok(self.data())
    }

    fn append(&mut self, bytes: &[u8]) -> QueueResult<()> {
        let mut state = self.state.lock();
        Self::check_writable(&state)?;
        state.data.extend_from_slice(bytes);
        Ok(())
    }

    fn sync(&mut self) -> QueueResult<()> {
        Self::check_writable(&self.state.lock())
    }

    fn len(&self) -> QueueResult<u64> {
        Ok(self.state.lock().data.len() as u64)
    }

    fn truncate(&mut self, len: u64) -> QueueResult<()> {
        let mut state = self.state.lock();
        Self::check_writable(&state)?;
        let len = usize::try_from(len).unwrap_or(usize::MAX);
        if len > state.data.len() {
            return Err(QueueError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("cannot truncate to {} bytes, journal has {}", len, state.data.len()),
            )));
        }
        state.data.truncate(len);
        Ok(())
    }

    fn replace(&mut self, bytes: &[u8]) -> QueueResult<()> {
        let mut state = self.state.lock();
        Self::check_writable(&state)?;
        state.data = bytes.to_vec();
        Ok(())
    }
}
