//! Storage collaborators: where transfer content and the journal live.
//!
//! File content is staged next to its final location and published by an
//! atomic rename, so readers only ever see a complete file. Both `finalize`
//! and `discard` are idempotent: after a restart the journal replay may call
//! them for work that already (partly) happened.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage full")]
    Full,
    #[error("invalid path: {0:?}")]
    InvalidPath(String),
    #[error("no staged write for {0:?}")]
    NotOpen(String),
    #[error("storage i/o: {0}")]
    Io(std::io::Error),
    /// The file is in place but its directory entry may not be durable yet.
    #[error("{0:?} published, directory sync failed: {1}")]
    Unsynced(String, std::io::Error),
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        if e.raw_os_error() == Some(libc::ENOSPC) {
            StorageError::Full
        } else {
            StorageError::Io(e)
        }
    }
}

/// Accept only plain relative paths: no root, no `..`, no `.`, no NUL.
pub fn validate_path(path: &str) -> Result<PathBuf, StorageError> {
    let invalid = || StorageError::InvalidPath(path.to_string());
    if path.is_empty() || path.contains('\0') {
        return Err(invalid());
    }
    let parsed = Path::new(path);
    if !parsed
        .components()
        .all(|c| matches!(c, Component::Normal(_)))
    {
        return Err(invalid());
    }
    Ok(parsed.to_path_buf())
}

/// Destination for transfer content, keyed by relative path.
pub trait Storage {
    /// Start a staged write of `size` bytes, replacing any earlier stage.
    fn open_write(&mut self, path: &str, size: u32) -> Result<(), StorageError>;

    fn write_at(&mut self, path: &str, offset: u32, data: &[u8]) -> Result<(), StorageError>;

    /// Make staged content durable without publishing it.
    fn flush(&mut self, path: &str) -> Result<(), StorageError>;

    /// Publish the staged content atomically. Succeeds if already published.
    fn finalize(&mut self, path: &str) -> Result<(), StorageError>;

    /// Drop staged content. Succeeds if there is nothing staged.
    fn discard(&mut self, path: &str) -> Result<(), StorageError>;
}

// ── Filesystem ────────────────────────────────────────────────────────────────

const STAGE_SUFFIX: &str = ".part";

pub struct FsStorage {
    root: PathBuf,
    open: HashMap<String, File>,
}

impl FsStorage {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            open: HashMap::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn final_path(&self, path: &str) -> Result<PathBuf, StorageError> {
        Ok(self.root.join(validate_path(path)?))
    }

    fn stage_path(&self, path: &str) -> Result<PathBuf, StorageError> {
        let mut staged = self.final_path(path)?.into_os_string();
        staged.push(STAGE_SUFFIX);
        Ok(PathBuf::from(staged))
    }

    fn handle(&mut self, path: &str) -> Result<&mut File, StorageError> {
        if !self.open.contains_key(path) {
            // Reopen an existing stage (resume in the same process).
            let staged = self.stage_path(path)?;
            let file = OpenOptions::new()
                .write(true)
                .open(&staged)
                .map_err(|_| StorageError::NotOpen(path.to_string()))?;
            self.open.insert(path.to_string(), file);
        }
        self.open
            .get_mut(path)
            .ok_or_else(|| StorageError::NotOpen(path.to_string()))
    }

    /// Bytes free on the filesystem holding the storage root.
    pub fn free_bytes(&self) -> Result<u64, StorageError> {
        free_bytes(&self.root)
    }
}

/// Free space available to unprivileged writers, via statvfs.
pub fn free_bytes(path: &Path) -> Result<u64, StorageError> {
    use std::os::unix::ffi::OsStrExt;

    let c_path = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|_| StorageError::InvalidPath(path.display().to_string()))?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    // Safety: c_path is NUL-terminated and stat is a valid out-pointer.
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(stat.f_bavail as u64 * stat.f_frsize as u64)
}

fn sync_dir(dir: &Path) -> std::io::Result<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

impl Storage for FsStorage {
    fn open_write(&mut self, path: &str, size: u32) -> Result<(), StorageError> {
        let staged = self.stage_path(path)?;
        if let Some(parent) = staged.parent() {
            fs::create_dir_all(parent)?;
        }
        if let Ok(free) = self.free_bytes() {
            if free < size as u64 {
                return Err(StorageError::Full);
            }
        }
        let file = File::create(&staged)?;
        tracing::debug!(path, staged = %staged.display(), size, "staged write opened");
        self.open.insert(path.to_string(), file);
        Ok(())
    }

    fn write_at(&mut self, path: &str, offset: u32, data: &[u8]) -> Result<(), StorageError> {
        let file = self.handle(path)?;
        file.seek(SeekFrom::Start(offset as u64))?;
        file.write_all(data)?;
        Ok(())
    }

    fn flush(&mut self, path: &str) -> Result<(), StorageError> {
        self.handle(path)?.sync_all()?;
        Ok(())
    }

    fn finalize(&mut self, path: &str) -> Result<(), StorageError> {
        let staged = self.stage_path(path)?;
        let target = self.final_path(path)?;

        if let Some(file) = self.open.remove(path) {
            file.sync_all()?;
        }
        if !staged.exists() {
            if target.exists() {
                // Published before a restart; replay is finishing the job.
                return Ok(());
            }
            return Err(StorageError::NotOpen(path.to_string()));
        }

        File::open(&staged)?.sync_all()?;
        fs::rename(&staged, &target)?;
        tracing::info!(path, target = %target.display(), "file published");
        if let Some(parent) = target.parent() {
            sync_dir(parent).map_err(|e| StorageError::Unsynced(path.to_string(), e))?;
        }
        Ok(())
    }

    fn discard(&mut self, path: &str) -> Result<(), StorageError> {
        self.open.remove(path);
        let staged = self.stage_path(path)?;
        match fs::remove_file(&staged) {
            Ok(()) => {
                tracing::info!(path, "staged write discarded");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// ── In-memory ─────────────────────────────────────────────────────────────────

#[derive(Default)]
struct MemFiles {
    staged: HashMap<String, Vec<u8>>,
    published: HashMap<String, Vec<u8>>,
    capacity: Option<usize>,
    fail_io: bool,
    fail_dir_sync: bool,
}

impl MemFiles {
    fn used(&self) -> usize {
        self.staged.values().chain(self.published.values()).map(Vec::len).sum()
    }
}

/// Storage held in memory. Clones share the same files, so a test can keep
/// a handle while the transfer machine owns another.
#[derive(Clone, Default)]
pub struct MemStorage {
    inner: Arc<Mutex<MemFiles>>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Limit total bytes held; writes past it fail with `Full`.
    pub fn with_capacity(capacity: usize) -> Self {
        let storage = Self::default();
        storage.lock().capacity = Some(capacity);
        storage
    }

    /// Make every subsequent operation fail with an I/O error.
    pub fn set_failing(&self, failing: bool) {
        self.lock().fail_io = failing;
    }

    /// Make `finalize` publish and then report `Unsynced`.
    pub fn set_dir_sync_failing(&self, failing: bool) {
        self.lock().fail_dir_sync = failing;
    }

    pub fn published(&self, path: &str) -> Option<Vec<u8>> {
        self.lock().published.get(path).cloned()
    }

    pub fn staged(&self, path: &str) -> Option<Vec<u8>> {
        self.lock().staged.get(path).cloned()
    }

    pub fn staged_count(&self) -> usize {
        self.lock().staged.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemFiles> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check(files: &MemFiles) -> Result<(), StorageError> {
        if files.fail_io {
            return Err(StorageError::Io(std::io::Error::other("injected failure")));
        }
        Ok(())
    }
}

impl Storage for MemStorage {
    fn open_write(&mut self, path: &str, _size: u32) -> Result<(), StorageError> {
        validate_path(path)?;
        let mut files = self.lock();
        Self::check(&files)?;
        files.staged.insert(path.to_string(), Vec::new());
        Ok(())
    }

    fn write_at(&mut self, path: &str, offset: u32, data: &[u8]) -> Result<(), StorageError> {
        let mut files = self.lock();
        Self::check(&files)?;
        let offset = offset as usize;
        let current = files
            .staged
            .get(path)
            .map(Vec::len)
            .ok_or_else(|| StorageError::NotOpen(path.to_string()))?;
        let end = offset + data.len();
        let growth = end.saturating_sub(current);
        if let Some(cap) = files.capacity {
            if files.used() + growth > cap {
                return Err(StorageError::Full);
            }
        }
        let buf = files
            .staged
            .get_mut(path)
            .ok_or_else(|| StorageError::NotOpen(path.to_string()))?;
        if buf.len() < end {
            buf.resize(end, 0);
        }
        buf[offset..end].copy_from_slice(data);
        Ok(())
    }

    fn flush(&mut self, path: &str) -> Result<(), StorageError> {
        let files = self.lock();
        Self::check(&files)?;
        if !files.staged.contains_key(path) {
            return Err(StorageError::NotOpen(path.to_string()));
        }
        Ok(())
    }

    fn finalize(&mut self, path: &str) -> Result<(), StorageError> {
        let mut files = self.lock();
        Self::check(&files)?;
        match files.staged.remove(path) {
            Some(content) => {
                files.published.insert(path.to_string(), content);
                if files.fail_dir_sync {
                    return Err(StorageError::Unsynced(
                        path.to_string(),
                        std::io::Error::other("injected directory sync failure"),
                    ));
                }
                Ok(())
            }
            None if files.published.contains_key(path) => Ok(()),
            None => Err(StorageError::NotOpen(path.to_string())),
        }
    }

    fn discard(&mut self, path: &str) -> Result<(), StorageError> {
        let mut files = self.lock();
        Self::check(&files)?;
        files.staged.remove(path);
        Ok(())
    }
}

// ── Journal stores ────────────────────────────────────────────────────────────

/// Durable byte log backing the transfer journal.
pub trait JournalStore {
    /// Append `record`; it must be durable when this returns Ok. A failed
    /// append leaves the log as it was.
    fn append(&mut self, record: &[u8]) -> Result<(), StorageError>;

    fn read_all(&mut self) -> Result<Vec<u8>, StorageError>;

    fn truncate(&mut self) -> Result<(), StorageError>;
}

pub struct FileJournalStore {
    path: PathBuf,
    file: File,
    len: u64,
}

impl FileJournalStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let len = file.metadata()?.len();
        Ok(Self { path, file, len })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl JournalStore for FileJournalStore {
    fn append(&mut self, record: &[u8]) -> Result<(), StorageError> {
        let result = self
            .file
            .seek(SeekFrom::Start(self.len))
            .and_then(|_| self.file.write_all(record))
            .and_then(|_| self.file.sync_data());
        match result {
            Ok(()) => {
                self.len += record.len() as u64;
                Ok(())
            }
            Err(e) => {
                // Cut off whatever part of the record made it to disk.
                if let Err(undo) = self.file.set_len(self.len) {
                    tracing::warn!(error = %undo, "failed to trim partial journal record");
                }
                Err(e.into())
            }
        }
    }

    fn read_all(&mut self) -> Result<Vec<u8>, StorageError> {
        let mut bytes = Vec::with_capacity(self.len as usize);
        self.file.seek(SeekFrom::Start(0))?;
        self.file.read_to_end(&mut bytes)?;
        self.len = bytes.len() as u64;
        Ok(bytes)
    }

    fn truncate(&mut self) -> Result<(), StorageError> {
        self.file.set_len(0)?;
        self.file.sync_all()?;
        self.len = 0;
        Ok(())
    }
}

#[derive(Default)]
struct MemLog {
    bytes: Vec<u8>,
    capacity: Option<usize>,
}

/// In-memory journal log, shared between clones like [`MemStorage`].
#[derive(Clone, Default)]
pub struct MemJournalStore {
    inner: Arc<Mutex<MemLog>>,
}

impl MemJournalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let store = Self::default();
        store.lock().capacity = Some(capacity);
        store
    }

    /// Raw log contents.
    pub fn raw(&self) -> Vec<u8> {
        self.lock().bytes.clone()
    }

    /// Replace the raw log contents (simulate a torn write).
    pub fn set_bytes(&self, bytes: Vec<u8>) {
        self.lock().bytes = bytes;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemLog> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl JournalStore for MemJournalStore {
    fn append(&mut self, record: &[u8]) -> Result<(), StorageError> {
        let mut log = self.lock();
        if let Some(cap) = log.capacity {
            if log.bytes.len() + record.len() > cap {
                return Err(StorageError::Full);
            }
        }
        log.bytes.extend_from_slice(record);
        Ok(())
    }

    fn read_all(&mut self) -> Result<Vec<u8>, StorageError> {
        Ok(self.raw())
    }

    fn truncate(&mut self) -> Result<(), StorageError> {
        self.lock().bytes.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_validation() {
        assert!(validate_path("audio/clip.wav").is_ok());
        assert!(validate_path("config.json").is_ok());
        for bad in ["", "/etc/passwd", "../escape", "a/../../b", "./x", "a\0b"] {
            assert!(
                matches!(validate_path(bad), Err(StorageError::InvalidPath(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn fs_storage_stages_then_publishes() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = FsStorage::new(dir.path()).unwrap();

        storage.open_write("sounds/beep.raw", 10).unwrap();
        storage.write_at("sounds/beep.raw", 0, b"hello").unwrap();
        storage.write_at("sounds/beep.raw", 5, b"world").unwrap();
        assert!(dir.path().join("sounds/beep.raw.part").exists());
        assert!(!dir.path().join("sounds/beep.raw").exists());

        storage.flush("sounds/beep.raw").unwrap();
        storage.finalize("sounds/beep.raw").unwrap();
        assert_eq!(
            fs::read(dir.path().join("sounds/beep.raw")).unwrap(),
            b"helloworld"
        );
        assert!(!dir.path().join("sounds/beep.raw.part").exists());

        // Replay after a restart finalizes again; already published is fine.
        let mut reopened = FsStorage::new(dir.path()).unwrap();
        reopened.finalize("sounds/beep.raw").unwrap();
    }

    #[test]
    fn fs_storage_discard_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = FsStorage::new(dir.path()).unwrap();
        storage.open_write("a.bin", 3).unwrap();
        storage.write_at("a.bin", 0, b"abc").unwrap();
        storage.discard("a.bin").unwrap();
        assert!(!dir.path().join("a.bin.part").exists());
        storage.discard("a.bin").unwrap();
        assert!(matches!(
            storage.finalize("a.bin"),
            Err(StorageError::NotOpen(_))
        ));
    }

    #[test]
    fn fs_storage_reopens_stage_for_resume() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = FsStorage::new(dir.path()).unwrap();
        storage.open_write("r.bin", 4).unwrap();
        storage.write_at("r.bin", 0, b"ab").unwrap();
        storage.open.clear();
        storage.write_at("r.bin", 2, b"cd").unwrap();
        storage.finalize("r.bin").unwrap();
        assert_eq!(fs::read(dir.path().join("r.bin")).unwrap(), b"abcd");
    }

    #[test]
    fn fs_storage_reports_free_space() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsStorage::new(dir.path()).unwrap();
        assert!(storage.free_bytes().unwrap() > 0);
    }

    #[test]
    fn mem_storage_capacity_and_failures() {
        let mut storage = MemStorage::with_capacity(4);
        storage.open_write("x", 8).unwrap();
        storage.write_at("x", 0, b"1234").unwrap();
        assert!(matches!(
            storage.write_at("x", 4, b"5"),
            Err(StorageError::Full)
        ));
        // Overwriting within the existing length needs no new space.
        storage.write_at("x", 0, b"ab").unwrap();
        assert_eq!(storage.staged("x").unwrap(), b"ab34");

        storage.set_failing(true);
        assert!(matches!(storage.finalize("x"), Err(StorageError::Io(_))));
        storage.set_failing(false);
        storage.finalize("x").unwrap();
        assert_eq!(storage.published("x").unwrap(), b"ab34");
        assert_eq!(storage.staged_count(), 0);
    }

    #[test]
    fn file_journal_appends_and_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("j").join("journal.bin");
        let mut store = FileJournalStore::open(&path).unwrap();
        store.append(b"one").unwrap();
        store.append(b"two").unwrap();
        assert_eq!(store.read_all().unwrap(), b"onetwo");

        // Survives reopening.
        let mut reopened = FileJournalStore::open(&path).unwrap();
        assert_eq!(reopened.read_all().unwrap(), b"onetwo");
        reopened.append(b"3").unwrap();
        assert_eq!(reopened.read_all().unwrap(), b"onetwo3");

        reopened.truncate().unwrap();
        assert!(reopened.read_all().unwrap().is_empty());
        assert_eq!(fs::metadata(&path).unwrap().len(), 0);
    }

    #[test]
    fn mem_journal_capacity() {
        let mut store = MemJournalStore::with_capacity(5);
        store.append(b"abc").unwrap();
        assert!(matches!(store.append(b"def"), Err(StorageError::Full)));
        assert_eq!(store.raw(), b"abc");
    }

    #[test]
    fn enospc_maps_to_full() {
        let e = std::io::Error::from_raw_os_error(libc::ENOSPC);
        assert!(matches!(StorageError::from(e), StorageError::Full));
        let e = std::io::Error::from_raw_os_error(libc::EIO);
        assert!(matches!(StorageError::from(e), StorageError::Io(_)));
    }
}
