//! Filesystem abstraction for the log sink.
//!
//! Every open, stat, rename and unlink performed by the rotation protocol goes
//! through [`Filesystem`], so the protocol can be driven against
//! [`MockFilesystem`] in tests, including failures a real disk only produces
//! under duress (out of space, rename of an in-use file).

use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use thiserror::Error;

/// Errors from filesystem operations.
#[derive(Debug, Error)]
pub enum FsError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl FsError {
    /// True when the error means the path does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, FsError::Io(e) if e.kind() == io::ErrorKind::NotFound)
    }
}

/// Result of a stat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub len: u64,
}

/// An open, append-mode handle to a log file.
pub trait LogHandle: Write + Send {
    /// Stat the file this handle refers to (not the path it was opened by).
    fn stat(&self) -> Result<FileStat, FsError>;
}

/// Trait for filesystem operations.
/// Abstracted for testing with mock implementations.
pub trait Filesystem: Send + Sync {
    type Handle: LogHandle;

    /// Open a file for appending, creating it if it doesn't exist.
    fn open_append(&self, path: &Path) -> Result<Self::Handle, FsError>;

    /// Open a file for appending after truncating it to zero length.
    fn open_truncate(&self, path: &Path) -> Result<Self::Handle, FsError>;

    /// Stat a path. Returns `Ok(None)` if nothing exists there.
    fn stat(&self, path: &Path) -> Result<Option<FileStat>, FsError>;

    /// Whether `path` currently names the physical file `handle` has open.
    /// `Ok(false)` if nothing exists at `path`.
    fn is_same_file(&self, handle: &Self::Handle, path: &Path) -> Result<bool, FsError>;

    /// Rename a file. Callers must not rely on `to` being replaced if it
    /// already exists; that is not portable.
    fn rename(&self, from: &Path, to: &Path) -> Result<(), FsError>;

    /// Remove a file.
    fn remove(&self, path: &Path) -> Result<(), FsError>;

    /// Truncate an existing file to zero length in place.
    fn truncate(&self, path: &Path) -> Result<(), FsError>;

    /// Check if a path exists.
    fn exists(&self, path: &Path) -> bool;

    /// Create directory and parents if needed.
    fn create_dir_all(&self, path: &Path) -> Result<(), FsError>;
}

/// Real filesystem implementation.
#[derive(Debug, Default, Clone, Copy)]
pub struct RealFilesystem;

/// Append-mode handle on the real filesystem.
///
/// Carries the file's identity (device and inode on Unix, volume serial and
/// file index on Windows) via `same-file`. On other platforms identity is
/// unavailable and every check reports the file as replaced, so the sink
/// reopens before each record.
#[derive(Debug)]
pub struct RealHandle {
    file: same_file::Handle,
}

impl RealHandle {
    fn new(file: File) -> Result<Self, FsError> {
        Ok(Self {
            file: same_file::Handle::from_file(file)?,
        })
    }
}

impl Write for RealHandle {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.as_file_mut().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.as_file_mut().flush()
    }
}

impl LogHandle for RealHandle {
    fn stat(&self) -> Result<FileStat, FsError> {
        let meta = self.file.as_file().metadata()?;
        Ok(FileStat { len: meta.len() })
    }
}

impl Filesystem for RealFilesystem {
    type Handle = RealHandle;

    fn open_append(&self, path: &Path) -> Result<RealHandle, FsError> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        RealHandle::new(file)
    }

    fn open_truncate(&self, path: &Path) -> Result<RealHandle, FsError> {
        // O_APPEND keeps writes at the end even if a peer writes concurrently
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        file.set_len(0)?;
        RealHandle::new(file)
    }

    fn stat(&self, path: &Path) -> Result<Option<FileStat>, FsError> {
        match fs::metadata(path) {
            Ok(meta) => Ok(Some(FileStat { len: meta.len() })),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn is_same_file(&self, handle: &RealHandle, path: &Path) -> Result<bool, FsError> {
        match same_file::Handle::from_path(path) {
            Ok(on_disk) => Ok(on_disk == handle.file),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<(), FsError> {
        fs::rename(from, to)?;
        Ok(())
    }

    fn remove(&self, path: &Path) -> Result<(), FsError> {
        fs::remove_file(path)?;
        Ok(())
    }

    fn truncate(&self, path: &Path) -> Result<(), FsError> {
        let file = OpenOptions::new().write(true).open(path)?;
        file.set_len(0)?;
        Ok(())
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn create_dir_all(&self, path: &Path) -> Result<(), FsError> {
        fs::create_dir_all(path)?;
        Ok(())
    }
}

#[derive(Debug)]
struct MockFile {
    data: Vec<u8>,
}

type SharedFile = Arc<RwLock<MockFile>>;

#[derive(Debug, Default)]
struct MockTree {
    files: HashMap<PathBuf, SharedFile>,
    dirs: HashSet<PathBuf>,
}

impl MockTree {
    fn create(&mut self, path: &Path) -> SharedFile {
        let file = Arc::new(RwLock::new(MockFile { data: Vec::new() }));
        self.files.insert(path.to_path_buf(), Arc::clone(&file));
        file
    }
}

#[derive(Debug, Default)]
struct MockFaults {
    fail_writes: AtomicBool,
    deny_rename_while_open: AtomicBool,
    fail_rename_from: RwLock<HashSet<PathBuf>>,
}

/// Mock filesystem for testing.
/// Cloning creates a new handle to the same underlying data, so two sinks
/// holding clones behave like two processes sharing one disk.
///
/// File identity survives renames, and handles keep referring to
/// the file they opened after it is renamed or removed, as on POSIX. Unlike
/// POSIX, renaming onto an existing path fails with `AlreadyExists`.
#[derive(Debug, Clone, Default)]
pub struct MockFilesystem {
    tree: Arc<RwLock<MockTree>>,
    faults: Arc<MockFaults>,
}

/// Handle into a [`MockFilesystem`] file.
#[derive(Debug)]
pub struct MockHandle {
    file: SharedFile,
    faults: Arc<MockFaults>,
}

impl Write for MockHandle {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.faults.fail_writes.load(Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::StorageFull,
                "no space left on device",
            ));
        }
        self.file.write().unwrap().data.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl LogHandle for MockHandle {
    fn stat(&self) -> Result<FileStat, FsError> {
        Ok(mock_stat(&self.file))
    }
}

fn mock_stat(file: &SharedFile) -> FileStat {
    FileStat {
        len: file.read().unwrap().data.len() as u64,
    }
}

fn not_found(path: &Path) -> FsError {
    FsError::Io(io::Error::new(
        io::ErrorKind::NotFound,
        format!("file not found: {}", path.display()),
    ))
}

impl MockFilesystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get content of a specific file.
    pub fn get_file(&self, path: &Path) -> Option<Vec<u8>> {
        let tree = self.tree.read().unwrap();
        tree.files.get(path).map(|f| f.read().unwrap().data.clone())
    }

    /// Add a file directly (for test setup).
    pub fn add_file(&self, path: PathBuf, data: Vec<u8>) {
        let mut tree = self.tree.write().unwrap();
        let file = tree.create(&path);
        file.write().unwrap().data = data;
    }

    /// All paths that currently hold a file, sorted.
    pub fn paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self.tree.read().unwrap().files.keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Number of open handles on the file at `path`.
    pub fn open_handles(&self, path: &Path) -> usize {
        let tree = self.tree.read().unwrap();
        // The tree itself holds one reference.
        tree.files
            .get(path)
            .map_or(0, |f| Arc::strong_count(f) - 1)
    }

    /// Make every write through any handle fail as if the disk were full.
    pub fn set_fail_writes(&self, fail: bool) {
        self.faults.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Refuse to rename a file while any handle on it is open, as Windows
    /// does.
    pub fn set_deny_rename_while_open(&self, deny: bool) {
        self.faults.deny_rename_while_open.store(deny, Ordering::SeqCst);
    }

    /// Make renames whose source is `path` fail with a permission error.
    pub fn fail_rename_from(&self, path: impl Into<PathBuf>) {
        self.faults.fail_rename_from.write().unwrap().insert(path.into());
    }

    /// Clear every injected fault.
    pub fn clear_faults(&self) {
        self.set_fail_writes(false);
        self.set_deny_rename_while_open(false);
        self.faults.fail_rename_from.write().unwrap().clear();
    }

    fn handle(&self, file: SharedFile) -> MockHandle {
        MockHandle {
            file,
            faults: Arc::clone(&self.faults),
        }
    }
}

impl Filesystem for MockFilesystem {
    type Handle = MockHandle;

    fn open_append(&self, path: &Path) -> Result<MockHandle, FsError> {
        let mut tree = self.tree.write().unwrap();
        let existing = tree.files.get(path).cloned();
        let file = match existing {
            Some(file) => file,
            None => tree.create(path),
        };
        Ok(self.handle(file))
    }

    fn open_truncate(&self, path: &Path) -> Result<MockHandle, FsError> {
        let handle = self.open_append(path)?;
        handle.file.write().unwrap().data.clear();
        Ok(handle)
    }

    fn stat(&self, path: &Path) -> Result<Option<FileStat>, FsError> {
        let tree = self.tree.read().unwrap();
        Ok(tree.files.get(path).map(mock_stat))
    }

    fn is_same_file(&self, handle: &MockHandle, path: &Path) -> Result<bool, FsError> {
        let tree = self.tree.read().unwrap();
        Ok(tree
            .files
            .get(path)
            .is_some_and(|file| Arc::ptr_eq(file, &handle.file)))
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<(), FsError> {
        if self.faults.fail_rename_from.read().unwrap().contains(from) {
            return Err(FsError::Io(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("permission denied: {}", from.display()),
            )));
        }

        let mut tree = self.tree.write().unwrap();
        let Some(file) = tree.files.get(from) else {
            return Err(not_found(from));
        };
        if self.faults.deny_rename_while_open.load(Ordering::SeqCst)
            && Arc::strong_count(file) > 1
        {
            return Err(FsError::Io(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("file is in use by another handle: {}", from.display()),
            )));
        }
        if tree.files.contains_key(to) {
            return Err(FsError::Io(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("destination exists: {}", to.display()),
            )));
        }

        if let Some(file) = tree.files.remove(from) {
            tree.files.insert(to.to_path_buf(), file);
        }
        Ok(())
    }

    fn remove(&self, path: &Path) -> Result<(), FsError> {
        match self.tree.write().unwrap().files.remove(path) {
            Some(_) => Ok(()),
            None => Err(not_found(path)),
        }
    }

    fn truncate(&self, path: &Path) -> Result<(), FsError> {
        let tree = self.tree.read().unwrap();
        match tree.files.get(path) {
            Some(file) => {
                file.write().unwrap().data.clear();
                Ok(())
            }
            None => Err(not_found(path)),
        }
    }

    fn exists(&self, path: &Path) -> bool {
        let tree = self.tree.read().unwrap();
        tree.files.contains_key(path) || tree.dirs.contains(path)
    }

    fn create_dir_all(&self, path: &Path) -> Result<(), FsError> {
        self.tree.write().unwrap().dirs.insert(path.to_path_buf());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    // ===========================================
    // MockFilesystem
    // ===========================================

    #[test]
    fn test_mock_open_append_creates_file() {
        let fs = MockFilesystem::new();
        let path = PathBuf::from("/logs/app.log");

        let mut handle = fs.open_append(&path).expect("open");
        handle.write_all(b"one\n").expect("write");

        assert!(fs.exists(&path));
        assert_eq!(fs.get_file(&path), Some(b"one\n".to_vec()));
    }

    #[test]
    fn test_mock_open_append_shares_existing_file() {
        let fs = MockFilesystem::new();
        let path = PathBuf::from("/logs/app.log");

        let mut a = fs.open_append(&path).unwrap();
        let mut b = fs.open_append(&path).unwrap();
        a.write_all(b"a").unwrap();
        b.write_all(b"b").unwrap();

        assert_eq!(fs.get_file(&path), Some(b"ab".to_vec()));
        assert!(fs.is_same_file(&a, &path).unwrap());
        assert!(fs.is_same_file(&b, &path).unwrap());
    }

    #[test]
    fn test_mock_open_truncate_clears() {
        let fs = MockFilesystem::new();
        let path = PathBuf::from("/logs/app.log");
        fs.add_file(path.clone(), b"old".to_vec());

        let _handle = fs.open_truncate(&path).unwrap();

        assert_eq!(fs.get_file(&path), Some(Vec::new()));
    }

    #[test]
    fn test_mock_stat_missing_is_none() {
        let fs = MockFilesystem::new();
        assert_eq!(fs.stat(Path::new("/nope")).unwrap(), None);
    }

    #[test]
    fn test_mock_rename_keeps_identity() {
        let fs = MockFilesystem::new();
        let from = PathBuf::from("/logs/app.log");
        let to = PathBuf::from("/logs/app.log.1");
        let handle = fs.open_append(&from).unwrap();

        fs.rename(&from, &to).unwrap();

        assert!(!fs.exists(&from));
        assert!(fs.is_same_file(&handle, &to).unwrap());
        assert!(!fs.is_same_file(&handle, &from).unwrap());
        // A fresh file at the old path is a different file.
        let fresh = fs.open_append(&from).unwrap();
        assert!(!fs.is_same_file(&handle, &from).unwrap());
        assert!(fs.is_same_file(&fresh, &from).unwrap());
    }

    #[test]
    fn test_mock_rename_onto_existing_fails() {
        let fs = MockFilesystem::new();
        fs.add_file(PathBuf::from("/a"), vec![]);
        fs.add_file(PathBuf::from("/b"), vec![]);

        let err = fs.rename(Path::new("/a"), Path::new("/b")).unwrap_err();
        assert!(matches!(err, FsError::Io(ref e) if e.kind() == io::ErrorKind::AlreadyExists));
    }

    #[test]
    fn test_mock_rename_missing_is_not_found() {
        let fs = MockFilesystem::new();
        let err = fs.rename(Path::new("/a"), Path::new("/b")).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_mock_handle_survives_remove() {
        let fs = MockFilesystem::new();
        let path = PathBuf::from("/logs/app.log");
        let mut handle = fs.open_append(&path).unwrap();

        fs.remove(&path).unwrap();
        handle.write_all(b"orphan").unwrap();

        assert!(!fs.exists(&path));
        assert_eq!(handle.stat().unwrap().len, 6);
    }

    #[test]
    fn test_mock_fail_writes() {
        let fs = MockFilesystem::new();
        let path = PathBuf::from("/logs/app.log");
        let mut handle = fs.open_append(&path).unwrap();

        fs.set_fail_writes(true);
        let err = handle.write_all(b"lost").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::StorageFull);

        fs.clear_faults();
        handle.write_all(b"kept").unwrap();
        assert_eq!(fs.get_file(&path), Some(b"kept".to_vec()));
    }

    #[test]
    fn test_mock_deny_rename_while_open() {
        let fs = MockFilesystem::new();
        let path = PathBuf::from("/logs/app.log");
        fs.set_deny_rename_while_open(true);

        let handle = fs.open_append(&path).unwrap();
        assert_eq!(fs.open_handles(&path), 1);
        assert!(fs.rename(&path, Path::new("/logs/app.log.1")).is_err());

        drop(handle);
        assert_eq!(fs.open_handles(&path), 0);
        fs.rename(&path, Path::new("/logs/app.log.1")).unwrap();
    }

    #[test]
    fn test_mock_fail_rename_from() {
        let fs = MockFilesystem::new();
        fs.add_file(PathBuf::from("/a"), vec![]);
        fs.fail_rename_from("/a");

        let err = fs.rename(Path::new("/a"), Path::new("/b")).unwrap_err();
        assert!(matches!(err, FsError::Io(ref e) if e.kind() == io::ErrorKind::PermissionDenied));
        assert!(fs.exists(Path::new("/a")));
    }

    #[test]
    fn test_mock_truncate_missing() {
        let fs = MockFilesystem::new();
        assert!(fs.truncate(Path::new("/a")).unwrap_err().is_not_found());
    }

    #[test]
    fn test_mock_paths_sorted() {
        let fs = MockFilesystem::new();
        fs.add_file(PathBuf::from("/b"), vec![]);
        fs.add_file(PathBuf::from("/a"), vec![]);
        assert_eq!(fs.paths(), vec![PathBuf::from("/a"), PathBuf::from("/b")]);
    }

    // ===========================================
    // RealFilesystem
    // ===========================================

    #[test]
    fn test_real_append_and_stat() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("app.log");
        let fs = RealFilesystem;

        let mut handle = fs.open_append(&path).unwrap();
        handle.write_all(b"hello\n").unwrap();
        handle.flush().unwrap();

        let by_path = fs.stat(&path).unwrap().expect("exists");
        let by_handle = handle.stat().unwrap();
        assert_eq!(by_path, by_handle);
        assert_eq!(by_path.len, 6);
    }

    #[test]
    fn test_real_stat_missing_is_none() {
        let dir = tempdir().unwrap();
        assert_eq!(RealFilesystem.stat(&dir.path().join("nope")).unwrap(), None);
    }

    #[test]
    fn test_real_identity_changes_after_rotation() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("app.log");
        let rotated = dir.path().join("app.log.1");
        let fs = RealFilesystem;

        let handle = fs.open_append(&path).unwrap();
        assert!(fs.is_same_file(&handle, &path).unwrap());

        fs.rename(&path, &rotated).unwrap();
        assert!(!fs.is_same_file(&handle, &path).unwrap());

        let fresh = fs.open_append(&path).unwrap();
        assert!(fs.is_same_file(&handle, &rotated).unwrap());
        assert!(!fs.is_same_file(&handle, &path).unwrap());
        assert!(fs.is_same_file(&fresh, &path).unwrap());
    }

    #[test]
    fn test_real_identity_ignores_timestamps() {
        // A replacement created under the old name, even with the old file's
        // timestamps copied over, is still a different file.
        let dir = tempdir().unwrap();
        let path = dir.path().join("app.log");
        let fs = RealFilesystem;

        let handle = fs.open_append(&path).unwrap();
        let modified = fs::metadata(&path).unwrap().modified().unwrap();
        fs.rename(&path, &dir.path().join("app.log.1")).unwrap();
        let fresh = fs.open_append(&path).unwrap();
        File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(modified)
            .unwrap();

        assert!(!fs.is_same_file(&handle, &path).unwrap());
        assert!(fs.is_same_file(&fresh, &path).unwrap());
    }

    #[test]
    fn test_real_truncate_and_open_truncate() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("app.log");
        fs::write(&path, b"0123456789").unwrap();
        let real = RealFilesystem;

        real.truncate(&path).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"");

        fs::write(&path, b"again").unwrap();
        let mut handle = real.open_truncate(&path).unwrap();
        handle.write_all(b"new").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"new");
    }

    #[test]
    fn test_real_remove_missing_is_not_found() {
        let dir = tempdir().unwrap();
        let err = RealFilesystem.remove(&dir.path().join("nope")).unwrap_err();
        assert!(err.is_not_found());
    }
}
