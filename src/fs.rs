//! The filesystem abstraction (§4.C): a `FileSystem` trait with a real-disk
//! implementation and a read-only ROM implementation, plus path
//! normalization shared by both.

use crate::error::{ErrorKind, MprError, Result};
use crate::sync::MprMutex;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

/// An open file reference returned by [`FileSystem::open`], opaque to the
/// caller beyond being usable with `seek`/`close` on the same provider.
pub type FileHandle = u64;

/// Where a [`FileSystem::seek`] offset is measured from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekWhence {
    Start,
    Current,
    End,
}

/// Which access a [`FileSystem::access`] check is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessMode {
    pub read: bool,
    pub write: bool,
}

impl AccessMode {
    pub const READ: AccessMode = AccessMode { read: true, write: false };
    pub const WRITE: AccessMode = AccessMode { read: false, write: true };
}

fn bad_handle() -> MprError {
    MprError::new(ErrorKind::BadHandle, "invalid file handle")
}

/// Normalizes a path: collapses `.` components, resolves `..` without
/// escaping the root, and converts to the platform separator. Case
/// sensitivity is left to the underlying OS; this function only handles
/// structure, not casing (§4.C).
pub fn normalize(path: &str) -> PathBuf {
    let input = Path::new(path);
    let mut out = PathBuf::new();
    for component in input.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                // Never pop past the root: an excess `..` is dropped rather
                // than allowed to escape (§4.C's root-escape prevention).
                if !matches!(out.components().last(), Some(Component::RootDir) | None) {
                    out.pop();
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

/// The process's starting working directory, captured once at first use to
/// avoid a TOCTOU race against a later `chdir` (§4.C).
fn start_dir() -> &'static PathBuf {
    static START_DIR: OnceLock<PathBuf> = OnceLock::new();
    START_DIR.get_or_init(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
}

/// Resolves a possibly-relative path against the captured start directory
/// rather than the live (and potentially since-changed) current directory.
pub fn resolve(path: &str) -> PathBuf {
    let normalized = normalize(path);
    if normalized.is_absolute() {
        normalized
    } else {
        start_dir().join(normalized)
    }
}

/// File metadata as the runtime needs it.
#[derive(Debug, Clone, Copy)]
pub struct FileInfo {
    pub size: u64,
    pub is_dir: bool,
    pub modified_unix: i64,
}

/// A source of file content and metadata. [`DiskFileSystem`] reads/writes the
/// real filesystem; [`RomFileSystem`] serves an in-memory read-only image
/// (embedded content with no disk dependency, per §4.C).
pub trait FileSystem: Send + Sync {
    fn read(&self, path: &str) -> Result<Vec<u8>>;
    fn write(&self, path: &str, data: &[u8]) -> Result<()>;
    fn stat(&self, path: &str) -> Result<FileInfo>;
    fn exists(&self, path: &str) -> bool;
    fn remove(&self, path: &str) -> Result<()>;
    fn is_read_only(&self) -> bool;

    /// Opens `path` for handle-based `seek`, returning an opaque
    /// [`FileHandle`]. `write` requests a writable handle, creating the file
    /// if it doesn't exist.
    fn open(&self, path: &str, write: bool) -> Result<FileHandle>;
    fn close(&self, handle: FileHandle) -> Result<()>;
    fn seek(&self, handle: FileHandle, offset: i64, whence: SeekWhence) -> Result<u64>;
    /// Checks whether `path` permits the given access without opening it.
    fn access(&self, path: &str, mode: AccessMode) -> bool;
    fn mkdir(&self, path: &str) -> Result<()>;
    fn make_link(&self, target: &str, link: &str, symbolic: bool) -> Result<()>;
    fn readlink(&self, path: &str) -> Result<String>;
}

pub struct DiskFileSystem {
    handles: MprMutex<HashMap<FileHandle, std::fs::File>>,
    next_handle: AtomicU64,
}

impl Default for DiskFileSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl DiskFileSystem {
    pub fn new() -> Self {
        DiskFileSystem { handles: MprMutex::new(HashMap::new()), next_handle: AtomicU64::new(1) }
    }
}

impl FileSystem for DiskFileSystem {
    fn read(&self, path: &str) -> Result<Vec<u8>> {
        let resolved = resolve(path);
        let mut file = std::fs::File::open(&resolved).map_err(|e| MprError::from_io(ErrorKind::Io, e))?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).map_err(|e| MprError::from_io(ErrorKind::Io, e))?;
        Ok(buf)
    }

    fn write(&self, path: &str, data: &[u8]) -> Result<()> {
        let resolved = resolve(path);
        let mut file = std::fs::File::create(&resolved).map_err(|e| MprError::from_io(ErrorKind::Io, e))?;
        file.write_all(data).map_err(|e| MprError::from_io(ErrorKind::Io, e))
    }

    fn stat(&self, path: &str) -> Result<FileInfo> {
        let resolved = resolve(path);
        let meta = std::fs::metadata(&resolved).map_err(|e| MprError::from_io(ErrorKind::Io, e))?;
        let modified_unix = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        Ok(FileInfo { size: meta.len(), is_dir: meta.is_dir(), modified_unix })
    }

    fn exists(&self, path: &str) -> bool {
        resolve(path).exists()
    }

    fn remove(&self, path: &str) -> Result<()> {
        std::fs::remove_file(resolve(path)).map_err(|e| MprError::from_io(ErrorKind::Io, e))
    }

    fn is_read_only(&self) -> bool {
        false
    }

    fn open(&self, path: &str, write: bool) -> Result<FileHandle> {
        let resolved = resolve(path);
        let file = if write {
            std::fs::OpenOptions::new().create(true).write(true).open(&resolved)
        } else {
            std::fs::File::open(&resolved)
        }
        .map_err(|e| MprError::from_io(ErrorKind::Io, e))?;
        let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.handles.lock().map(|h| h.insert(id, file));
        Ok(id)
    }

    fn close(&self, handle: FileHandle) -> Result<()> {
        self.handles.lock().map(|h| h.remove(&handle)).ok_or_else(bad_handle)?;
        Ok(())
    }

    fn seek(&self, handle: FileHandle, offset: i64, whence: SeekWhence) -> Result<u64> {
        use std::io::{Seek, SeekFrom};
        let from = match whence {
            SeekWhence::Start => SeekFrom::Start(offset as u64),
            SeekWhence::Current => SeekFrom::Current(offset),
            SeekWhence::End => SeekFrom::End(offset),
        };
        self.handles.lock().map(|h| {
            let file = h.get_mut(&handle).ok_or_else(bad_handle)?;
            file.seek(from).map_err(|e| MprError::from_io(ErrorKind::Io, e))
        })
    }

    fn access(&self, path: &str, mode: AccessMode) -> bool {
        let resolved = resolve(path);
        match std::fs::metadata(&resolved) {
            Ok(meta) => !(mode.write && meta.permissions().readonly()),
            Err(_) => false,
        }
    }

    fn mkdir(&self, path: &str) -> Result<()> {
        std::fs::create_dir_all(resolve(path)).map_err(|e| MprError::from_io(ErrorKind::Io, e))
    }

    fn make_link(&self, target: &str, link: &str, symbolic: bool) -> Result<()> {
        let target = resolve(target);
        let link = resolve(link);
        #[cfg(unix)]
        {
            if symbolic {
                std::os::unix::fs::symlink(&target, &link).map_err(|e| MprError::from_io(ErrorKind::Io, e))
            } else {
                std::fs::hard_link(&target, &link).map_err(|e| MprError::from_io(ErrorKind::Io, e))
            }
        }
        #[cfg(not(unix))]
        {
            let _ = symbolic;
            std::fs::hard_link(&target, &link).map_err(|e| MprError::from_io(ErrorKind::Io, e))
        }
    }

    fn readlink(&self, path: &str) -> Result<String> {
        std::fs::read_link(resolve(path))
            .map_err(|e| MprError::from_io(ErrorKind::Io, e))
            .map(|p| p.to_string_lossy().into_owned())
    }
}

/// An in-memory, read-only filesystem image — the "ROM" provider for
/// embedded deployments that ship their content compiled into the binary
/// rather than on a writable disk (§4.C).
pub struct RomFileSystem {
    files: HashMap<String, &'static [u8]>,
    /// Read cursors for handles opened via `open`/`seek`/`close`, keyed the
    /// same way `DiskFileSystem` keys its open `std::fs::File`s.
    cursors: MprMutex<HashMap<FileHandle, (&'static [u8], u64)>>,
    next_handle: AtomicU64,
}

impl RomFileSystem {
    pub fn new(files: impl IntoIterator<Item = (&'static str, &'static [u8])>) -> Self {
        RomFileSystem {
            files: files.into_iter().map(|(k, v)| (normalize(k).to_string_lossy().into_owned(), v)).collect(),
            cursors: MprMutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
        }
    }

    fn lookup(&self, path: &str) -> Result<&'static [u8]> {
        let key = normalize(path).to_string_lossy().into_owned();
        self.files.get(key.as_str()).copied().ok_or_else(|| {
            MprError::new(ErrorKind::Io, format!("no such file in ROM image: {path}"))
        })
    }
}

impl FileSystem for RomFileSystem {
    fn read(&self, path: &str) -> Result<Vec<u8>> {
        self.lookup(path).map(|bytes| bytes.to_vec())
    }

    fn write(&self, _path: &str, _data: &[u8]) -> Result<()> {
        Err(MprError::new(ErrorKind::ReadOnly, "ROM filesystem is read-only"))
    }

    fn stat(&self, path: &str) -> Result<FileInfo> {
        self.lookup(path).map(|bytes| FileInfo { size: bytes.len() as u64, is_dir: false, modified_unix: 0 })
    }

    fn exists(&self, path: &str) -> bool {
        self.lookup(path).is_ok()
    }

    fn remove(&self, _path: &str) -> Result<()> {
        Err(MprError::new(ErrorKind::ReadOnly, "ROM filesystem is read-only"))
    }

    fn is_read_only(&self) -> bool {
        true
    }

    fn open(&self, path: &str, write: bool) -> Result<FileHandle> {
        if write {
            return Err(MprError::new(ErrorKind::ReadOnly, "ROM filesystem is read-only"));
        }
        let bytes = self.lookup(path)?;
        let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.cursors.lock().map(|c| c.insert(id, (bytes, 0)));
        Ok(id)
    }

    fn close(&self, handle: FileHandle) -> Result<()> {
        self.cursors.lock().map(|c| c.remove(&handle)).ok_or_else(bad_handle)?;
        Ok(())
    }

    fn seek(&self, handle: FileHandle, offset: i64, whence: SeekWhence) -> Result<u64> {
        self.cursors.lock().map(|c| {
            let (bytes, pos) = c.get_mut(&handle).ok_or_else(bad_handle)?;
            let base = match whence {
                SeekWhence::Start => 0i64,
                SeekWhence::Current => *pos as i64,
                SeekWhence::End => bytes.len() as i64,
            };
            let new_pos = base + offset;
            if new_pos < 0 {
                return Err(MprError::new(ErrorKind::BadArgument, "seek before start of file"));
            }
            *pos = new_pos as u64;
            Ok(*pos)
        })
    }

    fn access(&self, path: &str, mode: AccessMode) -> bool {
        if mode.write {
            return false;
        }
        self.lookup(path).is_ok()
    }

    fn mkdir(&self, _path: &str) -> Result<()> {
        Err(MprError::new(ErrorKind::ReadOnly, "ROM filesystem is read-only"))
    }

    fn make_link(&self, _target: &str, _link: &str, _symbolic: bool) -> Result<()> {
        Err(MprError::new(ErrorKind::Unsupported, "ROM filesystem has no link support"))
    }

    fn readlink(&self, _path: &str) -> Result<String> {
        Err(MprError::new(ErrorKind::Unsupported, "ROM filesystem has no link support"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_collapses_dot_and_dotdot() {
        assert_eq!(normalize("a/./b/../c"), PathBuf::from("a/c"));
        assert_eq!(normalize("../../etc/passwd"), PathBuf::from("etc/passwd"));
    }

    #[test]
    fn normalize_keeps_absolute_root() {
        assert_eq!(normalize("/a/../../b"), PathBuf::from("/b"));
    }

    #[test]
    fn rom_filesystem_is_read_only() {
        let rom = RomFileSystem::new([("index.html", b"<html/>".as_slice())]);
        assert!(rom.exists("index.html"));
        assert_eq!(rom.read("index.html").unwrap(), b"<html/>");
        assert!(rom.write("index.html", b"x").is_err());
    }

    #[test]
    fn disk_filesystem_round_trip() {
        let dir = std::env::temp_dir().join(format!("mpr-fs-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("greeting.txt");
        let fs = DiskFileSystem::new();
        fs.write(path.to_str().unwrap(), b"hello").unwrap();
        assert_eq!(fs.read(path.to_str().unwrap()).unwrap(), b"hello");
        assert!(fs.stat(path.to_str().unwrap()).unwrap().size == 5);
        fs.remove(path.to_str().unwrap()).unwrap();
        let _ = std::fs::remove_dir(&dir);
    }

    #[test]
    fn disk_filesystem_open_seek_close_and_links() {
        let dir = std::env::temp_dir().join(format!("mpr-fs-handle-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("data.bin");
        let fs = DiskFileSystem::new();
        fs.write(path.to_str().unwrap(), b"0123456789").unwrap();

        let handle = fs.open(path.to_str().unwrap(), false).unwrap();
        let pos = fs.seek(handle, 4, SeekWhence::Start).unwrap();
        assert_eq!(pos, 4);
        fs.close(handle).unwrap();
        assert!(fs.seek(handle, 0, SeekWhence::Current).is_err(), "seeking a closed handle should fail");

        assert!(fs.access(path.to_str().unwrap(), AccessMode::READ));

        let link_path = dir.join("data.lnk");
        fs.make_link(path.to_str().unwrap(), link_path.to_str().unwrap(), true).unwrap();
        let target = fs.readlink(link_path.to_str().unwrap()).unwrap();
        assert!(target.ends_with("data.bin"));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn rom_filesystem_open_seek_and_rejects_mutation() {
        let rom = RomFileSystem::new([("data.bin", b"hello world".as_slice())]);
        let handle = rom.open("data.bin", false).unwrap();
        assert_eq!(rom.seek(handle, 6, SeekWhence::Start).unwrap(), 6);
        rom.close(handle).unwrap();

        assert!(rom.open("data.bin", true).is_err());
        assert!(rom.mkdir("newdir").is_err());
        assert!(rom.make_link("data.bin", "alias.bin", true).is_err());
        assert!(rom.readlink("data.bin").is_err());
        assert!(!rom.access("data.bin", AccessMode::WRITE));
        assert!(rom.access("data.bin", AccessMode::READ));
    }
}
