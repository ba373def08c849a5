//! Virtual filesystem core: file nodes, handles, and the open-mode
//! selector.

pub mod dir;
pub mod file;
pub mod read;
pub mod read_write;
pub mod write;

use std::fmt;
use std::fs::OpenOptions;
use std::io::SeekFrom;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::cache::Cache;
use crate::config::Options;
use crate::remote::ObjectStore;
use crate::{Result, VfsError};

use dir::Dir;
use file::File;
use read::ReadFileHandle;
use read_write::RwFileHandle;
use write::WriteFileHandle;

/// Shared context for one mounted remote: configuration, backend and cache.
pub struct Vfs {
    opt: Options,
    remote: Arc<dyn ObjectStore>,
    cache: Cache,
}

impl Vfs {
    pub fn new(remote: Arc<dyn ObjectStore>, opt: Options) -> Result<Arc<Vfs>> {
        let cache = Cache::new(remote.clone(), opt.resolve_cache_dir())?;
        Ok(Arc::new(Vfs { opt, remote, cache }))
    }

    pub fn opt(&self) -> &Options {
        &self.opt
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    pub fn remote(&self) -> &Arc<dyn ObjectStore> {
        &self.remote
    }

    /// A fresh root directory node for this VFS.
    pub fn root(self: &Arc<Self>) -> Arc<Dir> {
        Dir::root(self)
    }
}

static NEXT_INODE: AtomicU64 = AtomicU64::new(1);

// Inode numbers are process-unique and never reused.
pub(crate) fn new_inode() -> u64 {
    NEXT_INODE.fetch_add(1, Ordering::Relaxed)
}

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_handle_id() -> u64 {
    NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed)
}

/// Join a directory path and a leaf name. The root directory is the empty
/// string, so logical paths never start with a separator.
pub(crate) fn join_path(dir: &str, leaf: &str) -> String {
    if dir.is_empty() {
        leaf.to_string()
    } else {
        format!("{dir}/{leaf}")
    }
}

/// Open flags as passed by a front-end, kept as the raw libc bits.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct OpenFlags(pub i32);

impl OpenFlags {
    pub const RDONLY: OpenFlags = OpenFlags(libc::O_RDONLY);
    pub const WRONLY: OpenFlags = OpenFlags(libc::O_WRONLY);
    pub const RDWR: OpenFlags = OpenFlags(libc::O_RDWR);

    pub fn access(self) -> i32 {
        self.0 & libc::O_ACCMODE
    }

    pub fn is_read_only(self) -> bool {
        self.access() == libc::O_RDONLY
    }

    pub fn is_write_only(self) -> bool {
        self.access() == libc::O_WRONLY
    }

    pub fn append(self) -> bool {
        self.0 & libc::O_APPEND != 0
    }

    pub fn create(self) -> bool {
        self.0 & libc::O_CREAT != 0
    }

    pub fn excl(self) -> bool {
        self.0 & libc::O_EXCL != 0
    }

    pub fn trunc(self) -> bool {
        self.0 & libc::O_TRUNC != 0
    }

    pub fn sync(self) -> bool {
        self.0 & libc::O_SYNC != 0
    }

    pub fn with(self, bits: i32) -> OpenFlags {
        OpenFlags(self.0 | bits)
    }

    pub fn without(self, bits: i32) -> OpenFlags {
        OpenFlags(self.0 & !bits)
    }

    // Translate to OpenOptions for opening the cache copy. Creating or
    // truncating the copy needs write access on the descriptor even when
    // the handle itself is read-only; the handle layer still refuses
    // mismatched reads and writes with EBADF.
    pub(crate) fn open_options(self, perms: u32) -> OpenOptions {
        let mut opts = OpenOptions::new();
        opts.read(self.access() != libc::O_WRONLY);
        opts.write(self.access() != libc::O_RDONLY || self.create() || self.trunc());
        opts.append(self.append());
        opts.truncate(self.trunc());
        opts.create(self.create());
        if self.create() && self.excl() {
            opts.create_new(true);
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            opts.mode(perms);
        }
        #[cfg(not(unix))]
        let _ = perms;
        opts
    }
}

impl fmt::Display for OpenFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::from(match self.access() {
            libc::O_RDONLY => "O_RDONLY",
            libc::O_WRONLY => "O_WRONLY",
            libc::O_RDWR => "O_RDWR",
            _ => "O_?",
        });
        for (bit, name) in [
            (libc::O_APPEND, "O_APPEND"),
            (libc::O_CREAT, "O_CREAT"),
            (libc::O_EXCL, "O_EXCL"),
            (libc::O_SYNC, "O_SYNC"),
            (libc::O_TRUNC, "O_TRUNC"),
        ] {
            if self.0 & bit != 0 {
                out.push('|');
                out.push_str(name);
            }
        }
        f.write_str(&out)
    }
}

impl fmt::Debug for OpenFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// One open handle on a file, produced by the open-mode selector.
#[derive(Clone)]
pub enum Handle {
    // Debug is implemented manually below (the underlying handle types
    // don't derive it).
    /// Cache-backed read/write handle.
    Rw(Arc<RwFileHandle>),
    /// Streaming read-only handle.
    Read(Arc<ReadFileHandle>),
    /// Buffered write-only handle.
    Write(Arc<WriteFileHandle>),
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Handle::Rw(_) => f.write_str("Handle::Rw"),
            Handle::Read(_) => f.write_str("Handle::Read"),
            Handle::Write(_) => f.write_str("Handle::Write"),
        }
    }
}

impl Handle {
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        match self {
            Handle::Rw(h) => h.read(buf),
            Handle::Read(h) => h.read(buf),
            Handle::Write(h) => h.read(buf),
        }
    }

    pub fn read_at(&self, buf: &mut [u8], offset: i64) -> Result<usize> {
        match self {
            Handle::Rw(h) => h.read_at(buf, offset),
            Handle::Read(h) => h.read_at(buf, offset),
            Handle::Write(h) => h.read_at(buf, offset),
        }
    }

    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        match self {
            Handle::Rw(h) => h.write(buf),
            Handle::Read(h) => h.write(buf),
            Handle::Write(h) => h.write(buf),
        }
    }

    pub fn write_at(&self, buf: &[u8], offset: i64) -> Result<usize> {
        match self {
            Handle::Rw(h) => h.write_at(buf, offset),
            Handle::Read(h) => h.write_at(buf, offset),
            Handle::Write(h) => h.write_at(buf, offset),
        }
    }

    pub fn seek(&self, pos: SeekFrom) -> Result<i64> {
        match self {
            Handle::Rw(h) => h.seek(pos),
            Handle::Read(h) => h.seek(pos),
            Handle::Write(h) => h.seek(pos),
        }
    }

    pub fn truncate(&self, size: i64) -> Result<()> {
        match self {
            Handle::Rw(h) => h.truncate(size),
            Handle::Read(h) => h.truncate(size),
            Handle::Write(h) => h.truncate(size),
        }
    }

    pub fn sync(&self) -> Result<()> {
        match self {
            Handle::Rw(h) => h.sync(),
            Handle::Read(h) => h.sync(),
            Handle::Write(h) => h.sync(),
        }
    }

    pub fn flush(&self) -> Result<()> {
        match self {
            Handle::Rw(h) => h.flush(),
            Handle::Read(h) => h.flush(),
            Handle::Write(h) => h.flush(),
        }
    }

    pub fn close(&self) -> Result<()> {
        match self {
            Handle::Rw(h) => h.close(),
            Handle::Read(h) => h.close(),
            Handle::Write(h) => h.close(),
        }
    }

    pub fn release(&self) -> Result<()> {
        match self {
            Handle::Rw(h) => h.release(),
            Handle::Read(h) => h.release(),
            Handle::Write(h) => h.release(),
        }
    }

    pub fn size(&self) -> i64 {
        match self {
            Handle::Rw(h) => h.size(),
            Handle::Read(h) => h.size(),
            Handle::Write(h) => h.size(),
        }
    }

    /// The file node this handle is open on.
    pub fn node(&self) -> Arc<File> {
        match self {
            Handle::Rw(h) => h.file().clone(),
            Handle::Read(h) => h.file().clone(),
            Handle::Write(h) => h.file().clone(),
        }
    }

    // Directory-only and ownership operations are not supported on file
    // handles.

    pub fn chdir(&self) -> Result<()> {
        Err(VfsError::NotSupported)
    }

    pub fn chmod(&self, _mode: u32) -> Result<()> {
        Err(VfsError::NotSupported)
    }

    pub fn chown(&self, _uid: u32, _gid: u32) -> Result<()> {
        Err(VfsError::NotSupported)
    }

    pub fn readdir(&self) -> Result<Vec<String>> {
        Err(VfsError::NotSupported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_path() {
        assert_eq!(join_path("", "a.txt"), "a.txt");
        assert_eq!(join_path("sub", "a.txt"), "sub/a.txt");
        assert_eq!(join_path("sub/deep", "a.txt"), "sub/deep/a.txt");
    }

    #[test]
    fn test_open_flags_decode() {
        let flags = OpenFlags(libc::O_RDWR | libc::O_CREAT | libc::O_TRUNC);
        assert_eq!(flags.access(), libc::O_RDWR);
        assert!(flags.create());
        assert!(flags.trunc());
        assert!(!flags.append());
        assert_eq!(flags.to_string(), "O_RDWR|O_CREAT|O_TRUNC");

        let stripped = flags.without(libc::O_CREAT);
        assert!(!stripped.create());
        assert!(stripped.trunc());
    }

    #[test]
    fn test_open_flags_access_modes() {
        assert!(OpenFlags::RDONLY.is_read_only());
        assert!(OpenFlags::WRONLY.is_write_only());
        assert!(!OpenFlags::RDWR.is_read_only());
        assert!(!OpenFlags::RDWR.is_write_only());
        assert_eq!(OpenFlags::RDONLY.to_string(), "O_RDONLY");
    }
}
