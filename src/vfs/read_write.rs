//! Cache-backed read/write file handles.
//!
//! An RW handle works against a local cached copy of the remote object. The
//! copy is materialized lazily on first I/O, all reads and writes hit the
//! local file, and a modified copy is uploaded whole when the last writer
//! closes. The cache copy is left in place when a close fails so the data
//! can be recovered.

use std::fs;
use std::io::{self, SeekFrom};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error};

use crate::{Result, VfsError};

use super::dir::Dir;
use super::file::{File, WriterHandle};
use super::{next_handle_id, OpenFlags};

#[cfg(unix)]
fn pread(fd: &fs::File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    fd.read_at(buf, offset)
}

#[cfg(unix)]
fn pwrite(fd: &fs::File, buf: &[u8], offset: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    fd.write_at(buf, offset)
}

#[cfg(windows)]
fn pread(fd: &fs::File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;
    fd.seek_read(buf, offset)
}

#[cfg(windows)]
fn pwrite(fd: &fs::File, buf: &[u8], offset: u64) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;
    fd.seek_write(buf, offset)
}

pub struct RwFileHandle {
    id: u64,
    file: Arc<File>,
    dir: Arc<Dir>,
    flags: OpenFlags,
    state: Mutex<RwState>,
}

struct RwState {
    fd: Option<fs::File>,
    /// Stream position for sequential read and write.
    offset: i64,
    /// The cached copy has been materialized and the OS handle obtained.
    opened: bool,
    closed: bool,
    /// Some write operation ran on this handle.
    write_called: bool,
    /// The contents changed some way other than a plain write: a truncate,
    /// or creating a file that did not exist.
    changed: bool,
}

impl RwFileHandle {
    pub(crate) fn new(dir: Arc<Dir>, file: Arc<File>, flags: OpenFlags) -> Result<Arc<RwFileHandle>> {
        if flags.create() && flags.excl() && file.exists() {
            return Err(VfsError::AlreadyExists);
        }

        let path = file.path();

        // mark the file open in the cache; must happen before the mkdir
        dir.vfs().cache().open(&path);
        if let Err(e) = dir.vfs().cache().mkdir(&path) {
            dir.vfs().cache().close(&path);
            return Err(e.context("open RW handle failed to make cache directory"));
        }

        let fh = Arc::new(RwFileHandle {
            id: next_handle_id(),
            file: file.clone(),
            dir,
            flags,
            state: Mutex::new(RwState {
                fd: None,
                offset: 0,
                opened: false,
                closed: false,
                write_called: false,
                changed: false,
            }),
        });

        if !flags.is_read_only() {
            file.add_writer(fh.id, WriterHandle::Rw(Arc::downgrade(&fh)));
        }

        // truncate or create files immediately to prepare the cache copy
        if flags.trunc() || (flags.create() && !file.exists()) {
            let mut st = fh.state.lock();
            if let Err(e) = fh.open_pending(&mut st, false) {
                drop(st);
                if !flags.is_read_only() {
                    file.del_writer(fh.id, false);
                    file.finish_writer_close();
                }
                fh.dir.vfs().cache().close(&path);
                return Err(e);
            }
        }

        Ok(fh)
    }

    pub fn file(&self) -> &Arc<File> {
        &self.file
    }

    // Materialize unless already done. Call with the handle state locked
    // but without the file's writeback lock.
    fn open_pending(&self, st: &mut RwState, truncate: bool) -> Result<()> {
        if st.opened {
            return Ok(());
        }
        let _rw = self.file.rw_guard();
        self.do_open_pending(st, truncate)
    }

    // Body of materialization: prepare the cached copy according to the
    // open flags and obtain the OS-level handle. Call with the handle state
    // locked and the file's writeback lock held.
    fn do_open_pending(&self, st: &mut RwState, truncate: bool) -> Result<()> {
        if st.opened {
            return Ok(());
        }

        let o = self.file.get_object();
        let path = self.file.path();
        let cache = self.dir.vfs().cache();
        let os_path = cache.to_os_path(&path);
        let perms = self.dir.vfs().opt().file_perms;
        let mut cache_open_flags = self.flags;

        if !self.flags.trunc() && !truncate {
            // a cached copy only needs validating against the remote when
            // no other RW handle has it open
            if let Some(o) = &o {
                if self.file.rw_opens() == 0 {
                    cache
                        .check(o, &path)
                        .map_err(|e| e.context("open RW handle failed to check cache file"))?;
                }
            }

            // try to open an existing cache file; leaving O_CREAT out
            // distinguishes presence
            match cache_open_flags
                .without(libc::O_CREAT)
                .open_options(perms)
                .open(&os_path)
            {
                Ok(fd) => {
                    debug!(path = %path, flags = %self.flags, "opened existing cached copy");
                    st.fd = Some(fd);
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    // no cached copy; fetch one when there is an object to
                    // fetch it from
                    let mut content: Result<()> = Err(VfsError::Io(e));
                    if let Some(o) = &o {
                        content = match cache.fetch(o, &path) {
                            Ok(()) => Ok(()),
                            Err(fe) if fe.is_not_found() => Err(fe),
                            Err(fe) => {
                                return Err(fe.context("open RW handle failed to cache file"))
                            }
                        };
                    }
                    if let Err(e) = content {
                        if self.flags.create() {
                            // the object wasn't found but we are about to
                            // create the file
                            self.file.set_size(0);
                            st.changed = true;
                        } else {
                            return Err(e.context("open RW handle failed to cache file"));
                        }
                    }
                }
                Err(e) => return Err(VfsError::Io(e).context("cache open file failed")),
            }
        } else {
            // truncating: the copy starts empty and must be written back
            self.file.set_size(0);
            st.changed = true;
            if !self.flags.create() && self.file.exists() {
                // produce the observable truncated state before the open
                fs::write(&os_path, b"").map_err(|e| {
                    VfsError::Io(e).context("cache open failed to create zero length file")
                })?;
            }
            // O_TRUNC combined with O_APPEND is refused by the open layer;
            // strip the truncate bit and empty any existing copy by hand
            if self.flags.append() {
                cache_open_flags = cache_open_flags.without(libc::O_TRUNC);
                if os_path.is_file() {
                    let fd = fs::OpenOptions::new()
                        .write(true)
                        .open(&os_path)
                        .map_err(VfsError::Io)?;
                    fd.set_len(0)
                        .map_err(|e| VfsError::Io(e).context("cache open failed to truncate"))?;
                }
            }
        }

        if st.fd.is_none() {
            debug!(path = %path, flags = %cache_open_flags, "opening cached copy");
            let fd = cache_open_flags
                .open_options(perms)
                .open(&os_path)
                .map_err(|e| VfsError::Io(e).context("cache open file failed"))?;
            st.fd = Some(fd);
        }
        st.opened = true;
        self.file.add_rw_open();
        // make sure the parent directory lists this file now
        self.dir.add_object(&self.file);
        Ok(())
    }

    fn size_locked(&self, st: &RwState) -> i64 {
        if !st.opened {
            return self.file.size();
        }
        match st.fd.as_ref().and_then(|fd| fd.metadata().ok()) {
            Some(meta) => meta.len() as i64,
            None => 0,
        }
    }

    /// Size of the underlying file.
    pub fn size(&self) -> i64 {
        let st = self.state.lock();
        self.size_locked(&st)
    }

    fn read_at_locked(&self, st: &mut RwState, buf: &mut [u8], offset: i64) -> Result<usize> {
        if st.closed {
            return Err(VfsError::HandleClosed);
        }
        if self.flags.is_write_only() {
            return Err(VfsError::BadFileDescriptor);
        }
        self.open_pending(st, false)?;
        let fd = st.fd.as_ref().ok_or(VfsError::BadFileDescriptor)?;
        Ok(pread(fd, buf, offset as u64)?)
    }

    /// Read at an explicit offset, leaving the stream position alone.
    pub fn read_at(&self, buf: &mut [u8], offset: i64) -> Result<usize> {
        let mut st = self.state.lock();
        self.read_at_locked(&mut st, buf, offset)
    }

    /// Read from the stream position and advance it.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut st = self.state.lock();
        let offset = st.offset;
        let n = self.read_at_locked(&mut st, buf, offset)?;
        st.offset += n as i64;
        Ok(n)
    }

    fn write_at_locked(&self, st: &mut RwState, buf: &[u8], offset: i64) -> Result<usize> {
        if st.closed {
            return Err(VfsError::HandleClosed);
        }
        if self.flags.is_read_only() {
            return Err(VfsError::BadFileDescriptor);
        }
        self.open_pending(st, false)?;
        st.write_called = true;

        let fd = st.fd.as_ref().ok_or(VfsError::BadFileDescriptor)?;
        let n = if self.flags.append() {
            // an append-mode descriptor picks the end of file itself, and
            // an explicit offset would contradict it
            let mut w: &fs::File = fd;
            io::Write::write(&mut w, buf)?
        } else {
            pwrite(fd, buf, offset as u64)?
        };

        let meta = fd
            .metadata()
            .map_err(|e| VfsError::Io(e).context("failed to stat cache file"))?;
        self.file.set_size(meta.len() as i64);
        Ok(n)
    }

    /// Write at an explicit offset. In append mode the offset is ignored
    /// and the data goes to the end of file.
    pub fn write_at(&self, buf: &[u8], offset: i64) -> Result<usize> {
        let mut st = self.state.lock();
        self.write_at_locked(&mut st, buf, offset)
    }

    /// Write at the stream position and advance it.
    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        let mut st = self.state.lock();
        let offset = st.offset;
        let n = self.write_at_locked(&mut st, buf, offset)?;
        st.offset += n as i64;
        Ok(n)
    }

    /// Move the stream position. No bounds check; the next read or write
    /// surfaces past-end behavior.
    pub fn seek(&self, pos: SeekFrom) -> Result<i64> {
        let mut st = self.state.lock();
        if st.closed {
            return Err(VfsError::HandleClosed);
        }
        // seek-to-zero on a fresh handle is common; don't materialize for it
        if !st.opened {
            if let SeekFrom::Start(0) | SeekFrom::Current(0) = pos {
                return Ok(0);
            }
        }
        self.open_pending(&mut st, false)?;
        let new_offset = match pos {
            SeekFrom::Start(n) => n as i64,
            SeekFrom::Current(n) => st.offset + n,
            SeekFrom::End(n) => self.size_locked(&st) + n,
        };
        st.offset = new_offset;
        Ok(new_offset)
    }

    /// Truncate the cached copy to `size`.
    pub fn truncate(&self, size: i64) -> Result<()> {
        let mut st = self.state.lock();
        if st.closed {
            return Err(VfsError::HandleClosed);
        }
        self.open_pending(&mut st, size == 0)?;
        st.changed = true;
        self.file.set_size(size);
        let fd = st.fd.as_ref().ok_or(VfsError::BadFileDescriptor)?;
        fd.set_len(size as u64)?;
        Ok(())
    }

    /// Commit the cached copy to disk. A no-op before materialization or on
    /// read-only handles.
    pub fn sync(&self) -> Result<()> {
        let st = self.state.lock();
        if st.closed {
            return Err(VfsError::HandleClosed);
        }
        if !st.opened || self.flags.is_read_only() {
            return Ok(());
        }
        if let Some(fd) = st.fd.as_ref() {
            fd.sync_all()?;
        }
        Ok(())
    }

    // Whether the cache copy needs writing back.
    fn modified(&self, st: &RwState) -> bool {
        if !st.write_called && !st.changed {
            debug!(path = %self.file.path(), "not modified so not transferring");
            return false;
        }
        true
    }

    // Write back the cache copy if this handle turns out to be the last
    // modifying writer. Call with the handle state locked and the file's
    // writeback lock held.
    fn flush_writes(&self, st: &mut RwState, close_file: bool) -> Result<()> {
        if st.closed && !close_file {
            return Ok(());
        }

        let writer = !self.flags.is_read_only();
        if !st.opened && !writer {
            return Ok(());
        }

        let mut is_copied = false;
        if writer {
            is_copied = self.file.del_writer(self.id, self.modified(st));
        }
        let res = self.transfer(st, close_file, writer, is_copied);
        if writer {
            self.file.finish_writer_close();
        }
        res
    }

    fn transfer(&self, st: &mut RwState, close_file: bool, writer: bool, is_copied: bool) -> Result<()> {
        // a create or truncate handle that saw no I/O still has to produce
        // its (empty) file
        if self.flags.create() || self.flags.trunc() {
            self.do_open_pending(st, false)?;
        }

        if writer && st.opened {
            match st.fd.as_ref().map(|fd| fd.metadata()) {
                Some(Ok(meta)) => self.file.set_size(meta.len() as i64),
                Some(Err(e)) => {
                    error!(path = %self.file.path(), error = %e, "failed to stat cache file")
                }
                None => {}
            }
        }

        if st.opened && close_file {
            let fd = st.fd.take();
            if writer {
                if let Some(fd) = &fd {
                    // surface close-time errors before the transfer; the
                    // cache file survives for recovery
                    fd.sync_all()
                        .map_err(|e| VfsError::Io(e).context("failed to close cache file"))?;
                }
            }
        }

        if is_copied {
            let path = self.file.path();
            let o = self.dir.vfs().cache().store(&path).map_err(|e| {
                error!(path = %path, error = %e, "failed to transfer file to remote");
                e
            })?;
            debug!(path = %path, "transferred to remote");
            self.file.set_object(o);
        }
        Ok(())
    }

    // Close with the handle state locked.
    fn close_locked(&self, st: &mut RwState) -> Result<()> {
        let _rw = self.file.rw_guard();
        if st.closed {
            return Err(VfsError::HandleClosed);
        }
        st.closed = true;
        let res = self.flush_writes(st, true);
        if st.opened {
            self.file.del_rw_open();
        }
        // drop the cache refcount even when the writeback failed
        self.dir.vfs().cache().close(&self.file.path());
        res
    }

    /// Close the handle, writing back a modified copy. A second close
    /// returns `HandleClosed`.
    pub fn close(&self) -> Result<()> {
        let mut st = self.state.lock();
        self.close_locked(&mut st)
    }

    /// Flush written data to the remote without closing the handle. Called
    /// freely by front-ends, so unopened, unwritten and closed handles are
    /// all no-ops.
    pub fn flush(&self) -> Result<()> {
        let mut st = self.state.lock();
        if !st.opened {
            debug!(path = %self.file.path(), "flush ignored on unopened handle");
            return Ok(());
        }
        if st.closed {
            debug!(path = %self.file.path(), "flush on closed handle, nothing to do");
            return Ok(());
        }
        if !st.write_called {
            debug!(path = %self.file.path(), "flush ignored on unwritten handle");
            return Ok(());
        }
        let _rw = self.file.rw_guard();
        let res = self.flush_writes(&mut st, false);
        if let Err(e) = &res {
            error!(path = %self.file.path(), error = %e, "flush failed");
        }
        res
    }

    /// Idempotent close for protocol layers that ignore the result.
    pub fn release(&self) -> Result<()> {
        let mut st = self.state.lock();
        if st.closed {
            debug!(path = %self.file.path(), "release: nothing to do");
            return Ok(());
        }
        debug!(path = %self.file.path(), "release closing file");
        let res = self.close_locked(&mut st);
        if let Err(e) = &res {
            error!(path = %self.file.path(), error = %e, "release failed");
        }
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheMode, Options};
    use crate::remote::memory::MemoryStore;
    use crate::remote::ObjectStore;
    use crate::vfs::{Handle, Vfs};
    use std::io::SeekFrom;
    use std::thread;
    use std::time::{Duration, SystemTime, UNIX_EPOCH};
    use tempfile::tempdir;

    fn mtime(secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(secs)
    }

    fn new_vfs(mode: CacheMode) -> (Arc<MemoryStore>, Arc<Dir>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let opt = Options {
            cache_mode: mode,
            cache_dir: Some(dir.path().join("cache")),
            ..Options::default()
        };
        let vfs = Vfs::new(store.clone(), opt).unwrap();
        (store, vfs.root(), dir)
    }

    fn flags(bits: i32) -> OpenFlags {
        OpenFlags(bits)
    }

    #[test]
    fn test_create_on_open_stores_once() {
        let (store, root, _tmp) = new_vfs(CacheMode::Writes);
        let file = root.create("a.txt").unwrap();

        let fh = file.open(flags(libc::O_WRONLY | libc::O_CREAT)).unwrap();
        assert_eq!(fh.write(b"abc").unwrap(), 3);
        assert_eq!(store.put_count(), 0);
        fh.close().unwrap();

        assert_eq!(store.put_count(), 1);
        assert_eq!(store.contents("a.txt").unwrap(), b"abc");
        assert!(file.exists());
        assert_eq!(file.size(), 3);
        assert!(root.contains("a.txt"));
    }

    #[test]
    fn test_exclusive_create_on_existing_fails() {
        let (store, root, _tmp) = new_vfs(CacheMode::Writes);
        store.insert("a.txt", b"already here", mtime(1));
        let file = root.lookup("a.txt").unwrap();

        let err = file
            .open(flags(libc::O_WRONLY | libc::O_CREAT | libc::O_EXCL))
            .unwrap_err();
        assert!(matches!(err.kind(), VfsError::AlreadyExists));
        assert_eq!(root.vfs().cache().opens("a.txt"), 0);
    }

    #[test]
    fn test_truncate_on_open() {
        let (store, root, _tmp) = new_vfs(CacheMode::Writes);
        store.insert("big.bin", &[7u8; 100], mtime(1));
        let file = root.lookup("big.bin").unwrap();
        assert_eq!(file.size(), 100);

        let fh = file.open(flags(libc::O_RDWR | libc::O_TRUNC)).unwrap();
        assert_eq!(file.size(), 0);
        fh.close().unwrap();

        assert_eq!(store.put_count(), 1);
        assert_eq!(store.contents("big.bin").unwrap(), b"");
        assert_eq!(file.size(), 0);
    }

    #[test]
    fn test_pure_read_does_not_store() {
        let (store, root, _tmp) = new_vfs(CacheMode::Full);
        store.insert("a.txt", b"hello world", mtime(1));
        let file = root.lookup("a.txt").unwrap();

        let fh = file.open(flags(libc::O_RDONLY)).unwrap();
        assert!(matches!(fh, Handle::Rw(_)));
        let mut buf = [0u8; 32];
        let n = fh.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello world");
        assert_eq!(fh.read(&mut buf).unwrap(), 0);
        fh.close().unwrap();

        assert_eq!(store.put_count(), 0);
    }

    #[test]
    fn test_read_write_round_trip_through_cache() {
        let (store, root, _tmp) = new_vfs(CacheMode::Writes);
        store.insert("a.txt", b"hello world", mtime(1));
        let file = root.lookup("a.txt").unwrap();

        let fh = file.open(flags(libc::O_RDWR)).unwrap();
        let mut buf = [0u8; 5];
        assert_eq!(fh.read_at(&mut buf, 6).unwrap(), 5);
        assert_eq!(&buf, b"world");

        assert_eq!(fh.write_at(b"HELLO", 0).unwrap(), 5);
        let mut buf = [0u8; 32];
        let n = fh.read_at(&mut buf, 0).unwrap();
        assert_eq!(&buf[..n], b"HELLO world");
        fh.close().unwrap();

        assert_eq!(store.contents("a.txt").unwrap(), b"HELLO world");
    }

    #[test]
    fn test_multi_handle_single_writeback() {
        let (store, root, _tmp) = new_vfs(CacheMode::Writes);
        let file = root.create("a.txt").unwrap();

        let h1 = file.open(flags(libc::O_RDWR | libc::O_CREAT)).unwrap();
        let h2 = file.open(flags(libc::O_RDWR)).unwrap();
        assert!(matches!(h2, Handle::Rw(_)));

        h1.write_at(b"aaaa", 0).unwrap();
        h2.write_at(b"bbbb", 4).unwrap();

        h1.close().unwrap();
        assert_eq!(store.put_count(), 0);
        h2.close().unwrap();
        assert_eq!(store.put_count(), 1);
        assert_eq!(store.contents("a.txt").unwrap(), b"aaaabbbb");
    }

    #[test]
    fn test_pending_rename_runs_after_close() {
        let (store, root, _tmp) = new_vfs(CacheMode::Writes);
        store.insert("old.txt", b"contents", mtime(1));
        let file = root.lookup("old.txt").unwrap();

        // an unmodified writer defers the rename but triggers no writeback
        let fh = file.open(flags(libc::O_RDWR)).unwrap();
        let mut buf = [0u8; 8];
        fh.read_at(&mut buf, 0).unwrap();

        file.rename(&root, "new.txt").unwrap();
        assert_eq!(file.path(), "new.txt");
        assert!(store.contents("old.txt").is_some());
        assert!(store.contents("new.txt").is_none());

        fh.close().unwrap();
        assert_eq!(store.put_count(), 0);
        assert!(store.contents("old.txt").is_none());
        assert_eq!(store.contents("new.txt").unwrap(), b"contents");
    }

    #[test]
    fn test_back_to_back_renames_chain_in_order() {
        let (store, root, _tmp) = new_vfs(CacheMode::Writes);
        store.insert("a.txt", b"data", mtime(1));
        let file = root.lookup("a.txt").unwrap();

        let fh = file.open(flags(libc::O_RDWR)).unwrap();
        let mut buf = [0u8; 4];
        fh.read_at(&mut buf, 0).unwrap();

        file.rename(&root, "b.txt").unwrap();
        file.rename(&root, "c.txt").unwrap();
        assert_eq!(file.path(), "c.txt");
        assert!(store.contents("a.txt").is_some());

        fh.close().unwrap();
        assert!(store.contents("a.txt").is_none());
        assert!(store.contents("b.txt").is_none());
        assert_eq!(store.contents("c.txt").unwrap(), b"data");
    }

    #[test]
    fn test_rename_during_write_stores_at_new_path() {
        let (store, root, _tmp) = new_vfs(CacheMode::Writes);
        let file = root.create("a.txt").unwrap();

        let fh = file.open(flags(libc::O_WRONLY | libc::O_CREAT)).unwrap();
        fh.write(b"renamed content").unwrap();
        file.rename(&root, "b.txt").unwrap();
        assert_eq!(file.path(), "b.txt");
        assert!(store.contents("b.txt").is_none());

        fh.close().unwrap();
        assert_eq!(store.contents("b.txt").unwrap(), b"renamed content");
    }

    #[test]
    fn test_pending_modtime_applied_on_writeback() {
        let (store, root, _tmp) = new_vfs(CacheMode::Writes);
        let file = root.create("a.txt").unwrap();

        let fh = file.open(flags(libc::O_WRONLY | libc::O_CREAT)).unwrap();
        fh.write(b"x").unwrap();
        file.set_mod_time(mtime(12345)).unwrap();
        assert_eq!(file.mod_time(), mtime(12345));

        fh.close().unwrap();
        assert_eq!(store.stat("a.txt").unwrap().unwrap().mod_time, mtime(12345));
        assert_eq!(file.mod_time(), mtime(12345));
    }

    #[test]
    fn test_close_idempotence_and_refcount() {
        let (_store, root, _tmp) = new_vfs(CacheMode::Writes);
        let file = root.create("a.txt").unwrap();

        let fh = file.open(flags(libc::O_WRONLY | libc::O_CREAT)).unwrap();
        assert_eq!(root.vfs().cache().opens("a.txt"), 1);
        fh.write(b"abc").unwrap();

        fh.close().unwrap();
        assert_eq!(root.vfs().cache().opens("a.txt"), 0);
        let err = fh.close().unwrap_err();
        assert!(matches!(err.kind(), VfsError::HandleClosed));
        assert_eq!(root.vfs().cache().opens("a.txt"), 0);
    }

    #[test]
    fn test_release_is_idempotent() {
        let (store, root, _tmp) = new_vfs(CacheMode::Writes);
        let file = root.create("a.txt").unwrap();

        let fh = file.open(flags(libc::O_WRONLY | libc::O_CREAT)).unwrap();
        fh.write(b"abc").unwrap();
        fh.release().unwrap();
        fh.release().unwrap();
        assert_eq!(store.put_count(), 1);
    }

    #[test]
    fn test_flush_without_writes_is_noop() {
        let (store, root, _tmp) = new_vfs(CacheMode::Writes);
        store.insert("a.txt", b"hello", mtime(1));
        let file = root.lookup("a.txt").unwrap();

        let fh = file.open(flags(libc::O_RDWR)).unwrap();
        let mut buf = [0u8; 5];
        fh.read(&mut buf).unwrap();
        fh.flush().unwrap();
        assert_eq!(store.put_count(), 0);
        fh.close().unwrap();
        assert_eq!(store.put_count(), 0);
    }

    #[test]
    fn test_flush_on_fresh_handle_is_noop() {
        let (store, root, _tmp) = new_vfs(CacheMode::Writes);
        store.insert("a.txt", b"hello", mtime(1));
        let file = root.lookup("a.txt").unwrap();

        // never materialized: flush must not materialize or transfer
        let fh = file.open(flags(libc::O_RDWR)).unwrap();
        fh.flush().unwrap();
        assert_eq!(store.put_count(), 0);
        fh.close().unwrap();
    }

    #[test]
    fn test_append_write_at_appends() {
        let (store, root, _tmp) = new_vfs(CacheMode::Writes);
        store.insert("log.txt", b"hello", mtime(1));
        let file = root.lookup("log.txt").unwrap();

        let fh = file
            .open(flags(libc::O_WRONLY | libc::O_APPEND))
            .unwrap();
        assert!(matches!(fh, Handle::Rw(_)));
        assert_eq!(fh.write_at(b" world", 0).unwrap(), 6);
        fh.close().unwrap();

        assert_eq!(store.contents("log.txt").unwrap(), b"hello world");
        assert!(file.append_mode());
    }

    #[test]
    fn test_create_then_close_without_io_produces_empty_file() {
        let (store, root, _tmp) = new_vfs(CacheMode::Writes);
        let file = root.create("empty.txt").unwrap();

        let fh = file.open(flags(libc::O_WRONLY | libc::O_CREAT)).unwrap();
        fh.close().unwrap();

        assert_eq!(store.put_count(), 1);
        assert_eq!(store.contents("empty.txt").unwrap(), b"");
    }

    #[test]
    fn test_seek_short_circuit_and_seek_end() {
        let (store, root, _tmp) = new_vfs(CacheMode::Writes);
        store.insert("a.txt", b"0123456789", mtime(1));
        let file = root.lookup("a.txt").unwrap();

        let fh = file.open(flags(libc::O_RDWR)).unwrap();
        // seek to zero on a fresh handle doesn't materialize
        assert_eq!(fh.seek(SeekFrom::Start(0)).unwrap(), 0);
        assert!(!root.vfs().cache().exists("a.txt"));

        assert_eq!(fh.seek(SeekFrom::End(-4)).unwrap(), 6);
        let mut buf = [0u8; 4];
        assert_eq!(fh.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"6789");
        assert_eq!(fh.seek(SeekFrom::Current(-2)).unwrap(), 8);
        fh.close().unwrap();
    }

    #[test]
    fn test_access_mode_mismatch() {
        let (store, root, _tmp) = new_vfs(CacheMode::Writes);
        store.insert("a.txt", b"hello", mtime(1));
        let file = root.lookup("a.txt").unwrap();

        let wr = file.open(flags(libc::O_WRONLY)).unwrap();
        wr.write_at(b"HELLO", 0).unwrap();
        let mut buf = [0u8; 4];
        let err = wr.read(&mut buf).unwrap_err();
        assert!(matches!(err.kind(), VfsError::BadFileDescriptor));
        wr.close().unwrap();

        // a cached copy now exists, so a read-only open picks the RW path
        let rd = file.open(flags(libc::O_RDONLY)).unwrap();
        assert!(matches!(rd, Handle::Rw(_)));
        let err = rd.write(b"nope").unwrap_err();
        assert!(matches!(err.kind(), VfsError::BadFileDescriptor));
        rd.close().unwrap();
    }

    #[test]
    fn test_truncate_with_open_writers_delegates() {
        let (store, root, _tmp) = new_vfs(CacheMode::Writes);
        let file = root.create("a.txt").unwrap();

        let fh = file.open(flags(libc::O_WRONLY | libc::O_CREAT)).unwrap();
        fh.write(b"0123456789").unwrap();
        file.truncate(4).unwrap();
        assert_eq!(file.size(), 4);
        fh.close().unwrap();

        assert_eq!(store.contents("a.txt").unwrap(), b"0123");
    }

    #[test]
    fn test_truncate_without_writers_reopens() {
        let (store, root, _tmp) = new_vfs(CacheMode::Writes);
        store.insert("a.txt", b"hello", mtime(1));
        let file = root.lookup("a.txt").unwrap();

        file.truncate(0).unwrap();
        assert_eq!(store.contents("a.txt").unwrap(), b"");

        // size already matches: nothing to do
        let puts = store.put_count();
        file.truncate(0).unwrap();
        assert_eq!(store.put_count(), puts);
    }

    #[test]
    fn test_handle_rejects_directory_operations() {
        let (_store, root, _tmp) = new_vfs(CacheMode::Writes);
        let file = root.create("a.txt").unwrap();
        let fh = file.open(flags(libc::O_WRONLY | libc::O_CREAT)).unwrap();
        assert!(matches!(fh.chdir().unwrap_err(), VfsError::NotSupported));
        assert!(matches!(fh.chmod(0o644).unwrap_err(), VfsError::NotSupported));
        assert!(matches!(fh.chown(0, 0).unwrap_err(), VfsError::NotSupported));
        assert!(matches!(fh.readdir().unwrap_err(), VfsError::NotSupported));
        fh.close().unwrap();
    }

    #[test]
    fn test_size_tracks_writes_then_object() {
        let (_store, root, _tmp) = new_vfs(CacheMode::Writes);
        let file = root.create("a.txt").unwrap();

        let fh = file.open(flags(libc::O_WRONLY | libc::O_CREAT)).unwrap();
        fh.write(b"123456").unwrap();
        // writers present: the atomic size is authoritative
        assert_eq!(file.size(), 6);
        fh.close().unwrap();
        // quiescent: the object is authoritative
        assert_eq!(file.size(), 6);
    }

    #[test]
    fn test_concurrent_read_open_waits_for_writer() {
        let (_store, root, _tmp) = new_vfs(CacheMode::Off);
        let file = root.create("a.txt").unwrap();

        let wh = file.open(flags(libc::O_WRONLY | libc::O_CREAT)).unwrap();
        wh.write(b"written by peer").unwrap();

        let closer = {
            let wh = wh.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(300));
                wh.close().unwrap();
            })
        };

        // blocks until the writer's close binds the object
        let rh = file.open(flags(libc::O_RDONLY)).unwrap();
        let mut buf = [0u8; 32];
        let n = rh.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"written by peer");
        rh.close().unwrap();
        closer.join().unwrap();
    }
}
