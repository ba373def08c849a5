//! File nodes: per-file state, writer bookkeeping, deferred operations and
//! the open-mode selector.

use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, SystemTime};

use parking_lot::{Mutex, MutexGuard, RwLock};
use tracing::{debug, error, warn};

use crate::config::CacheMode;
use crate::remote::Object;
use crate::{Result, VfsError};

use super::dir::Dir;
use super::read::ReadFileHandle;
use super::read_write::RwFileHandle;
use super::write::WriteFileHandle;
use super::{join_path, new_inode, Handle, OpenFlags};

// File and Dir nodes both carry locks, so files observe a strict
// discipline: with the file attribute lock held, the only Dir calls allowed
// are the lock-free `vfs()` and `remote()` accessors. Every other Dir
// method must be invoked with the file lock released, which keeps File
// subordinate to Dir in the lock order. The writeback lock serializes
// handle materialization, handle close and `remove`, and is always taken
// before the attribute lock.

/// Number of polls waiting for a file's object to appear, and the pause
/// between polls. Together they bound the read-open wait at five seconds.
pub const OBJECT_WAIT_POLLS: u32 = 50;
pub const OBJECT_WAIT_INTERVAL: Duration = Duration::from_millis(100);

/// A file node.
impl std::fmt::Debug for File {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("File").field("inode", &self.inode).finish()
    }
}

pub struct File {
    inode: u64,
    /// Size while writing is in progress. Read and written atomically so
    /// size queries never block on the attribute lock.
    size: AtomicI64,
    /// Mirror of the writers list length, for lock-free polling.
    nwriters: AtomicI32,
    state: RwLock<FileState>,
    /// Serializes handle materialization, handle close and `remove`.
    rw: Mutex<()>,
}

struct FileState {
    dir: Weak<Dir>,
    /// Path of the parent directory; combined with `leaf` it yields the
    /// file's logical path. Both change on rename.
    dir_path: String,
    leaf: String,
    /// None while the file has never been written back or fetched.
    object: Option<Object>,
    /// RW handles that have completed materialization, as opposed to
    /// handles merely registered.
    rw_open_count: i32,
    writers: Vec<WriterEntry>,
    /// How many of `writers` are RW handles.
    read_writers: i32,
    /// An RW handle is inside its close critical section; writeback may
    /// still be imminent.
    read_writer_closing: bool,
    /// A handle reported it modified the cache copy.
    modified: bool,
    /// Applied once `object` becomes available.
    pending_mod_time: Option<SystemTime>,
    /// Run once no writers remain.
    pending_rename: Option<PendingRename>,
    /// Some open of this file used append semantics.
    append_mode: bool,
}

impl FileState {
    fn writing_in_progress(&self) -> bool {
        self.object.is_none() || !self.writers.is_empty() || self.read_writer_closing
    }

    fn path(&self) -> String {
        join_path(&self.dir_path, &self.leaf)
    }
}

/// A queued remote-side rename, run once the last writer is gone. Renames
/// issued while one is already queued chain in submission order.
struct PendingRename {
    new_path: String,
    chained: Option<Box<PendingRename>>,
}

impl PendingRename {
    // Attach `older` at the far end of the chain so it runs first.
    fn chain_oldest(&mut self, older: PendingRename) {
        match self.chained.as_mut() {
            Some(next) => next.chain_oldest(older),
            None => self.chained = Some(Box::new(older)),
        }
    }
}

pub(crate) struct WriterEntry {
    id: u64,
    handle: WriterHandle,
}

/// Weak reference back to a registered writer, used to delegate truncation
/// without keeping the handle alive.
pub(crate) enum WriterHandle {
    Rw(Weak<RwFileHandle>),
    Write(Weak<WriteFileHandle>),
}

impl WriterHandle {
    fn upgrade(&self) -> Option<Handle> {
        match self {
            WriterHandle::Rw(h) => h.upgrade().map(Handle::Rw),
            WriterHandle::Write(h) => h.upgrade().map(Handle::Write),
        }
    }
}

impl File {
    pub(crate) fn new(dir: &Arc<Dir>, object: Option<Object>, leaf: &str) -> Arc<File> {
        let size = object.as_ref().map_or(0, |o| o.size());
        Arc::new(File {
            inode: new_inode(),
            size: AtomicI64::new(size),
            nwriters: AtomicI32::new(0),
            state: RwLock::new(FileState {
                dir: Arc::downgrade(dir),
                dir_path: dir.path(),
                leaf: leaf.to_string(),
                object,
                rw_open_count: 0,
                writers: Vec::new(),
                read_writers: 0,
                read_writer_closing: false,
                modified: false,
                pending_mod_time: None,
                pending_rename: None,
                append_mode: false,
            }),
            rw: Mutex::new(()),
        })
    }

    pub fn inode(&self) -> u64 {
        self.inode
    }

    /// Leaf name of the file.
    pub fn name(&self) -> String {
        self.state.read().leaf.clone()
    }

    /// Full logical path of the file.
    pub fn path(&self) -> String {
        self.state.read().path()
    }

    /// Parent directory, resolved from the weak edge.
    pub fn dir(&self) -> Result<Arc<Dir>> {
        self.state.read().dir.upgrade().ok_or(VfsError::NotFound)
    }

    pub fn append_mode(&self) -> bool {
        self.state.read().append_mode
    }

    /// Size of the file. While writing is in progress this is the size
    /// written so far; otherwise the remote object is authoritative.
    pub fn size(&self) -> i64 {
        let st = self.state.read();
        if st.writing_in_progress() {
            return self.size.load(Ordering::SeqCst);
        }
        st.object.as_ref().map_or(0, |o| o.size().max(0))
    }

    // Update the size while writing.
    pub(crate) fn set_size(&self, n: i64) {
        self.size.store(n, Ordering::SeqCst);
    }

    /// Whether the file exists on the remote.
    pub fn exists(&self) -> bool {
        self.state.read().object.is_some()
    }

    pub(crate) fn get_object(&self) -> Option<Object> {
        self.state.read().object.clone()
    }

    /// Modification time: a pending modtime wins, then the object's, then
    /// now for files still being written.
    pub fn mod_time(&self) -> SystemTime {
        let st = self.state.read();
        if let Some(t) = st.pending_mod_time {
            return t;
        }
        if let Some(o) = &st.object {
            return o.mod_time();
        }
        SystemTime::now()
    }

    /// Bind the freshly written-back object, apply any pending modtime, and
    /// surface the file in its parent listing.
    pub(crate) fn set_object(self: &Arc<Self>, o: Object) {
        {
            let mut st = self.state.write();
            st.object = Some(o);
            if let Err(e) = File::apply_pending_mod_time(&mut st) {
                debug!(path = %st.path(), error = %e, "failed to apply pending modtime");
            }
        }
        // the attribute lock must be released before touching the directory
        if let Ok(d) = self.dir() {
            d.add_object(self);
        }
    }

    /// Update the object binding without touching the directory listing.
    pub(crate) fn set_object_no_update(&self, o: Object) {
        self.state.write().object = Some(o);
    }

    fn read_only(&self) -> Result<bool> {
        Ok(self.dir()?.vfs().opt().read_only)
    }

    /// Set the file's modtime. While a write is in progress the time is
    /// queued and applied when the object next becomes available.
    pub fn set_mod_time(&self, mod_time: SystemTime) -> Result<()> {
        if self.read_only()? {
            return Err(VfsError::ReadOnly);
        }
        let mut st = self.state.write();
        st.pending_mod_time = Some(mod_time);
        if !st.writing_in_progress() {
            return File::apply_pending_mod_time(&mut st);
        }
        Ok(())
    }

    // Apply a queued modtime to the cache copy and the remote object. Call
    // with the attribute lock held.
    fn apply_pending_mod_time(st: &mut FileState) -> Result<()> {
        let Some(mod_time) = st.pending_mod_time.take() else {
            return Ok(());
        };
        if st.object.is_none() {
            return Err(VfsError::Other(
                "cannot apply modtime: file object is not available".into(),
            ));
        }
        let path = st.path();
        if let Some(d) = st.dir.upgrade() {
            d.vfs().cache().set_mod_time(&path, mod_time);
        }
        if let Some(object) = st.object.as_mut() {
            match object.set_mod_time(mod_time) {
                Ok(()) => debug!(path = %path, "applied modtime"),
                // a backend that can't set modtimes must not break touching
                // an existing file
                Err(e) if matches!(e.kind(), VfsError::CantSetModTime) => {}
                Err(e) => {
                    debug!(path = %path, error = %e, "failed to set object modtime");
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Register a writer handle.
    pub(crate) fn add_writer(&self, id: u64, handle: WriterHandle) {
        let mut st = self.state.write();
        let is_rw = matches!(handle, WriterHandle::Rw(_));
        st.writers.push(WriterEntry { id, handle });
        self.nwriters.fetch_add(1, Ordering::SeqCst);
        if is_rw {
            st.read_writers += 1;
        }
    }

    /// Deregister a writer. Returns true iff this was the last writer and
    /// the cache copy was modified, in which case the caller owns the
    /// writeback for this epoch.
    pub(crate) fn del_writer(&self, id: u64, modified_cache_file: bool) -> bool {
        let last_writer_and_modified = {
            let mut st = self.state.write();
            match st.writers.iter().position(|w| w.id == id) {
                Some(i) => {
                    let entry = st.writers.remove(i);
                    self.nwriters.fetch_sub(1, Ordering::SeqCst);
                    if matches!(entry.handle, WriterHandle::Rw(_)) {
                        st.read_writers -= 1;
                    }
                }
                None => debug!(path = %st.path(), "del_writer couldn't find handle"),
            }
            st.read_writer_closing = true;
            if modified_cache_file {
                st.modified = true;
            }
            let last = st.writers.is_empty() && st.modified;
            if last {
                st.modified = false;
            }
            last
        };
        self.apply_pending_rename();
        last_writer_and_modified
    }

    /// Record that an RW handle finished materialization.
    pub(crate) fn add_rw_open(&self) {
        self.state.write().rw_open_count += 1;
    }

    pub(crate) fn del_rw_open(&self) {
        self.state.write().rw_open_count -= 1;
    }

    /// RW handles past materialization; pending opens don't count.
    pub(crate) fn rw_opens(&self) -> i32 {
        self.state.read().rw_open_count
    }

    /// Clear the closing flag set by `del_writer` and retry the pending
    /// rename now that the close critical section is over.
    pub(crate) fn finish_writer_close(&self) {
        self.state.write().read_writer_closing = false;
        self.apply_pending_rename();
    }

    /// Number of registered writers, readable without the attribute lock.
    pub fn active_writers(&self) -> i32 {
        self.nwriters.load(Ordering::SeqCst)
    }

    /// Guard serializing materialization, writeback and removal.
    pub(crate) fn rw_guard(&self) -> MutexGuard<'_, ()> {
        self.rw.lock()
    }

    // Run the queued rename if writing has quiesced. Call without locks.
    fn apply_pending_rename(&self) {
        let (queued, writing) = {
            let st = self.state.read();
            (st.pending_rename.is_some(), st.writing_in_progress())
        };
        if !queued || writing {
            return;
        }
        debug!(path = %self.path(), "running delayed rename now");
        if let Err(e) = self.run_pending_rename() {
            error!(path = %self.path(), error = %e, "delayed rename failed");
        }
    }

    fn run_pending_rename(&self) -> Result<()> {
        let Some(op) = self.state.write().pending_rename.take() else {
            return Ok(());
        };
        match self.run_rename(&op) {
            Ok(()) => Ok(()),
            Err(e) => {
                // keep it queued for the next quiescent point; a rename
                // issued meanwhile stays ahead in the chain
                let mut st = self.state.write();
                match st.pending_rename.take() {
                    None => st.pending_rename = Some(op),
                    Some(mut newer) => {
                        newer.chain_oldest(op);
                        st.pending_rename = Some(newer);
                    }
                }
                Err(e)
            }
        }
    }

    // Execute a rename chain, oldest first, then move the remote object to
    // its final path and rebind it.
    fn run_rename(&self, op: &PendingRename) -> Result<()> {
        if let Some(prev) = &op.chained {
            self.run_rename(prev)?;
        }
        let Some(object) = self.get_object() else {
            return Err(VfsError::Other(
                "cannot rename: file object is not available".into(),
            ));
        };
        if object.remote() == op.new_path {
            return Ok(());
        }
        let remote = self.dir()?.remote().clone();
        let info = remote
            .move_object(object.remote(), &op.new_path)
            .map_err(|e| {
                error!(path = %self.path(), error = %e, "rename of remote object failed");
                e
            })?;
        debug!(from = object.remote(), to = %op.new_path, "renamed remote object");
        self.set_object_no_update(Object::new(remote, info));
        Ok(())
    }

    /// Rename the file into `dest_dir` under `new_name`.
    ///
    /// The logical path and the cached copy move immediately. The remote
    /// move runs now when the file is quiescent, otherwise it is queued
    /// until the last writer finishes.
    pub fn rename(&self, dest_dir: &Arc<Dir>, new_name: &str) -> Result<()> {
        let d = self.dir()?;
        if !d.remote().supports_move() {
            let err = VfsError::Other(
                "backend cannot rename files (no server-side move)".into(),
            );
            error!(path = %self.path(), error = %err, "rename failed");
            return Err(err);
        }

        // both paths are computed with the file lock released
        let dest_path = dest_dir.path();
        let new_path = join_path(&dest_path, new_name);
        let old_path = self.path();

        // the cached copy moves synchronously regardless of writers
        if d.vfs().cache().exists(&old_path) {
            if let Err(e) = d.vfs().cache().rename(&old_path, &new_path) {
                warn!(path = %old_path, error = %e, "cache rename failed");
            }
        }

        let op = {
            let mut st = self.state.write();
            let chained = st.pending_rename.take().map(Box::new);
            st.dir = Arc::downgrade(dest_dir);
            st.dir_path = dest_path;
            st.leaf = new_name.to_string();
            let op = PendingRename { new_path, chained };
            if st.writing_in_progress() {
                debug!(path = %st.path(), "file is open, delaying rename");
                st.pending_rename = Some(op);
                None
            } else {
                Some(op)
            }
        };
        match op {
            Some(op) => self.run_rename(&op),
            None => Ok(()),
        }
    }

    /// Wait briefly for the object to appear, as when a concurrent writer
    /// is finishing its writeback. Fails fast when no writer remains to
    /// produce one.
    pub(crate) fn wait_for_valid_object(&self) -> Result<Object> {
        for _ in 0..OBJECT_WAIT_POLLS {
            let (object, nwriters, closing) = {
                let st = self.state.read();
                (st.object.clone(), st.writers.len(), st.read_writer_closing)
            };
            if let Some(o) = object {
                return Ok(o);
            }
            if nwriters == 0 && !closing {
                return Err(VfsError::WriterFailed);
            }
            thread::sleep(OBJECT_WAIT_INTERVAL);
        }
        Err(VfsError::NotFound)
    }

    /// Open the file, choosing the handle variant from the flags and the
    /// configured cache mode.
    pub fn open(self: &Arc<Self>, flags: OpenFlags) -> Result<Handle> {
        debug!(path = %self.path(), flags = %flags, "open");

        // POSIX leaves O_RDONLY|O_TRUNC undefined; reject it
        if flags.is_read_only() && flags.trunc() {
            return Err(VfsError::InvalidArgument);
        }

        let (mut read, mut write) = match flags.access() {
            libc::O_RDONLY => (true, false),
            libc::O_WRONLY => (false, true),
            libc::O_RDWR => (true, true),
            _ => {
                debug!(path = %self.path(), flags = %flags, "unsupported access mode");
                return Err(VfsError::PermissionDenied);
            }
        };
        // append needs seekable storage, truncate needs write intent
        if flags.append() {
            read = true;
            self.state.write().append_mode = true;
        }
        if flags.trunc() {
            write = true;
        }

        let d = self.dir()?;
        let cache_mode = d.vfs().opt().cache_mode;
        let cache = d.vfs().cache();
        let path = self.path();

        let fd = if cache_mode >= CacheMode::Minimal
            && (cache.opens(&path) > 0 || cache.exists(&path))
        {
            self.open_rw(&d, flags)
        } else if read && write {
            if cache_mode >= CacheMode::Minimal {
                self.open_rw(&d, flags)
            } else {
                // open write-only and hope the caller doesn't read; if they
                // do they get EPERM
                self.open_write(&d, flags)
            }
        } else if write {
            if cache_mode >= CacheMode::Writes {
                self.open_rw(&d, flags)
            } else {
                self.open_write(&d, flags)
            }
        } else if read {
            if cache_mode >= CacheMode::Full {
                self.open_rw(&d, flags)
            } else {
                self.open_read()
            }
        } else {
            debug!(path = %self.path(), flags = %flags, "cannot interpret flags");
            return Err(VfsError::PermissionDenied);
        }?;

        if flags.create() {
            // make the new file visible; called without the file lock held
            d.add_object(self);
        }
        Ok(fd)
    }

    fn open_read(self: &Arc<Self>) -> Result<Handle> {
        Ok(Handle::Read(ReadFileHandle::new(self.clone())?))
    }

    fn open_write(self: &Arc<Self>, d: &Arc<Dir>, flags: OpenFlags) -> Result<Handle> {
        if d.vfs().opt().read_only {
            return Err(VfsError::ReadOnly);
        }
        Ok(Handle::Write(WriteFileHandle::new(
            d.clone(),
            self.clone(),
            flags,
        )?))
    }

    fn open_rw(self: &Arc<Self>, d: &Arc<Dir>, flags: OpenFlags) -> Result<Handle> {
        if !flags.is_read_only() && d.vfs().opt().read_only {
            return Err(VfsError::ReadOnly);
        }
        Ok(Handle::Rw(RwFileHandle::new(d.clone(), self.clone(), flags)?))
    }

    /// Change the size of the file, delegating to open writers when any
    /// exist.
    pub fn truncate(self: &Arc<Self>, size: i64) -> Result<()> {
        let (writers, object) = {
            let st = self.state.read();
            let writers: Vec<Handle> =
                st.writers.iter().filter_map(|w| w.handle.upgrade()).collect();
            (writers, st.object.clone())
        };

        if !writers.is_empty() {
            debug!(path = %self.path(), handles = writers.len(), "truncating open file handles");
            let mut res = Ok(());
            for h in &writers {
                if let Err(e) = h.truncate(size) {
                    res = Err(e);
                }
            }
            return res;
        }

        if let Some(o) = &object {
            if o.size() == size {
                return Ok(());
            }
        }

        // no writers: reopen write-only and let close run the writeback
        debug!(path = %self.path(), size, "truncating file");
        let mut flags = OpenFlags::WRONLY;
        if size == 0 {
            flags = flags.with(libc::O_TRUNC);
        }
        let fh = self.open(flags)?;
        let res = if size != 0 { fh.truncate(size) } else { Ok(()) };
        let close_res = fh.close();
        res.and(close_res)
    }

    /// Remove the file: delete the remote object, detach from the parent
    /// listing, and drop the cached copy. Open handles stay valid against
    /// their cached copies.
    pub fn remove(&self) -> Result<()> {
        let d = self.dir()?;
        if d.vfs().opt().read_only {
            return Err(VfsError::ReadOnly);
        }
        {
            // the writeback lock comes before the attribute lock, same as
            // materialization and close
            let _rw = self.rw.lock();
            let st = self.state.write();
            if let Some(o) = &st.object {
                if let Err(e) = o.remove() {
                    debug!(path = %st.path(), error = %e, "failed to remove remote object");
                    return Err(e);
                }
            }
        }
        // called with the file lock released
        d.del_object(&self.name());
        d.vfs().cache().remove(&self.path());
        Ok(())
    }

    /// Same as `remove` for files.
    pub fn remove_all(&self) -> Result<()> {
        self.remove()
    }

    /// Nothing to do: data reaches the remote on writeback.
    pub fn sync(&self) -> Result<()> {
        Ok(())
    }
}
