//! Write-only upload handles.
//!
//! Used when the cache mode keeps writes out of the cache: bytes are
//! buffered locally and uploaded as one object when the last writer
//! closes. The backend only takes whole objects, so writes must be
//! sequential and reading back is refused with EPERM.

use std::io::{self, SeekFrom};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error};

use crate::remote::Object;
use crate::{Result, VfsError};

use super::dir::Dir;
use super::file::{File, WriterHandle};
use super::{next_handle_id, OpenFlags};

pub struct WriteFileHandle {
    id: u64,
    file: Arc<File>,
    dir: Arc<Dir>,
    state: Mutex<WriteState>,
}

struct WriteState {
    buf: Vec<u8>,
    offset: i64,
    closed: bool,
    write_called: bool,
}

impl WriteFileHandle {
    pub(crate) fn new(dir: Arc<Dir>, file: Arc<File>, flags: OpenFlags) -> Result<Arc<WriteFileHandle>> {
        if flags.create() && flags.excl() && file.exists() {
            return Err(VfsError::AlreadyExists);
        }
        let fh = Arc::new(WriteFileHandle {
            id: next_handle_id(),
            file: file.clone(),
            dir,
            state: Mutex::new(WriteState {
                buf: Vec::new(),
                offset: 0,
                closed: false,
                write_called: false,
            }),
        });
        // the upload replaces the object wholesale, so the size so far is
        // what has been written
        file.set_size(0);
        file.add_writer(fh.id, WriterHandle::Write(Arc::downgrade(&fh)));
        Ok(fh)
    }

    pub fn file(&self) -> &Arc<File> {
        &self.file
    }

    fn write_at_locked(&self, st: &mut WriteState, buf: &[u8], offset: i64) -> Result<usize> {
        if st.closed {
            return Err(VfsError::HandleClosed);
        }
        if st.offset != offset {
            // out-of-order writes need a cache-backed handle
            error!(
                path = %self.file.path(),
                expected = st.offset,
                requested = offset,
                "cannot seek in file opened for streaming write"
            );
            return Err(VfsError::PermissionDenied);
        }
        st.write_called = true;
        st.buf.extend_from_slice(buf);
        st.offset += buf.len() as i64;
        self.file.set_size(st.offset);
        Ok(buf.len())
    }

    /// Write at an explicit offset, which must match the bytes written so
    /// far.
    pub fn write_at(&self, buf: &[u8], offset: i64) -> Result<usize> {
        let mut st = self.state.lock();
        self.write_at_locked(&mut st, buf, offset)
    }

    /// Append to the upload buffer.
    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        let mut st = self.state.lock();
        let offset = st.offset;
        self.write_at_locked(&mut st, buf, offset)
    }

    /// Reading back requires a cache-backed handle.
    pub fn read(&self, _buf: &mut [u8]) -> Result<usize> {
        error!(path = %self.file.path(), "cannot read and write to file without a cache");
        Err(VfsError::PermissionDenied)
    }

    pub fn read_at(&self, _buf: &mut [u8], _offset: i64) -> Result<usize> {
        error!(path = %self.file.path(), "cannot read and write to file without a cache");
        Err(VfsError::PermissionDenied)
    }

    /// Only seeks to the current position succeed.
    pub fn seek(&self, pos: SeekFrom) -> Result<i64> {
        let st = self.state.lock();
        if st.closed {
            return Err(VfsError::HandleClosed);
        }
        let target = match pos {
            SeekFrom::Start(n) => n as i64,
            SeekFrom::Current(n) => st.offset + n,
            SeekFrom::End(n) => st.offset + n,
        };
        if target != st.offset {
            error!(path = %self.file.path(), "cannot seek in file opened for streaming write");
            return Err(VfsError::PermissionDenied);
        }
        Ok(target)
    }

    /// Truncating to anything but the bytes written so far is unsupported.
    pub fn truncate(&self, size: i64) -> Result<()> {
        let st = self.state.lock();
        if st.closed {
            return Err(VfsError::HandleClosed);
        }
        if size != st.offset {
            error!(path = %self.file.path(), size, "cannot truncate file opened for streaming write");
            return Err(VfsError::PermissionDenied);
        }
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        Ok(())
    }

    fn transfer(&self, st: &mut WriteState) -> Result<()> {
        let path = self.file.path();
        let mod_time = self.file.mod_time();
        let mut data = io::Cursor::new(std::mem::take(&mut st.buf));
        let info = self
            .dir
            .remote()
            .put(&path, &mut data, mod_time)
            .map_err(|e| {
                error!(path = %path, error = %e, "failed to transfer file to remote");
                e
            })?;
        debug!(path = %path, size = info.size, "transferred to remote");
        self.file
            .set_object(Object::new(self.dir.remote().clone(), info));
        Ok(())
    }

    fn close_locked(&self, st: &mut WriteState) -> Result<()> {
        if st.closed {
            return Err(VfsError::HandleClosed);
        }
        st.closed = true;
        // even an untouched handle produces its (empty) object
        let is_copied = self.file.del_writer(self.id, true);
        let res = if is_copied { self.transfer(st) } else { Ok(()) };
        self.file.finish_writer_close();
        res
    }

    /// Close the handle, uploading the buffered bytes when this was the
    /// last writer. A second close returns `HandleClosed`.
    pub fn close(&self) -> Result<()> {
        let mut st = self.state.lock();
        self.close_locked(&mut st)
    }

    /// Uploads on the first flush after writes; later operations see the
    /// handle closed, matching close-time flush semantics.
    pub fn flush(&self) -> Result<()> {
        let mut st = self.state.lock();
        if st.closed {
            debug!(path = %self.file.path(), "flush on closed handle, nothing to do");
            return Ok(());
        }
        if !st.write_called {
            debug!(path = %self.file.path(), "flush ignored on unwritten handle");
            return Ok(());
        }
        self.close_locked(&mut st)
    }

    /// Idempotent close for protocol layers that ignore the result.
    pub fn release(&self) -> Result<()> {
        let mut st = self.state.lock();
        if st.closed {
            debug!(path = %self.file.path(), "release: nothing to do");
            return Ok(());
        }
        let res = self.close_locked(&mut st);
        if let Err(e) = &res {
            error!(path = %self.file.path(), error = %e, "release failed");
        }
        res
    }

    pub fn size(&self) -> i64 {
        self.file.size()
    }
}
