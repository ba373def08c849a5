//! Streaming read-only file handles.
//!
//! Used when the cache mode keeps reads out of the cache: bytes come
//! straight from the remote object. Sequential reads stream; reading
//! behind the stream position reopens the object.

use std::io::{self, Read, SeekFrom};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::{Result, VfsError};

use super::file::File;

pub struct ReadFileHandle {
    file: Arc<File>,
    state: Mutex<ReadState>,
}

struct ReadState {
    reader: Option<Box<dyn Read + Send>>,
    /// Position of the underlying object stream.
    stream_pos: i64,
    /// Logical cursor for sequential reads.
    offset: i64,
    closed: bool,
}

impl ReadFileHandle {
    pub(crate) fn new(file: Arc<File>) -> Result<Arc<ReadFileHandle>> {
        // wait for a concurrent writer to finish producing the object
        file.wait_for_valid_object()?;
        Ok(Arc::new(ReadFileHandle {
            file,
            state: Mutex::new(ReadState {
                reader: None,
                stream_pos: 0,
                offset: 0,
                closed: false,
            }),
        }))
    }

    pub fn file(&self) -> &Arc<File> {
        &self.file
    }

    // Position the object stream at `offset`, reopening when seeking back.
    fn position_stream(&self, st: &mut ReadState, offset: i64) -> Result<()> {
        if st.reader.is_none() || offset < st.stream_pos {
            let o = self.file.get_object().ok_or(VfsError::NotFound)?;
            debug!(path = %self.file.path(), offset, "opening object stream");
            st.reader = Some(o.open()?);
            st.stream_pos = 0;
        }
        let to_skip = offset - st.stream_pos;
        if to_skip > 0 {
            let reader = st.reader.as_mut().ok_or(VfsError::BadFileDescriptor)?;
            let skipped = io::copy(&mut reader.take(to_skip as u64), &mut io::sink())?;
            // short skips mean the stream hit end of file; reads there
            // return zero bytes
            st.stream_pos += skipped as i64;
        }
        Ok(())
    }

    fn read_at_locked(&self, st: &mut ReadState, buf: &mut [u8], offset: i64) -> Result<usize> {
        if st.closed {
            return Err(VfsError::HandleClosed);
        }
        if offset < 0 {
            return Err(VfsError::InvalidArgument);
        }
        self.position_stream(st, offset)?;
        if st.stream_pos < offset {
            // the skip ran out of object; nothing to read here
            return Ok(0);
        }
        let reader = st.reader.as_mut().ok_or(VfsError::BadFileDescriptor)?;
        let n = reader.read(buf)?;
        st.stream_pos += n as i64;
        Ok(n)
    }

    /// Read at an explicit offset. The stream follows the last read.
    pub fn read_at(&self, buf: &mut [u8], offset: i64) -> Result<usize> {
        let mut st = self.state.lock();
        self.read_at_locked(&mut st, buf, offset)
    }

    /// Read from the cursor and advance it.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut st = self.state.lock();
        let offset = st.offset;
        let n = self.read_at_locked(&mut st, buf, offset)?;
        st.offset += n as i64;
        Ok(n)
    }

    /// Move the logical cursor; the stream repositions on the next read.
    pub fn seek(&self, pos: SeekFrom) -> Result<i64> {
        let mut st = self.state.lock();
        if st.closed {
            return Err(VfsError::HandleClosed);
        }
        let new_offset = match pos {
            SeekFrom::Start(n) => n as i64,
            SeekFrom::Current(n) => st.offset + n,
            SeekFrom::End(n) => self.file.size() + n,
        };
        if new_offset < 0 {
            return Err(VfsError::InvalidArgument);
        }
        st.offset = new_offset;
        Ok(new_offset)
    }

    pub fn write(&self, _buf: &[u8]) -> Result<usize> {
        Err(VfsError::BadFileDescriptor)
    }

    pub fn write_at(&self, _buf: &[u8], _offset: i64) -> Result<usize> {
        Err(VfsError::BadFileDescriptor)
    }

    pub fn truncate(&self, _size: i64) -> Result<()> {
        Err(VfsError::BadFileDescriptor)
    }

    pub fn sync(&self) -> Result<()> {
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        Ok(())
    }

    pub fn close(&self) -> Result<()> {
        let mut st = self.state.lock();
        if st.closed {
            return Err(VfsError::HandleClosed);
        }
        st.closed = true;
        st.reader = None;
        Ok(())
    }

    /// Idempotent close for protocol layers that ignore the result.
    pub fn release(&self) -> Result<()> {
        let mut st = self.state.lock();
        if st.closed {
            return Ok(());
        }
        st.closed = true;
        st.reader = None;
        Ok(())
    }

    pub fn size(&self) -> i64 {
        self.file.size()
    }
}
