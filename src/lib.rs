pub mod cache;
pub mod config;
pub mod ranges;
pub mod remote;
pub mod vfs;

use std::io;

/// Errors returned by the VFS layer.
///
/// Front-ends map these to POSIX errno values with [`VfsError::errno`].
/// Context added with [`VfsError::context`] wraps the error without losing
/// its classification; [`VfsError::kind`] recovers the underlying value.
#[derive(Debug, thiserror::Error)]
pub enum VfsError {
    #[error("file already exists")]
    AlreadyExists,

    #[error("bad file descriptor")]
    BadFileDescriptor,

    #[error("file handle is closed")]
    HandleClosed,

    #[error("no such file or directory")]
    NotFound,

    #[error("invalid argument")]
    InvalidArgument,

    #[error("operation not permitted")]
    PermissionDenied,

    #[error("read-only file system")]
    ReadOnly,

    #[error("operation not supported")]
    NotSupported,

    #[error("object not found")]
    ObjectNotFound,

    #[error("directory not found")]
    DirNotFound,

    #[error("backend cannot set modification time")]
    CantSetModTime,

    #[error("cannot open file: writer failed")]
    WriterFailed,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("{context}: {source}")]
    Wrapped {
        context: String,
        #[source]
        source: Box<VfsError>,
    },

    #[error("{0}")]
    Other(String),
}

impl VfsError {
    /// Attach context, preserving the classification of the underlying error.
    pub fn context(self, context: impl Into<String>) -> VfsError {
        VfsError::Wrapped {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Unwrap any context wrapping down to the underlying classification.
    pub fn kind(&self) -> &VfsError {
        match self {
            VfsError::Wrapped { source, .. } => source.kind(),
            other => other,
        }
    }

    /// True for the various shapes of "the thing is not there".
    pub fn is_not_found(&self) -> bool {
        match self.kind() {
            VfsError::NotFound | VfsError::ObjectNotFound | VfsError::DirNotFound => true,
            VfsError::Io(e) => e.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// The errno a front-end should surface for this error.
    pub fn errno(&self) -> libc::c_int {
        match self.kind() {
            VfsError::AlreadyExists => libc::EEXIST,
            VfsError::BadFileDescriptor | VfsError::HandleClosed => libc::EBADF,
            VfsError::NotFound | VfsError::ObjectNotFound | VfsError::DirNotFound => libc::ENOENT,
            VfsError::InvalidArgument => libc::EINVAL,
            VfsError::PermissionDenied => libc::EPERM,
            VfsError::ReadOnly => libc::EROFS,
            VfsError::NotSupported => libc::ENOSYS,
            VfsError::Io(e) => match e.raw_os_error() {
                Some(code) => code,
                None if e.kind() == io::ErrorKind::NotFound => libc::ENOENT,
                None => libc::EIO,
            },
            _ => libc::EIO,
        }
    }
}

pub type Result<T> = std::result::Result<T, VfsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_preserves_kind() {
        let err = VfsError::ObjectNotFound
            .context("fetch failed")
            .context("open RW handle failed to cache file");
        assert!(matches!(err.kind(), VfsError::ObjectNotFound));
        assert!(err.is_not_found());
        assert_eq!(err.errno(), libc::ENOENT);
        let msg = err.to_string();
        assert!(msg.starts_with("open RW handle failed to cache file"));
    }

    #[test]
    fn test_errno_mapping() {
        assert_eq!(VfsError::AlreadyExists.errno(), libc::EEXIST);
        assert_eq!(VfsError::HandleClosed.errno(), libc::EBADF);
        assert_eq!(VfsError::ReadOnly.errno(), libc::EROFS);
        assert_eq!(VfsError::NotSupported.errno(), libc::ENOSYS);
        assert_eq!(VfsError::WriterFailed.errno(), libc::EIO);
    }

    #[test]
    fn test_io_not_found() {
        let err = VfsError::Io(io::Error::from(io::ErrorKind::NotFound));
        assert!(err.is_not_found());
        let err = VfsError::Io(io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(!err.is_not_found());
    }
}
