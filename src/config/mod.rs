use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::VfsError;

/// Policy controlling when cache-backed read/write handles are chosen over
/// the streaming variants. The modes are strictly ordered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum CacheMode {
    /// Never cache; reads stream from the remote, writes upload directly.
    #[default]
    Off,
    /// Cache only files that are already cached or currently open.
    Minimal,
    /// Cache every file opened for writing.
    Writes,
    /// Cache every file opened for reading or writing.
    Full,
}

impl fmt::Display for CacheMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CacheMode::Off => "off",
            CacheMode::Minimal => "minimal",
            CacheMode::Writes => "writes",
            CacheMode::Full => "full",
        })
    }
}

impl FromStr for CacheMode {
    type Err = VfsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "off" => Ok(CacheMode::Off),
            "minimal" => Ok(CacheMode::Minimal),
            "writes" => Ok(CacheMode::Writes),
            "full" => Ok(CacheMode::Full),
            _ => Err(VfsError::Other(format!("unknown cache mode {s:?}"))),
        }
    }
}

/// Resolved VFS configuration.
#[derive(Debug, Clone)]
pub struct Options {
    pub cache_mode: CacheMode,
    /// Refuse every write-intent operation with EROFS.
    pub read_only: bool,
    /// Root directory for the on-disk cache; resolved to a platform cache
    /// dir when unset.
    pub cache_dir: Option<PathBuf>,
    /// Permission bits for cache files.
    pub file_perms: u32,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            cache_mode: CacheMode::Off,
            read_only: false,
            cache_dir: None,
            file_perms: 0o600,
        }
    }
}

impl Options {
    /// The cache root to use, falling back to the platform cache directory.
    pub fn resolve_cache_dir(&self) -> PathBuf {
        if let Some(dir) = &self.cache_dir {
            return dir.clone();
        }
        match directories::ProjectDirs::from("", "", "objfs") {
            Some(dirs) => dirs.cache_dir().to_path_buf(),
            None => std::env::temp_dir().join("objfs-cache"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_mode_ordering() {
        assert!(CacheMode::Off < CacheMode::Minimal);
        assert!(CacheMode::Minimal < CacheMode::Writes);
        assert!(CacheMode::Writes < CacheMode::Full);
        assert!(CacheMode::Writes >= CacheMode::Minimal);
    }

    #[test]
    fn test_cache_mode_round_trip() {
        for mode in [
            CacheMode::Off,
            CacheMode::Minimal,
            CacheMode::Writes,
            CacheMode::Full,
        ] {
            assert_eq!(mode.to_string().parse::<CacheMode>().unwrap(), mode);
        }
        assert!("chunked".parse::<CacheMode>().is_err());
    }

    #[test]
    fn test_explicit_cache_dir_wins() {
        let opt = Options {
            cache_dir: Some(PathBuf::from("/tmp/objfs-test")),
            ..Options::default()
        };
        assert_eq!(opt.resolve_cache_dir(), PathBuf::from("/tmp/objfs-test"));
    }
}
