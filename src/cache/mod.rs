//! Whole-file on-disk cache for remote objects.
//!
//! Cached copies live under a root directory mirroring the remote path
//! layout. Files are fetched whole, written back whole, and tracked with a
//! refcount of open handles per path. The handle layer owns all
//! serialization; the cache itself only guards its bookkeeping map.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::remote::{Object, ObjectStore};
use crate::{Result, VfsError};

pub struct Cache {
    remote: Arc<dyn ObjectStore>,
    root: PathBuf,
    items: Mutex<HashMap<String, Item>>,
}

#[derive(Default)]
struct Item {
    opens: i32,
}

impl Cache {
    pub fn new(remote: Arc<dyn ObjectStore>, root: PathBuf) -> Result<Cache> {
        fs::create_dir_all(&root)?;
        debug!(root = %root.display(), "cache root ready");
        Ok(Cache {
            remote,
            root,
            items: Mutex::new(HashMap::new()),
        })
    }

    /// Where the cached copy of `path` lives on disk.
    pub fn to_os_path(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }

    /// Record an open handle on `path`. Purely bookkeeping, independent of
    /// OS-level handles.
    pub fn open(&self, path: &str) {
        self.items.lock().entry(path.to_string()).or_default().opens += 1;
    }

    /// Drop one open from `path`.
    pub fn close(&self, path: &str) {
        let mut items = self.items.lock();
        match items.get_mut(path) {
            Some(item) => {
                item.opens -= 1;
                if item.opens <= 0 {
                    items.remove(path);
                }
            }
            None => warn!(path, "cache close without matching open"),
        }
    }

    /// Number of open handles recorded against `path`.
    pub fn opens(&self, path: &str) -> i32 {
        self.items.lock().get(path).map_or(0, |item| item.opens)
    }

    /// Whether a cached copy of `path` exists on disk.
    pub fn exists(&self, path: &str) -> bool {
        self.to_os_path(path).is_file()
    }

    /// Ensure the on-disk parent directory for `path` exists.
    pub fn mkdir(&self, path: &str) -> Result<()> {
        if let Some(parent) = self.to_os_path(path).parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(())
    }

    /// Make sure the cached copy of `path` is up to date with `o`,
    /// refetching when the local copy is missing or stale. Idempotent.
    pub fn check(&self, o: &Object, path: &str) -> Result<()> {
        let os_path = self.to_os_path(path);
        let meta = match fs::metadata(&os_path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return self.fetch(o, path),
            Err(e) => return Err(e.into()),
        };
        let fresh = meta.len() as i64 == o.size() && meta.modified().ok() == Some(o.mod_time());
        if fresh {
            return Ok(());
        }
        debug!(path, "cached copy is stale, refetching");
        self.fetch(o, path)
    }

    /// Download `o` into the cache, overwriting any existing copy. The
    /// cached file's modtime is set to the object's so a later `check` can
    /// compare them.
    pub fn fetch(&self, o: &Object, path: &str) -> Result<()> {
        self.mkdir(path)?;
        let os_path = self.to_os_path(path);
        let mut reader = o.open()?;
        let mut out = fs::File::create(&os_path)?;
        let n = io::copy(&mut reader, &mut out)?;
        out.set_times(fs::FileTimes::new().set_modified(o.mod_time()))?;
        debug!(path, size = n, "fetched object into cache");
        Ok(())
    }

    /// Upload the cached copy of `path` to the remote, returning the new
    /// object. The upload carries the cache file's modtime.
    pub fn store(&self, path: &str) -> Result<Object> {
        let os_path = self.to_os_path(path);
        let mut file = fs::File::open(&os_path)
            .map_err(|e| VfsError::Io(e).context("failed to open cache file for upload"))?;
        let mod_time = file
            .metadata()
            .and_then(|m| m.modified())
            .unwrap_or_else(|_| SystemTime::now());
        let info = self.remote.put(path, &mut file, mod_time)?;
        debug!(path, size = info.size, "transferred cache file to remote");
        Ok(Object::new(self.remote.clone(), info))
    }

    /// Move the cached copy (and its open refcount) to a new path. A
    /// missing copy is not an error.
    pub fn rename(&self, old: &str, new: &str) -> Result<()> {
        let old_os = self.to_os_path(old);
        if old_os.is_file() {
            self.mkdir(new)?;
            fs::rename(&old_os, self.to_os_path(new))?;
        }
        let mut items = self.items.lock();
        if let Some(item) = items.remove(old) {
            items.entry(new.to_string()).or_default().opens += item.opens;
        }
        Ok(())
    }

    /// Delete the cached copy of `path`, if any. Open refcounts are left
    /// alone; outstanding handles still close them.
    pub fn remove(&self, path: &str) {
        let os_path = self.to_os_path(path);
        match fs::remove_file(&os_path) {
            Ok(()) => debug!(path, "removed cached copy"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path, error = %e, "failed to remove cached copy"),
        }
    }

    /// Set the cached copy's modtime. Failures are logged, not fatal.
    pub fn set_mod_time(&self, path: &str, mod_time: SystemTime) {
        let os_path = self.to_os_path(path);
        let res = fs::OpenOptions::new()
            .write(true)
            .open(&os_path)
            .and_then(|f| f.set_times(fs::FileTimes::new().set_modified(mod_time)));
        if let Err(e) = res {
            debug!(path, error = %e, "failed to set cache file modtime");
        }
    }
}
