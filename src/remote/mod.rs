//! Remote object storage facade.
//!
//! Backends support only whole-object transfer; random access over them is
//! bridged by the cache layer above.

pub mod memory;

use std::fmt;
use std::io::Read;
use std::sync::Arc;
use std::time::SystemTime;

use crate::Result;

/// Metadata snapshot for one remote object.
#[derive(Debug, Clone)]
pub struct ObjectInfo {
    pub path: String,
    pub size: i64,
    pub mod_time: SystemTime,
}

/// A remote storage backend holding whole objects addressed by path.
pub trait ObjectStore: Send + Sync {
    /// Stat a single object; `Ok(None)` when it does not exist.
    fn stat(&self, path: &str) -> Result<Option<ObjectInfo>>;

    /// Open an object for a sequential whole-content read.
    fn get(&self, path: &str) -> Result<Box<dyn Read + Send>>;

    /// Upload a whole object, overwriting any existing one.
    fn put(&self, path: &str, data: &mut dyn Read, mod_time: SystemTime) -> Result<ObjectInfo>;

    /// Server-side move, overwriting the destination.
    fn move_object(&self, from: &str, to: &str) -> Result<ObjectInfo>;

    /// Delete an object.
    fn remove(&self, path: &str) -> Result<()>;

    /// Set an object's modification time. Backends without per-object
    /// modtimes fail with `CantSetModTime`, which callers treat as benign.
    fn set_mod_time(&self, path: &str, mod_time: SystemTime) -> Result<()>;

    /// Whether the backend can rename objects without a re-upload.
    fn supports_move(&self) -> bool {
        true
    }
}

/// Handle to one remote object: a metadata snapshot bound to its store.
#[derive(Clone)]
pub struct Object {
    store: Arc<dyn ObjectStore>,
    info: ObjectInfo,
}

impl Object {
    pub fn new(store: Arc<dyn ObjectStore>, info: ObjectInfo) -> Object {
        Object { store, info }
    }

    /// The object's path on the remote.
    pub fn remote(&self) -> &str {
        &self.info.path
    }

    pub fn size(&self) -> i64 {
        self.info.size
    }

    pub fn mod_time(&self) -> SystemTime {
        self.info.mod_time
    }

    /// Open the object's content for reading.
    pub fn open(&self) -> Result<Box<dyn Read + Send>> {
        self.store.get(&self.info.path)
    }

    pub fn set_mod_time(&mut self, mod_time: SystemTime) -> Result<()> {
        self.store.set_mod_time(&self.info.path, mod_time)?;
        self.info.mod_time = mod_time;
        Ok(())
    }

    pub fn remove(&self) -> Result<()> {
        self.store.remove(&self.info.path)
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Object")
            .field("path", &self.info.path)
            .field("size", &self.info.size)
            .field("mod_time", &self.info.mod_time)
            .finish()
    }
}
