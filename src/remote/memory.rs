//! In-memory object store, the reference backend and the test double for
//! the writeback paths.

use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use parking_lot::Mutex;
use tracing::debug;

use super::{ObjectInfo, ObjectStore};
use crate::{Result, VfsError};

#[derive(Clone)]
struct Entry {
    data: Vec<u8>,
    mod_time: SystemTime,
}

/// Object store holding every object in process memory.
#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<HashMap<String, Entry>>,
    puts: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }

    /// Number of uploads performed, for write-path accounting.
    pub fn put_count(&self) -> u64 {
        self.puts.load(Ordering::SeqCst)
    }

    /// Raw object bytes; `None` when absent.
    pub fn contents(&self, path: &str) -> Option<Vec<u8>> {
        self.objects.lock().get(path).map(|e| e.data.clone())
    }

    /// Seed an object directly, bypassing the upload path.
    pub fn insert(&self, path: &str, data: &[u8], mod_time: SystemTime) {
        self.objects.lock().insert(
            path.to_string(),
            Entry {
                data: data.to_vec(),
                mod_time,
            },
        );
    }

    fn info(path: &str, entry: &Entry) -> ObjectInfo {
        ObjectInfo {
            path: path.to_string(),
            size: entry.data.len() as i64,
            mod_time: entry.mod_time,
        }
    }
}

impl ObjectStore for MemoryStore {
    fn stat(&self, path: &str) -> Result<Option<ObjectInfo>> {
        Ok(self
            .objects
            .lock()
            .get(path)
            .map(|e| MemoryStore::info(path, e)))
    }

    fn get(&self, path: &str) -> Result<Box<dyn Read + Send>> {
        match self.objects.lock().get(path) {
            Some(e) => Ok(Box::new(Cursor::new(e.data.clone()))),
            None => Err(VfsError::ObjectNotFound),
        }
    }

    fn put(&self, path: &str, data: &mut dyn Read, mod_time: SystemTime) -> Result<ObjectInfo> {
        let mut buf = Vec::new();
        data.read_to_end(&mut buf)?;
        let entry = Entry {
            data: buf,
            mod_time,
        };
        let info = MemoryStore::info(path, &entry);
        self.objects.lock().insert(path.to_string(), entry);
        self.puts.fetch_add(1, Ordering::SeqCst);
        debug!(path, size = info.size, "stored object");
        Ok(info)
    }

    fn move_object(&self, from: &str, to: &str) -> Result<ObjectInfo> {
        let mut objects = self.objects.lock();
        let entry = objects.remove(from).ok_or(VfsError::ObjectNotFound)?;
        let info = MemoryStore::info(to, &entry);
        objects.insert(to.to_string(), entry);
        debug!(from, to, "moved object");
        Ok(info)
    }

    fn remove(&self, path: &str) -> Result<()> {
        match self.objects.lock().remove(path) {
            Some(_) => Ok(()),
            None => Err(VfsError::ObjectNotFound),
        }
    }

    fn set_mod_time(&self, path: &str, mod_time: SystemTime) -> Result<()> {
        match self.objects.lock().get_mut(path) {
            Some(e) => {
                e.mod_time = mod_time;
                Ok(())
            }
            None => Err(VfsError::ObjectNotFound),
        }
    }
}
