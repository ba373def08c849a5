//! Minimal directory nodes.
//!
//! Directory trees proper belong to the front-end; this carries just the
//! contract the file machine needs: a path, a listing of file nodes, and
//! two accessors that are safe to call with a file lock held.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::remote::{Object, ObjectStore};
use crate::{Result, VfsError};

use super::file::File;
use super::{join_path, new_inode, Vfs};

pub struct Dir {
    vfs: Arc<Vfs>,
    inode: u64,
    state: RwLock<DirState>,
}

struct DirState {
    path: String,
    items: HashMap<String, Arc<File>>,
}

impl Dir {
    /// The root directory; its path is the empty string.
    pub fn root(vfs: &Arc<Vfs>) -> Arc<Dir> {
        Dir::new(vfs.clone(), String::new())
    }

    fn new(vfs: Arc<Vfs>, path: String) -> Arc<Dir> {
        Arc::new(Dir {
            vfs,
            inode: new_inode(),
            state: RwLock::new(DirState {
                path,
                items: HashMap::new(),
            }),
        })
    }

    /// A subdirectory node under this one.
    pub fn subdir(self: &Arc<Self>, leaf: &str) -> Arc<Dir> {
        let path = join_path(&self.path(), leaf);
        Dir::new(self.vfs.clone(), path)
    }

    pub fn inode(&self) -> u64 {
        self.inode
    }

    pub fn path(&self) -> String {
        self.state.read().path.clone()
    }

    /// Lock-free accessor; safe to call with a file lock held.
    pub fn vfs(&self) -> &Arc<Vfs> {
        &self.vfs
    }

    /// Lock-free accessor; safe to call with a file lock held.
    pub fn remote(&self) -> &Arc<dyn ObjectStore> {
        self.vfs.remote()
    }

    /// Insert or refresh a file in the listing.
    pub fn add_object(&self, file: &Arc<File>) {
        let name = file.name();
        self.state.write().items.insert(name, file.clone());
    }

    /// Remove a file from the listing.
    pub fn del_object(&self, name: &str) {
        self.state.write().items.remove(name);
    }

    /// Whether the listing currently holds `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.state.read().items.contains_key(name)
    }

    /// Look up a file, falling back to a remote stat for files not seen yet.
    pub fn lookup(self: &Arc<Self>, leaf: &str) -> Result<Arc<File>> {
        if let Some(file) = self.state.read().items.get(leaf) {
            return Ok(file.clone());
        }
        let path = join_path(&self.path(), leaf);
        match self.vfs.remote().stat(&path)? {
            Some(info) => {
                let object = Object::new(self.vfs.remote().clone(), info);
                let file = File::new(self, Some(object), leaf);
                self.add_object(&file);
                Ok(file)
            }
            None => Err(VfsError::NotFound),
        }
    }

    /// A new file node with no remote object yet. It becomes visible in the
    /// listing once opened with `O_CREAT`.
    pub fn create(self: &Arc<Self>, leaf: &str) -> Result<Arc<File>> {
        if self.vfs.opt().read_only {
            return Err(VfsError::ReadOnly);
        }
        Ok(File::new(self, None, leaf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Options;
    use crate::remote::memory::MemoryStore;
    use std::time::SystemTime;
    use tempfile::tempdir;

    fn setup() -> (Arc<MemoryStore>, Arc<Dir>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let opt = Options {
            cache_dir: Some(dir.path().join("cache")),
            ..Options::default()
        };
        let vfs = Vfs::new(store.clone(), opt).unwrap();
        (store, vfs.root(), dir)
    }

    #[test]
    fn test_lookup_stats_remote() {
        let (store, root, _dir) = setup();
        store.insert("a.txt", b"hello", SystemTime::now());

        let file = root.lookup("a.txt").unwrap();
        assert!(file.exists());
        assert_eq!(file.size(), 5);
        assert_eq!(file.path(), "a.txt");
        // second lookup returns the cached node
        assert_eq!(root.lookup("a.txt").unwrap().inode(), file.inode());
    }

    #[test]
    fn test_lookup_missing() {
        let (_store, root, _dir) = setup();
        assert!(matches!(
            root.lookup("nope.txt").unwrap_err(),
            VfsError::NotFound
        ));
    }

    #[test]
    fn test_add_del_object() {
        let (_store, root, _dir) = setup();
        let file = root.create("new.txt").unwrap();
        assert!(!root.contains("new.txt"));
        root.add_object(&file);
        assert!(root.contains("new.txt"));
        root.del_object("new.txt");
        assert!(!root.contains("new.txt"));
    }

    #[test]
    fn test_subdir_paths() {
        let (_store, root, _dir) = setup();
        let sub = root.subdir("music");
        assert_eq!(sub.path(), "music");
        let deep = sub.subdir("live");
        assert_eq!(deep.path(), "music/live");
        let file = deep.create("track.flac").unwrap();
        assert_eq!(file.path(), "music/live/track.flac");
    }
}
