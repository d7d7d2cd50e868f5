use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::storage::{ListPage, ObjectMeta, ObjectStore, StoreError, StoreResult};

/// Page size for listings, matching what cloud backends return per request.
const LIST_PAGE_SIZE: usize = 1000;

/// Object store rooted at a local directory, used for development and
/// integration tests against a real filesystem.
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: &str) -> StoreResult<Self> {
        let root_path = PathBuf::from(root);
        if !root_path.exists() {
            fs::create_dir_all(&root_path)
                .map_err(|e| StoreError::Permanent(format!("create store root '{root}': {e}")))?;
        }
        let root = fs::canonicalize(&root_path)
            .map_err(|e| StoreError::Permanent(format!("resolve store root '{root}': {e}")))?;
        Ok(Self { root })
    }

    /// Reject keys that could escape the store root.
    fn validate_key(key: &str) -> StoreResult<()> {
        if key.is_empty() {
            return Err(StoreError::Permanent("unsafe store key: empty".into()));
        }
        if key.starts_with('/') || key.contains('\\') {
            return Err(StoreError::Permanent(format!(
                "unsafe store key: '{key}'"
            )));
        }
        for component in Path::new(key).components() {
            if component == Component::ParentDir {
                return Err(StoreError::Permanent(format!(
                    "unsafe store key: parent traversal '{key}'"
                )));
            }
        }
        Ok(())
    }

    fn resolve(&self, key: &str) -> StoreResult<PathBuf> {
        Self::validate_key(key)?;
        Ok(self.root.join(key))
    }

    fn collect_keys(&self, dir: &Path, out: &mut Vec<ObjectMeta>) -> std::io::Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            if meta.is_dir() {
                self.collect_keys(&entry.path(), out)?;
            } else {
                let rel = entry
                    .path()
                    .strip_prefix(&self.root)
                    .expect("entry under root")
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join("/");
                let mod_time = meta.modified().ok().map(DateTime::<Utc>::from);
                out.push(ObjectMeta {
                    key: rel,
                    size: meta.len(),
                    mod_time,
                });
            }
        }
        Ok(())
    }

    fn io_err(op: &str, key: &str, e: std::io::Error) -> StoreError {
        if e.kind() == std::io::ErrorKind::NotFound {
            StoreError::NotFound(key.to_string())
        } else {
            StoreError::Permanent(format!("{op} '{key}': {e}"))
        }
    }
}

impl ObjectStore for LocalStore {
    fn put(&self, key: &str, reader: &mut dyn Read, _size_hint: u64) -> StoreResult<String> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Self::io_err("mkdir for", key, e))?;
        }
        // Write to a sibling temp file so readers never observe a torn object.
        let leaf = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "object".to_string());
        let tmp = path.with_file_name(format!(".{leaf}.stela-put"));
        let written = (|| -> std::io::Result<u64> {
            let mut file = fs::File::create(&tmp)?;
            let n = std::io::copy(reader, &mut file)?;
            file.sync_all()?;
            Ok(n)
        })()
        .map_err(|e| {
            let _ = fs::remove_file(&tmp);
            Self::io_err("write", key, e)
        })?;
        fs::rename(&tmp, &path).map_err(|e| Self::io_err("rename", key, e))?;
        Ok(format!("local-{written}"))
    }

    fn get_from(&self, key: &str, offset: u64) -> StoreResult<Box<dyn Read + Send>> {
        let path = self.resolve(key)?;
        let mut file = fs::File::open(&path).map_err(|e| Self::io_err("open", key, e))?;
        if offset > 0 {
            file.seek(SeekFrom::Start(offset))
                .map_err(|e| Self::io_err("seek", key, e))?;
        }
        Ok(Box::new(file))
    }

    fn list_page(&self, prefix: &str, start_after: Option<&str>) -> StoreResult<ListPage> {
        let mut all = Vec::new();
        self.collect_keys(&self.root.clone(), &mut all)
            .map_err(|e| StoreError::Permanent(format!("list '{prefix}': {e}")))?;
        all.retain(|o| o.key.starts_with(prefix) && !o.key.ends_with(".stela-put"));
        all.sort_by(|a, b| a.key.cmp(&b.key));
        if let Some(after) = start_after {
            all.retain(|o| o.key.as_str() > after);
        }
        let truncated = all.len() > LIST_PAGE_SIZE;
        all.truncate(LIST_PAGE_SIZE);
        Ok(ListPage {
            objects: all,
            truncated,
        })
    }

    fn delete(&self, key: &str) -> StoreResult<()> {
        let path = self.resolve(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Permanent(format!("delete '{key}': {e}"))),
        }
    }

    fn exists(&self, key: &str) -> StoreResult<bool> {
        let path = self.resolve(key)?;
        match fs::metadata(&path) {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::Permanent(format!("stat '{key}': {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::scan_prefix;
    use std::io::Cursor;
    use tempfile::tempdir;

    fn store() -> (tempfile::TempDir, LocalStore) {
        let dir = tempdir().unwrap();
        let store = LocalStore::new(dir.path().to_str().unwrap()).unwrap();
        (dir, store)
    }

    #[test]
    fn put_get_roundtrip() {
        let (_dir, store) = store();
        store
            .put("a/b/c.db", &mut Cursor::new(b"hello".to_vec()), 5)
            .unwrap();
        let mut out = Vec::new();
        store.get("a/b/c.db").unwrap().read_to_end(&mut out).unwrap();
        assert_eq!(out, b"hello");
    }

    #[test]
    fn get_from_offset_skips_bytes() {
        let (_dir, store) = store();
        store
            .put("k", &mut Cursor::new(b"0123456789".to_vec()), 10)
            .unwrap();
        let mut out = Vec::new();
        store.get_from("k", 6).unwrap().read_to_end(&mut out).unwrap();
        assert_eq!(out, b"6789");
    }

    #[test]
    fn missing_object_maps_to_not_found() {
        let (_dir, store) = store();
        assert!(matches!(
            store.get("missing").err().unwrap(),
            StoreError::NotFound(_)
        ));
        assert!(!store.exists("missing").unwrap());
    }

    #[test]
    fn delete_is_idempotent() {
        let (_dir, store) = store();
        store.put("k", &mut Cursor::new(b"x".to_vec()), 1).unwrap();
        store.delete("k").unwrap();
        store.delete("k").unwrap();
        assert!(!store.exists("k").unwrap());
    }

    #[test]
    fn listing_is_prefix_scoped_and_sorted() {
        let (_dir, store) = store();
        for key in ["p/2", "p/1", "q/1", "p/3"] {
            store.put(key, &mut Cursor::new(b"x".to_vec()), 1).unwrap();
        }
        let keys: Vec<String> = scan_prefix(&store, "p/")
            .map(|r| r.unwrap().key)
            .collect();
        assert_eq!(keys, ["p/1", "p/2", "p/3"]);
    }

    #[test]
    fn unsafe_keys_are_rejected() {
        let (_dir, store) = store();
        for key in ["../escape", "/abs", ""] {
            assert!(store.exists(key).is_err(), "key: {key}");
        }
    }

    #[test]
    fn listing_reports_sizes() {
        let (_dir, store) = store();
        store
            .put("sized", &mut Cursor::new(vec![0u8; 1024]), 1024)
            .unwrap();
        let page = store.list_page("sized", None).unwrap();
        assert_eq!(page.objects.len(), 1);
        assert_eq!(page.objects[0].size, 1024);
    }
}
