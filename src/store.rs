/*
 * Copyright (c) 2020 - 2021.  Shoyo Inokuchi.
 * Please refer to github.com/shoyo/jin for more information about this project and its license.
 */

//! Fixed-size page read/write against pooled file handles. The store
//! itself holds no knowledge of relations or logical page ids beyond
//! what it's handed in a [`PhysLoc`] — that mapping lives in
//! `crate::directory`.
//!
//! Concurrency: a manager-wide mutex protects only the handle map
//! (lookup/insertion); each handle carries its own reader/writer lock.
//! Reads acquire a file's shared lock, writes (and the trailing fsync)
//! acquire its exclusive lock. The manager mutex is never held across
//! disk I/O.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::{FileExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use tracing::debug;

use crate::error::StoreError;
use crate::page::{PageId, PhysLoc, RawPage, PAGE_SIZE};

/// Permission bits for a newly created relation file: `rwx r-- ---`.
const FILE_MODE: u32 = 0o740;

fn io_err(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

struct FileHandle {
    file: RwLock<File>,
}

/// Positional page read/write against pooled file handles.
pub struct PageStore {
    handles: Mutex<HashMap<String, Arc<FileHandle>>>,
}

impl Default for PageStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PageStore {
    pub fn new() -> Self {
        Self {
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// Exclusively create a new, empty file at `path`, including any
    /// missing intermediate directories, with mode `rwx r-- ---`.
    /// Fails with [`StoreError::FileAlreadyExists`] if the path is
    /// already registered or already exists on disk.
    pub fn create_file(&self, path: &Path) -> Result<(), StoreError> {
        let key = path_key(path);

        {
            let handles = self.handles.lock().unwrap();
            if handles.contains_key(&key) {
                return Err(StoreError::FileAlreadyExists(path.to_path_buf()));
            }
        }
        if path.exists() {
            return Err(StoreError::FileAlreadyExists(path.to_path_buf()));
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| io_err(path, e))?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .mode(FILE_MODE)
            .open(path)
            .map_err(|e| io_err(path, e))?;
        file.set_permissions(fs::Permissions::from_mode(FILE_MODE))
            .map_err(|e| io_err(path, e))?;

        debug!(path = %path.display(), "created relation file");

        let mut handles = self.handles.lock().unwrap();
        handles.insert(
            key,
            Arc::new(FileHandle {
                file: RwLock::new(file),
            }),
        );
        Ok(())
    }

    /// Close (if open) and remove the file at `path`.
    pub fn delete_file(&self, path: &Path) -> Result<(), StoreError> {
        let key = path_key(path);
        {
            let mut handles = self.handles.lock().unwrap();
            handles.remove(&key);
        }
        if path.exists() {
            fs::remove_file(path).map_err(|e| io_err(path, e))?;
        }
        debug!(path = %path.display(), "deleted relation file");
        Ok(())
    }

    /// Read exactly `PAGE_SIZE` bytes at `loc.offset` from `loc.file`.
    pub fn get_page(&self, page_id: PageId, loc: &PhysLoc) -> Result<RawPage, StoreError> {
        let handle = self.get_handle(Path::new(&loc.file))?;
        let guard = handle.file.read().unwrap();

        let mut bytes = Box::new([0u8; PAGE_SIZE]);
        let read = guard
            .read_at(bytes.as_mut_slice(), loc.offset as u64)
            .map_err(|e| io_err(Path::new(&loc.file), e))?;
        if read != PAGE_SIZE {
            return Err(StoreError::IncompletePageRead {
                expected: PAGE_SIZE,
                actual: read,
            });
        }

        Ok(RawPage::from_bytes(page_id, loc.clone(), bytes))
    }

    /// Write the full `PAGE_SIZE` buffer of `page` at its recorded
    /// location and fsync before returning success.
    pub fn write_page(&self, page: &RawPage) -> Result<(), StoreError> {
        let handle = self.get_handle(Path::new(&page.location.file))?;
        let guard = handle.file.write().unwrap();

        let written = guard
            .write_at(page.as_bytes(), page.location.offset as u64)
            .map_err(|e| io_err(Path::new(&page.location.file), e))?;
        if written != PAGE_SIZE {
            return Err(StoreError::IncompletePageWrite {
                expected: PAGE_SIZE,
                actual: written,
            });
        }

        guard
            .sync_all()
            .map_err(|e| io_err(Path::new(&page.location.file), e))?;
        Ok(())
    }

    /// Look up (opening and registering if necessary) the handle for
    /// `path`. The handle map mutex is held only for the lookup/insert,
    /// never across the open() syscall or any read/write: on a miss, the
    /// lock is dropped before `open()` runs, and if another thread opened
    /// the same path first, that handle wins and this one is discarded.
    fn get_handle(&self, path: &Path) -> Result<Arc<FileHandle>, StoreError> {
        let key = path_key(path);

        {
            let handles = self.handles.lock().unwrap();
            if let Some(handle) = handles.get(&key) {
                return Ok(handle.clone());
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| io_err(path, e))?;
        let handle = Arc::new(FileHandle {
            file: RwLock::new(file),
        });

        let mut handles = self.handles.lock().unwrap();
        let handle = handles.entry(key).or_insert(handle).clone();
        Ok(handle)
    }
}

fn path_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::{PageType, SLOTS_START_OFFSET};

    #[test]
    fn create_file_twice_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rel").join("accounts");
        let store = PageStore::new();
        store.create_file(&path).unwrap();
        assert!(matches!(
            store.create_file(&path),
            Err(StoreError::FileAlreadyExists(_))
        ));
    }

    #[test]
    fn write_then_read_page_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accounts");
        let store = PageStore::new();
        store.create_file(&path).unwrap();

        // Grow the file to hold one page's worth of bytes.
        let loc = PhysLoc::new(path.to_string_lossy().into_owned(), 0);
        let id = PageId::new("accounts", 0);
        let mut page = RawPage::new(id.clone(), loc.clone(), PageType::LEAF);
        page.as_bytes_mut()[SLOTS_START_OFFSET as usize] = 0xAB;
        store.write_page(&page).unwrap();

        let reread = store.get_page(id, &loc).unwrap();
        assert_eq!(reread.as_bytes()[SLOTS_START_OFFSET as usize], 0xAB);
    }

    #[test]
    fn delete_file_closes_the_handle_and_removes_it_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accounts");
        let store = PageStore::new();
        store.create_file(&path).unwrap();
        assert!(path.exists());

        store.delete_file(&path).unwrap();
        assert!(!path.exists());

        // The handle was dropped too: re-creating the same path succeeds.
        store.create_file(&path).unwrap();
    }

    #[test]
    fn reopening_an_existing_store_sees_durable_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accounts");
        {
            let store = PageStore::new();
            store.create_file(&path).unwrap();
            let loc = PhysLoc::new(path.to_string_lossy().into_owned(), 0);
            let id = PageId::new("accounts", 0);
            let mut page = RawPage::new(id, loc, PageType::LEAF);
            page.as_bytes_mut()[10] = 0x42;
            store.write_page(&page).unwrap();
        }
        // Fresh store, fresh handle map: the bytes must still be on disk.
        let store = PageStore::new();
        let loc = PhysLoc::new(path.to_string_lossy().into_owned(), 0);
        let id = PageId::new("accounts", 0);
        let page = store.get_page(id, &loc).unwrap();
        assert_eq!(page.as_bytes()[10], 0x42);
    }
}
