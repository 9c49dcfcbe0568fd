/*
 * Copyright (c) 2020 - 2021.  Shoyo Inokuchi.
 * Please refer to github.com/shoyo/jin for more information about this project and its license.
 */

//! Mapping from relations to their backing files, and from logical page
//! ids to physical `(file, offset)` locations. The directory performs no
//! I/O of its own — it only ever hands back paths and offsets for the
//! page store to act on.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;

use crate::error::DirectoryError;
use crate::page::{PageId, PhysLoc, PAGE_SIZE};

struct RelationEntry {
    main_relation: String,
    path: PathBuf,
}

/// Relation-to-file and page-to-offset lookups, guarded by a
/// shared-read/exclusive-write discipline.
pub struct PageDirectory {
    root_path: PathBuf,
    relations: RwLock<HashMap<String, RelationEntry>>,
    pages: RwLock<HashMap<PageId, PhysLoc>>,
}

impl PageDirectory {
    pub fn new(root_path: impl Into<PathBuf>) -> Self {
        Self {
            root_path: root_path.into(),
            relations: RwLock::new(HashMap::new()),
            pages: RwLock::new(HashMap::new()),
        }
    }

    /// Register `relation` as a file under `main_relation`'s directory
    /// (`rootPath/mainRelation/relation`) and return its path. A
    /// relation may not be registered twice.
    pub fn register_file(
        &self,
        main_relation: &str,
        relation: &str,
    ) -> Result<PathBuf, DirectoryError> {
        let mut relations = self.relations.write().unwrap();
        if relations.contains_key(relation) {
            return Err(DirectoryError::RelationAlreadyExists(relation.to_string()));
        }

        let path = self.root_path.join(main_relation).join(relation);
        relations.insert(
            relation.to_string(),
            RelationEntry {
                main_relation: main_relation.to_string(),
                path: path.clone(),
            },
        );
        Ok(path)
    }

    /// Drop the registration for `relation`. Does not touch pages
    /// previously registered under it.
    pub fn unregister_file(&self, relation: &str) {
        let mut relations = self.relations.write().unwrap();
        relations.remove(relation);
    }

    /// Return the registered file path for `relation`, if any.
    pub fn file_path(&self, relation: &str) -> Option<PathBuf> {
        let relations = self.relations.read().unwrap();
        relations.get(relation).map(|entry| entry.path.clone())
    }

    /// Return the main relation `relation` is registered under, if any.
    pub fn main_relation(&self, relation: &str) -> Option<String> {
        let relations = self.relations.read().unwrap();
        relations
            .get(relation)
            .map(|entry| entry.main_relation.clone())
    }

    /// Bind `page_id` to a physical location at `offset` bytes into its
    /// relation's file. Fails if the relation isn't registered or the
    /// page id is already bound.
    pub fn register_page(
        &self,
        page_id: PageId,
        offset: u32,
    ) -> Result<PhysLoc, DirectoryError> {
        let path = {
            let relations = self.relations.read().unwrap();
            relations
                .get(&page_id.relation)
                .map(|entry| entry.path.clone())
                .ok_or_else(|| DirectoryError::RelationNotExists(page_id.relation.clone()))?
        };

        let mut pages = self.pages.write().unwrap();
        if pages.contains_key(&page_id) {
            return Err(DirectoryError::PageAlreadyExists(page_id));
        }

        let loc = PhysLoc::new(path.to_string_lossy().into_owned(), offset);
        pages.insert(page_id, loc.clone());
        Ok(loc)
    }

    /// Unbind `page_id`. A no-op if it wasn't registered.
    pub fn unregister_page(&self, page_id: &PageId) {
        let mut pages = self.pages.write().unwrap();
        pages.remove(page_id);
    }

    /// Look up the physical location of `page_id`.
    pub fn get_page_loc(&self, page_id: &PageId) -> Result<PhysLoc, DirectoryError> {
        let pages = self.pages.read().unwrap();
        pages
            .get(page_id)
            .cloned()
            .ok_or_else(|| DirectoryError::PageNotFound(page_id.clone()))
    }

    /// The byte offset one past the highest page currently registered
    /// for `relation`, i.e. where the next page should be appended.
    /// Returns `SLOTS_START_OFFSET`-free offset 0 if the relation has no
    /// pages yet.
    pub fn next_page_offset(&self, relation: &str) -> u32 {
        let pages = self.pages.read().unwrap();
        pages
            .iter()
            .filter(|(id, _)| id.relation == relation)
            .map(|(_, loc)| loc.offset + PAGE_SIZE as u32)
            .max()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn register_file_builds_posix_style_path() {
        let dir = PageDirectory::new("/var/db");
        let path = dir.register_file("accounts", "accounts_idx1").unwrap();
        assert_eq!(path, Path::new("/var/db/accounts/accounts_idx1"));
    }

    #[test]
    fn registering_the_same_relation_twice_fails() {
        let dir = PageDirectory::new("/var/db");
        dir.register_file("accounts", "accounts").unwrap();
        assert!(matches!(
            dir.register_file("accounts", "accounts"),
            Err(DirectoryError::RelationAlreadyExists(_))
        ));
    }

    #[test]
    fn register_page_requires_a_registered_relation() {
        let dir = PageDirectory::new("/var/db");
        let id = PageId::new("accounts", 0);
        assert!(matches!(
            dir.register_page(id, 0),
            Err(DirectoryError::RelationNotExists(_))
        ));
    }

    #[test]
    fn register_page_twice_fails() {
        let dir = PageDirectory::new("/var/db");
        dir.register_file("accounts", "accounts").unwrap();
        let id = PageId::new("accounts", 0);
        dir.register_page(id.clone(), 0).unwrap();
        assert!(matches!(
            dir.register_page(id, PAGE_SIZE as u32),
            Err(DirectoryError::PageAlreadyExists(_))
        ));
    }

    #[test]
    fn get_page_loc_roundtrips() {
        let dir = PageDirectory::new("/var/db");
        dir.register_file("accounts", "accounts").unwrap();
        let id = PageId::new("accounts", 3);
        let loc = dir.register_page(id.clone(), 3 * PAGE_SIZE as u32).unwrap();
        assert_eq!(dir.get_page_loc(&id).unwrap(), loc);
    }

    #[test]
    fn unregister_file_allows_re_registration_and_drops_the_lookup() {
        let dir = PageDirectory::new("/var/db");
        dir.register_file("accounts", "accounts").unwrap();
        dir.unregister_file("accounts");
        assert!(dir.file_path("accounts").is_none());
        // Since the registration is gone, registering it again succeeds.
        dir.register_file("accounts", "accounts").unwrap();
    }

    #[test]
    fn unregister_page_is_a_noop_when_not_registered() {
        let dir = PageDirectory::new("/var/db");
        let id = PageId::new("accounts", 0);
        dir.unregister_page(&id);
    }

    #[test]
    fn unregister_page_drops_the_location_and_allows_re_registration() {
        let dir = PageDirectory::new("/var/db");
        dir.register_file("accounts", "accounts").unwrap();
        let id = PageId::new("accounts", 0);
        dir.register_page(id.clone(), 0).unwrap();
        dir.unregister_page(&id);
        assert!(matches!(
            dir.get_page_loc(&id),
            Err(DirectoryError::PageNotFound(_))
        ));
        dir.register_page(id, PAGE_SIZE as u32).unwrap();
    }
}
