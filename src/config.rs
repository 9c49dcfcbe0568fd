/*
 * Copyright (c) 2020 - 2021.  Shoyo Inokuchi.
 * Please refer to github.com/shoyo/jin for more information about this project and its license.
 */

//! Explicit construction surface for the storage substrate. There are no
//! environment variables or CLI flags in scope here (spec.md §6) — a
//! [`StorageConfig`] is a plain struct the embedding program builds
//! itself and hands to [`Storage::new`], mirroring the teacher's
//! `DiskManager::new(filename)` / `BufferManager::new(buffer_size, ...)`
//! explicit-construction style rather than a process-global singleton.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::debug;

use crate::buffer::{BufferManager, DEFAULT_CAPACITY};
use crate::directory::PageDirectory;
use crate::error::StorageError;
use crate::freespace::FreeSpaceManager;
use crate::store::PageStore;

/// Construction parameters for a [`Storage`] instance. Page size is
/// fixed at compile time (`crate::page::PAGE_SIZE`) per the Non-goals in
/// spec.md §1 — it is not a configuration knob.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub root_path: PathBuf,
    pub buffer_capacity: usize,
}

impl StorageConfig {
    pub fn new(root_path: impl Into<PathBuf>) -> Self {
        Self {
            root_path: root_path.into(),
            buffer_capacity: DEFAULT_CAPACITY,
        }
    }

    pub fn with_buffer_capacity(mut self, buffer_capacity: usize) -> Self {
        self.buffer_capacity = buffer_capacity;
        self
    }
}

/// Wires together the page store, directory, buffer manager, and
/// free-space manager that make up the storage substrate, and drives
/// the relation-to-file registration rules from spec.md §3: a main
/// relation `R` gets a primary file `R` plus a free-space sidecar
/// `R_fsm`; each index `R_indexY` gets its own sidecar `R_indexY_fsm`.
/// Each of these is registered as an independent relation in the
/// directory.
pub struct Storage {
    pub store: Arc<PageStore>,
    pub directory: Arc<PageDirectory>,
    pub buffer: BufferManager,
    pub free_space: FreeSpaceManager,
}

impl Storage {
    pub fn new(config: StorageConfig) -> Self {
        let store = Arc::new(PageStore::new());
        let directory = Arc::new(PageDirectory::new(config.root_path));
        let buffer = BufferManager::with_capacity(store.clone(), directory.clone(), config.buffer_capacity);
        Self {
            store,
            directory,
            buffer,
            free_space: FreeSpaceManager::new(),
        }
    }

    /// Stand up a brand-new main relation: register `relation` and its
    /// `relation_fsm` sidecar in the directory, create both backing
    /// files on disk, and initialize an empty free-space tree for the
    /// main relation.
    pub fn create_relation(&self, relation: &str) -> Result<(), StorageError> {
        self.create_file_pair(relation, relation)?;
        self.free_space.init(relation);
        debug!(relation, "created main relation");
        Ok(())
    }

    /// Stand up an index relation `{relation}_{index_name}` under the
    /// same main relation subtree, with its own free-space sidecar.
    pub fn create_index(&self, relation: &str, index_name: &str) -> Result<(), StorageError> {
        let index_relation = format!("{relation}_{index_name}");
        self.create_file_pair(relation, &index_relation)?;
        self.free_space.init(&index_relation);
        debug!(relation = %index_relation, main_relation = relation, "created index relation");
        Ok(())
    }

    fn create_file_pair(&self, main_relation: &str, relation: &str) -> Result<(), StorageError> {
        let path = self.directory.register_file(main_relation, relation)?;
        self.store.create_file(&path)?;

        let fsm_relation = format!("{relation}_fsm");
        let fsm_path = self.directory.register_file(main_relation, &fsm_relation)?;
        self.store.create_file(&fsm_path)?;
        Ok(())
    }
}
