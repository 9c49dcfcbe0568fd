/*
 * Copyright (c) 2020 - 2021.  Shoyo Inokuchi.
 * Please refer to github.com/shoyo/jin for more information about this project and its license.
 */

//! Per-subsystem error types. Each subsystem returns its own enum rather
//! than a single crate-wide error, mirroring the narrow `BufferError` /
//! `BufferFrameError` split already used by the buffer manager.

use std::io;
use std::path::PathBuf;

use crate::page::PageId;

/// Errors from the bounded byte codec (`crate::codec`).
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("access at offset {offset} of width {width} is out of bounds for a buffer of length {len}")]
    OutOfBounds {
        offset: usize,
        width: usize,
        len: usize,
    },
}

/// Errors from the page store (`crate::store`).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("file already exists: {0}")]
    FileAlreadyExists(PathBuf),

    #[error("incomplete page read: expected {expected} bytes, got {actual}")]
    IncompletePageRead { expected: usize, actual: usize },

    #[error("incomplete page write: expected {expected} bytes, wrote {actual}")]
    IncompletePageWrite { expected: usize, actual: usize },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Errors from the page directory (`crate::directory`).
#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("relation already exists: {0}")]
    RelationAlreadyExists(String),

    #[error("relation does not exist: {0}")]
    RelationNotExists(String),

    #[error("page already exists: {0}")]
    PageAlreadyExists(PageId),

    #[error("page not found: {0}")]
    PageNotFound(PageId),
}

/// Errors from the schema/layout compiler and field I/O (`crate::layout`).
#[derive(Debug, thiserror::Error)]
pub enum LayoutError {
    #[error("field not found: {0}")]
    FieldNotFound(String),

    #[error("unknown field type")]
    UnknownFieldType,

    #[error("wrong field type for field {field}")]
    WrongFieldType { field: String },

    #[error("field {0} is not nullable")]
    NotNullable(String),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Errors from assembling an overflowing string field's full value
/// (`crate::layout::string::assemble_overflow_string`): either the
/// continuation fetch failed, or the assembled bytes aren't valid
/// UTF-8. Neither is swallowed — a failed fetch must not silently
/// return a truncated value.
#[derive(Debug, thiserror::Error)]
pub enum OverflowReadError {
    #[error("failed to fetch overflow continuation: {0}")]
    Fetch(#[from] CodecError),

    #[error("overflow string is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
}

/// Errors from the buffer manager (`crate::buffer`).
#[derive(Debug, thiserror::Error)]
pub enum BufferError {
    #[error("no frame available for eviction")]
    NoFrameAvailable,

    #[error(transparent)]
    Directory(#[from] DirectoryError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors from the free-space map (`crate::freespace`).
#[derive(Debug, thiserror::Error)]
pub enum FreeSpaceError {
    #[error("no page with sufficient free space for request of {0} bytes")]
    NoSpace(u16),

    #[error("relation does not exist: {0}")]
    RelationNotExists(String),
}

/// Errors from the top-level storage facade (`crate::config`), which
/// composes the directory and page store to stand up a relation's full
/// file subtree (main file, indexes, free-space sidecars).
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error(transparent)]
    Directory(#[from] DirectoryError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
