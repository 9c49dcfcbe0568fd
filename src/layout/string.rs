/*
 * Copyright (c) 2020 - 2021.  Shoyo Inokuchi.
 * Please refer to github.com/shoyo/jin for more information about this project and its license.
 */

//! On-page encoding of variable-length string fields: a 14-byte metadata
//! record (`data_offset | length | overflow_page_id | total_length |
//! overflow_slot_index`) plus the inline payload bytes it points at. See
//! spec.md §3/§6.

use crate::codec;
use crate::error::{CodecError, OverflowReadError};
use crate::page::PageId;

/// On-page size of a string field's metadata record.
pub const STRING_META_SIZE: u16 = 14;

const DATA_OFFSET_OFFSET: usize = 0;
const LENGTH_OFFSET: usize = 2;
const OVERFLOW_PAGE_ID_OFFSET: usize = 4;
const TOTAL_LENGTH_OFFSET: usize = 8;
const OVERFLOW_SLOT_INDEX_OFFSET: usize = 12;

/// Where the continuation of an overflowing string lives: a `Values`
/// page in the same relation, at a given slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverflowRef {
    pub page_id: u32,
    pub slot_index: u16,
    pub total_length: u32,
}

/// What's stored inline in a tuple for a string field: the metadata
/// record, decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StringMeta {
    pub data_offset: u16,
    pub length: u16,
    pub overflow: Option<OverflowRef>,
}

/// Everything needed to write a string field: the prefix bytes actually
/// stored inline (the whole string, if it fits; otherwise the prefix),
/// where they go, and overflow continuation info if any. The caller is
/// responsible for computing `data_offset` (and shifting any cells after
/// it if this write lengthens the payload) before calling
/// [`write_string_field`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteStringData {
    pub inline_bytes: Vec<u8>,
    pub data_offset: u16,
    pub overflow: Option<OverflowRef>,
}

/// Read the 14-byte metadata record at `meta_offset`.
pub fn read_string_meta(buffer: &[u8], meta_offset: u16) -> Result<StringMeta, CodecError> {
    let off = meta_offset as usize;
    let data_offset = codec::read_u16(buffer, off + DATA_OFFSET_OFFSET)?;
    let length = codec::read_u16(buffer, off + LENGTH_OFFSET)?;
    let overflow_page_id = codec::read_u32(buffer, off + OVERFLOW_PAGE_ID_OFFSET)?;

    let overflow = if overflow_page_id != 0 {
        let total_length = codec::read_u32(buffer, off + TOTAL_LENGTH_OFFSET)?;
        let slot_index = codec::read_u16(buffer, off + OVERFLOW_SLOT_INDEX_OFFSET)?;
        Some(OverflowRef {
            page_id: overflow_page_id,
            slot_index,
            total_length,
        })
    } else {
        None
    };

    Ok(StringMeta {
        data_offset,
        length,
        overflow,
    })
}

/// Write the 14-byte metadata record at `meta_offset` and the inline
/// payload bytes at `data.data_offset`.
pub fn write_string_field(
    buffer: &mut [u8],
    meta_offset: u16,
    data: &WriteStringData,
) -> Result<(), CodecError> {
    let off = meta_offset as usize;
    codec::write_u16(buffer, off + DATA_OFFSET_OFFSET, data.data_offset)?;
    codec::write_u16(buffer, off + LENGTH_OFFSET, data.inline_bytes.len() as u16)?;

    let (overflow_page_id, total_length, slot_index) = match &data.overflow {
        Some(ov) => (ov.page_id, ov.total_length, ov.slot_index),
        None => (0, 0, 0),
    };
    codec::write_u32(buffer, off + OVERFLOW_PAGE_ID_OFFSET, overflow_page_id)?;
    codec::write_u32(buffer, off + TOTAL_LENGTH_OFFSET, total_length)?;
    codec::write_u16(buffer, off + OVERFLOW_SLOT_INDEX_OFFSET, slot_index)?;

    codec::write_bytes(buffer, data.data_offset as usize, &data.inline_bytes)?;
    Ok(())
}

/// Read the inline bytes a [`StringMeta`] describes (the whole string if
/// it fit, otherwise just the prefix — the caller must fetch the
/// continuation from `overflow` itself if `total_length` exceeds
/// `length`).
pub fn read_inline_bytes(buffer: &[u8], meta: &StringMeta) -> Result<Vec<u8>, CodecError> {
    codec::read_bytes(buffer, meta.data_offset as usize, meta.length as usize)
}

/// Assemble the full logical string for a field whose value overflowed
/// into a continuation page, given a callback that can fetch a page's
/// bytes by id within the same relation. Returns just the inline prefix
/// decoded as UTF-8 if there is no overflow. A failed continuation fetch
/// is propagated, never swallowed into a silently truncated value.
pub fn assemble_overflow_string(
    relation: &str,
    inline_prefix: &[u8],
    meta: &StringMeta,
    mut fetch_values_page: impl FnMut(PageId, u16) -> Result<Vec<u8>, CodecError>,
) -> Result<String, OverflowReadError> {
    match &meta.overflow {
        None => Ok(String::from_utf8(inline_prefix.to_vec())?),
        Some(ov) => {
            let mut full = inline_prefix.to_vec();
            let tail = fetch_values_page(PageId::new(relation, ov.page_id), ov.slot_index)?;
            full.extend(tail);
            Ok(String::from_utf8(full)?)
        }
    }
}
