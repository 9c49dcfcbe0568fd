/*
 * Copyright (c) 2020 - 2021.  Shoyo Inokuchi.
 * Please refer to github.com/shoyo/jin for more information about this project and its license.
 */

//! Page identity, physical location, the fixed-size raw page, and its
//! 9-byte on-page header. The slotted-page codec (slots and cells) lives
//! in `slotted`.

pub mod slotted;

use std::fmt;

use crate::codec;
use crate::error::CodecError;

/// Every page is exactly this many bytes, on disk and in memory.
pub const PAGE_SIZE: usize = 4096;

/// Header layout, see spec.md §3.
const PAGE_TYPE_OFFSET: usize = 0;
const SLOTS_COUNT_OFFSET: usize = 1;
const FREE_SPACE_OFFSET: usize = 3;
const SLOTS_END_OFFSET_OFFSET: usize = 5;
const CELLS_END_OFFSET_OFFSET: usize = 7;
pub const HEADER_SIZE: usize = 9;

/// First byte offset at which the slot array may place a slot.
pub const SLOTS_START_OFFSET: u16 = HEADER_SIZE as u16;

bitflags::bitflags! {
    /// Bit flags describing what a page is used for.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageType: u8 {
        const ROOT = 1;
        const INTERNAL = 2;
        const LEAF = 4;
        const VALUES = 8;
    }
}

/// The identity of a logical page: which relation's file it belongs to,
/// and its id within that relation. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PageId {
    pub relation: String,
    pub id: u32,
}

impl PageId {
    pub fn new(relation: impl Into<String>, id: u32) -> Self {
        Self {
            relation: relation.into(),
            id,
        }
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.relation, self.id)
    }
}

/// The physical location of a page: a file and a `PAGE_SIZE`-aligned byte
/// offset within it. Assigned once by the directory and never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PhysLoc {
    pub file: String,
    pub offset: u32,
}

impl PhysLoc {
    pub fn new(file: impl Into<String>, offset: u32) -> Self {
        Self {
            file: file.into(),
            offset,
        }
    }
}

/// The on-page header: byte 0 is a `PageType` bitflag set, followed by
/// four big-endian `u16` fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageHeader {
    pub page_type: PageType,
    pub slots_count: u16,
    pub free_space: u16,
    pub slots_end_offset: u16,
    pub cells_end_offset: u16,
}

impl PageHeader {
    /// A freshly allocated page's header: no slots, no cells, and all of
    /// the space between the header and the page tail is free.
    pub fn empty(page_type: PageType) -> Self {
        Self {
            page_type,
            slots_count: 0,
            free_space: PAGE_SIZE as u16 - SLOTS_START_OFFSET,
            slots_end_offset: SLOTS_START_OFFSET,
            cells_end_offset: PAGE_SIZE as u16,
        }
    }
}

/// Parse the 9-byte header out of `page`. Rejects a header whose
/// `slots_end_offset` exceeds its `cells_end_offset`, since that would
/// describe a slot array overlapping the cell heap.
pub fn load_page_header(page: &[u8]) -> Result<PageHeader, CodecError> {
    let page_type_byte = codec::read_u8(page, PAGE_TYPE_OFFSET)?;
    let page_type = PageType::from_bits_truncate(page_type_byte);
    let slots_count = codec::read_u16(page, SLOTS_COUNT_OFFSET)?;
    let free_space = codec::read_u16(page, FREE_SPACE_OFFSET)?;
    let slots_end_offset = codec::read_u16(page, SLOTS_END_OFFSET_OFFSET)?;
    let cells_end_offset = codec::read_u16(page, CELLS_END_OFFSET_OFFSET)?;

    if slots_end_offset > cells_end_offset {
        // A corrupt header: the slot array would overlap the cell heap.
        // Bounds violations like this are reported through the same
        // codec error the rest of this module uses rather than a new
        // variant, since the caller's remedy is identical: reject the page.
        return Err(CodecError::OutOfBounds {
            offset: slots_end_offset as usize,
            width: 0,
            len: cells_end_offset as usize,
        });
    }

    Ok(PageHeader {
        page_type,
        slots_count,
        free_space,
        slots_end_offset,
        cells_end_offset,
    })
}

/// Serialize `header` into the first 9 bytes of `page`.
pub fn write_page_header(page: &mut [u8], header: &PageHeader) -> Result<(), CodecError> {
    codec::write_u8(page, PAGE_TYPE_OFFSET, header.page_type.bits())?;
    codec::write_u16(page, SLOTS_COUNT_OFFSET, header.slots_count)?;
    codec::write_u16(page, FREE_SPACE_OFFSET, header.free_space)?;
    codec::write_u16(page, SLOTS_END_OFFSET_OFFSET, header.slots_end_offset)?;
    codec::write_u16(page, CELLS_END_OFFSET_OFFSET, header.cells_end_offset)?;
    Ok(())
}

/// An owned, fixed-size page: its bytes, its logical identity, and its
/// physical location. The header is parsed on demand and cached; callers
/// that mutate the header bytes directly must call
/// [`RawPage::invalidate_header_cache`].
pub struct RawPage {
    pub id: PageId,
    pub location: PhysLoc,
    bytes: Box<[u8; PAGE_SIZE]>,
    header_cache: Option<PageHeader>,
}

impl RawPage {
    /// A freshly zeroed page at the given identity/location, with an
    /// empty header of the given type already serialized into byte 0..9.
    pub fn new(id: PageId, location: PhysLoc, page_type: PageType) -> Self {
        let mut bytes = Box::new([0u8; PAGE_SIZE]);
        let header = PageHeader::empty(page_type);
        write_page_header(bytes.as_mut_slice(), &header).expect("header always fits in PAGE_SIZE");
        Self {
            id,
            location,
            bytes,
            header_cache: Some(header),
        }
    }

    /// Wrap an existing `PAGE_SIZE` buffer (e.g. one just read off disk)
    /// as a `RawPage`.
    pub fn from_bytes(id: PageId, location: PhysLoc, bytes: Box<[u8; PAGE_SIZE]>) -> Self {
        Self {
            id,
            location,
            bytes,
            header_cache: None,
        }
    }

    pub fn as_bytes(&self) -> &[u8; PAGE_SIZE] {
        &self.bytes
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8; PAGE_SIZE] {
        self.header_cache = None;
        &mut self.bytes
    }

    /// Return the parsed header, parsing and caching it on first access.
    pub fn header(&mut self) -> Result<PageHeader, CodecError> {
        if let Some(header) = self.header_cache {
            return Ok(header);
        }
        let header = load_page_header(self.bytes.as_slice())?;
        self.header_cache = Some(header);
        Ok(header)
    }

    /// Serialize and store `header`, updating the cache in the same call.
    pub fn set_header(&mut self, header: PageHeader) -> Result<(), CodecError> {
        write_page_header(self.bytes.as_mut_slice(), &header)?;
        self.header_cache = Some(header);
        Ok(())
    }

    pub fn invalidate_header_cache(&mut self) {
        self.header_cache = None;
    }
}
