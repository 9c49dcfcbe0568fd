/*
 * Copyright (c) 2020 - 2021.  Shoyo Inokuchi.
 * Please refer to github.com/shoyo/jin for more information about this project and its license.
 */

//! The schema (layout) compiler and per-field read/write. A [`Layout`] is
//! an ordered set of [`Field`]s compiled from a list of [`FieldSpec`]s
//! following the placement rules in spec.md §3: null bitsets first,
//! packed booleans next, fixed-size values next, variable-length
//! metadata last.

pub mod string;

use crate::codec;
use crate::error::LayoutError;
pub use string::WriteStringData;

/// The semantic type of a field's value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
    Datetime,
    String,
}

struct TypeInfo {
    size: u16,
    packable: bool,
    variable_length: bool,
}

fn type_info(t: FieldType) -> TypeInfo {
    match t {
        FieldType::Bool => TypeInfo {
            size: 0,
            packable: true,
            variable_length: false,
        },
        FieldType::Int8 => TypeInfo {
            size: 1,
            packable: false,
            variable_length: false,
        },
        FieldType::Int16 => TypeInfo {
            size: 2,
            packable: false,
            variable_length: false,
        },
        FieldType::Int32 => TypeInfo {
            size: 4,
            packable: false,
            variable_length: false,
        },
        FieldType::Int64 => TypeInfo {
            size: 8,
            packable: false,
            variable_length: false,
        },
        FieldType::Float32 => TypeInfo {
            size: 4,
            packable: false,
            variable_length: false,
        },
        FieldType::Float64 => TypeInfo {
            size: 8,
            packable: false,
            variable_length: false,
        },
        FieldType::Datetime => TypeInfo {
            size: 8,
            packable: false,
            variable_length: false,
        },
        FieldType::String => TypeInfo {
            size: string::STRING_META_SIZE,
            packable: false,
            variable_length: true,
        },
    }
}

/// A tagged union over every value a field can hold, including the
/// absence of one. Matching on this exhaustively at the call site is
/// what makes `WrongFieldType` unreachable from the typed writer API —
/// it's only raised when a value of the wrong variant is routed at a
/// field of a different type.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Bool(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    /// Seconds since the Unix epoch.
    Datetime(i64),
    String(String),
}

/// An unplaced field as supplied to [`Layout::new`].
#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub name: String,
    pub field_type: FieldType,
    pub nullable: bool,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, field_type: FieldType, nullable: bool) -> Self {
        Self {
            name: name.into(),
            field_type,
            nullable,
        }
    }
}

/// A field together with its placement, computed once by
/// [`Layout::new`] and stable thereafter.
#[derive(Debug, Clone)]
pub struct Field {
    pub name: String,
    pub field_type: FieldType,
    pub nullable: bool,

    /// For packed booleans: the bitset byte offset. For fixed
    /// non-packed values and string metadata: the byte offset of the
    /// value/record itself.
    offset: u16,
    packed: bool,
    /// Bit index within the packed-bool bitset byte at `offset`.
    pack_index: u8,
    null_offset: u16,
    null_index: u8,
}

impl Field {
    /// The byte offset of this field's fixed-size value or, for a
    /// string field, its metadata record.
    pub fn offset(&self) -> u16 {
        self.offset
    }

    pub fn is_packed(&self) -> bool {
        self.packed
    }

    /// Whether the null bit for this field is set. Always `false` for a
    /// non-nullable field, without reading any bytes.
    pub fn is_null(&self, buffer: &[u8]) -> Result<bool, LayoutError> {
        if !self.nullable {
            return Ok(false);
        }
        Ok(codec::read_bit(
            buffer,
            self.null_offset as usize,
            self.null_index,
        )?)
    }

    /// Set or clear the null bit for this field.
    pub fn set_is_null(&self, is_null: bool, buffer: &mut [u8]) -> Result<(), LayoutError> {
        if !self.nullable {
            return Err(LayoutError::NotNullable(self.name.clone()));
        }
        codec::write_bit(buffer, self.null_offset as usize, self.null_index, is_null)?;
        Ok(())
    }

    /// Read this field's value out of `buffer`.
    pub fn read(&self, buffer: &[u8]) -> Result<FieldValue, LayoutError> {
        if self.nullable && self.is_null(buffer)? {
            return Ok(FieldValue::Null);
        }

        if self.packed {
            let bit = codec::read_bit(buffer, self.offset as usize, self.pack_index)?;
            return Ok(FieldValue::Bool(bit));
        }

        let offset = self.offset as usize;
        Ok(match self.field_type {
            FieldType::Bool => unreachable!("bool fields are always packed"),
            FieldType::Int8 => FieldValue::I8(codec::read_u8(buffer, offset)? as i8),
            FieldType::Int16 => FieldValue::I16(codec::read_i16(buffer, offset)?),
            FieldType::Int32 => FieldValue::I32(codec::read_i32(buffer, offset)?),
            FieldType::Int64 => FieldValue::I64(codec::read_i64(buffer, offset)?),
            FieldType::Float32 => FieldValue::F32(codec::read_f32(buffer, offset)?),
            FieldType::Float64 => FieldValue::F64(codec::read_f64(buffer, offset)?),
            FieldType::Datetime => FieldValue::Datetime(codec::read_i64(buffer, offset)?),
            FieldType::String => {
                let meta = string::read_string_meta(buffer, self.offset)?;
                let bytes = string::read_inline_bytes(buffer, &meta)?;
                let value = String::from_utf8(bytes).map_err(|_| LayoutError::WrongFieldType {
                    field: self.name.clone(),
                })?;
                FieldValue::String(value)
            }
        })
    }

    /// Write a scalar value (anything but a string) into this field.
    /// Strings go through [`Field::write_string`] instead, since they
    /// need a caller-computed `data_offset` and, possibly, overflow
    /// placement.
    pub fn write(&self, value: &FieldValue, buffer: &mut [u8]) -> Result<(), LayoutError> {
        if let FieldValue::Null = value {
            return self.set_is_null(true, buffer);
        }
        if self.nullable {
            self.set_is_null(false, buffer)?;
        }

        let wrong_type = || LayoutError::WrongFieldType {
            field: self.name.clone(),
        };

        if self.packed {
            let FieldValue::Bool(b) = value else {
                return Err(wrong_type());
            };
            codec::write_bit(buffer, self.offset as usize, self.pack_index, *b)?;
            return Ok(());
        }

        let offset = self.offset as usize;
        match (self.field_type, value) {
            (FieldType::Int8, FieldValue::I8(v)) => codec::write_u8(buffer, offset, *v as u8)?,
            (FieldType::Int16, FieldValue::I16(v)) => codec::write_i16(buffer, offset, *v)?,
            (FieldType::Int32, FieldValue::I32(v)) => codec::write_i32(buffer, offset, *v)?,
            (FieldType::Int64, FieldValue::I64(v)) => codec::write_i64(buffer, offset, *v)?,
            (FieldType::Float32, FieldValue::F32(v)) => codec::write_f32(buffer, offset, *v)?,
            (FieldType::Float64, FieldValue::F64(v)) => codec::write_f64(buffer, offset, *v)?,
            (FieldType::Datetime, FieldValue::Datetime(v)) => {
                codec::write_i64(buffer, offset, *v)?
            }
            (FieldType::String, _) => return Err(wrong_type()),
            _ => return Err(wrong_type()),
        }
        Ok(())
    }

    /// Write a string field's metadata record and inline bytes. The
    /// caller must already have shifted any subsequent cells if this
    /// write lengthens the payload, and must have computed
    /// `data.data_offset` (and overflow placement, if needed).
    pub fn write_string(
        &self,
        data: &WriteStringData,
        buffer: &mut [u8],
    ) -> Result<(), LayoutError> {
        if self.field_type != FieldType::String {
            return Err(LayoutError::WrongFieldType {
                field: self.name.clone(),
            });
        }
        if self.nullable {
            self.set_is_null(false, buffer)?;
        }
        string::write_string_field(buffer, self.offset, data)?;
        Ok(())
    }
}

/// A compiled, ordered set of fields. Field offsets are fixed for the
/// lifetime of the layout once compiled.
#[derive(Debug, Clone)]
pub struct Layout {
    fields: Vec<Field>,
    /// Total size in bytes of the fixed-size portion of a tuple under
    /// this layout (null bitsets + packed bools + fixed values + string
    /// metadata records), excluding variable payload bytes.
    size: u16,
}

impl Layout {
    /// Compile `specs` into a `Layout`, assigning offsets per spec.md
    /// §3's placement rules:
    /// 1. all null bitsets precede all value bytes;
    /// 2. nullable fields get one densely packed bit each, in
    ///    declaration order;
    /// 3. packed booleans get one bit each in a *separate* bitset
    ///    section placed after the null section, in declaration order;
    /// 4. fixed-size non-packed fields follow, in declaration order;
    /// 5. variable-length (string) metadata records follow last, in
    ///    declaration order.
    pub fn new(specs: Vec<FieldSpec>) -> Result<Self, LayoutError> {
        if specs.is_empty() {
            return Ok(Self {
                fields: Vec::new(),
                size: 0,
            });
        }

        // Pass 1: null bitset assignment, densely packed in declaration
        // order across all nullable fields regardless of type.
        let mut null_bits: Vec<Option<(u16, u8)>> = Vec::with_capacity(specs.len());
        let mut nullable_count: u32 = 0;
        for spec in &specs {
            if spec.nullable {
                let k = nullable_count;
                null_bits.push(Some(((k / 8) as u16, (k % 8) as u8)));
                nullable_count += 1;
            } else {
                null_bits.push(None);
            }
        }
        let null_section_bytes = (nullable_count as u16).div_ceil(8);

        // Pass 2: packed-bool bitset assignment, placed after the null
        // section, lazily allocated in declaration order.
        let packed_section_start = null_section_bytes;
        let mut pack_slots: Vec<Option<(u16, u8)>> = Vec::with_capacity(specs.len());
        let mut pack_count: u32 = 0;
        for spec in &specs {
            let info = type_info(spec.field_type);
            if info.packable {
                let k = pack_count;
                let byte_offset = packed_section_start + (k / 8) as u16;
                pack_slots.push(Some((byte_offset, (k % 8) as u8)));
                pack_count += 1;
            } else {
                pack_slots.push(None);
            }
        }
        let packed_section_bytes = (pack_count as u16).div_ceil(8);

        // Pass 3: fixed-size non-packed values, in declaration order.
        let fixed_section_start = packed_section_start + packed_section_bytes;
        let mut fixed_offsets: Vec<Option<u16>> = Vec::with_capacity(specs.len());
        let mut cursor = fixed_section_start;
        for spec in &specs {
            let info = type_info(spec.field_type);
            if !info.packable && !info.variable_length {
                fixed_offsets.push(Some(cursor));
                cursor += info.size;
            } else {
                fixed_offsets.push(None);
            }
        }
        let variable_section_start = cursor;

        // Pass 4: variable-length metadata records, in declaration
        // order, each STRING_META_SIZE bytes.
        let mut variable_offsets: Vec<Option<u16>> = Vec::with_capacity(specs.len());
        let mut var_cursor = variable_section_start;
        for spec in &specs {
            let info = type_info(spec.field_type);
            if info.variable_length {
                variable_offsets.push(Some(var_cursor));
                var_cursor += info.size;
            } else {
                variable_offsets.push(None);
            }
        }

        let mut fields = Vec::with_capacity(specs.len());
        for (i, spec) in specs.into_iter().enumerate() {
            let info = type_info(spec.field_type);
            let (null_offset, null_index) = null_bits[i].unwrap_or((0, 0));

            let (offset, packed, pack_index) = if let Some((byte_offset, bit)) = pack_slots[i] {
                (byte_offset, true, bit)
            } else if let Some(off) = fixed_offsets[i] {
                (off, false, 0)
            } else if let Some(off) = variable_offsets[i] {
                (off, false, 0)
            } else {
                return Err(LayoutError::UnknownFieldType);
            };
            let _ = info;

            fields.push(Field {
                name: spec.name,
                field_type: spec.field_type,
                nullable: spec.nullable,
                offset,
                packed,
                pack_index,
                null_offset,
                null_index,
            });
        }

        Ok(Self {
            fields,
            size: var_cursor,
        })
    }

    pub fn get_field(&self, name: &str) -> Result<&Field, LayoutError> {
        self.fields
            .iter()
            .find(|f| f.name == name)
            .ok_or_else(|| LayoutError::FieldNotFound(name.to_string()))
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Size in bytes of the fixed-size portion of a tuple under this
    /// layout, excluding variable payload bytes.
    pub fn size(&self) -> u16 {
        self.size
    }
}
