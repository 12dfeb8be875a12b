use alloc::string::{String, ToString};

use scroll::{Pread, Pwrite, SizeWith};

use crate::cursor::Cursor;
use crate::error::{self, Error};

/// A section header as it appears on disk
#[repr(C)]
#[derive(Debug, PartialEq, Clone, Default)]
#[doc(alias("IMAGE_SECTION_HEADER"))]
pub struct SectionTable {
    pub name: [u8; 8],
    /// The name resolved through the COFF string table, for `/NNN` long names
    pub real_name: Option<String>,
    pub virtual_size: u32,
    pub virtual_address: u32,
    pub size_of_raw_data: u32,
    pub pointer_to_raw_data: u32,
    pub pointer_to_relocations: u32,
    pub pointer_to_linenumbers: u32,
    pub number_of_relocations: u16,
    pub number_of_linenumbers: u16,
    pub characteristics: u32,
}

/// The fixed 40 byte record, before long name resolution
#[repr(C)]
#[derive(Debug, PartialEq, Copy, Clone, Default, Pread, Pwrite, SizeWith)]
struct RawSectionTable {
    name: [u8; 8],
    virtual_size: u32,
    virtual_address: u32,
    size_of_raw_data: u32,
    pointer_to_raw_data: u32,
    pointer_to_relocations: u32,
    pointer_to_linenumbers: u32,
    number_of_relocations: u16,
    number_of_linenumbers: u16,
    characteristics: u32,
}

pub const SIZEOF_SECTION_TABLE: usize = 8 * 5;

/// Longest long name read out of the string table
const MAX_SECTION_NAME_SIZE: usize = 0x100;

// Based on https://github.com/llvm-mirror/llvm/blob/af7b1832a03ab6486c42a40d21695b2c03b2d8a3/lib/Object/COFFObjectFile.cpp#L70
// Decodes a string table entry in base 64 (//AAAAAA). Expects string without
// prefixed slashes.
fn base64_decode_string_entry(s: &str) -> error::Result<usize> {
    let invalid = || {
        Error::Malformed(format!(
            "Invalid indirect section name //{s}: base64 decoding failed"
        ))
    };
    if s.len() > 6 {
        return Err(invalid());
    }
    let mut val: usize = 0;
    for c in s.bytes() {
        let v = match c {
            b'A'..=b'Z' => c - b'A',
            b'a'..=b'z' => c - b'a' + 26,
            b'0'..=b'9' => c - b'0' + 52,
            b'+' => 62,
            b'/' => 63,
            _ => return Err(invalid()),
        };
        // six digits need 36 bits
        val = val
            .checked_mul(64)
            .and_then(|val| val.checked_add(v as usize))
            .ok_or_else(invalid)?;
    }
    Ok(val)
}

impl SectionTable {
    /// Reads a section header at `*offset`, resolving a long name when the COFF string
    /// table is present.
    ///
    /// A long name that cannot be resolved is not an error: [`SectionTable::name`] falls
    /// back to the raw bytes.
    pub fn parse(
        cursor: &Cursor,
        offset: &mut usize,
        string_table_offset: Option<usize>,
    ) -> error::Result<Self> {
        let raw = cursor.gread::<RawSectionTable>(offset)?;
        let mut table = SectionTable {
            name: raw.name,
            real_name: None,
            virtual_size: raw.virtual_size,
            virtual_address: raw.virtual_address,
            size_of_raw_data: raw.size_of_raw_data,
            pointer_to_raw_data: raw.pointer_to_raw_data,
            pointer_to_relocations: raw.pointer_to_relocations,
            pointer_to_linenumbers: raw.pointer_to_linenumbers,
            number_of_relocations: raw.number_of_relocations,
            number_of_linenumbers: raw.number_of_linenumbers,
            characteristics: raw.characteristics,
        };
        if let Some(string_table_offset) = string_table_offset {
            if let Some(idx) = table.name_offset().ok().flatten() {
                table.real_name = string_table_offset
                    .checked_add(idx)
                    .and_then(|at| cursor.read_c_string(at, MAX_SECTION_NAME_SIZE).ok())
                    .map(ToString::to_string);
            }
        }
        Ok(table)
    }

    /// The string table offset encoded in a `/NNN` or `//BASE64` long name.
    pub fn name_offset(&self) -> error::Result<Option<usize>> {
        // Based on https://github.com/llvm-mirror/llvm/blob/af7b1832a03ab6486c42a40d21695b2c03b2d8a3/lib/Object/COFFObjectFile.cpp#L1054
        if self.name[0] != b'/' {
            return Ok(None);
        }
        let idx: usize = if self.name[1] == b'/' {
            let b64idx = self.raw_name()?;
            base64_decode_string_entry(&b64idx[2..])?
        } else {
            let name = self.raw_name()?;
            name[1..].parse().map_err(|err| {
                Error::Malformed(format!("Invalid indirect section name {name}: {err}"))
            })?
        };
        Ok(Some(idx))
    }

    /// The 8 name bytes up to the first NUL
    pub fn raw_name(&self) -> error::Result<&str> {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(self.name.len());
        core::str::from_utf8(&self.name[..len])
            .map_err(|_| Error::Malformed("section name is not valid UTF-8".into()))
    }

    /// The resolved long name if any, otherwise the raw name
    pub fn name(&self) -> error::Result<&str> {
        match self.real_name.as_ref() {
            Some(s) => Ok(s),
            None => self.raw_name(),
        }
    }

    /// File offset one past the last raw byte of this section
    pub fn raw_data_end(&self) -> u64 {
        self.pointer_to_raw_data as u64 + self.size_of_raw_data as u64
    }
}

/// Reserved for future use.
pub const IMAGE_SCN_TYPE_NO_PAD: u32 = 0x0000_0008;
/// The section contains executable code.
pub const IMAGE_SCN_CNT_CODE: u32 = 0x0000_0020;
/// The section contains initialized data.
pub const IMAGE_SCN_CNT_INITIALIZED_DATA: u32 = 0x0000_0040;
/// The section contains uninitialized data.
pub const IMAGE_SCN_CNT_UNINITIALIZED_DATA: u32 = 0x0000_0080;
pub const IMAGE_SCN_LNK_OTHER: u32 = 0x0000_0100;
/// The section contains comments or other information.
pub const IMAGE_SCN_LNK_INFO: u32 = 0x0000_0200;
/// The section will not become part of the image.
pub const IMAGE_SCN_LNK_REMOVE: u32 = 0x0000_0800;
/// The section contains COMDAT data.
pub const IMAGE_SCN_LNK_COMDAT: u32 = 0x0000_1000;
/// The section contains data referenced through the global pointer (GP).
pub const IMAGE_SCN_GPREL: u32 = 0x0000_8000;
pub const IMAGE_SCN_ALIGN_MASK: u32 = 0x00F0_0000;
/// The section contains extended relocations.
pub const IMAGE_SCN_LNK_NRELOC_OVFL: u32 = 0x0100_0000;
/// The section can be discarded as needed.
pub const IMAGE_SCN_MEM_DISCARDABLE: u32 = 0x0200_0000;
/// The section cannot be cached.
pub const IMAGE_SCN_MEM_NOT_CACHED: u32 = 0x0400_0000;
/// The section is not pageable.
pub const IMAGE_SCN_MEM_NOT_PAGED: u32 = 0x0800_0000;
/// The section can be shared in memory.
pub const IMAGE_SCN_MEM_SHARED: u32 = 0x1000_0000;
/// The section can be executed as code.
pub const IMAGE_SCN_MEM_EXECUTE: u32 = 0x2000_0000;
/// The section can be read.
pub const IMAGE_SCN_MEM_READ: u32 = 0x4000_0000;
/// The section can be written to.
pub const IMAGE_SCN_MEM_WRITE: u32 = 0x8000_0000;
