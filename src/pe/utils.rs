use alloc::string::String;
use alloc::vec::Vec;

use crate::error;

use super::section_table::SectionTable;

/// Longest DLL name accepted in an import descriptor
// According to https://stackoverflow.com/a/265782/87207
pub const MAX_DLL_NAME_SIZE: usize = 255;
/// Longest imported function name accepted in a hint/name entry
// According to https://stackoverflow.com/a/23340781
pub const MAX_IMPORT_NAME_SIZE: usize = 0x1000;

/// Whether `rva` falls inside the virtual extent of `section`.
///
/// The extent is `max(virtual_size, size_of_raw_data)` long: some linkers leave
/// `virtual_size` at zero.
#[inline]
fn is_in_section(rva: u32, section: &SectionTable) -> bool {
    let start = section.virtual_address as u64;
    let extent = core::cmp::max(section.virtual_size, section.size_of_raw_data) as u64;
    let rva = rva as u64;
    start <= rva && rva < start + extent
}

/// Translates `rva` into an offset into a buffer of `len` bytes.
///
/// The first section (in on-disk order) whose virtual extent contains `rva` owns it.
/// A section with no extent never matches.
pub fn rva_to_offset(rva: u32, sections: &[SectionTable], len: usize) -> error::Result<usize> {
    for section in sections {
        if is_in_section(rva, section) {
            let offset = section.pointer_to_raw_data as u64
                + (rva as u64 - section.virtual_address as u64);
            return match usize::try_from(offset) {
                Ok(offset) if offset < len => Ok(offset),
                _ => Err(error::Error::Unmapped(rva as u64)),
            };
        }
    }
    Err(error::Error::Unmapped(rva as u64))
}

/// Like [`rva_to_offset`], but an RVA below the first section is read as a file
/// offset into the headers.
///
/// This is a recovery heuristic for tools that point into the header region, not
/// something the format documents.
pub fn rva_to_offset_with_header_fallback(
    rva: u32,
    sections: &[SectionTable],
    len: usize,
) -> error::Result<usize> {
    rva_to_offset(rva, sections, len).or_else(|err| match sections.first() {
        Some(first) if rva < first.virtual_address && (rva as usize) < len => Ok(rva as usize),
        _ => Err(err),
    })
}

/// Printable means no control characters; the cursor already guarantees UTF-8.
fn is_printable(name: &str) -> bool {
    name.chars().all(|c| !c.is_control())
}

/// Validates the name of an imported DLL
pub fn is_valid_dll_name(name: &str) -> bool {
    !name.is_empty() && name.len() <= MAX_DLL_NAME_SIZE && is_printable(name)
}

/// Validates the name of an imported function
pub fn is_valid_import_name(name: &str) -> bool {
    !name.is_empty() && name.len() <= MAX_IMPORT_NAME_SIZE && is_printable(name)
}

/// Decodes UTF-16LE bytes up to the first NUL code unit; odd trailing bytes are ignored.
pub(crate) fn to_utf16_string(bytes: &[u8]) -> String {
    let units = bytes
        .chunks_exact(2)
        .map(|chunk| u16::from_le_bytes([chunk[0], chunk[1]]))
        .take_while(|&unit| unit != 0)
        .collect::<Vec<_>>();
    String::from_utf16_lossy(&units)
}

/// Rounds `value` up to the next multiple of `align`, which must be a power of two.
#[inline]
pub(crate) fn align_up(value: usize, align: usize) -> Option<usize> {
    debug_assert!(align.is_power_of_two(), "Align must be a power of two");
    value.checked_add(align - 1).map(|v| v & !(align - 1))
}
