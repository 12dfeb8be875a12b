//! The "Rich" header: an undocumented, XOR-masked record of the Microsoft toolchain
//! components that built an image, hidden between the DOS stub and the PE header.
//!
//! References:
//! - <http://www.ntcore.com/files/richsign.htm>
//! - <https://bytepointer.com/articles/the_microsoft_rich_header.htm>

use alloc::vec::Vec;

use log::debug;
use scroll::Pread;

use crate::cursor::Cursor;
use crate::error;
use crate::pe::header::{DosHeader, SIZEOF_DOS_HEADER};

/// Ends the masked record, followed by the key
pub const RICH_MARKER: u32 = 0x6863_6952;
/// Starts the record once unmasked
pub const DANS_MARKER: u32 = 0x536e_6144;

/// One toolchain component and how many objects it contributed
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub struct RichEntry {
    /// Product id, the high half of the comp id
    pub id: u16,
    /// Build number, the low half of the comp id
    pub build_id: u16,
    pub count: u32,
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct RichHeader {
    /// File offset of the masked `DanS` marker
    pub offset: usize,
    /// The XOR key following `Rich`
    pub key: u32,
    pub entries: Vec<RichEntry>,
}

impl RichHeader {
    /// Looks for a rich header between the DOS header and `e_lfanew`.
    ///
    /// A stub without the markers has no rich header; that is `Ok(None)`.
    pub(crate) fn parse(cursor: &Cursor, dos_header: &DosHeader) -> error::Result<Option<Self>> {
        let end = (dos_header.pe_pointer as usize).min(cursor.len());
        if end <= SIZEOF_DOS_HEADER {
            return Ok(None);
        }
        let stub = cursor.read_fixed(SIZEOF_DOS_HEADER, end - SIZEOF_DOS_HEADER)?;

        let Some(rich) = rfind_u32(stub, RICH_MARKER) else {
            return Ok(None);
        };
        let key = match stub.pread_with::<u32>(rich + 4, scroll::LE) {
            Ok(key) => key,
            Err(_) => return Ok(None),
        };
        let Some(dans) = rfind_u32(&stub[..rich], DANS_MARKER ^ key) else {
            debug!("rich marker at {:#x} without a DanS marker", SIZEOF_DOS_HEADER + rich);
            return Ok(None);
        };

        // DanS, then three masked zero dwords, then (comp id, count) pairs up to Rich
        let mut entries = Vec::new();
        let mut offset = dans + 16;
        while offset + 8 <= rich {
            let comp_id = stub.pread_with::<u32>(offset, scroll::LE)? ^ key;
            let count = stub.pread_with::<u32>(offset + 4, scroll::LE)? ^ key;
            entries.push(RichEntry {
                id: (comp_id >> 16) as u16,
                build_id: comp_id as u16,
                count,
            });
            offset += 8;
        }
        let offset = SIZEOF_DOS_HEADER + dans;
        debug!("rich header at {offset:#x}, key {key:#x}, {} entries", entries.len());
        Ok(Some(RichHeader {
            offset,
            key,
            entries,
        }))
    }
}

/// Offset of the last dword-aligned occurrence of `needle` (little endian) in `haystack`.
///
/// `haystack` starts right after the DOS header, so its dwords are aligned in the file too.
fn rfind_u32(haystack: &[u8], needle: u32) -> Option<usize> {
    let needle = needle.to_le_bytes();
    haystack
        .chunks_exact(4)
        .rposition(|dword| dword == needle)
        .map(|index| index * 4)
}
